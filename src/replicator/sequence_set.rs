//! The ledger of peer sequences requested but not yet inserted.

use std::collections::VecDeque;

use super::message::RemoteSequence;

/// A sparse ordered set over opaque peer sequences.
///
/// Sequences are added in the order the peer announced them. [`Self::since`]
/// is the greatest *contiguous* completed prefix: every sequence up to and
/// including it has been requested and completed, so it is safe to record
/// as a checkpoint.
#[derive(Debug, Default)]
pub struct SequenceSet {
    entries: VecDeque<(RemoteSequence, bool)>,
    since: RemoteSequence,
    outstanding: usize,
}

impl SequenceSet {
    /// Empties the ledger and resets the checkpoint base.
    pub fn clear(&mut self, since: RemoteSequence) {
        self.entries.clear();
        self.outstanding = 0;
        self.since = since;
    }

    /// Records a requested sequence.
    pub fn add(&mut self, sequence: RemoteSequence) {
        self.entries.push_back((sequence, false));
        self.outstanding += 1;
    }

    /// Marks a sequence completed. Returns whether [`Self::since`]
    /// advanced, i.e. whether a new checkpoint should be recorded.
    pub fn remove(&mut self, sequence: &RemoteSequence) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(pending, done)| !done && pending == sequence)
        else {
            return false;
        };
        entry.1 = true;
        self.outstanding -= 1;

        let mut advanced = false;
        while matches!(self.entries.front(), Some((_, true))) {
            let (sequence, _) = self.entries.pop_front().expect("checked front");
            self.since = sequence;
            advanced = true;
        }
        advanced
    }

    /// The greatest contiguous completed sequence.
    pub fn since(&self) -> &RemoteSequence {
        &self.since
    }

    /// Whether no requests are outstanding.
    pub fn is_empty(&self) -> bool {
        self.outstanding == 0
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.outstanding
    }
}
