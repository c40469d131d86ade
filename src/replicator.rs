//! Pull replication: the message contract, the requested-sequence ledger,
//! and the [`puller::PullerHandle`] actor that drives a pull against a
//! peer connection.

use std::sync::Arc;

use bytes::Bytes;

pub mod message;
pub mod puller;
mod sequence_set;

pub use puller::PullerHandle;
pub use sequence_set::SequenceSet;

use message::RemoteSequence;

/// How busy a replication task currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ActivityLevel {
    /// Finished (or never started).
    Stopped,
    /// Work is in flight.
    Busy,
    /// Caught up, waiting for more changes.
    Idle,
}

/// Callback deciding whether a pulled document may be inserted.
/// Receives the document id and the parsed JSON body.
pub type PullValidator = Arc<dyn Fn(&[u8], &serde_json::Value) -> bool + Send + Sync>;

/// Replication configuration.
#[derive(derive_more::Debug, Clone, Default)]
pub struct Options {
    /// Keep pulling after catching up instead of stopping.
    pub continuous: bool,
    /// This endpoint only responds; it never subscribes to changes.
    pub passive: bool,
    /// Validator applied to every pulled document.
    #[debug(skip)]
    pub validator: Option<PullValidator>,
}

impl Options {
    /// Pull once and stop when caught up.
    pub fn one_shot() -> Options {
        Options::default()
    }

    /// Pull and stay subscribed to the peer's changes.
    pub fn continuous() -> Options {
        Options {
            continuous: true,
            ..Default::default()
        }
    }

    /// Server side of a pull: respond only.
    pub fn passive() -> Options {
        Options {
            passive: true,
            ..Default::default()
        }
    }
}

/// Replication progress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Documents inserted.
    pub completed: u64,
    /// Documents that failed or were rejected.
    pub failed: u64,
}

/// Events reported by a replication task.
#[derive(Debug, Clone)]
pub enum Event {
    /// The activity level changed.
    Activity {
        /// The new level.
        level: ActivityLevel,
        /// Progress so far.
        progress: Progress,
    },
    /// The pull checkpoint advanced; persist it for the next session.
    Checkpoint {
        /// Greatest contiguous completed peer sequence.
        sequence: RemoteSequence,
    },
    /// A document failed without stopping replication.
    DocumentError {
        /// The affected document.
        doc_id: Bytes,
        /// Error domain reported to the peer.
        domain: &'static str,
        /// Error code reported to the peer.
        code: i32,
        /// Log-friendly description.
        message: String,
    },
}
