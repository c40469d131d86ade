//! The in-memory revision forest of a document.
//!
//! A [`RevTree`] holds every known revision of one document. Each revision
//! points at its parent by *index* into the owning tree, because the array
//! is reordered by [`RevTree::sort`] and raw references would dangle. The
//! packed on-disk form lives in [`raw`].

use std::cmp::Ordering;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::revid::{self, RevId};

pub mod raw;

/// Monotonic per-store sequence number. Zero means "not yet persisted".
pub type Sequence = u64;

/// Hard ceiling on revisions per tree; parent indices are 16-bit.
pub const MAX_REVS: usize = u16::MAX as usize;

/// One revision in a [`RevTree`].
#[derive(Debug, Clone)]
pub struct Rev {
    rev_id: RevId,
    flags: u8,
    parent: Option<u16>,
    sequence: Sequence,
    body: Bytes,
}

impl Rev {
    /// This revision is a deletion tombstone. Implies [`Rev::LEAF`].
    pub const DELETED: u8 = 0x01;
    /// This revision has no children.
    pub const LEAF: u8 = 0x02;
    /// Inserted in memory but not yet persisted. Never written to disk.
    pub const NEW: u8 = 0x04;
    /// The body references binary attachments.
    pub const HAS_ATTACHMENTS: u8 = 0x08;
    /// Keep the body when this revision stops being current.
    pub const KEEP_BODY: u8 = 0x10;

    pub(crate) const NON_PERSISTENT: u8 = Rev::NEW;

    /// The revision identifier.
    pub fn rev_id(&self) -> &RevId {
        &self.rev_id
    }

    /// Raw flag bits.
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Index of the parent revision in the owning tree, if any.
    ///
    /// Valid only until the next [`RevTree::sort`].
    pub fn parent(&self) -> Option<u16> {
        self.parent
    }

    /// The sequence this revision was persisted under, or 0.
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// The revision body. May be empty.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Generation of the revision id (0 if the id is improper).
    pub fn generation(&self) -> u32 {
        self.rev_id.generation()
    }

    /// Whether this revision has no children.
    pub fn is_leaf(&self) -> bool {
        self.flags & Rev::LEAF != 0
    }

    /// Whether this revision is a deletion tombstone.
    pub fn is_deleted(&self) -> bool {
        self.flags & Rev::DELETED != 0
    }

    /// A live branch tip: a leaf that is not deleted.
    pub fn is_active(&self) -> bool {
        self.is_leaf() && !self.is_deleted()
    }

    /// Whether this revision has not been persisted yet.
    pub fn is_new(&self) -> bool {
        self.flags & Rev::NEW != 0
    }

    pub(crate) fn set_sequence(&mut self, sequence: Sequence) {
        self.sequence = sequence;
        self.flags &= !Rev::NEW;
    }

    pub(crate) fn from_raw_parts(
        rev_id: RevId,
        flags: u8,
        parent: Option<u16>,
        sequence: Sequence,
        body: Bytes,
    ) -> Self {
        Rev {
            rev_id,
            flags,
            parent,
            sequence,
            body,
        }
    }
}

/// Ordering used everywhere a "first" revision is needed: leaves before
/// non-leaves, live before deleted, then revision ids descending. The
/// revision that sorts first is the current revision.
fn compare_revs(a: &Rev, b: &Rev) -> Ordering {
    b.is_leaf()
        .cmp(&a.is_leaf())
        .then_with(|| a.is_deleted().cmp(&b.is_deleted()))
        .then_with(|| revid::compare(b.rev_id.as_bytes(), a.rev_id.as_bytes()))
}

/// The mutable forest of revisions of one document.
#[derive(Debug, Clone, Default)]
pub struct RevTree {
    revs: Vec<Rev>,
    sorted: bool,
}

impl RevTree {
    /// Creates an empty tree with room for `capacity` revisions.
    pub fn new(capacity: usize) -> Self {
        RevTree {
            revs: Vec::with_capacity(capacity),
            sorted: true,
        }
    }

    /// Decodes a packed blob, reserving room for `extra_capacity` more
    /// revisions. Revisions stored with sequence 0 (they were new when the
    /// blob was written) adopt `record_sequence`.
    pub fn decode(blob: &[u8], extra_capacity: usize, record_sequence: Sequence) -> Result<Self> {
        let mut revs = raw::decode_tree(blob, record_sequence)?;
        revs.reserve(extra_capacity);
        Ok(RevTree {
            revs,
            // Trees are written in sorted order, so a freshly decoded one
            // is sorted until the first insert.
            sorted: true,
        })
    }

    /// Sorts and emits the packed form.
    pub fn encode(&mut self) -> Bytes {
        self.sort();
        raw::encode_tree(&self.revs)
    }

    /// Number of revisions in the tree.
    pub fn len(&self) -> usize {
        self.revs.len()
    }

    /// Whether the tree holds no revisions.
    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    /// Direct access by index. Indices are valid only between sorts.
    pub fn get(&self, index: usize) -> Option<&Rev> {
        self.revs.get(index)
    }

    /// Linear search by revision id. Trees are small.
    pub fn find(&self, rev_id: &[u8]) -> Option<usize> {
        self.revs
            .iter()
            .position(|rev| rev.rev_id.as_bytes() == rev_id)
    }

    /// The deterministically chosen winner among all revisions.
    pub fn current_revision(&self) -> Option<&Rev> {
        if self.sorted {
            self.revs.first()
        } else {
            self.revs.iter().min_by(|a, b| compare_revs(a, b))
        }
    }

    /// True iff two or more live branch tips exist.
    pub fn has_conflict(&self) -> bool {
        if self.revs.len() < 2 {
            false
        } else if self.sorted {
            self.revs[1].is_active()
        } else {
            self.revs.iter().filter(|rev| rev.is_active()).count() >= 2
        }
    }

    /// Iterates over all leaf revisions.
    pub fn leaves(&self) -> impl Iterator<Item = &Rev> {
        self.revs.iter().filter(|rev| rev.is_leaf())
    }

    /// Iterates over all revisions in their current order.
    pub fn iter(&self) -> std::slice::Iter<'_, Rev> {
        self.revs.iter()
    }

    /// Appends a new leaf revision and returns its index.
    ///
    /// If `parent` was a leaf its leaf flag is cleared. The tree becomes
    /// unsorted; indices handed out earlier stay valid until [`Self::sort`].
    pub fn insert(
        &mut self,
        rev_id: RevId,
        body: Bytes,
        parent: Option<usize>,
        deleted: bool,
    ) -> Result<usize> {
        if self.revs.len() >= MAX_REVS {
            return Err(Error::InvalidParameter("revision tree is full"));
        }
        if rev_id.is_empty() || rev_id.len() > u8::MAX as usize {
            return Err(Error::InvalidParameter("revision id length out of range"));
        }
        let parent = match parent {
            Some(index) => {
                let parent_rev = self
                    .revs
                    .get_mut(index)
                    .ok_or(Error::InvalidParameter("parent index out of range"))?;
                parent_rev.flags &= !Rev::LEAF;
                Some(index as u16)
            }
            None => None,
        };
        let mut flags = Rev::LEAF | Rev::NEW;
        if deleted {
            flags |= Rev::DELETED;
        }
        let index = self.revs.len();
        self.revs.push(Rev {
            rev_id,
            flags,
            parent,
            sequence: 0,
            body,
        });
        if self.revs.len() > 1 {
            self.sorted = false;
        }
        Ok(index)
    }

    /// Reorders the array so the current revision lands at index 0 and the
    /// rest follow the same ordering, rewriting all parent indices.
    pub fn sort(&mut self) {
        if self.sorted {
            return;
        }
        let count = self.revs.len();

        // Snapshot the parent links, and overwrite each one with its own
        // slot so the sort leaves behind a permutation witness.
        let mut old_parents = Vec::with_capacity(count);
        for (index, rev) in self.revs.iter_mut().enumerate() {
            old_parents.push(rev.parent);
            rev.parent = Some(index as u16);
        }

        self.revs.sort_by(compare_revs);

        // Invert the witness: old slot -> new slot.
        let mut old_to_new = vec![0u16; count];
        for (new_index, rev) in self.revs.iter().enumerate() {
            let old_index = rev.parent.expect("permutation witness");
            old_to_new[old_index as usize] = new_index as u16;
        }

        // Route every saved parent link through the inverse permutation.
        for rev in self.revs.iter_mut() {
            let old_index = rev.parent.expect("permutation witness");
            rev.parent =
                old_parents[old_index as usize].map(|parent| old_to_new[parent as usize]);
        }
        self.sorted = true;
    }

    pub(crate) fn revs_mut(&mut self) -> &mut [Rev] {
        &mut self.revs
    }
}
