//! Documents: key-store records whose body is a packed revision tree.
//!
//! [`DocumentStore`] is the glue between the revision model and the
//! storage layer. A document record's `version` is the current revision
//! id, its `sequence` is the highest sequence of any revision inside, and
//! its flag bits mirror the deleted/conflicted state of the tree.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Error, Result};
use crate::revid::RevId;
use crate::store::{
    Capabilities, DataFile, KeyStore, ReadOnlyTransaction, Record, Transaction, DEFAULT_KEY_STORE,
};
use crate::tree::RevTree;

/// Registry key of the [`DocumentKeys`] shared object.
pub const DOCUMENT_KEYS: &str = "document-keys";

/// A document read from a [`DocumentStore`]: its id, decoded revision
/// tree, and record metadata.
#[derive(Debug)]
pub struct Document {
    /// The document id.
    pub id: Bytes,
    /// The decoded revision tree.
    pub tree: RevTree,
    /// Sequence of the latest revision.
    pub sequence: u64,
    /// Record flag bits; see [`Record`].
    pub flags: u8,
}

impl Document {
    /// The current revision id.
    pub fn current_rev_id(&self) -> Option<&RevId> {
        self.tree.current_revision().map(|rev| rev.rev_id())
    }

    /// Whether the current revision is a deletion tombstone.
    pub fn is_deleted(&self) -> bool {
        self.flags & Record::DELETED != 0
    }

    /// Whether the tree has conflicting live revisions.
    pub fn is_conflicted(&self) -> bool {
        self.flags & Record::CONFLICTED != 0
    }
}

/// A new revision to insert with [`DocumentStore::put`].
#[derive(Debug, Clone, Default)]
pub struct PutRequest {
    /// The document id.
    pub doc_id: Bytes,
    /// The proposed revision id; generated from the body when absent.
    pub rev_id: Option<RevId>,
    /// The parent revision id; absent for a root revision.
    pub parent_rev_id: Option<RevId>,
    /// Ancestor revision ids, nearest first, excluding the new revision.
    /// Supplying these selects the replication path: missing ancestors are
    /// spliced in and an existing revision becomes a no-op.
    pub history: Vec<RevId>,
    /// The revision body.
    pub body: Bytes,
    /// Insert a deletion tombstone.
    pub deleted: bool,
    /// Permit creating a new branch (a conflict).
    pub allow_conflict: bool,
}

/// What [`DocumentStore::put`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    /// Id of the inserted (or already present) revision.
    pub rev_id: RevId,
    /// The document record's sequence after the write.
    pub sequence: u64,
    /// Whether the document now has conflicting live revisions.
    pub was_conflict: bool,
}

/// Reads and writes documents in one [`KeyStore`].
#[derive(Debug, Clone)]
pub struct DocumentStore {
    store: KeyStore,
}

impl DocumentStore {
    /// Opens the document store over the file's default key store.
    pub fn new(file: &DataFile) -> Result<DocumentStore> {
        if file.options().use_document_keys {
            file.add_shared_object(DOCUMENT_KEYS, Arc::new(DocumentKeys::default()));
        }
        let store = file.get_key_store(DEFAULT_KEY_STORE, Capabilities::DOCUMENTS)?;
        Ok(DocumentStore { store })
    }

    /// Opens a document store over an explicit key store. The store must
    /// track sequences.
    pub fn for_store(store: KeyStore) -> Result<DocumentStore> {
        if !store.capabilities().sequences {
            return Err(Error::InvalidParameter(
                "document stores need sequence tracking",
            ));
        }
        Ok(DocumentStore { store })
    }

    /// The underlying key store.
    pub fn key_store(&self) -> &KeyStore {
        &self.store
    }

    /// Loads a document from a fresh snapshot.
    pub fn get(&self, doc_id: &[u8]) -> Result<Option<Document>> {
        match self.store.get(doc_id)? {
            None => Ok(None),
            // A purged record is a store-level tombstone, not a document.
            Some(record) if record.is_tombstone() => Ok(None),
            Some(record) => decode_document(record).map(Some),
        }
    }

    /// Loads a document from a pinned snapshot.
    pub fn get_in(&self, doc_id: &[u8], snapshot: &ReadOnlyTransaction) -> Result<Option<Document>> {
        match self.store.get_in(doc_id, snapshot)? {
            None => Ok(None),
            Some(record) if record.is_tombstone() => Ok(None),
            Some(record) => decode_document(record).map(Some),
        }
    }

    /// Inserts a new revision.
    ///
    /// Without [`PutRequest::history`] this is the local-edit path: the
    /// parent must exist and be a leaf unless conflicts are allowed.
    /// With a history this is the replication path: the chain is walked
    /// from the new revision towards the root, missing ancestors are
    /// inserted in order, and a revision we already have is a no-op.
    pub fn put(&self, request: &PutRequest, txn: &Transaction) -> Result<PutOutcome> {
        if request.doc_id.is_empty() {
            return Err(Error::InvalidParameter("document id is empty"));
        }
        let record = self.store.get_for_update(&request.doc_id, txn)?;
        let expected_version = record
            .as_ref()
            .map(|record| record.version.clone())
            .unwrap_or_default();
        let mut tree = match &record {
            Some(record) if !record.body.is_empty() => {
                RevTree::decode(&record.body, 1, record.sequence)?
            }
            _ => RevTree::new(1),
        };

        let rev_id = if request.history.is_empty() {
            self.insert_local(&mut tree, request)?
        } else {
            match self.insert_history(&mut tree, request)? {
                Inserted::New(rev_id) => rev_id,
                Inserted::AlreadyPresent(rev_id) => {
                    // Nothing changed; report the state as stored.
                    return Ok(PutOutcome {
                        rev_id,
                        sequence: record.map(|record| record.sequence).unwrap_or(0),
                        was_conflict: tree.has_conflict(),
                    });
                }
            }
        };

        let sequence = self.save(&request.doc_id, &mut tree, &expected_version, txn)?;
        let was_conflict = tree.has_conflict();
        trace!(doc = %String::from_utf8_lossy(&request.doc_id), rev = %rev_id, sequence, "inserted revision");
        Ok(PutOutcome {
            rev_id,
            sequence,
            was_conflict,
        })
    }

    /// Inserts a deletion tombstone on top of `parent_rev_id`.
    pub fn delete(
        &self,
        doc_id: &[u8],
        parent_rev_id: &RevId,
        txn: &Transaction,
    ) -> Result<PutOutcome> {
        self.put(
            &PutRequest {
                doc_id: Bytes::copy_from_slice(doc_id),
                parent_rev_id: Some(parent_rev_id.clone()),
                deleted: true,
                ..Default::default()
            },
            txn,
        )
    }

    fn insert_local(&self, tree: &mut RevTree, request: &PutRequest) -> Result<RevId> {
        let parent_index = match &request.parent_rev_id {
            Some(parent) => Some(tree.find(parent.as_bytes()).ok_or(Error::NotFound)?),
            // Without an explicit parent, a conflicting insert may still
            // attach to a leaf of the preceding generation.
            None => match &request.rev_id {
                Some(rev_id) if request.allow_conflict && rev_id.generation() > 1 => {
                    let target = rev_id.generation() - 1;
                    (0..tree.len()).find(|&index| {
                        let rev = tree.get(index).expect("index in range");
                        rev.is_leaf() && rev.generation() == target
                    })
                }
                _ => None,
            },
        };

        // Creating a sibling branch is a conflict unless explicitly
        // allowed: a non-leaf parent, or a second root.
        let creates_branch = match parent_index {
            Some(index) => !tree.get(index).expect("parent index").is_leaf(),
            None => !tree.is_empty(),
        };
        if creates_branch && !request.allow_conflict {
            return Err(Error::Conflict);
        }

        let parent_generation = parent_index
            .and_then(|index| tree.get(index))
            .map_or(0, |rev| rev.generation());
        let rev_id = match &request.rev_id {
            Some(rev_id) => {
                if tree.find(rev_id.as_bytes()).is_some() {
                    return Err(Error::Conflict);
                }
                if rev_id.generation() != parent_generation + 1 {
                    return Err(Error::InvalidParameter(
                        "revision generation does not follow its parent",
                    ));
                }
                rev_id.clone()
            }
            None => generate_rev_id(
                parent_index.and_then(|index| tree.get(index)).map(|rev| rev.rev_id()),
                request.deleted,
                &request.body,
            ),
        };

        tree.insert(
            rev_id.clone(),
            request.body.clone(),
            parent_index,
            request.deleted,
        )?;
        Ok(rev_id)
    }

    fn insert_history(&self, tree: &mut RevTree, request: &PutRequest) -> Result<Inserted> {
        let rev_id = request
            .rev_id
            .clone()
            .ok_or(Error::InvalidParameter("history without a revision id"))?;

        // The full chain, newest first.
        let mut chain = Vec::with_capacity(1 + request.history.len());
        chain.push(rev_id.clone());
        chain.extend(request.history.iter().cloned());
        for pair in chain.windows(2) {
            if pair[0].is_proper()
                && pair[1].is_proper()
                && pair[0].generation() != pair[1].generation() + 1
            {
                return Err(Error::InvalidParameter("revision history is not contiguous"));
            }
        }

        // Find the deepest link we already have.
        let known = chain
            .iter()
            .position(|id| tree.find(id.as_bytes()).is_some())
            .unwrap_or(chain.len());
        if known == 0 {
            return Ok(Inserted::AlreadyPresent(rev_id));
        }
        if !request.allow_conflict && !tree.is_empty() {
            // Splicing a chain that does not land on a live leaf creates a
            // branch.
            let attaches_to_leaf = known < chain.len()
                && tree
                    .find(chain[known].as_bytes())
                    .and_then(|index| tree.get(index))
                    .is_some_and(|rev| rev.is_leaf());
            if !attaches_to_leaf {
                return Err(Error::Conflict);
            }
        }

        // Insert the missing ancestors oldest-first, then the new leaf.
        let mut parent_index = match chain.get(known) {
            Some(ancestor) => tree.find(ancestor.as_bytes()),
            None => None,
        };
        for position in (0..known).rev() {
            let is_new_leaf = position == 0;
            let body = if is_new_leaf {
                request.body.clone()
            } else {
                Bytes::new()
            };
            let deleted = is_new_leaf && request.deleted;
            parent_index =
                Some(tree.insert(chain[position].clone(), body, parent_index, deleted)?);
        }
        Ok(Inserted::New(rev_id))
    }

    fn save(
        &self,
        doc_id: &[u8],
        tree: &mut RevTree,
        expected_version: &[u8],
        txn: &Transaction,
    ) -> Result<u64> {
        let blob = tree.encode();
        let current = tree.current_revision().ok_or(Error::CorruptRevisionData)?;
        let version = current.rev_id().to_bytes();
        let mut flags = 0u8;
        if current.is_deleted() {
            flags |= Record::DELETED;
        }
        if tree.has_conflict() {
            flags |= Record::CONFLICTED;
        }
        if tree.iter().any(|rev| rev.flags() & crate::tree::Rev::HAS_ATTACHMENTS != 0) {
            flags |= Record::HAS_ATTACHMENTS;
        }
        let sequence = self.store.set_expecting(
            doc_id,
            Some(expected_version),
            &version,
            &blob,
            flags,
            txn,
        )?;
        // The revision that was new in this tree now owns the record's
        // sequence.
        for rev in tree.revs_mut() {
            if rev.is_new() {
                rev.set_sequence(sequence);
            }
        }
        Ok(sequence)
    }
}

enum Inserted {
    New(RevId),
    AlreadyPresent(RevId),
}

fn decode_document(record: Record) -> Result<Document> {
    let tree = RevTree::decode(&record.body, 0, record.sequence)?;
    Ok(Document {
        id: record.key,
        tree,
        sequence: record.sequence,
        flags: record.flags,
    })
}

/// Generates a deterministic revision id: the parent's generation plus
/// one, and a digest over the parent id, the deletion flag and the body.
/// Two peers making the same edit derive the same id.
pub fn generate_rev_id(parent: Option<&RevId>, deleted: bool, body: &[u8]) -> RevId {
    let mut hasher = blake3::Hasher::new();
    if let Some(parent) = parent {
        hasher.update(&(parent.len() as u32).to_be_bytes());
        hasher.update(parent.as_bytes());
    }
    hasher.update(&[deleted as u8]);
    hasher.update(body);
    let digest = hasher.finalize();
    let generation = parent.map_or(0, |parent| parent.generation()) + 1;
    RevId::from_parts(generation, hex::encode(&digest.as_bytes()[..16]).as_bytes())
}

/// In-memory interning table for document keys, registered as a shared
/// object when [`crate::store::Options::use_document_keys`] is set.
///
/// The binary document encoding that consumes these mappings is an
/// external collaborator; this table only guarantees one stable id per
/// key string for the lifetime of the file.
#[derive(Debug, Default)]
pub struct DocumentKeys {
    keys: Mutex<Vec<String>>,
}

impl DocumentKeys {
    /// Returns the id for `key`, interning it on first use.
    pub fn intern(&self, key: &str) -> u32 {
        let mut keys = self.keys.lock();
        if let Some(index) = keys.iter().position(|existing| existing == key) {
            return index as u32;
        }
        keys.push(key.to_string());
        (keys.len() - 1) as u32
    }

    /// Looks up the key string for an id.
    pub fn lookup(&self, id: u32) -> Option<String> {
        self.keys.lock().get(id as usize).cloned()
    }
}
