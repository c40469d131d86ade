//! An embeddable document database with replication.
//!
//! Every document carries a [revision tree](RevTree): an append-only,
//! branchable history where each revision is labeled by a
//! generation-prefixed digest ([`RevId`]), may hold an opaque body, and
//! points at its parent. The tree is what makes multi-master replication
//! correct: concurrent edits become branches, conflicts are detected
//! instead of silently resolved, and every replica picks the same current
//! revision deterministically.
//!
//! Documents live in named [key stores](store::KeyStore) inside a single
//! [database file](store::DataFile) backed by [`redb`]; writers serialize
//! at file granularity through a process-wide lock table while readers
//! observe consistent snapshots. The [`docs::DocumentStore`] maps between
//! documents and their packed on-disk form ([`tree::raw`]), and the
//! [`replicator`] pulls revisions from a peer over a message-oriented
//! connection, tracking progress with contiguous-prefix checkpoints.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod actor;
pub mod docs;
mod error;
pub mod replicator;
pub mod revid;
pub mod store;
pub mod tree;

pub use self::error::{Domain, Error, Result};
pub use self::revid::RevId;
pub use self::tree::{Rev, RevTree, Sequence};
