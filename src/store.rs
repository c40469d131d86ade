//! Storage: database files, named key stores, transactions.
//!
//! A [`DataFile`] is a single file holding any number of named
//! [`KeyStore`]s. Writers serialize at file granularity through a
//! process-wide lock table ([`shared`]); readers observe engine snapshots
//! and never block. The engine behind a path is chosen by filename
//! extension through [`engine_for_path`].

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};

pub mod fs;
pub(crate) mod shared;

pub use fs::{DataFile, KeyStore, ReadOnlyTransaction, RecordIter, SequenceIter, Transaction};

/// Name of the key store used for documents unless callers pick another.
pub const DEFAULT_KEY_STORE: &str = "default";
/// Name of the key store holding file-level bookkeeping records.
pub const INFO_KEY_STORE: &str = "info";

/// Feature flags of a [`KeyStore`], fixed when the store is first created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Maintain per-record sequences and a by-sequence index.
    pub sequences: bool,
    /// Deletions leave a tombstone record with an empty body.
    pub soft_deletes: bool,
}

impl Capabilities {
    /// No optional features.
    pub const NONE: Capabilities = Capabilities {
        sequences: false,
        soft_deletes: false,
    };

    /// Everything a document store needs.
    pub const DOCUMENTS: Capabilities = Capabilities {
        sequences: true,
        soft_deletes: true,
    };

    pub(crate) fn to_bits(self) -> u8 {
        (self.sequences as u8) | ((self.soft_deletes as u8) << 1)
    }

    pub(crate) fn from_bits(bits: u8) -> Capabilities {
        Capabilities {
            sequences: bits & 0x01 != 0,
            soft_deletes: bits & 0x02 != 0,
        }
    }

    /// Whether every capability in `other` is also in `self`.
    pub fn covers(&self, other: &Capabilities) -> bool {
        (self.sequences || !other.sequences) && (self.soft_deletes || !other.soft_deletes)
    }
}

/// At-rest encryption selection for a database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionAlgorithm {
    /// No encryption.
    #[default]
    None,
    /// AES-256. Not supported by the current engine.
    Aes256,
}

/// Callback extracting the structured-data slice from a record body.
///
/// Used by external indexing layers; the storage layer itself never looks
/// inside bodies.
pub type ContentAccessor = Arc<dyn for<'a> Fn(&'a [u8]) -> &'a [u8] + Send + Sync>;

/// Configuration consumed by [`DataFile::open`]. Fixed for the lifetime of
/// the handle.
#[derive(derive_more::Debug, Clone)]
pub struct Options {
    /// Create the file if it does not exist.
    pub create: bool,
    /// Open writable; `false` means read-only.
    pub writeable: bool,
    /// Maintain a shared document-key table for binary document encoding.
    pub use_document_keys: bool,
    /// At-rest encryption algorithm.
    pub encryption_algorithm: EncryptionAlgorithm,
    /// Encryption key material, when encrypting.
    pub encryption_key: Option<Bytes>,
    /// Default capabilities for implicitly created key stores.
    pub key_stores: Capabilities,
    /// Callback to extract structured data from a record body.
    #[debug(skip)]
    pub content_accessor: Option<ContentAccessor>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            create: true,
            writeable: true,
            use_document_keys: false,
            encryption_algorithm: EncryptionAlgorithm::None,
            encryption_key: None,
            key_stores: Capabilities::NONE,
            content_accessor: None,
        }
    }
}

impl Options {
    /// Read-only variant of the default options.
    pub fn read_only() -> Self {
        Options {
            create: false,
            writeable: false,
            ..Default::default()
        }
    }
}

/// One entry of a [`KeyStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    /// The record key.
    pub key: Bytes,
    /// Opaque version used for optimistic concurrency.
    pub version: Bytes,
    /// Per-store sequence assigned at write, 0 if the store does not track
    /// sequences.
    pub sequence: u64,
    /// Flag bits; see the associated constants.
    pub flags: u8,
    /// The record body.
    pub body: Bytes,
}

impl Record {
    /// The record (or the document it holds) is deleted.
    pub const DELETED: u8 = 0x01;
    /// The document has conflicting live revisions.
    pub const CONFLICTED: u8 = 0x02;
    /// The document body references attachments.
    pub const HAS_ATTACHMENTS: u8 = 0x04;

    /// Whether this is a soft-delete tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.flags & Record::DELETED != 0 && self.body.is_empty()
    }
}

/// Options for [`KeyStore::enumerate`] and
/// [`KeyStore::enumerate_by_sequence`].
#[derive(Debug, Clone, Default)]
pub struct EnumerateOptions {
    /// Lowest key to yield, inclusive.
    pub min_key: Option<Bytes>,
    /// Highest key to yield, inclusive.
    pub max_key: Option<Bytes>,
    /// Iterate in descending order.
    pub descending: bool,
    /// Resume after this cursor (a key previously yielded). Takes
    /// precedence over the range bound it supersedes.
    pub start_after: Option<Bytes>,
    /// Skip soft-delete tombstones.
    pub skip_deleted: bool,
}

impl EnumerateOptions {
    /// Descending iteration.
    pub fn descending() -> Self {
        EnumerateOptions {
            descending: true,
            ..Default::default()
        }
    }

    /// Resume a previous enumeration after `cursor`.
    pub fn start_after(cursor: impl Into<Bytes>) -> Self {
        EnumerateOptions {
            start_after: Some(cursor.into()),
            ..Default::default()
        }
    }

    /// Iterate the inclusive key range `min..=max`.
    pub fn range(min: impl Into<Bytes>, max: impl Into<Bytes>) -> Self {
        EnumerateOptions {
            min_key: Some(min.into()),
            max_key: Some(max.into()),
            ..Default::default()
        }
    }
}

/// Storage engines known to this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    /// The [`redb`] engine behind [`fs::DataFile`].
    Redb,
}

/// Filename extensions and the engine registered for each.
const ENGINES: &[(&str, Engine)] = &[("grove", Engine::Redb), ("redb", Engine::Redb)];

/// Picks the engine for a path by filename extension.
pub fn engine_for_path(path: &Path) -> Result<Engine> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .ok_or(Error::InvalidParameter("database path has no extension"))?;
    ENGINES
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, engine)| *engine)
        .ok_or(Error::InvalidParameter(
            "no storage engine registered for this extension",
        ))
}
