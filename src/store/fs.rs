//! The redb storage engine.
//!
//! One [`DataFile`] maps to one redb database file (or an in-memory
//! backend behind the same code path). Each named [`KeyStore`] owns a
//! records table plus, when it tracks sequences, a by-sequence index
//! table; a single meta table records every store's capabilities and its
//! last assigned sequence.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::{debug, trace, warn};

use super::shared::Shared;
use super::{
    Capabilities, EncryptionAlgorithm, EnumerateOptions, Options, Record, DEFAULT_KEY_STORE,
};
use crate::error::{Error, Result};

/// Store name -> (capability bits, last assigned sequence).
const META_TABLE: TableDefinition<&str, (u8, u64)> = TableDefinition::new("grove.stores");

/// Record value: (version, sequence, flags, body).
type RecordValue<'a> = (&'a [u8], u64, u8, &'a [u8]);

static FILE_IDS: AtomicU64 = AtomicU64::new(1);

struct DataFileInner {
    shared: Arc<Shared>,
    options: Options,
    id: u64,
    in_memory: bool,
    in_transaction: AtomicBool,
    closed: AtomicBool,
    key_stores: Mutex<HashMap<String, KeyStore>>,
    shared_objects: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl DataFileInner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::NotOpen)
        } else {
            Ok(())
        }
    }

    fn db(&self) -> Result<Arc<Database>> {
        self.check_open()?;
        self.shared.db.read().clone().ok_or(Error::NotOpen)
    }

    fn release(&self) {
        if self.shared.open_files.fetch_sub(1, Ordering::AcqRel) == 1 {
            *self.shared.db.write() = None;
        }
    }
}

impl Drop for DataFileInner {
    fn drop(&mut self) {
        if !*self.closed.get_mut() {
            self.release();
        }
    }
}

/// A database file: a container of named [`KeyStore`]s.
///
/// Cheap to clone; clones share one handle. Multiple `DataFile`s opened on
/// the same path cooperate through a per-path [`Shared`] object: their
/// writers serialize, their readers never block each other.
#[derive(Clone)]
pub struct DataFile {
    inner: Arc<DataFileInner>,
}

impl fmt::Debug for DataFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataFile")
            .field("path", &self.inner.shared.path())
            .field("open", &!self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl DataFile {
    /// Opens (or creates, per [`Options::create`]) the database at `path`.
    ///
    /// The engine is chosen by filename extension. The configuration is
    /// fixed for the lifetime of the handle.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<DataFile> {
        let path = path.as_ref();
        super::engine_for_path(path)?;
        check_encryption(&options)?;
        let shared = Shared::for_path(path)?;
        {
            let mut slot = shared.db.write();
            if slot.is_none() {
                let db = if options.create {
                    Database::create(path)?
                } else {
                    Database::open(path).map_err(not_found_as_missing)?
                };
                *slot = Some(Arc::new(db));
            }
        }
        debug!(path = %shared.path().display(), "opened database file");
        Self::finish_open(shared, options, false)
    }

    /// Opens a fresh in-memory database. Nothing is shared between
    /// in-memory instances.
    pub fn open_memory(options: Options) -> Result<DataFile> {
        check_encryption(&options)?;
        let shared = Shared::for_memory();
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())?;
        *shared.db.write() = Some(Arc::new(db));
        Self::finish_open(shared, options, true)
    }

    fn finish_open(shared: Arc<Shared>, options: Options, in_memory: bool) -> Result<DataFile> {
        if options.writeable {
            // Make sure the meta table exists so that read paths can rely
            // on opening it.
            let db = shared.db.read().clone().ok_or(Error::NotOpen)?;
            let txn = db.begin_write()?;
            txn.open_table(META_TABLE)?;
            txn.commit()?;
        }
        shared.open_files.fetch_add(1, Ordering::AcqRel);
        Ok(DataFile {
            inner: Arc::new(DataFileInner {
                shared,
                options,
                id: FILE_IDS.fetch_add(1, Ordering::Relaxed),
                in_memory,
                in_transaction: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                key_stores: Mutex::new(HashMap::new()),
                shared_objects: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// The open options this handle was created with.
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// The canonical path of the file, or `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        if self.inner.in_memory {
            None
        } else {
            Some(self.inner.shared.path())
        }
    }

    /// Whether this handle is still open.
    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    /// Closes this handle. Key-store handles obtained from it fail with
    /// [`Error::NotOpen`] afterwards. The engine handle is released when
    /// the last `DataFile` on the path closes.
    pub fn close(&self) -> Result<()> {
        if self.inner.in_transaction.load(Ordering::Acquire) {
            return Err(Error::TransactionNotClosed);
        }
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.key_stores.lock().clear();
        self.inner.shared_objects.lock().clear();
        self.inner.release();
        debug!(path = %self.inner.shared.path().display(), "closed database file");
        Ok(())
    }

    /// Closes this handle and deletes the file. Fails with [`Error::Busy`]
    /// while other handles on the path are still open.
    pub fn delete_data_file(self) -> Result<()> {
        self.close()?;
        if self.inner.shared.open_files.load(Ordering::Acquire) > 0 {
            return Err(Error::Busy);
        }
        if !self.inner.in_memory {
            std::fs::remove_file(self.inner.shared.path())?;
        }
        Ok(())
    }

    /// The file's default key store, with the default capability set from
    /// the open options.
    pub fn default_key_store(&self) -> Result<KeyStore> {
        self.get_key_store(DEFAULT_KEY_STORE, self.inner.options.key_stores)
    }

    /// Returns a handle to the named key store, creating the handle
    /// lazily. Handles are cached per `DataFile`.
    ///
    /// Capabilities are fixed when the store is first written; asking for
    /// capabilities an existing store does not have is an error.
    pub fn get_key_store(&self, name: &str, capabilities: Capabilities) -> Result<KeyStore> {
        self.inner.check_open()?;
        if name.is_empty() {
            return Err(Error::InvalidParameter("key store name is empty"));
        }
        let mut stores = self.inner.key_stores.lock();
        if let Some(store) = stores.get(name) {
            if !store.capabilities().covers(&capabilities) {
                return Err(Error::InvalidParameter(
                    "key store lacks a requested capability",
                ));
            }
            return Ok(store.clone());
        }
        let effective = match self.persisted_capabilities(name)? {
            Some(persisted) => {
                if !persisted.covers(&capabilities) {
                    return Err(Error::InvalidParameter(
                        "key store lacks a requested capability",
                    ));
                }
                persisted
            }
            None => capabilities,
        };
        let store = KeyStore::new(self.inner.clone(), name, effective);
        stores.insert(name.to_string(), store.clone());
        Ok(store)
    }

    /// Drops the cached handle for the named key store.
    pub fn close_key_store(&self, name: &str) {
        self.inner.key_stores.lock().remove(name);
    }

    /// Names of all key stores ever written in this file.
    pub fn all_key_store_names(&self) -> Result<Vec<String>> {
        let db = self.inner.db()?;
        let txn = db.begin_read()?;
        let meta = match txn.open_table(META_TABLE) {
            Ok(meta) => meta,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut names = Vec::new();
        for entry in meta.iter()? {
            let (key, _) = entry?;
            names.push(key.value().to_string());
        }
        Ok(names)
    }

    fn persisted_capabilities(&self, name: &str) -> Result<Option<Capabilities>> {
        let db = self.inner.db()?;
        let txn = db.begin_read()?;
        let meta = match txn.open_table(META_TABLE) {
            Ok(meta) => meta,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(meta
            .get(name)?
            .map(|guard| Capabilities::from_bits(guard.value().0)))
    }

    /// Starts a write transaction, waiting until no other transaction is
    /// live on this file anywhere in the process.
    pub fn transaction(&self) -> Result<Transaction> {
        Transaction::begin(self)
    }

    /// Pins a read snapshot. Multiple snapshots may be live at once and
    /// may coexist with a writer, isolated from its in-flight changes.
    pub fn read_snapshot(&self) -> Result<ReadOnlyTransaction> {
        ReadOnlyTransaction::begin(self)
    }

    /// Runs `f` while holding the file write lock, without opening an
    /// engine transaction. Must not be called while this thread holds a
    /// [`Transaction`] on the same file.
    pub fn with_file_lock<T>(&self, f: impl FnOnce() -> T) -> Result<T> {
        self.inner.check_open()?;
        let _guard = self.inner.shared.writer.lock();
        Ok(f())
    }

    /// Looks up a shared helper object registered on this file.
    pub fn shared_object(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.shared_objects.lock().get(key).cloned()
    }

    /// Registers a shared helper object, returning the existing one if the
    /// key is already taken. Shared objects live until the file closes.
    pub fn add_shared_object(
        &self,
        key: &str,
        object: Arc<dyn Any + Send + Sync>,
    ) -> Arc<dyn Any + Send + Sync> {
        self.inner
            .shared_objects
            .lock()
            .entry(key.to_string())
            .or_insert(object)
            .clone()
    }
}

fn check_encryption(options: &Options) -> Result<()> {
    match options.encryption_algorithm {
        EncryptionAlgorithm::None => {
            if options.encryption_key.is_some() {
                Err(Error::Crypto(
                    "encryption key given without an algorithm".into(),
                ))
            } else {
                Ok(())
            }
        }
        EncryptionAlgorithm::Aes256 => Err(Error::Crypto(
            "this engine does not support at-rest encryption".into(),
        )),
    }
}

fn not_found_as_missing(err: redb::DatabaseError) -> Error {
    match err {
        redb::DatabaseError::Storage(redb::StorageError::Io(io))
            if io.kind() == std::io::ErrorKind::NotFound =>
        {
            Error::NotFound
        }
        other => other.into(),
    }
}

/// Exclusive write access to a [`DataFile`] while in scope.
///
/// Constructing one acquires the process-wide write lock for the file and
/// starts an engine write transaction; the commit at scope exit is atomic
/// across every key store touched. Call [`Transaction::abort`] to roll
/// back instead.
pub struct Transaction {
    inner: Arc<DataFileInner>,
    txn: Option<redb::WriteTransaction>,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("path", &self.inner.shared.path())
            .field("active", &self.txn.is_some())
            .finish()
    }
}

impl Transaction {
    fn begin(file: &DataFile) -> Result<Transaction> {
        let inner = file.inner.clone();
        inner.check_open()?;
        if !inner.options.writeable {
            return Err(Error::NotWriteable);
        }
        // Nested transactions on one DataFile are a caller bug, not a
        // blocking condition.
        if inner.in_transaction.swap(true, Ordering::AcqRel) {
            return Err(Error::TransactionNotClosed);
        }
        match Self::acquire(&inner) {
            Ok((guard, txn)) => {
                trace!(path = %inner.shared.path().display(), "transaction began");
                Ok(Transaction {
                    inner,
                    txn: Some(txn),
                    guard: Some(guard),
                })
            }
            Err(err) => {
                inner.in_transaction.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    fn acquire(
        inner: &Arc<DataFileInner>,
    ) -> Result<(ArcMutexGuard<RawMutex, ()>, redb::WriteTransaction)> {
        // Blocks until every other writer on this path has finished.
        let guard = inner.shared.writer.lock_arc();
        let db = inner.db()?;
        let txn = db.begin_write()?;
        inner.shared.transactions.lock().writer = Some(inner.id);
        Ok((guard, txn))
    }

    pub(crate) fn write(&self) -> Result<&redb::WriteTransaction> {
        self.txn.as_ref().ok_or(Error::NotOpen)
    }

    pub(crate) fn check_file(&self, inner: &Arc<DataFileInner>) -> Result<()> {
        if Arc::ptr_eq(&self.inner, inner) {
            Ok(())
        } else {
            Err(Error::InvalidParameter(
                "transaction belongs to a different data file",
            ))
        }
    }

    /// Commits now instead of at scope exit.
    pub fn commit(mut self) -> Result<()> {
        self.end(true)
    }

    /// Rolls back everything written in this transaction.
    pub fn abort(mut self) -> Result<()> {
        self.end(false)
    }

    fn end(&mut self, commit: bool) -> Result<()> {
        let txn = self.txn.take().ok_or(Error::NotOpen)?;
        let result = if commit {
            txn.commit().map_err(Error::from)
        } else {
            txn.abort().map_err(Error::from)
        };
        self.inner.shared.transactions.lock().writer = None;
        self.inner.in_transaction.store(false, Ordering::Release);
        drop(self.guard.take());
        trace!(committed = commit, "transaction ended");
        result
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.txn.is_none() {
            return;
        }
        // Scope exit commits; an unwinding scope rolls back.
        let commit = !std::thread::panicking();
        if let Err(err) = self.end(commit) {
            warn!("implicit transaction end failed: {err}");
        }
    }
}

/// A pinned, consistent read snapshot of a [`DataFile`].
pub struct ReadOnlyTransaction {
    inner: Arc<DataFileInner>,
    txn: redb::ReadTransaction,
}

impl fmt::Debug for ReadOnlyTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOnlyTransaction")
            .field("path", &self.inner.shared.path())
            .finish()
    }
}

impl ReadOnlyTransaction {
    fn begin(file: &DataFile) -> Result<ReadOnlyTransaction> {
        let inner = file.inner.clone();
        let db = inner.db()?;
        let txn = db.begin_read()?;
        inner.shared.transactions.lock().readers += 1;
        Ok(ReadOnlyTransaction { inner, txn })
    }

    fn read(&self) -> &redb::ReadTransaction {
        &self.txn
    }
}

impl Drop for ReadOnlyTransaction {
    fn drop(&mut self) {
        let mut registry = self.inner.shared.transactions.lock();
        registry.readers = registry.readers.saturating_sub(1);
    }
}

/// A named, ordered mapping from record keys to [`Record`]s inside a
/// [`DataFile`]. Handles are cheap to clone and become unusable when their
/// file closes.
#[derive(Clone)]
pub struct KeyStore {
    inner: Arc<DataFileInner>,
    name: String,
    records_table: String,
    sequences_table: String,
    capabilities: Capabilities,
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl KeyStore {
    fn new(inner: Arc<DataFileInner>, name: &str, capabilities: Capabilities) -> KeyStore {
        KeyStore {
            inner,
            name: name.to_string(),
            records_table: format!("kv.{name}"),
            sequences_table: format!("seq.{name}"),
            capabilities,
        }
    }

    /// The store's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The store's capability set.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn records_def(&self) -> TableDefinition<'_, &'static [u8], RecordValue<'static>> {
        TableDefinition::new(&self.records_table)
    }

    fn sequences_def(&self) -> TableDefinition<'_, u64, &'static [u8]> {
        TableDefinition::new(&self.sequences_table)
    }

    /// Reads a record from a fresh snapshot.
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>> {
        let db = self.inner.db()?;
        let txn = db.begin_read()?;
        self.get_at(&txn, key)
    }

    /// Reads a record from a pinned snapshot.
    pub fn get_in(&self, key: &[u8], snapshot: &ReadOnlyTransaction) -> Result<Option<Record>> {
        if !Arc::ptr_eq(&self.inner, &snapshot.inner) {
            return Err(Error::InvalidParameter(
                "snapshot belongs to a different data file",
            ));
        }
        self.get_at(snapshot.read(), key)
    }

    /// Reads a record through the live write transaction, observing
    /// writes made earlier in the same transaction.
    pub fn get_for_update(&self, key: &[u8], txn: &Transaction) -> Result<Option<Record>> {
        txn.check_file(&self.inner)?;
        let write = txn.write()?;
        let table = write.open_table(self.records_def())?;
        let Some(guard) = table.get(key)? else {
            return Ok(None);
        };
        Ok(Some(record_from(key, guard.value())))
    }

    fn get_at(&self, txn: &redb::ReadTransaction, key: &[u8]) -> Result<Option<Record>> {
        let table = match txn.open_table(self.records_def()) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Some(guard) = table.get(key)? else {
            return Ok(None);
        };
        Ok(Some(record_from(key, guard.value())))
    }

    /// Looks up the record that was last written under `sequence`.
    pub fn get_by_sequence(&self, sequence: u64) -> Result<Option<Record>> {
        self.require_sequences()?;
        let db = self.inner.db()?;
        let txn = db.begin_read()?;
        let sequences = match txn.open_table(self.sequences_def()) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Some(guard) = sequences.get(&sequence)? else {
            return Ok(None);
        };
        let key = Bytes::copy_from_slice(guard.value());
        drop(guard);
        drop(sequences);
        self.get_at(&txn, &key)
    }

    /// Writes a record, atomically within `txn`. Returns the newly
    /// assigned sequence, or 0 if the store does not track sequences.
    pub fn set(
        &self,
        key: &[u8],
        version: &[u8],
        body: &[u8],
        flags: u8,
        txn: &Transaction,
    ) -> Result<u64> {
        self.set_expecting(key, None, version, body, flags, txn)
    }

    /// Like [`Self::set`], but fails with [`Error::Conflict`] unless the
    /// record's current version matches `expected_version` (empty means
    /// "record must not exist").
    pub fn set_expecting(
        &self,
        key: &[u8],
        expected_version: Option<&[u8]>,
        version: &[u8],
        body: &[u8],
        flags: u8,
        txn: &Transaction,
    ) -> Result<u64> {
        txn.check_file(&self.inner)?;
        let write = txn.write()?;
        let mut records = write.open_table(self.records_def())?;

        let existing = match records.get(key)? {
            Some(guard) => {
                let value = guard.value();
                Some((Bytes::copy_from_slice(value.0), value.1))
            }
            None => None,
        };
        if let Some(expected) = expected_version {
            let matches = match &existing {
                Some((current, _)) => current.as_ref() == expected,
                None => expected.is_empty(),
            };
            if !matches {
                return Err(Error::Conflict);
            }
        }

        let sequence = if self.capabilities.sequences {
            let next = self.bump_sequence(write)?;
            let mut sequences = write.open_table(self.sequences_def())?;
            if let Some((_, old_sequence)) = &existing {
                if *old_sequence != 0 {
                    sequences.remove(old_sequence)?;
                }
            }
            sequences.insert(&next, key)?;
            next
        } else {
            self.ensure_registered(write)?;
            0
        };

        records.insert(key, (version, sequence, flags, body))?;
        trace!(store = %self.name, sequence, "set record");
        Ok(sequence)
    }

    /// Deletes a record: a tombstone write when the store keeps soft
    /// deletes, a hard removal otherwise. Returns whether anything
    /// changed.
    pub fn del(&self, key: &[u8], txn: &Transaction) -> Result<bool> {
        txn.check_file(&self.inner)?;
        let write = txn.write()?;
        let mut records = write.open_table(self.records_def())?;

        let existing = match records.get(key)? {
            Some(guard) => {
                let value = guard.value();
                let tombstone = value.2 & Record::DELETED != 0 && value.3.is_empty();
                Some((value.1, tombstone))
            }
            None => None,
        };
        let Some((old_sequence, already_tombstone)) = existing else {
            return Ok(false);
        };

        if self.capabilities.soft_deletes {
            if already_tombstone {
                return Ok(false);
            }
            let sequence = if self.capabilities.sequences {
                let next = self.bump_sequence(write)?;
                let mut sequences = write.open_table(self.sequences_def())?;
                if old_sequence != 0 {
                    sequences.remove(&old_sequence)?;
                }
                sequences.insert(&next, key)?;
                next
            } else {
                0
            };
            records.insert(key, (&[] as &[u8], sequence, Record::DELETED, &[] as &[u8]))?;
        } else {
            records.remove(key)?;
            if self.capabilities.sequences && old_sequence != 0 {
                let mut sequences = write.open_table(self.sequences_def())?;
                sequences.remove(&old_sequence)?;
            }
        }
        Ok(true)
    }

    /// The last sequence assigned in this store, committed or in flight.
    pub fn last_sequence(&self) -> Result<u64> {
        let db = self.inner.db()?;
        let txn = db.begin_read()?;
        let meta = match txn.open_table(META_TABLE) {
            Ok(meta) => meta,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        Ok(meta
            .get(self.name.as_str())?
            .map(|guard| guard.value().1)
            .unwrap_or(0))
    }

    /// Number of records, including soft-delete tombstones.
    pub fn record_count(&self) -> Result<u64> {
        let db = self.inner.db()?;
        let txn = db.begin_read()?;
        match txn.open_table(self.records_def()) {
            Ok(table) => Ok(table.len()?),
            Err(redb::TableError::TableDoesNotExist(_)) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Iterates over records ordered by key, from a fresh snapshot.
    ///
    /// The iteration can be resumed later by passing the last yielded key
    /// as [`EnumerateOptions::start_after`].
    pub fn enumerate(&self, options: &EnumerateOptions) -> Result<RecordIter> {
        let db = self.inner.db()?;
        let txn = db.begin_read()?;
        let table = match txn.open_table(self.records_def()) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => {
                return Ok(RecordIter {
                    range: None,
                    descending: options.descending,
                    skip_deleted: options.skip_deleted,
                })
            }
            Err(err) => return Err(err.into()),
        };
        // A resume cursor supersedes the range bound on its side.
        let mut lower = match &options.min_key {
            Some(min) => Bound::Included(min.as_ref()),
            None => Bound::Unbounded,
        };
        let mut upper = match &options.max_key {
            Some(max) => Bound::Included(max.as_ref()),
            None => Bound::Unbounded,
        };
        if let Some(cursor) = &options.start_after {
            if options.descending {
                upper = Bound::Excluded(cursor.as_ref());
            } else {
                lower = Bound::Excluded(cursor.as_ref());
            }
        }
        let range = table.range::<&[u8]>((lower, upper))?;
        Ok(RecordIter {
            range: Some(range),
            descending: options.descending,
            skip_deleted: options.skip_deleted,
        })
    }

    /// Iterates over records in sequence order, starting after `since`.
    pub fn enumerate_by_sequence(
        &self,
        since: u64,
        options: &EnumerateOptions,
    ) -> Result<SequenceIter> {
        self.require_sequences()?;
        let db = self.inner.db()?;
        let txn = db.begin_read()?;
        let sequences = match txn.open_table(self.sequences_def()) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => {
                return Ok(SequenceIter {
                    range: None,
                    records: None,
                    descending: options.descending,
                    skip_deleted: options.skip_deleted,
                })
            }
            Err(err) => return Err(err.into()),
        };
        let records = match txn.open_table(self.records_def()) {
            Ok(table) => Some(table),
            Err(redb::TableError::TableDoesNotExist(_)) => None,
            Err(err) => return Err(err.into()),
        };
        let range = sequences.range::<u64>((Bound::Excluded(since), Bound::Unbounded))?;
        Ok(SequenceIter {
            range: Some(range),
            records,
            descending: options.descending,
            skip_deleted: options.skip_deleted,
        })
    }

    fn require_sequences(&self) -> Result<()> {
        if self.capabilities.sequences {
            Ok(())
        } else {
            Err(Error::InvalidParameter("key store does not track sequences"))
        }
    }

    fn bump_sequence(&self, write: &redb::WriteTransaction) -> Result<u64> {
        let mut meta = write.open_table(META_TABLE)?;
        let last = meta
            .get(self.name.as_str())?
            .map(|guard| guard.value().1)
            .unwrap_or(0);
        let next = last + 1;
        meta.insert(self.name.as_str(), (self.capabilities.to_bits(), next))?;
        Ok(next)
    }

    fn ensure_registered(&self, write: &redb::WriteTransaction) -> Result<()> {
        let mut meta = write.open_table(META_TABLE)?;
        if meta.get(self.name.as_str())?.is_none() {
            meta.insert(self.name.as_str(), (self.capabilities.to_bits(), 0u64))?;
        }
        Ok(())
    }
}

fn record_from(key: &[u8], value: RecordValue<'_>) -> Record {
    let (version, sequence, flags, body) = value;
    Record {
        key: Bytes::copy_from_slice(key),
        version: Bytes::copy_from_slice(version),
        sequence,
        flags,
        body: Bytes::copy_from_slice(body),
    }
}

/// Iterator over records in key order. Reads from the snapshot that was
/// current when it was created.
pub struct RecordIter {
    range: Option<redb::Range<'static, &'static [u8], RecordValue<'static>>>,
    descending: bool,
    skip_deleted: bool,
}

impl Iterator for RecordIter {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let range = self.range.as_mut()?;
        loop {
            let next = if self.descending {
                range.next_back()
            } else {
                range.next()
            };
            match next {
                None => return None,
                Some(Err(err)) => return Some(Err(err.into())),
                Some(Ok((key, value))) => {
                    let record = record_from(key.value(), value.value());
                    if self.skip_deleted && record.is_tombstone() {
                        continue;
                    }
                    return Some(Ok(record));
                }
            }
        }
    }
}

impl fmt::Debug for RecordIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecordIter")
    }
}

/// Iterator over records in sequence order.
pub struct SequenceIter {
    range: Option<redb::Range<'static, u64, &'static [u8]>>,
    records: Option<redb::ReadOnlyTable<&'static [u8], RecordValue<'static>>>,
    descending: bool,
    skip_deleted: bool,
}

impl Iterator for SequenceIter {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let range = self.range.as_mut()?;
        loop {
            let next = if self.descending {
                range.next_back()
            } else {
                range.next()
            };
            let (sequence, key) = match next {
                None => return None,
                Some(Err(err)) => return Some(Err(err.into())),
                Some(Ok((sequence, key))) => {
                    (sequence.value(), Bytes::copy_from_slice(key.value()))
                }
            };
            let Some(records) = &self.records else {
                return Some(Err(Error::engine("sequence index without records")));
            };
            match records.get(key.as_ref()) {
                Err(err) => return Some(Err(err.into())),
                Ok(None) => {
                    // The index pointed at a removed record.
                    return Some(Err(Error::engine(format!(
                        "dangling sequence index entry {sequence}"
                    ))));
                }
                Ok(Some(guard)) => {
                    let record = record_from(&key, guard.value());
                    if self.skip_deleted && record.is_tombstone() {
                        continue;
                    }
                    return Some(Ok(record));
                }
            }
        }
    }
}

impl fmt::Debug for SequenceIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SequenceIter")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_file() -> DataFile {
        DataFile::open_memory(Options::default()).unwrap()
    }

    fn documents_store(file: &DataFile) -> KeyStore {
        file.get_key_store("docs", Capabilities::DOCUMENTS).unwrap()
    }

    #[test]
    fn set_and_get_roundtrip() {
        let file = memory_file();
        let store = documents_store(&file);

        let txn = file.transaction().unwrap();
        let sequence = store.set(b"doc1", b"1-a", b"hello", 0, &txn).unwrap();
        assert_eq!(sequence, 1);
        txn.commit().unwrap();

        let record = store.get(b"doc1").unwrap().unwrap();
        assert_eq!(record.key.as_ref(), b"doc1");
        assert_eq!(record.version.as_ref(), b"1-a");
        assert_eq!(record.sequence, 1);
        assert_eq!(record.body.as_ref(), b"hello");
        assert!(store.get(b"doc2").unwrap().is_none());
    }

    #[test]
    fn sequences_are_dense_and_monotonic() {
        let file = memory_file();
        let store = documents_store(&file);

        let txn = file.transaction().unwrap();
        for i in 0..5u8 {
            let seq = store.set(&[b'k', i], b"v", b"b", 0, &txn).unwrap();
            assert_eq!(seq, u64::from(i) + 1);
        }
        txn.commit().unwrap();

        // Updating a record assigns a fresh sequence and retires the old.
        let txn = file.transaction().unwrap();
        let seq = store.set(b"k\x00", b"v2", b"b2", 0, &txn).unwrap();
        assert_eq!(seq, 6);
        txn.commit().unwrap();

        assert_eq!(store.last_sequence().unwrap(), 6);
        assert!(store.get_by_sequence(1).unwrap().is_none());
        let record = store.get_by_sequence(6).unwrap().unwrap();
        assert_eq!(record.body.as_ref(), b"b2");

        let sequences: Vec<u64> = store
            .enumerate_by_sequence(0, &EnumerateOptions::default())
            .unwrap()
            .map(|record| record.unwrap().sequence)
            .collect();
        assert_eq!(sequences, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn abort_rolls_back() {
        let file = memory_file();
        let store = documents_store(&file);

        let txn = file.transaction().unwrap();
        store.set(b"doc", b"1-a", b"x", 0, &txn).unwrap();
        txn.abort().unwrap();

        assert!(store.get(b"doc").unwrap().is_none());
        // Sequence numbering rolls back with the transaction.
        let txn = file.transaction().unwrap();
        let seq = store.set(b"doc", b"1-a", b"x", 0, &txn).unwrap();
        assert_eq!(seq, 1);
        txn.commit().unwrap();
    }

    #[test]
    fn drop_commits() {
        let file = memory_file();
        let store = documents_store(&file);
        {
            let txn = file.transaction().unwrap();
            store.set(b"doc", b"1-a", b"x", 0, &txn).unwrap();
            // txn dropped here without an explicit commit
        }
        assert!(store.get(b"doc").unwrap().is_some());
    }

    #[test]
    fn writer_sees_own_changes_readers_do_not() {
        let file = memory_file();
        let store = documents_store(&file);

        let txn = file.transaction().unwrap();
        store.set(b"doc", b"1-a", b"x", 0, &txn).unwrap();

        // Uncommitted writes are visible through the transaction...
        let in_txn = store.get_for_update(b"doc", &txn).unwrap();
        assert!(in_txn.is_some());
        // ...but not to fresh snapshots.
        assert!(store.get(b"doc").unwrap().is_none());
        txn.commit().unwrap();
        assert!(store.get(b"doc").unwrap().is_some());
    }

    #[test]
    fn pinned_snapshot_is_stable() {
        let file = memory_file();
        let store = documents_store(&file);

        let txn = file.transaction().unwrap();
        store.set(b"doc", b"1-a", b"old", 0, &txn).unwrap();
        txn.commit().unwrap();

        let snapshot = file.read_snapshot().unwrap();
        let txn = file.transaction().unwrap();
        store.set(b"doc", b"2-b", b"new", 0, &txn).unwrap();
        txn.commit().unwrap();

        let pinned = store.get_in(b"doc", &snapshot).unwrap().unwrap();
        assert_eq!(pinned.body.as_ref(), b"old");
        let fresh = store.get(b"doc").unwrap().unwrap();
        assert_eq!(fresh.body.as_ref(), b"new");
    }

    #[test]
    fn optimistic_version_check() {
        let file = memory_file();
        let store = documents_store(&file);

        let txn = file.transaction().unwrap();
        store
            .set_expecting(b"doc", Some(b""), b"1-a", b"x", 0, &txn)
            .unwrap();
        // Stale expectation fails and leaves the record alone.
        let err = store
            .set_expecting(b"doc", Some(b"0-stale"), b"2-b", b"y", 0, &txn)
            .unwrap_err();
        assert!(matches!(err, Error::Conflict));
        // Matching expectation succeeds.
        store
            .set_expecting(b"doc", Some(b"1-a"), b"2-b", b"y", 0, &txn)
            .unwrap();
        txn.commit().unwrap();

        let record = store.get(b"doc").unwrap().unwrap();
        assert_eq!(record.version.as_ref(), b"2-b");
    }

    #[test]
    fn soft_delete_leaves_tombstone() {
        let file = memory_file();
        let store = documents_store(&file);

        let txn = file.transaction().unwrap();
        store.set(b"doc", b"1-a", b"x", 0, &txn).unwrap();
        assert!(store.del(b"doc", &txn).unwrap());
        txn.commit().unwrap();

        let record = store.get(b"doc").unwrap().unwrap();
        assert!(record.is_tombstone());
        assert_eq!(record.sequence, 2);

        // Deleting a tombstone again is a no-op.
        let txn = file.transaction().unwrap();
        assert!(!store.del(b"doc", &txn).unwrap());
        txn.commit().unwrap();
    }

    #[test]
    fn hard_delete_removes_record() {
        let file = memory_file();
        let store = file
            .get_key_store(
                "plain",
                Capabilities {
                    sequences: true,
                    soft_deletes: false,
                },
            )
            .unwrap();

        let txn = file.transaction().unwrap();
        store.set(b"doc", b"1-a", b"x", 0, &txn).unwrap();
        assert!(store.del(b"doc", &txn).unwrap());
        assert!(!store.del(b"doc", &txn).unwrap());
        txn.commit().unwrap();

        assert!(store.get(b"doc").unwrap().is_none());
        assert!(store.get_by_sequence(1).unwrap().is_none());
    }

    #[test]
    fn enumerate_with_cursor() {
        let file = memory_file();
        let store = documents_store(&file);

        let txn = file.transaction().unwrap();
        for key in [b"a", b"b", b"c", b"d"] {
            store.set(key, b"v", b"body", 0, &txn).unwrap();
        }
        txn.commit().unwrap();

        let mut iter = store.enumerate(&EnumerateOptions::default()).unwrap();
        let first = iter.next().unwrap().unwrap();
        let second = iter.next().unwrap().unwrap();
        assert_eq!(first.key.as_ref(), b"a");
        assert_eq!(second.key.as_ref(), b"b");
        drop(iter);

        // Resume from the cursor: exactly the unseen suffix.
        let rest: Vec<Bytes> = store
            .enumerate(&EnumerateOptions::start_after(second.key.clone()))
            .unwrap()
            .map(|record| record.unwrap().key)
            .collect();
        assert_eq!(rest, vec![Bytes::from_static(b"c"), Bytes::from_static(b"d")]);

        let descending: Vec<Bytes> = store
            .enumerate(&EnumerateOptions::descending())
            .unwrap()
            .map(|record| record.unwrap().key)
            .collect();
        assert_eq!(
            descending,
            [b"d", b"c", b"b", b"a"]
                .iter()
                .map(|key| Bytes::from_static(*key))
                .collect::<Vec<_>>()
        );

        let bounded: Vec<Bytes> = store
            .enumerate(&EnumerateOptions::range(&b"b"[..], &b"c"[..]))
            .unwrap()
            .map(|record| record.unwrap().key)
            .collect();
        assert_eq!(bounded, vec![Bytes::from_static(b"b"), Bytes::from_static(b"c")]);
    }

    #[test]
    fn key_store_capabilities_are_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.grove");

        let file = DataFile::open(&path, Options::default()).unwrap();
        let store = file
            .get_key_store("checkpoints", Capabilities::NONE)
            .unwrap();
        let txn = file.transaction().unwrap();
        store.set(b"k", b"", b"v", 0, &txn).unwrap();
        txn.commit().unwrap();
        file.close().unwrap();

        let file = DataFile::open(&path, Options::default()).unwrap();
        // Asking for more than the store was created with fails.
        let err = file
            .get_key_store("checkpoints", Capabilities::DOCUMENTS)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
        // Asking for less (or the same) succeeds with the persisted set.
        let store = file
            .get_key_store("checkpoints", Capabilities::NONE)
            .unwrap();
        assert_eq!(store.capabilities(), Capabilities::NONE);
        assert!(file
            .all_key_store_names()
            .unwrap()
            .contains(&"checkpoints".to_string()));
    }

    #[test]
    fn nested_transaction_is_an_error() {
        let file = memory_file();
        let _txn = file.transaction().unwrap();
        assert!(matches!(
            file.transaction(),
            Err(Error::TransactionNotClosed)
        ));
    }

    #[test]
    fn read_only_refuses_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.grove");
        DataFile::open(&path, Options::default())
            .unwrap()
            .close()
            .unwrap();

        let file = DataFile::open(&path, Options::read_only()).unwrap();
        assert!(matches!(file.transaction(), Err(Error::NotWriteable)));
    }

    #[test]
    fn missing_file_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.grove");
        assert!(matches!(
            DataFile::open(&path, Options::read_only()),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn unsupported_encryption() {
        let options = Options {
            encryption_algorithm: EncryptionAlgorithm::Aes256,
            encryption_key: Some(Bytes::from_static(&[0u8; 32])),
            ..Default::default()
        };
        assert!(matches!(
            DataFile::open_memory(options),
            Err(Error::Crypto(_))
        ));
    }

    #[test]
    fn closed_file_rejects_operations() {
        let file = memory_file();
        let store = documents_store(&file);
        file.close().unwrap();

        assert!(matches!(store.get(b"x"), Err(Error::NotOpen)));
        assert!(matches!(file.transaction(), Err(Error::NotOpen)));
        assert!(matches!(
            file.get_key_store("other", Capabilities::NONE),
            Err(Error::NotOpen)
        ));
    }

    #[test]
    fn shared_objects_live_with_the_file() {
        let file = memory_file();
        let first = file.add_shared_object("keys", Arc::new(42u32));
        let again = file.add_shared_object("keys", Arc::new(7u32));
        // The first registration wins.
        assert_eq!(*again.downcast::<u32>().unwrap(), 42);
        assert!(file.shared_object("keys").is_some());
        assert!(file.shared_object("other").is_none());
        let _ = first;
        file.close().unwrap();
        assert!(file.shared_object("keys").is_none());
    }

    #[test]
    fn persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.grove");

        let file = DataFile::open(&path, Options::default()).unwrap();
        let store = documents_store(&file);
        let txn = file.transaction().unwrap();
        store.set(b"doc", b"1-a", b"persisted", 0, &txn).unwrap();
        txn.commit().unwrap();
        file.close().unwrap();

        let file = DataFile::open(&path, Options::default()).unwrap();
        let store = documents_store(&file);
        let record = store.get(b"doc").unwrap().unwrap();
        assert_eq!(record.body.as_ref(), b"persisted");
        assert_eq!(store.last_sequence().unwrap(), 1);
    }
}
