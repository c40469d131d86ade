//! Process-wide state shared by all [`DataFile`](super::DataFile) handles
//! on one path: the file write lock, the engine handle, and the registry
//! of live transactions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::error::Result;

/// Global registry of per-path shared state, keyed by canonical path.
static REGISTRY: Lazy<Mutex<HashMap<PathBuf, Weak<Shared>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Counter used to key in-memory databases, which share nothing.
static MEMORY_IDS: AtomicUsize = AtomicUsize::new(0);

/// Live transactions on one file, tracked for diagnostics and validation.
#[derive(Debug, Default)]
pub(crate) struct TransactionRegistry {
    /// Id of the `DataFile` currently holding the write lock, if any.
    pub writer: Option<u64>,
    /// Number of live read-only transactions.
    pub readers: usize,
}

/// Per-path singleton shared by every `DataFile` open on that path.
#[derive(derive_more::Debug)]
pub(crate) struct Shared {
    path: PathBuf,
    /// The process-wide write lock for the file. Arc'd so transactions can
    /// hold an owned guard.
    pub writer: Arc<Mutex<()>>,
    pub transactions: Mutex<TransactionRegistry>,
    /// The engine handle, shared because the engine allows only one handle
    /// per file. Dropped when the last `DataFile` on the path closes.
    #[debug(skip)]
    pub db: RwLock<Option<Arc<redb::Database>>>,
    /// Number of open `DataFile` handles on this path.
    pub open_files: AtomicUsize,
}

impl Shared {
    fn new(path: PathBuf) -> Arc<Shared> {
        Arc::new(Shared {
            path,
            writer: Arc::new(Mutex::new(())),
            transactions: Mutex::new(TransactionRegistry::default()),
            db: RwLock::new(None),
            open_files: AtomicUsize::new(0),
        })
    }

    /// Returns the shared state for `path`, creating it on first use.
    pub fn for_path(path: &Path) -> Result<Arc<Shared>> {
        let key = canonical_key(path)?;
        let mut registry = REGISTRY.lock();
        registry.retain(|_, weak| weak.strong_count() > 0);
        if let Some(shared) = registry.get(&key).and_then(Weak::upgrade) {
            trace!(path = %key.display(), "reusing shared file state");
            return Ok(shared);
        }
        let shared = Shared::new(key.clone());
        registry.insert(key, Arc::downgrade(&shared));
        Ok(shared)
    }

    /// Returns fresh shared state for an in-memory database. Each call
    /// yields an independent instance.
    pub fn for_memory() -> Arc<Shared> {
        let id = MEMORY_IDS.fetch_add(1, Ordering::Relaxed);
        Shared::new(PathBuf::from(format!(":memory:{id}")))
    }

    /// The canonical path this state is keyed by.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Canonicalizes a path so every spelling of one file maps to one key.
///
/// The file may not exist yet (`create` option), so the parent directory
/// is canonicalized instead when needed.
fn canonical_key(path: &Path) -> Result<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    let absolute = std::path::absolute(path)?;
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => match parent.canonicalize() {
            Ok(parent) => Ok(parent.join(name)),
            Err(_) => Ok(absolute.clone()),
        },
        _ => Ok(absolute),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_path_shares_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.grove");
        let a = Shared::for_path(&path).unwrap();
        let b = Shared::for_path(&path).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn relative_and_absolute_spellings_share_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.grove");
        std::fs::write(&path, b"").unwrap();
        let direct = Shared::for_path(&path).unwrap();
        let dotted = Shared::for_path(&dir.path().join(".").join("db.grove")).unwrap();
        assert!(Arc::ptr_eq(&direct, &dotted));
    }

    #[test]
    fn dropped_state_is_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.grove");
        let first = Shared::for_path(&path).unwrap();
        let addr = Arc::as_ptr(&first) as usize;
        drop(first);
        let second = Shared::for_path(&path).unwrap();
        // Not asserting a different address (the allocator may reuse it),
        // just that we get a live instance after the old one died.
        assert_eq!(Arc::strong_count(&second), 1);
        let _ = addr;
    }

    #[test]
    fn memory_state_is_never_shared() {
        let a = Shared::for_memory();
        let b = Shared::for_memory();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
