use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<PathBuf, Arc<Mutex<()>>>;

/// In-process advisory locks keyed by absolute path.
///
/// Entries are created on demand and removed when the last holder or waiter
/// releases them, so the table only ever holds paths that are in use.
#[derive(Clone, Default)]
pub struct PathLocks {
    inner: Arc<LockMap>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `path`.
    pub async fn lock(&self, path: &Path) -> PathGuard {
        let mutex = self
            .inner
            .entry(path.to_path_buf())
            .or_default()
            .value()
            .clone();
        let guard = mutex.lock_owned().await;

        PathGuard {
            key: path.to_path_buf(),
            map: Arc::clone(&self.inner),
            _guard: guard,
        }
    }

    /// Number of paths currently locked or waited on.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Held for the duration of a mutation on one path.
pub struct PathGuard {
    key: PathBuf,
    map: Arc<LockMap>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        // One reference is the table's, one is our own guard. Anything more is a waiter.
        self.map
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) <= 2);
    }
}
