//! Per-path write serialization for read-modify-write cycles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// A table of one mutex per state-file path. Every multi-step
/// read-modify-write on a JSON file must run under the path's guard; plain
/// readers may skip it and observe the previous snapshot.
#[derive(Debug, Default)]
pub struct PathLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut table = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        table
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `body` while holding the write lock for `path`.
    pub fn with_path<R>(&self, path: &Path, body: impl FnOnce() -> R) -> R {
        let lock = self.lock_for(path);
        let _guard: MutexGuard<'_, ()> = lock.lock().unwrap_or_else(|e| e.into_inner());
        body()
    }

    /// Number of paths that have been locked at least once.
    pub fn tracked_paths(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
