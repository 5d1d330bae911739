//! Per-output-path exclusive locks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::TranscodingError;

type LockMap = HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>;

/// Registry of async locks keyed by output path.
///
/// Entries exist only while someone holds or waits on them.
#[derive(Clone, Default)]
pub struct PathLocks {
    locks: Arc<Mutex<LockMap>>,
}

/// Held lock on one output path. Dropping it releases the path.
pub struct PathLockGuard {
    path: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
    locks: PathLocks,
}

impl PathLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.remove_if_unused(&self.path);
        trace!("Released path lock {}", self.path.display());
    }
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `path`.
    ///
    /// # Errors
    /// - `TranscodingError::Cancelled` - `cancel` fired before the lock was granted
    pub async fn lock(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathLockGuard, TranscodingError> {
        let entry = Arc::clone(self.locks.lock().entry(path.to_path_buf()).or_default());

        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            guard = Arc::clone(&entry).lock_owned() => Some(guard),
        };
        drop(entry);

        match acquired {
            Some(guard) => {
                trace!("Acquired path lock {}", path.display());
                Ok(PathLockGuard {
                    path: path.to_path_buf(),
                    guard: Some(guard),
                    locks: self.clone(),
                })
            }
            None => {
                self.remove_if_unused(path);
                Err(TranscodingError::Cancelled)
            }
        }
    }

    /// Number of paths currently held or awaited.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_if_unused(&self, path: &Path) {
        let mut locks = self.locks.lock();
        if let Some(entry) = locks.get(path)
            && Arc::strong_count(entry) == 1
        {
            locks.remove(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_second_locker_waits_for_release() {
        let locks = PathLocks::new();
        let cancel = CancellationToken::new();
        let path = Path::new("/tmp/a.m3u8");

        let first = locks.lock(path, &cancel).await.unwrap();
        let waiter = {
            let locks = locks.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { locks.lock(Path::new("/tmp/a.m3u8"), &cancel).await.is_ok() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(first);
        assert!(waiter.await.unwrap());
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_paths_do_not_contend() {
        let locks = PathLocks::new();
        let cancel = CancellationToken::new();
        let _a = locks.lock(Path::new("/tmp/a.m3u8"), &cancel).await.unwrap();
        let _b = locks.lock(Path::new("/tmp/b.m3u8"), &cancel).await.unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_no_entry() {
        let locks = PathLocks::new();
        let path = Path::new("/tmp/a.m3u8");
        let held = locks.lock(path, &CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let locks = locks.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { locks.lock(Path::new("/tmp/a.m3u8"), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(TranscodingError::Cancelled)));

        drop(held);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_already_cancelled_token_fails_fast() {
        let locks = PathLocks::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = locks.lock(Path::new("/tmp/a.m3u8"), &cancel).await;
        assert!(matches!(result, Err(TranscodingError::Cancelled)));
        assert!(locks.is_empty());
    }
}
