use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use quiver_common::config::LockPolicy;
use quiver_common::error::{QuiverError, Result};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a competing process may sit on a lock file before it is
/// presumed dead and its lock broken.
const STALE_LOCK_AGE: Duration = Duration::from_secs(10 * 60);
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Per-cache-path serialization within one process. Entries are weak so
/// the map never grows beyond the set of currently contended paths.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<PathBuf, Weak<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize on `path`. The returned guard releases on drop.
    pub async fn lock(&self, path: &Path) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().await;
            map.retain(|_, weak| weak.strong_count() > 0);
            match map.get(path).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    let created = Arc::new(Mutex::new(()));
                    map.insert(path.to_path_buf(), Arc::downgrade(&created));
                    created
                }
            }
        };
        entry.lock_owned().await
    }
}

/// Advisory cross-process lock, held through a companion `.lock` file
/// created with `O_EXCL`. Released (and the file removed) on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub async fn acquire(
        path: &Path,
        policy: LockPolicy,
        cancel: &CancellationToken,
    ) -> Result<FileLock> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        loop {
            if cancel.is_cancelled() {
                return Err(QuiverError::Cancelled);
            }
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(_) => {
                    debug!(path = %path.display(), "acquired file lock");
                    return Ok(FileLock {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if Self::break_if_stale(path) {
                        continue;
                    }
                    match policy {
                        LockPolicy::Fail => {
                            return Err(QuiverError::Cache(format!(
                                "{} is locked by another process",
                                path.display()
                            )))
                        }
                        LockPolicy::Block => {
                            tokio::select! {
                                _ = cancel.cancelled() => return Err(QuiverError::Cancelled),
                                _ = tokio::time::sleep(LOCK_RETRY_DELAY) => {}
                            }
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// A lock file whose holder died stays behind; break it once it is
    /// old enough that no live fetch can still own it.
    fn break_if_stale(path: &Path) -> bool {
        let Ok(metadata) = std::fs::metadata(path) else {
            // Gone between the open and here; retry immediately.
            return true;
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok());
        if age.is_some_and(|age| age > STALE_LOCK_AGE) {
            warn!(path = %path.display(), "breaking stale lock file");
            return std::fs::remove_file(path).is_ok();
        }
        false
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "failed to remove lock file");
        }
    }
}
