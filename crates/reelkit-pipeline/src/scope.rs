//! Per-job resource scope.
//!
//! A scope owns one temp directory and a LIFO stack of release callbacks.
//! Release runs callbacks in reverse registration order, then deletes the
//! directory with bounded retry; it is idempotent and never raises.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, PipelineError, PipelineResult};

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Lifetime boundary owning a temp directory and tracked cleanup callbacks.
pub struct ResourceScope {
    temp_dir: PathBuf,
    releases: Mutex<Vec<ReleaseFn>>,
    released: Mutex<bool>,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl ResourceScope {
    /// Create a scope under `work_dir`, named after the job.
    pub fn create(
        work_dir: &Path,
        job_id: &str,
        retry_attempts: u32,
        retry_delay: Duration,
    ) -> PipelineResult<Self> {
        let temp_dir = work_dir.join(format!("job_{}_{}", job_id, &Uuid::new_v4().simple().to_string()[..8]));
        std::fs::create_dir_all(&temp_dir).map_err(|e| {
            PipelineError::with_source(
                "scope",
                ErrorKind::Resource,
                format!("failed to create temp dir {}", temp_dir.display()),
                e,
            )
        })?;
        debug!("Created resource scope at {}", temp_dir.display());

        Ok(Self {
            temp_dir,
            releases: Mutex::new(Vec::new()),
            released: Mutex::new(false),
            retry_attempts: retry_attempts.max(1),
            retry_delay,
        })
    }

    /// The scope's temp directory.
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Path of a file inside the scope.
    pub fn temp_path(&self, file_name: &str) -> PathBuf {
        self.temp_dir.join(file_name)
    }

    /// Register a cleanup callback, run at release in LIFO order.
    pub fn track<F: FnOnce() + Send + 'static>(&self, release: F) {
        self.releases.lock().unwrap().push(Box::new(release));
    }

    /// Release the scope: run callbacks LIFO, then delete the directory.
    ///
    /// Safe against repeated calls; release-time errors are logged and
    /// swallowed.
    pub async fn release(&self) {
        {
            let mut released = self.released.lock().unwrap();
            if *released {
                return;
            }
            *released = true;
        }

        let callbacks = std::mem::take(&mut *self.releases.lock().unwrap());
        for release in callbacks.into_iter().rev() {
            release();
        }

        self.remove_dir_with_retry().await;
    }

    /// Delete the temp dir, retrying for filesystems that briefly refuse
    /// deletion of recently-closed files.
    async fn remove_dir_with_retry(&self) {
        for attempt in 1..=self.retry_attempts {
            match tokio::fs::remove_dir_all(&self.temp_dir).await {
                Ok(()) => {
                    debug!("Removed scope dir {}", self.temp_dir.display());
                    return;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                Err(e) => {
                    if attempt == self.retry_attempts {
                        warn!(
                            "Failed to remove scope dir {} after {} attempts: {}",
                            self.temp_dir.display(),
                            attempt,
                            e
                        );
                    } else {
                        debug!(
                            "Scope dir removal attempt {} failed, retrying: {}",
                            attempt, e
                        );
                        tokio::time::sleep(self.retry_delay * attempt).await;
                    }
                }
            }
        }
    }

    /// Whether release has already run.
    pub fn is_released(&self) -> bool {
        *self.released.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn scope_in(dir: &Path) -> ResourceScope {
        ResourceScope::create(dir, "test", 3, Duration::from_millis(10)).unwrap()
    }

    #[tokio::test]
    async fn test_release_removes_dir() {
        let root = tempfile::tempdir().unwrap();
        let scope = scope_in(root.path());
        let temp = scope.temp_dir().to_path_buf();

        tokio::fs::write(scope.temp_path("a.txt"), b"x").await.unwrap();
        assert!(temp.exists());

        scope.release().await;
        assert!(!temp.exists());
        assert!(scope.is_released());
    }

    #[tokio::test]
    async fn test_callbacks_run_lifo() {
        let root = tempfile::tempdir().unwrap();
        let scope = scope_in(root.path());

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            scope.track(move || order.lock().unwrap().push(i));
        }

        scope.release().await;
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let scope = scope_in(root.path());

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        scope.track(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        scope.release().await;
        scope.release().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
