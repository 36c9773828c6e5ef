//! Download and upload entry points used by jobs.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use super::budget::ConnectionBudget;
use super::files::readable_size;
use super::parallel::{MediaSource, TransferError, download_parallel};
use super::progress::ProgressTracker;

/// Runs transfers against the shared connection budget.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    budget: Arc<ConnectionBudget>,
}

impl TransferEngine {
    #[must_use]
    pub fn new(budget: Arc<ConnectionBudget>) -> Self {
        Self { budget }
    }

    #[must_use]
    pub fn budget(&self) -> &Arc<ConnectionBudget> {
        &self.budget
    }

    /// Downloads `source` into `path`.
    ///
    /// Uses the parallel path under a connection lease and falls back once
    /// to the standard download when that fails. Paid media is not retried.
    pub async fn download<S: MediaSource>(&self, source: &S, path: &Path) -> Result<u64, TransferError> {
        let size = source.size();
        let label = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());

        if size == 0 {
            info!("Size of {} unknown, using standard download", label);
            return source.download_to(path).await;
        }

        let parallel = match self.budget.acquire(size).await {
            Ok(lease) => {
                info!(
                    "Downloading {} ({}) over {} connections",
                    label,
                    readable_size(size),
                    lease.connections()
                );
                let mut progress = ProgressTracker::new(label.clone(), size);
                download_parallel(source, path, lease.connections(), &mut progress).await
            }
            Err(e) => Err(e.into()),
        };

        match parallel {
            Ok(written) => Ok(written),
            Err(TransferError::PaidMedia) => Err(TransferError::PaidMedia),
            Err(e) => {
                warn!("Parallel download of {} failed, falling back to standard: {}", label, e);
                let _ = tokio::fs::remove_file(path).await;
                source.download_to(path).await
            }
        }
    }

    /// Runs an upload of `size` bytes, holding connections when available.
    pub async fn upload<F, T>(&self, size: u64, upload: F) -> T
    where
        F: Future<Output = T>,
    {
        let lease = self.budget.try_acquire(size);
        match &lease {
            Some(lease) => info!(
                "Uploading {} with {} connections reserved",
                readable_size(size),
                lease.connections()
            ),
            None => info!("Uploading {} without reserved connections", readable_size(size)),
        }

        let result = upload.await;
        drop(lease);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::transfer::budget::BudgetLimits;
    use crate::transfer::parallel::CHUNK_SIZE;
    use crate::transfer::parallel::tests::FakeMedia;

    fn engine(total: usize) -> TransferEngine {
        TransferEngine::new(Arc::new(ConnectionBudget::new(BudgetLimits {
            total,
            min_per_transfer: 1,
            max_per_transfer: total,
            acquire_timeout: Duration::from_secs(5),
        })))
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_download_releases_lease() {
        let engine = engine(8);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.mp4");
        let media = FakeMedia::new(CHUNK_SIZE * 2 + 5);

        let written = engine.download(&media, &path).await.unwrap();

        assert_eq!(written, media.size());
        assert_eq!(*media.fallback_calls.lock().unwrap(), 0);
        assert_eq!(engine.budget().snapshot().in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_once_on_failure() {
        let engine = engine(8);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.mp4");
        let mut media = FakeMedia::new(CHUNK_SIZE * 3);
        media.fail_chunk = Some(2);

        let written = engine.download(&media, &path).await.unwrap();

        assert_eq!(written, media.size());
        assert_eq!(*media.fallback_calls.lock().unwrap(), 1);
        assert_eq!(std::fs::read(&path).unwrap(), media.data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paid_media_not_retried() {
        let engine = engine(8);
        let dir = tempfile::tempdir().unwrap();
        let mut media = FakeMedia::new(CHUNK_SIZE);
        media.paid = true;

        let result = engine.download(&media, &dir.path().join("x")).await;

        assert!(matches!(result, Err(TransferError::PaidMedia)));
        assert_eq!(*media.fallback_calls.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_timeout_falls_back() {
        let engine = engine(2);
        let _hog = engine.budget().acquire(100 * 1024 * 1024).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let media = FakeMedia::new(CHUNK_SIZE);

        engine.download(&media, &dir.path().join("x")).await.unwrap();
        assert_eq!(*media.fallback_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upload_holds_lease_while_running() {
        let engine = engine(4);
        let budget = Arc::clone(engine.budget());

        let in_use = engine
            .upload(50 * 1024 * 1024, async move { budget.snapshot().in_use })
            .await;

        assert_eq!(in_use, 4);
        assert_eq!(engine.budget().snapshot().in_use, 0);
    }
}
