//! Periodic housekeeping.
//!
//! Every interval the maintenance loop disconnects idle sessions, removes
//! orphaned download files and takes a memory snapshot. Sessions of users
//! with a running or waiting job stay connected, and files of users with a
//! running job are left alone.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::memory::MemoryMonitor;
use crate::queue::DownloadQueue;
use crate::session::{SessionConnector, SessionManager};
use crate::transfer::files::{ORPHAN_STALE_AFTER, cleanup_orphaned_files, readable_size};

/// Default time between maintenance passes.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// What one pass cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub idle_sessions: usize,
    pub orphan_files: usize,
    pub freed_bytes: u64,
}

/// Background loop for session, file and memory housekeeping.
pub struct Maintenance<K: SessionConnector> {
    queue: Arc<DownloadQueue>,
    sessions: Arc<SessionManager<K>>,
    memory: Arc<Mutex<MemoryMonitor>>,
    downloads_dir: PathBuf,
    interval: Duration,
    orphan_age: Duration,
}

impl<K: SessionConnector> Maintenance<K> {
    #[must_use]
    pub fn new(
        queue: Arc<DownloadQueue>,
        sessions: Arc<SessionManager<K>>,
        memory: Arc<Mutex<MemoryMonitor>>,
        downloads_dir: PathBuf,
    ) -> Self {
        Self {
            queue,
            sessions,
            memory,
            downloads_dir,
            interval: MAINTENANCE_INTERVAL,
            orphan_age: ORPHAN_STALE_AFTER,
        }
    }

    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub const fn with_orphan_age(mut self, age: Duration) -> Self {
        self.orphan_age = age;
        self
    }

    /// Runs passes until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Maintenance started, every {:?}", self.interval);

        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Maintenance shutting down");
                    break;
                }
                _ = timer.tick() => {
                    self.run_once().await;
                }
            }
        }
    }

    /// One housekeeping pass.
    pub async fn run_once(&self) -> MaintenanceReport {
        let busy = self.queue.busy_users().await;
        let idle_sessions = self.sessions.cleanup_idle(&busy).await;

        let active = self.queue.active_users().await;
        let root = self.downloads_dir.clone();
        let orphan_age = self.orphan_age;
        let (orphan_files, freed_bytes) =
            match tokio::task::spawn_blocking(move || cleanup_orphaned_files(&root, &active, orphan_age)).await {
                Ok(counts) => counts,
                Err(e) => {
                    warn!("Orphan cleanup task failed: {}", e);
                    (0, 0)
                }
            };

        self.memory.lock().await.snapshot("maintenance");

        let report = MaintenanceReport {
            idle_sessions,
            orphan_files,
            freed_bytes,
        };
        if report == MaintenanceReport::default() {
            debug!("Maintenance pass found nothing to clean");
        } else {
            info!(
                "Maintenance: {} idle sessions closed, {} orphaned files removed ({})",
                report.idle_sessions,
                report.orphan_files,
                readable_size(report.freed_bytes)
            );
        }
        report
    }
}

impl<K: SessionConnector> std::fmt::Debug for Maintenance<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Maintenance")
            .field("downloads_dir", &self.downloads_dir)
            .field("interval", &self.interval)
            .field("orphan_age", &self.orphan_age)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    use crate::queue::QueueLimits;
    use crate::session::SessionLimits;
    use crate::session::tests::FakeConnector;

    fn maintenance(dir: &std::path::Path, idle_timeout: Duration) -> Maintenance<FakeConnector> {
        let sessions = SessionManager::new(
            FakeConnector::default(),
            SessionLimits {
                max_sessions: 5,
                idle_timeout,
            },
        );
        Maintenance::new(
            Arc::new(DownloadQueue::new(QueueLimits::default())),
            Arc::new(sessions),
            Arc::new(Mutex::new(MemoryMonitor::default())),
            dir.to_path_buf(),
        )
        .with_orphan_age(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_pass_removes_orphans_and_idle_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let user_dir = dir.path().join("42");
        std::fs::create_dir_all(&user_dir).unwrap();
        let file_path = user_dir.join("left_over.mp4");
        std::fs::write(&file_path, vec![0_u8; 1000]).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&file_path)
            .unwrap()
            .set_modified(std::time::SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        let maintenance = maintenance(dir.path(), Duration::ZERO);
        maintenance
            .sessions
            .get_or_create(1, &HashSet::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = maintenance.run_once().await;

        assert_eq!(report.idle_sessions, 1);
        assert_eq!(report.orphan_files, 1);
        assert_eq!(report.freed_bytes, 1000);
        assert!(!user_dir.exists());
        assert_eq!(maintenance.memory.lock().await.history().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_pass() {
        let dir = tempfile::tempdir().unwrap();
        let maintenance = maintenance(dir.path(), Duration::from_secs(3600));

        assert_eq!(maintenance.run_once().await, MaintenanceReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let maintenance = Arc::new(maintenance(dir.path(), Duration::from_secs(3600)).with_interval(Duration::from_secs(1)));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn({
            let maintenance = Arc::clone(&maintenance);
            let shutdown = shutdown.clone();
            async move { maintenance.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        shutdown.cancel();
        task.await.unwrap();
    }
}
