//! Queue processor loop.
//!
//! The processor keeps the queue moving:
//! 1. Every tick, and whenever a job finishes, waiting items are promoted
//!    into free slots.
//! 2. Every sweep interval, stale waiting items and orphaned tasks are
//!    removed.
//!
//! Jobs are never run by the processor itself; the queue spawns them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

use super::DownloadQueue;

/// How often waiting jobs are checked without a finish signal.
const PROMOTION_TICK: Duration = Duration::from_secs(1);

/// Messages that can be sent to the processor.
#[derive(Debug, Clone)]
pub enum ProcessorMessage {
    /// Promote waiting jobs right away.
    TriggerPromotion,
    /// Stop the processor.
    Shutdown,
}

/// Background loop that drains the waiting queue.
pub struct QueueProcessor {
    queue: Arc<DownloadQueue>,

    /// How often stale items are swept.
    sweep_interval: Duration,

    /// Waiting items older than this are dropped.
    stale_age: Duration,
}

impl QueueProcessor {
    #[must_use]
    pub fn new(queue: Arc<DownloadQueue>, stale_age: Duration) -> Self {
        Self {
            queue,
            sweep_interval: Duration::from_secs(5 * 60),
            stale_age,
        }
    }

    #[must_use]
    pub const fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Runs the processor loop until shutdown.
    pub async fn run(&self, mut rx: mpsc::Receiver<ProcessorMessage>) {
        info!("Queue processor started");

        let mut tick_timer = interval(PROMOTION_TICK);
        tick_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_timer = interval(self.sweep_interval);
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        sweep_timer.tick().await;

        loop {
            tokio::select! {
                _ = tick_timer.tick() => {
                    self.queue.promote().await;
                }
                () = self.queue.finished_signal().notified() => {
                    debug!("Job finished, promoting waiting jobs");
                    self.queue.promote().await;
                }
                _ = sweep_timer.tick() => {
                    self.queue.sweep_stale(self.stale_age).await;
                }
                msg = rx.recv() => {
                    match msg {
                        Some(ProcessorMessage::TriggerPromotion) => {
                            debug!("Received promotion trigger");
                            self.queue.promote().await;
                        }
                        Some(ProcessorMessage::Shutdown) | None => {
                            info!("Queue processor shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for QueueProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProcessor")
            .field("sweep_interval", &self.sweep_interval)
            .field("stale_age", &self.stale_age)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Admission, JobOutcome, JobRequest, Priority, QueueLimits, Work};

    fn quick_job(user_id: i64) -> JobRequest {
        let work: Work = Box::pin(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });
        JobRequest::new(user_id, Priority::Free, "post", work)
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_jobs_drain() {
        let (queue, mut reports) = DownloadQueue::with_reports(QueueLimits {
            max_concurrent: 1,
            max_queue: 10,
            job_timeout: Duration::from_secs(60),
        });
        let queue = Arc::new(queue);

        assert_eq!(queue.enqueue(quick_job(1)).await, Ok(Admission::Started));
        for user in 2..=4 {
            assert!(matches!(
                queue.enqueue(quick_job(user)).await,
                Ok(Admission::Queued { .. })
            ));
        }

        let (tx, rx) = mpsc::channel(4);
        let processor = QueueProcessor::new(Arc::clone(&queue), Duration::from_secs(3600));
        let handle = tokio::spawn(async move { processor.run(rx).await });

        let mut finished = Vec::new();
        for _ in 0..4 {
            let report = reports.recv().await.unwrap();
            assert_eq!(report.outcome, JobOutcome::Completed);
            finished.push(report.user_id);
        }
        assert_eq!(finished, vec![1, 2, 3, 4]);

        tx.send(ProcessorMessage::Shutdown).await.unwrap();
        handle.await.unwrap();
        assert_eq!(queue.snapshot().await.waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep() {
        let queue = Arc::new(DownloadQueue::new(QueueLimits {
            max_concurrent: 1,
            max_queue: 10,
            job_timeout: Duration::from_secs(24 * 3600),
        }));
        let blocker: Work = Box::pin(futures::future::pending());
        queue
            .enqueue(JobRequest::new(1, Priority::Free, "a", blocker))
            .await
            .unwrap();
        queue.enqueue(quick_job(2)).await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        let processor = QueueProcessor::new(Arc::clone(&queue), Duration::from_secs(60))
            .with_sweep_interval(Duration::from_secs(120));
        let handle = tokio::spawn(async move { processor.run(rx).await });

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(queue.position(2).await, 0);
        assert!(queue.is_active(1).await);

        drop(tx);
        handle.await.unwrap();
    }
}
