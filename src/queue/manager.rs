//! Download queue: admission, concurrency gate and cancellation.
//!
//! All state sits behind a single async mutex. A job moves through
//! `waiting -> active -> gone`; a user owns at most one entry in either
//! place. Jobs run on their own tasks and remove themselves from the active
//! set when they finish, so a slot is freed even if nobody polls the queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::session::BusyUsers;

use super::item::{
    Admission, AdmissionError, Cancellation, JobOutcome, JobReport, JobRequest, Priority,
    QueueItem, QueueSnapshot, SweepReport, UserId, UserQueueStatus, Work,
};

/// Capacity limits of the queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub max_concurrent: usize,
    pub max_queue: usize,
    /// Hard limit on a single job.
    pub job_timeout: Duration,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 20,
            max_queue: 100,
            job_timeout: Duration::from_secs(30 * 60),
        }
    }
}

struct ActiveJob {
    job_id: u64,
    source_ref: String,
    priority: Priority,
    started_at: Instant,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct QueueState {
    active: HashMap<UserId, ActiveJob>,
    waiting: VecDeque<QueueItem>,
    next_seq: u64,
    next_job_id: u64,
}

impl QueueState {
    fn position_of(&self, user_id: UserId) -> Option<usize> {
        self.waiting
            .iter()
            .position(|item| item.user_id == user_id)
            .map(|idx| idx + 1)
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Everything a job task needs to clean up after itself.
struct JobContext {
    state: Arc<Mutex<QueueState>>,
    finished: Arc<Notify>,
    reports: Option<mpsc::UnboundedSender<JobReport>>,
    job_id: u64,
    user_id: UserId,
    source_ref: String,
    cancel: CancellationToken,
    timeout: Duration,
}

/// Priority download queue with a bounded number of running jobs.
pub struct DownloadQueue {
    limits: QueueLimits,
    state: Arc<Mutex<QueueState>>,
    finished: Arc<Notify>,
    reports: Option<mpsc::UnboundedSender<JobReport>>,
}

impl DownloadQueue {
    /// Creates a queue whose job reports are dropped.
    #[must_use]
    pub fn new(limits: QueueLimits) -> Self {
        info!(
            "Queue initialized: {} concurrent, {} max queue",
            limits.max_concurrent, limits.max_queue
        );

        Self {
            limits,
            state: Arc::new(Mutex::new(QueueState::default())),
            finished: Arc::new(Notify::new()),
            reports: None,
        }
    }

    /// Creates a queue that sends a [`JobReport`] for every finished job.
    #[must_use]
    pub fn with_reports(limits: QueueLimits) -> (Self, mpsc::UnboundedReceiver<JobReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut queue = Self::new(limits);
        queue.reports = Some(tx);
        (queue, rx)
    }

    #[must_use]
    pub const fn limits(&self) -> &QueueLimits {
        &self.limits
    }

    /// Admits a job: runs it now, queues it, or rejects it.
    pub async fn enqueue(&self, request: JobRequest) -> Result<Admission, AdmissionError> {
        let mut state = self.state.lock().await;
        let user_id = request.user_id;

        if state.active.contains_key(&user_id) {
            return Err(AdmissionError::AlreadyActive);
        }

        if let Some(position) = state.position_of(user_id) {
            return Err(AdmissionError::AlreadyQueued {
                position,
                waiting: state.waiting.len(),
            });
        }

        // Waiting jobs get free slots first; a slot still free afterwards
        // means nobody is waiting.
        if state.active.len() < self.limits.max_concurrent {
            self.promote_locked(&mut state);
            if state.active.len() < self.limits.max_concurrent {
                let seq = state.bump_seq();
                self.start_locked(&mut state, QueueItem::from_request(request, seq));
                return Ok(Admission::Started);
            }
        }

        if state.waiting.len() >= self.limits.max_queue {
            return Err(AdmissionError::QueueFull {
                active: state.active.len(),
                max_concurrent: self.limits.max_concurrent,
                waiting: state.waiting.len(),
                max_queue: self.limits.max_queue,
            });
        }

        let seq = state.bump_seq();
        let item = QueueItem::from_request(request, seq);
        let at = state.waiting.partition_point(|queued| queued <= &item);
        info!(
            "Queued {} job for user {} at position {}",
            item.priority.label(),
            user_id,
            at + 1
        );
        state.waiting.insert(at, item);

        self.promote_locked(&mut state);

        Ok(state
            .position_of(user_id)
            .map_or(Admission::Started, |position| Admission::Queued {
                position,
                waiting: state.waiting.len(),
            }))
    }

    /// Moves waiting jobs into free slots. Returns how many were started.
    pub async fn promote(&self) -> usize {
        let mut state = self.state.lock().await;
        self.promote_locked(&mut state)
    }

    fn promote_locked(&self, state: &mut QueueState) -> usize {
        let mut started = 0;

        while state.active.len() < self.limits.max_concurrent {
            let Some(item) = state.waiting.pop_front() else {
                break;
            };

            if state.active.contains_key(&item.user_id) {
                warn!(
                    "Dropping queued job for user {}: already has an active job",
                    item.user_id
                );
                continue;
            }

            self.start_locked(state, item);
            started += 1;
        }

        if started > 0 {
            info!(
                "Started {} queued job(s). Active: {}, Queue: {}",
                started,
                state.active.len(),
                state.waiting.len()
            );
        }

        started
    }

    fn start_locked(&self, state: &mut QueueState, item: QueueItem) {
        state.next_job_id += 1;
        let job_id = state.next_job_id;
        let cancel = CancellationToken::new();

        let ctx = JobContext {
            state: Arc::clone(&self.state),
            finished: Arc::clone(&self.finished),
            reports: self.reports.clone(),
            job_id,
            user_id: item.user_id,
            source_ref: item.source_ref.clone(),
            cancel: cancel.clone(),
            timeout: self.limits.job_timeout,
        };

        // The task cannot touch the state before we release the lock, so the
        // entry below is always in place when it tries to remove itself.
        let handle = tokio::spawn(run_job(ctx, item.work));

        state.active.insert(
            item.user_id,
            ActiveJob {
                job_id,
                source_ref: item.source_ref,
                priority: item.priority,
                started_at: Instant::now(),
                cancel,
                handle: Some(handle),
            },
        );

        info!(
            "Job {} started for user {}. Active: {}/{}",
            job_id,
            item.user_id,
            state.active.len(),
            self.limits.max_concurrent
        );
    }

    /// 1-based waiting position, 0 when the user is not waiting.
    pub async fn position(&self, user_id: UserId) -> usize {
        self.state.lock().await.position_of(user_id).unwrap_or(0)
    }

    pub async fn user_status(&self, user_id: UserId) -> UserQueueStatus {
        let state = self.state.lock().await;

        if state.active.contains_key(&user_id) {
            return UserQueueStatus::Active;
        }

        state
            .waiting
            .iter()
            .enumerate()
            .find(|(_, item)| item.user_id == user_id)
            .map_or(UserQueueStatus::Idle, |(idx, item)| UserQueueStatus::Waiting {
                position: idx + 1,
                waiting: state.waiting.len(),
                priority: item.priority,
            })
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        let premium_waiting = state
            .waiting
            .iter()
            .filter(|item| item.priority == Priority::Premium)
            .count();

        QueueSnapshot {
            active: state.active.len(),
            max_concurrent: self.limits.max_concurrent,
            waiting: state.waiting.len(),
            max_queue: self.limits.max_queue,
            premium_waiting,
            free_waiting: state.waiting.len() - premium_waiting,
        }
    }

    /// Users that currently own a running job.
    pub async fn active_users(&self) -> HashSet<UserId> {
        self.state.lock().await.active.keys().copied().collect()
    }

    /// Users with a running or waiting job.
    pub async fn busy_users(&self) -> HashSet<UserId> {
        let state = self.state.lock().await;
        state
            .active
            .keys()
            .copied()
            .chain(state.waiting.iter().map(|item| item.user_id))
            .collect()
    }

    pub async fn is_active(&self, user_id: UserId) -> bool {
        self.state.lock().await.active.contains_key(&user_id)
    }

    /// Source reference and runtime of the user's running job.
    pub async fn active_job(&self, user_id: UserId) -> Option<(String, Duration)> {
        let state = self.state.lock().await;
        state
            .active
            .get(&user_id)
            .map(|job| (job.source_ref.clone(), job.started_at.elapsed()))
    }

    /// Cancels the user's running job or removes their waiting entry.
    pub async fn cancel_user(&self, user_id: UserId) -> Cancellation {
        let mut state = self.state.lock().await;

        if let Some(job) = state.active.remove(&user_id) {
            job.cancel.cancel();
            info!(
                "Cancelled active {} job {} for user {}",
                job.priority.label(),
                job.job_id,
                user_id
            );
            return Cancellation::Active;
        }

        if let Some(idx) = state.waiting.iter().position(|item| item.user_id == user_id) {
            state.waiting.remove(idx);
            info!("Removed user {} from the queue", user_id);
            return Cancellation::Queued;
        }

        Cancellation::NotFound
    }

    /// Cancels every running job and empties the queue.
    pub async fn cancel_all(&self) -> usize {
        let mut state = self.state.lock().await;
        let mut cancelled = 0;

        for (_, job) in state.active.drain() {
            if job.handle.as_ref().is_some_and(|h| !h.is_finished()) {
                cancelled += 1;
            }
            job.cancel.cancel();
        }

        cancelled += state.waiting.len();
        state.waiting.clear();

        info!("Cancelled all downloads: {} total", cancelled);
        cancelled
    }

    /// Drops waiting items older than `max_age` and forgets finished tasks
    /// that never cleaned up after themselves.
    pub async fn sweep_stale(&self, max_age: Duration) -> SweepReport {
        let mut state = self.state.lock().await;
        let mut report = SweepReport::default();

        state.waiting.retain(|item| {
            let age = item.age();
            if age > max_age {
                warn!(
                    "Cleaned up stale queue item for user {} (age: {} minutes)",
                    item.user_id,
                    age.as_secs() / 60
                );
                report.stale_items += 1;
                false
            } else {
                true
            }
        });

        state.active.retain(|user_id, job| {
            let orphaned = job.handle.as_ref().is_none_or(JoinHandle::is_finished);
            if orphaned {
                warn!("Cleaned up orphaned task for user {}", user_id);
                report.orphaned_tasks += 1;
            }
            !orphaned
        });

        if !report.is_empty() {
            info!(
                "Queue sweep: cleaned {} stale items and {} orphaned tasks",
                report.stale_items, report.orphaned_tasks
            );
        }

        report
    }

    /// Signalled whenever a job leaves the active set by itself.
    pub(crate) fn finished_signal(&self) -> &Notify {
        &self.finished
    }
}

impl BusyUsers for DownloadQueue {
    async fn busy_users(&self) -> HashSet<UserId> {
        Self::busy_users(self).await
    }
}

impl std::fmt::Debug for DownloadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadQueue")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

async fn run_job(ctx: JobContext, work: Work) {
    let started = Instant::now();

    let outcome = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => JobOutcome::Cancelled,
        result = tokio::time::timeout(ctx.timeout, work) => match result {
            Ok(Ok(())) => JobOutcome::Completed,
            Ok(Err(e)) => JobOutcome::Failed(format!("{e:#}")),
            Err(_) => JobOutcome::TimedOut(ctx.timeout),
        },
    };

    let remaining = {
        let mut state = ctx.state.lock().await;
        // A cancelled job may already have been replaced by a newer one.
        if state
            .active
            .get(&ctx.user_id)
            .is_some_and(|job| job.job_id == ctx.job_id)
        {
            state.active.remove(&ctx.user_id);
        }
        state.active.len()
    };
    ctx.finished.notify_one();

    match &outcome {
        JobOutcome::Completed => info!(
            "Job {} completed for user {}. Active: {}",
            ctx.job_id, ctx.user_id, remaining
        ),
        JobOutcome::Failed(reason) => {
            error!("Job {} failed for user {}: {}", ctx.job_id, ctx.user_id, reason);
        }
        JobOutcome::TimedOut(limit) => error!(
            "Job {} for user {} timed out after {} minutes",
            ctx.job_id,
            ctx.user_id,
            limit.as_secs() / 60
        ),
        JobOutcome::Cancelled => info!("Job {} cancelled for user {}", ctx.job_id, ctx.user_id),
    }

    if let Some(reports) = ctx.reports {
        let _ = reports.send(JobReport {
            user_id: ctx.user_id,
            source_ref: ctx.source_ref,
            outcome,
            elapsed: started.elapsed(),
        });
    }
}
