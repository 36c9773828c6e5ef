//! Queue entries and job bookkeeping types.

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

/// Telegram user id.
pub type UserId = i64;

/// The body of a job. Errors are opaque and only reported to the user.
pub type Work = BoxFuture<'static, anyhow::Result<()>>;

/// Queue priority. Lower values are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Premium = 1,
    Free = 2,
}

impl Priority {
    #[must_use]
    pub const fn from_premium(is_premium: bool) -> Self {
        if is_premium { Self::Premium } else { Self::Free }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Premium => "PREMIUM",
            Self::Free => "FREE",
        }
    }
}

/// A job submitted to the queue.
pub struct JobRequest {
    pub user_id: UserId,
    pub priority: Priority,
    /// Link or other human-readable reference to what is being fetched.
    pub source_ref: String,
    pub work: Work,
}

impl JobRequest {
    pub fn new(user_id: UserId, priority: Priority, source_ref: impl Into<String>, work: Work) -> Self {
        Self {
            user_id,
            priority,
            source_ref: source_ref.into(),
            work,
        }
    }
}

impl fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRequest")
            .field("user_id", &self.user_id)
            .field("priority", &self.priority)
            .field("source_ref", &self.source_ref)
            .finish_non_exhaustive()
    }
}

/// A job waiting for a slot.
pub(crate) struct QueueItem {
    pub priority: Priority,
    pub enqueued_at: Instant,
    /// Arrival counter, breaks ties inside a priority tier.
    pub seq: u64,
    pub user_id: UserId,
    pub source_ref: String,
    pub work: Work,
}

impl QueueItem {
    pub fn from_request(request: JobRequest, seq: u64) -> Self {
        Self {
            priority: request.priority,
            enqueued_at: Instant::now(),
            seq,
            user_id: request.user_id,
            source_ref: request.source_ref,
            work: request.work,
        }
    }

    pub const fn key(&self) -> (Priority, u64) {
        (self.priority, self.seq)
    }

    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// How an active job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    TimedOut(Duration),
    Cancelled,
}

/// Emitted once for every job that left the active set by itself.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub user_id: UserId,
    pub source_ref: String,
    pub outcome: JobOutcome,
    pub elapsed: Duration,
}

/// Result of a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The job got a slot right away.
    Started,
    /// The job waits at `position` (1-based) among `waiting` items.
    Queued { position: usize, waiting: usize },
}

/// Why a job was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("a download is already in progress for this user")]
    AlreadyActive,

    #[error("already queued at position {position}/{waiting}")]
    AlreadyQueued { position: usize, waiting: usize },

    #[error("queue is full ({active}/{max_concurrent} active, {waiting}/{max_queue} waiting)")]
    QueueFull {
        active: usize,
        max_concurrent: usize,
        waiting: usize,
        max_queue: usize,
    },
}

/// What `cancel_user` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    Active,
    Queued,
    NotFound,
}

/// Where a user currently stands in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserQueueStatus {
    Active,
    Waiting {
        position: usize,
        waiting: usize,
        priority: Priority,
    },
    Idle,
}

/// Global queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueSnapshot {
    pub active: usize,
    pub max_concurrent: usize,
    pub waiting: usize,
    pub max_queue: usize,
    pub premium_waiting: usize,
    pub free_waiting: usize,
}

/// Counts removed by a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub stale_items: usize,
    pub orphaned_tasks: usize,
}

impl SweepReport {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.stale_items == 0 && self.orphaned_tasks == 0
    }
}
