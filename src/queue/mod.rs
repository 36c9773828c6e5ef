//! Download queue module.
//!
//! Bounds how many downloads run at once, orders waiting jobs by tier and
//! arrival, and keeps the queue moving in the background.

mod item;
mod manager;
mod processor;

pub use item::{
    Admission, AdmissionError, Cancellation, JobOutcome, JobReport, JobRequest, Priority,
    QueueSnapshot, SweepReport, UserId, UserQueueStatus, Work,
};
pub use manager::{DownloadQueue, QueueLimits};
pub use processor::{ProcessorMessage, QueueProcessor};
