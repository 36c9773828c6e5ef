//! Transfer module.
//!
//! Shares a global budget of parallel connections between transfers and
//! moves files between Telegram and the local downloads folder.

mod budget;
mod engine;
pub mod files;
pub(crate) mod parallel;
mod progress;
mod tiers;

pub use budget::{BudgetError, BudgetLimits, BudgetSnapshot, ConnectionBudget, ConnectionLease};
pub use engine::TransferEngine;
pub use parallel::{CHUNK_SIZE, MediaSource, TransferError, chunk_count, download_parallel};
pub use progress::ProgressTracker;
pub use tiers::{tier_connections, weight};
