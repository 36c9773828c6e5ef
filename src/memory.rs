//! Process memory monitoring.
//!
//! Keeps a short history of RSS readings taken around transfers and on the
//! maintenance tick, and warns when memory is high or jumps suddenly. On a
//! 512 MB host these warnings are usually the last thing logged before an
//! OOM kill.

use std::collections::VecDeque;
use std::fmt::Write as _;

use chrono::{DateTime, Local};
use sysinfo::{ProcessesToUpdate, System};
use tracing::{info, warn};

const MB: f64 = 1024.0 * 1024.0;

/// Snapshots kept in the history.
pub const HISTORY_LEN: usize = 20;

/// RSS above this is reported as high memory.
pub const HIGH_MEMORY_MB: f64 = 400.0;

/// An RSS increase above this between two snapshots is a spike.
pub const SPIKE_MB: f64 = 50.0;

/// One memory reading.
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySnapshot {
    pub taken_at: DateTime<Local>,
    pub operation: String,
    pub rss_mb: f64,
}

/// System-wide memory figures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemMemory {
    pub total_mb: f64,
    pub available_mb: f64,
}

/// What a new reading means compared to the previous one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MemoryAlert {
    Normal,
    High { rss_mb: f64 },
    Spike { increase_mb: f64 },
}

/// Resident set size of this process in bytes.
#[must_use]
pub fn process_rss() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(sysinfo::Process::memory)
}

/// Current RSS in megabytes, 0 when it cannot be read.
#[must_use]
pub fn process_rss_mb() -> f64 {
    process_rss().map_or(0.0, |bytes| bytes as f64 / MB)
}

/// Total and available system memory.
#[must_use]
pub fn system_memory() -> SystemMemory {
    let mut system = System::new();
    system.refresh_memory();
    SystemMemory {
        total_mb: system.total_memory() as f64 / MB,
        available_mb: system.available_memory() as f64 / MB,
    }
}

/// Rolling memory history with threshold alerts.
#[derive(Debug)]
pub struct MemoryMonitor {
    history: VecDeque<MemorySnapshot>,
    last_rss_mb: Option<f64>,
    high_mb: f64,
    spike_mb: f64,
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::new(HIGH_MEMORY_MB, SPIKE_MB)
    }
}

impl MemoryMonitor {
    #[must_use]
    pub fn new(high_mb: f64, spike_mb: f64) -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_LEN),
            last_rss_mb: None,
            high_mb,
            spike_mb,
        }
    }

    /// Reads the current RSS and records it.
    pub fn snapshot(&mut self, operation: &str) -> MemoryAlert {
        self.record(operation, process_rss_mb())
    }

    /// Records an RSS reading and logs it.
    pub fn record(&mut self, operation: &str, rss_mb: f64) -> MemoryAlert {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(MemorySnapshot {
            taken_at: Local::now(),
            operation: operation.to_owned(),
            rss_mb,
        });

        let increase = self.last_rss_mb.map_or(0.0, |last| rss_mb - last);
        self.last_rss_mb = Some(rss_mb);

        let alert = if increase > self.spike_mb {
            MemoryAlert::Spike {
                increase_mb: increase,
            }
        } else if rss_mb > self.high_mb {
            MemoryAlert::High { rss_mb }
        } else {
            MemoryAlert::Normal
        };

        match alert {
            MemoryAlert::Spike { increase_mb } => {
                warn!(
                    "Memory spike: +{:.1} MB during {} (now {:.1} MB)",
                    increase_mb, operation, rss_mb
                );
                warn!("{}", self.recent_operations());
            }
            MemoryAlert::High { rss_mb } => {
                warn!("High memory usage: {:.1} MB during {}", rss_mb, operation);
            }
            MemoryAlert::Normal => {
                info!("Memory: {:.1} MB ({})", rss_mb, operation);
            }
        }

        alert
    }

    #[must_use]
    pub fn history(&self) -> &VecDeque<MemorySnapshot> {
        &self.history
    }

    #[must_use]
    pub fn last_rss_mb(&self) -> Option<f64> {
        self.last_rss_mb
    }

    /// History formatted one line per snapshot, oldest first.
    #[must_use]
    pub fn recent_operations(&self) -> String {
        let mut out = format!("Recent operations (last {}):", self.history.len());
        for (idx, snap) in self.history.iter().enumerate() {
            let _ = write!(
                out,
                "\n  {}. [{}] {} - {:.1} MB",
                idx + 1,
                snap.taken_at.format("%H:%M:%S"),
                snap.operation,
                snap.rss_mb
            );
        }
        out
    }
}
