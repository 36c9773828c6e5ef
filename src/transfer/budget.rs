//! Global connection budget shared by all transfers.
//!
//! Each transfer asks for a share of the budget sized by how many transfers
//! are already running and by how large its file is. Connections go back to
//! the pool when the [`ConnectionLease`] is dropped, and every waiter is woken
//! to retry.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::tiers;

/// Limits of the connection budget.
#[derive(Debug, Clone, Copy)]
pub struct BudgetLimits {
    /// Connections shared by every transfer.
    pub total: usize,
    pub min_per_transfer: usize,
    pub max_per_transfer: usize,
    /// How long `acquire` waits for the floor to become available.
    pub acquire_timeout: Duration,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            total: 20,
            min_per_transfer: 1,
            max_per_transfer: 20,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Budget errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetError {
    #[error("No connections became available within {} seconds", .0.as_secs())]
    Timeout(Duration),
}

/// Point-in-time view of the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetSnapshot {
    pub total: usize,
    pub in_use: usize,
    pub active_transfers: usize,
}

#[derive(Debug, Default)]
struct BudgetState {
    in_use: usize,
    active_transfers: usize,
}

/// Allocator for parallel transfer connections.
#[derive(Debug)]
pub struct ConnectionBudget {
    limits: BudgetLimits,
    // Held only for arithmetic, never across an await.
    state: Mutex<BudgetState>,
    released: Notify,
}

impl ConnectionBudget {
    #[must_use]
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(BudgetState::default()),
            released: Notify::new(),
        }
    }

    #[must_use]
    pub const fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connections a new transfer of `file_size` bytes would ask for.
    fn desired(&self, active_transfers: usize, file_size: u64) -> usize {
        let fair_share = (self.limits.total / (active_transfers + 1)).max(1);
        let weighted = (fair_share as f64 * tiers::weight(file_size)).round() as usize;
        weighted.clamp(self.limits.min_per_transfer, self.limits.max_per_transfer)
    }

    /// Reserves connections for a transfer of `file_size` bytes.
    ///
    /// Waits for released connections until the acquire timeout expires.
    pub async fn acquire(self: &Arc<Self>, file_size: u64) -> Result<ConnectionLease, BudgetError> {
        let deadline = Instant::now() + self.limits.acquire_timeout;

        loop {
            // Register before checking so a release between the check and the
            // wait is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                let available = self.limits.total.saturating_sub(state.in_use);

                if available >= self.limits.min_per_transfer {
                    let granted = self.desired(state.active_transfers, file_size).min(available);
                    state.in_use += granted;
                    state.active_transfers += 1;

                    debug!(
                        "Granted {} connections for {} bytes ({}/{} in use, {} transfers)",
                        granted,
                        file_size,
                        state.in_use,
                        self.limits.total,
                        state.active_transfers
                    );

                    return Ok(ConnectionLease {
                        budget: Arc::clone(self),
                        connections: granted,
                    });
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    "Connection budget exhausted for {} seconds",
                    self.limits.acquire_timeout.as_secs()
                );
                return Err(BudgetError::Timeout(self.limits.acquire_timeout));
            }
        }
    }

    /// Reserves connections only if the floor is available right now.
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>, file_size: u64) -> Option<ConnectionLease> {
        let mut state = self.lock();
        let available = self.limits.total.saturating_sub(state.in_use);
        if available < self.limits.min_per_transfer {
            return None;
        }

        let granted = self.desired(state.active_transfers, file_size).min(available);
        state.in_use += granted;
        state.active_transfers += 1;

        Some(ConnectionLease {
            budget: Arc::clone(self),
            connections: granted,
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> BudgetSnapshot {
        let state = self.lock();
        BudgetSnapshot {
            total: self.limits.total,
            in_use: state.in_use,
            active_transfers: state.active_transfers,
        }
    }

    fn release(&self, connections: usize) {
        {
            let mut state = self.lock();
            state.in_use = state.in_use.saturating_sub(connections);
            state.active_transfers = state.active_transfers.saturating_sub(1);
            debug!(
                "Released {} connections ({}/{} in use)",
                connections, state.in_use, self.limits.total
            );
        }
        self.released.notify_waiters();
    }
}

/// Connections held by one transfer. Released on drop.
#[derive(Debug)]
pub struct ConnectionLease {
    budget: Arc<ConnectionBudget>,
    connections: usize,
}

impl ConnectionLease {
    #[must_use]
    pub const fn connections(&self) -> usize {
        self.connections
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.budget.release(self.connections);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn budget(total: usize, min: usize, max: usize) -> Arc<ConnectionBudget> {
        Arc::new(ConnectionBudget::new(BudgetLimits {
            total,
            min_per_transfer: min,
            max_per_transfer: max,
            acquire_timeout: Duration::from_secs(30),
        }))
    }

    #[tokio::test]
    async fn test_first_large_transfer_gets_everything() {
        let budget = budget(20, 1, 20);
        let lease = budget.acquire(50 * MIB).await.unwrap();
        assert_eq!(lease.connections(), 20);
        assert_eq!(budget.snapshot().in_use, 20);

        drop(lease);
        let snapshot = budget.snapshot();
        assert_eq!(snapshot.in_use, 0);
        assert_eq!(snapshot.active_transfers, 0);
    }

    #[tokio::test]
    async fn test_small_files_ask_for_less() {
        let budget = budget(20, 1, 20);
        // fair share 20, weight 0.4
        let lease = budget.acquire(512).await.unwrap();
        assert_eq!(lease.connections(), 8);
    }

    #[tokio::test]
    async fn test_fair_share_shrinks_with_active_transfers() {
        let budget = budget(20, 1, 20);
        let first = budget.acquire(5 * MIB).await.unwrap();
        // round(20 * 0.75) = 15
        assert_eq!(first.connections(), 15);
        // fair share 10, weight 1.0, capped by the 5 still free
        let second = budget.acquire(50 * MIB).await.unwrap();
        assert_eq!(second.connections(), 5);
        assert_eq!(budget.snapshot().in_use, 20);
    }

    #[tokio::test]
    async fn test_ceiling_applies() {
        let budget = budget(20, 2, 6);
        let lease = budget.acquire(50 * MIB).await.unwrap();
        assert_eq!(lease.connections(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_exhausted() {
        let budget = budget(4, 2, 4);
        let _held = budget.acquire(50 * MIB).await.unwrap();
        let result = budget.acquire(50 * MIB).await;
        assert_eq!(result.unwrap_err(), BudgetError::Timeout(Duration::from_secs(30)));
        assert!(budget.try_acquire(1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_wakes_on_release() {
        let budget = budget(4, 2, 4);
        let held = budget.acquire(50 * MIB).await.unwrap();

        let waiter = {
            let budget = Arc::clone(&budget);
            tokio::spawn(async move { budget.acquire(50 * MIB).await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(held);

        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(lease.connections(), 4);
    }

    #[tokio::test]
    async fn test_in_use_never_exceeds_total() {
        let budget = budget(12, 2, 8);
        let mut tasks = Vec::new();

        for i in 0..40_u64 {
            let budget = Arc::clone(&budget);
            tasks.push(tokio::spawn(async move {
                let lease = budget.acquire((i % 4) * 3 * MIB).await.unwrap();
                let snapshot = budget.snapshot();
                assert!(snapshot.in_use <= snapshot.total);
                tokio::task::yield_now().await;
                drop(lease);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(budget.snapshot().in_use, 0);
    }
}
