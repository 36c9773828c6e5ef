//! Bounded pool of live user sessions.
//!
//! Every connected user client costs tens of megabytes, so only
//! `max_sessions` are kept. When the pool is full the least recently used
//! session whose user has no running or waiting job is disconnected to make
//! room.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::queue::UserId;

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("All {0} session slots are busy with downloads")]
    SlotsFull(usize),

    #[error("No saved login for this user")]
    NotLoggedIn,

    #[error("Saved session is no longer authorized")]
    InvalidSession,

    #[error("Failed to create session: {0}")]
    CreationFailed(String),
}

/// A connected per-user client.
pub trait SessionClient: Send + Sync + 'static {
    /// Whether the account behind the client is signed in.
    fn is_authorized(&self) -> impl Future<Output = bool> + Send;

    fn disconnect(&self) -> impl Future<Output = ()> + Send;
}

/// Opens user clients from saved logins.
pub trait SessionConnector: Send + Sync {
    type Client: SessionClient;
    type Error: Display + Send;

    /// Whether a saved login exists for the user.
    fn has_saved_session(&self, user_id: UserId) -> bool;

    fn connect(&self, user_id: UserId) -> impl Future<Output = Result<Self::Client, Self::Error>> + Send;
}

/// Users whose sessions must stay connected.
pub trait BusyUsers: Send + Sync {
    fn busy_users(&self) -> impl Future<Output = HashSet<UserId>> + Send;
}

impl BusyUsers for HashSet<UserId> {
    async fn busy_users(&self) -> HashSet<UserId> {
        self.clone()
    }
}

/// Limits of the session pool.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions: 5,
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

struct SessionEntry<C> {
    client: Arc<C>,
    last_activity: Instant,
    /// LRU stamp; higher is more recent.
    last_used: u64,
}

struct SessionPool<C> {
    entries: HashMap<UserId, SessionEntry<C>>,
    clock: u64,
}

impl<C> SessionPool<C> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Least recently used user that is not busy.
    fn eviction_candidate(&self, busy: &HashSet<UserId>) -> Option<UserId> {
        self.entries
            .iter()
            .filter(|(user_id, _)| !busy.contains(user_id))
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(user_id, _)| *user_id)
    }
}

/// Bounded LRU of live user sessions.
pub struct SessionManager<K: SessionConnector> {
    connector: K,
    limits: SessionLimits,
    pool: Mutex<SessionPool<K::Client>>,
}

impl<K: SessionConnector> SessionManager<K> {
    #[must_use]
    pub fn new(connector: K, limits: SessionLimits) -> Self {
        info!(
            "Session manager initialized: max {} sessions, {} min idle timeout",
            limits.max_sessions,
            limits.idle_timeout.as_secs() / 60
        );

        Self {
            connector,
            limits,
            pool: Mutex::new(SessionPool {
                entries: HashMap::new(),
                clock: 0,
            }),
        }
    }

    #[must_use]
    pub const fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    #[must_use]
    pub const fn connector(&self) -> &K {
        &self.connector
    }

    /// Returns the user's live session, connecting one if needed.
    ///
    /// Sessions of `busy` users are never evicted. The set is read while
    /// the pool is locked.
    pub async fn get_or_create<B>(&self, user_id: UserId, busy: &B) -> Result<Arc<K::Client>, SessionError>
    where
        B: BusyUsers + ?Sized,
    {
        let mut pool = self.pool.lock().await;

        let stamp = pool.tick();
        if let Some(entry) = pool.entries.get_mut(&user_id) {
            entry.last_used = stamp;
            entry.last_activity = Instant::now();
            debug!("Reusing session for user {}", user_id);
            return Ok(Arc::clone(&entry.client));
        }

        if !self.connector.has_saved_session(user_id) {
            return Err(SessionError::NotLoggedIn);
        }

        if pool.entries.len() >= self.limits.max_sessions {
            let busy = busy.busy_users().await;
            let Some(victim) = pool.eviction_candidate(&busy) else {
                warn!(
                    "Cannot create session for user {}: all {} sessions have active downloads",
                    user_id, self.limits.max_sessions
                );
                return Err(SessionError::SlotsFull(self.limits.max_sessions));
            };

            if let Some(entry) = pool.entries.remove(&victim) {
                entry.client.disconnect().await;
                info!("Disconnected least recently used session of user {}", victim);
            }
        }

        let client = match self.connector.connect(user_id).await {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to create session for user {}: {}", user_id, e);
                return Err(SessionError::CreationFailed(e.to_string()));
            }
        };

        if !client.is_authorized().await {
            error!("Session for user {} is not authorized", user_id);
            client.disconnect().await;
            return Err(SessionError::InvalidSession);
        }

        let client = Arc::new(client);
        let stamp = pool.tick();
        pool.entries.insert(
            user_id,
            SessionEntry {
                client: Arc::clone(&client),
                last_activity: Instant::now(),
                last_used: stamp,
            },
        );

        info!(
            "Created session for user {} ({}/{})",
            user_id,
            pool.entries.len(),
            self.limits.max_sessions
        );

        Ok(client)
    }

    /// Disconnects and forgets the user's session. Returns whether one existed.
    pub async fn remove(&self, user_id: UserId) -> bool {
        let entry = self.pool.lock().await.entries.remove(&user_id);
        match entry {
            Some(entry) => {
                entry.client.disconnect().await;
                info!("Removed session for user {}", user_id);
                true
            }
            None => false,
        }
    }

    /// Disconnects every session.
    pub async fn disconnect_all(&self) {
        let entries: Vec<_> = self.pool.lock().await.entries.drain().collect();
        for (_, entry) in &entries {
            entry.client.disconnect().await;
        }
        info!("All sessions disconnected ({})", entries.len());
    }

    /// Disconnects sessions idle past the timeout whose user is not busy.
    pub async fn cleanup_idle(&self, busy: &HashSet<UserId>) -> usize {
        let idle: Vec<_> = {
            let mut pool = self.pool.lock().await;
            let expired: Vec<UserId> = pool
                .entries
                .iter()
                .filter(|(user_id, entry)| {
                    !busy.contains(user_id) && entry.last_activity.elapsed() > self.limits.idle_timeout
                })
                .map(|(user_id, _)| *user_id)
                .collect();

            expired
                .into_iter()
                .filter_map(|user_id| pool.entries.remove(&user_id).map(|e| (user_id, e)))
                .collect()
        };

        for (user_id, entry) in &idle {
            info!(
                "Disconnecting idle session for user {} (idle for {} minutes)",
                user_id,
                entry.last_activity.elapsed().as_secs() / 60
            );
            entry.client.disconnect().await;
        }

        if !idle.is_empty() {
            info!(
                "Cleaned up {} idle sessions. Active sessions: {}",
                idle.len(),
                self.active_count().await
            );
        }

        idle.len()
    }

    pub async fn active_count(&self) -> usize {
        self.pool.lock().await.entries.len()
    }

    pub async fn contains(&self, user_id: UserId) -> bool {
        self.pool.lock().await.entries.contains_key(&user_id)
    }
}

impl<K: SessionConnector> std::fmt::Debug for SessionManager<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}
