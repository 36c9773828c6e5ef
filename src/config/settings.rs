//! Application settings and Telegram configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Env vars that identify a memory-constrained host (Render, Replit).
const CONSTRAINED_HOST_VARS: [&str; 4] =
    ["RENDER", "RENDER_EXTERNAL_URL", "REPLIT_DEPLOYMENT", "REPL_ID"];

/// Telegram API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Telegram API ID (obtain from <https://my.telegram.org>).
    pub api_id: i32,

    /// Telegram API hash (obtain from <https://my.telegram.org>).
    pub api_hash: String,

    /// Bot token issued by `@BotFather`.
    pub bot_token: String,

    /// Path to the bot's own session file.
    #[serde(default = "default_session_path")]
    pub session_path: PathBuf,

    /// Directory holding one session file per logged-in user.
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,
}

fn default_session_path() -> PathBuf {
    PathBuf::from("bot.session")
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from("sessions")
}

impl TelegramConfig {
    /// Creates a new Telegram configuration.
    #[must_use]
    pub fn new(api_id: i32, api_hash: String, bot_token: String) -> Self {
        Self {
            api_id,
            api_hash,
            bot_token,
            session_path: default_session_path(),
            sessions_dir: default_sessions_dir(),
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// Expects `TG_API_ID`, `TG_API_HASH` and `TG_BOT_TOKEN` to be set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_id: i32 = std::env::var("TG_API_ID")
            .map_err(|_| ConfigError::MissingEnvVar("TG_API_ID"))?
            .parse()
            .map_err(|_| ConfigError::InvalidApiId)?;

        let api_hash = std::env::var("TG_API_HASH")
            .map_err(|_| ConfigError::MissingEnvVar("TG_API_HASH"))?;

        let bot_token = std::env::var("TG_BOT_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("TG_BOT_TOKEN"))?;

        let session_path = std::env::var("TG_SESSION_PATH")
            .map_or_else(|_| default_session_path(), PathBuf::from);
        let sessions_dir = std::env::var("TG_SESSIONS_DIR")
            .map_or_else(|_| default_sessions_dir(), PathBuf::from);

        Ok(Self {
            api_id,
            api_hash,
            bot_token,
            session_path,
            sessions_dir,
        })
    }

    /// Session file for a given user.
    #[must_use]
    pub fn user_session_path(&self, user_id: i64) -> PathBuf {
        self.sessions_dir.join(format!("{user_id}.session"))
    }
}

/// Limits and paths for the download service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotSettings {
    /// Whether the host was detected as memory constrained.
    pub constrained: bool,

    /// Jobs allowed to run at the same time.
    pub max_concurrent: usize,

    /// Jobs allowed to wait for a slot.
    pub max_queue: usize,

    /// Live user sessions kept in memory.
    pub max_sessions: usize,

    /// Parallel connections shared by all transfers.
    pub total_connections: usize,

    /// Floor granted to a single transfer.
    pub min_connections: usize,

    /// Ceiling granted to a single transfer.
    pub max_connections: usize,

    /// How long a transfer may wait for its connection floor.
    pub acquire_timeout_secs: u64,

    /// Hard limit on a single job.
    pub job_timeout_secs: u64,

    /// Waiting items older than this are swept.
    pub stale_queue_minutes: u64,

    /// Sessions idle longer than this are disconnected.
    pub idle_timeout_minutes: u64,

    /// Downloaded files live under `<downloads_dir>/<user id>/`.
    pub downloads_dir: PathBuf,

    /// JSON file with premium/admin ids and usage counters.
    pub users_path: PathBuf,

    /// Downloads per day for free users.
    pub free_daily_limit: u32,

    /// Custom video thumbnails, one `<user id>.jpg` per user.
    #[serde(default = "default_thumbnails_dir")]
    pub thumbnails_dir: PathBuf,
}

fn default_thumbnails_dir() -> PathBuf {
    PathBuf::from("thumbnails")
}

impl Default for BotSettings {
    fn default() -> Self {
        Self::for_host(false)
    }
}

impl BotSettings {
    /// Defaults for a regular or a memory-constrained host.
    ///
    /// On a 512 MB host three transfers of large videos already use most of
    /// the memory, so both the queue and the session pool shrink.
    #[must_use]
    pub fn for_host(constrained: bool) -> Self {
        Self {
            constrained,
            max_concurrent: if constrained { 3 } else { 20 },
            max_queue: if constrained { 20 } else { 100 },
            max_sessions: if constrained { 3 } else { 5 },
            total_connections: 20,
            min_connections: 1,
            max_connections: 20,
            acquire_timeout_secs: 30,
            job_timeout_secs: 30 * 60,
            stale_queue_minutes: 60,
            idle_timeout_minutes: 30,
            downloads_dir: PathBuf::from("downloads"),
            users_path: PathBuf::from("users.json"),
            free_daily_limit: 5,
            thumbnails_dir: default_thumbnails_dir(),
        }
    }

    /// Creates bot settings from environment variables with defaults.
    #[must_use]
    pub fn from_env_with_defaults() -> Self {
        let defaults = Self::for_host(is_constrained_host());

        Self {
            max_concurrent: env_or("MAX_CONCURRENT", defaults.max_concurrent),
            max_queue: env_or("MAX_QUEUE", defaults.max_queue),
            max_sessions: env_or("MAX_SESSIONS", defaults.max_sessions),
            total_connections: env_or("MAX_CONNECTIONS", defaults.total_connections),
            min_connections: env_or("MIN_CONNECTIONS_PER_TRANSFER", defaults.min_connections),
            max_connections: env_or("MAX_CONNECTIONS_PER_TRANSFER", defaults.max_connections),
            acquire_timeout_secs: env_or("CONNECTION_WAIT_SECS", defaults.acquire_timeout_secs),
            job_timeout_secs: env_or("JOB_TIMEOUT_SECS", defaults.job_timeout_secs),
            stale_queue_minutes: env_or("STALE_QUEUE_MINUTES", defaults.stale_queue_minutes),
            idle_timeout_minutes: env_or("SESSION_IDLE_MINUTES", defaults.idle_timeout_minutes),
            downloads_dir: std::env::var("DOWNLOADS_DIR")
                .map_or(defaults.downloads_dir, PathBuf::from),
            users_path: std::env::var("USERS_PATH").map_or(defaults.users_path, PathBuf::from),
            free_daily_limit: env_or("FREE_DAILY_LIMIT", defaults.free_daily_limit),
            thumbnails_dir: std::env::var("THUMBNAILS_DIR")
                .map_or(defaults.thumbnails_dir, PathBuf::from),
            constrained: defaults.constrained,
        }
    }

    /// Checks that every limit is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("max_concurrent", self.max_concurrent),
            ("max_queue", self.max_queue),
            ("max_sessions", self.max_sessions),
            ("total_connections", self.total_connections),
            ("min_connections", self.min_connections),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::ZeroLimit(name));
            }
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvertedRange {
                min: self.min_connections,
                max: self.max_connections,
            });
        }

        if self.min_connections > self.total_connections {
            return Err(ConfigError::FloorAboveTotal {
                min: self.min_connections,
                total: self.total_connections,
            });
        }

        if self.job_timeout_secs == 0 {
            return Err(ConfigError::ZeroLimit("job_timeout_secs"));
        }

        Ok(())
    }

    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    #[must_use]
    pub const fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    #[must_use]
    pub const fn stale_queue_age(&self) -> Duration {
        Duration::from_secs(self.stale_queue_minutes * 60)
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_minutes * 60)
    }
}

/// Returns true when running on a host with a hard memory ceiling.
#[must_use]
pub fn is_constrained_host() -> bool {
    CONSTRAINED_HOST_VARS
        .iter()
        .any(|var| std::env::var(var).is_ok_and(|v| !v.is_empty()))
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),

    #[error("Invalid API ID format (must be a positive integer)")]
    InvalidApiId,

    #[error("{0} must be greater than 0")]
    ZeroLimit(&'static str),

    #[error("Per-transfer connection floor {min} exceeds the ceiling {max}")]
    InvertedRange { min: usize, max: usize },

    #[error("Per-transfer connection floor {min} exceeds the global budget {total}")]
    FloorAboveTotal { min: usize, total: usize },
}
