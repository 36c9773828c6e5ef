//! User directory: account tiers and daily download quota.
//!
//! The directory is a small JSON file. Premium and admin ids are edited by
//! hand (or by an external admin tool); the bot only writes usage counters
//! and custom thumbnails. Every write replaces the file atomically.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Errors that can occur while loading or validating the user directory.
#[derive(Debug, Error)]
pub enum UserStoreError {
    #[error("User id {0} is not a valid Telegram user id")]
    InvalidUserId(i64),

    #[error("Usage entry for user {user_id} is dated in the future ({date})")]
    FutureUsage { user_id: i64, date: NaiveDate },

    #[error("Failed to read users file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse users file: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Account tier of a bot user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserTier {
    Admin,
    Premium,
    Free,
}

impl UserTier {
    /// Premium and admin accounts get queue priority and no quota.
    #[must_use]
    pub const fn is_premium(self) -> bool {
        matches!(self, Self::Admin | Self::Premium)
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Admin => "Admin",
            Self::Premium => "Premium",
            Self::Free => "Free",
        }
    }
}

/// Downloads counted for one calendar day.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub count: u32,
}

/// Serialized form of the users file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserDirectory {
    /// Bot owner, always treated as admin.
    #[serde(default)]
    pub owner_id: Option<i64>,

    #[serde(default)]
    pub admins: BTreeSet<i64>,

    #[serde(default)]
    pub premium: BTreeSet<i64>,

    #[serde(default)]
    pub usage: BTreeMap<i64, DailyUsage>,

    /// Custom video thumbnails, one image file per user.
    #[serde(default)]
    pub thumbnails: BTreeMap<i64, PathBuf>,
}

impl UserDirectory {
    /// Loads the directory from a JSON file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, UserStoreError> {
        let content = std::fs::read_to_string(path)?;
        let directory: Self = serde_json::from_str(&content)?;
        Ok(directory)
    }

    /// Loads the directory, falling back to an empty one if the file is missing.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, UserStoreError> {
        match Self::load_from_file(path) {
            Err(UserStoreError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Saves the directory to a JSON file through a temp file and rename.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), UserStoreError> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;

        let dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(content.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Validates ids and usage dates against `today`.
    pub fn validate(&self, today: NaiveDate) -> Result<(), UserStoreError> {
        let ids = self
            .owner_id
            .iter()
            .chain(&self.admins)
            .chain(&self.premium)
            .chain(self.usage.keys())
            .chain(self.thumbnails.keys());

        for &id in ids {
            if id <= 0 {
                return Err(UserStoreError::InvalidUserId(id));
            }
        }

        for (&user_id, usage) in &self.usage {
            if usage.date > today {
                return Err(UserStoreError::FutureUsage {
                    user_id,
                    date: usage.date,
                });
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn tier(&self, user_id: i64) -> UserTier {
        if self.owner_id == Some(user_id) || self.admins.contains(&user_id) {
            UserTier::Admin
        } else if self.premium.contains(&user_id) {
            UserTier::Premium
        } else {
            UserTier::Free
        }
    }

    /// Downloads already used by `user_id` on `today`.
    #[must_use]
    pub fn used_on(&self, user_id: i64, today: NaiveDate) -> u32 {
        self.usage
            .get(&user_id)
            .filter(|u| u.date == today)
            .map_or(0, |u| u.count)
    }

    /// Remaining downloads for today, `None` when unlimited.
    #[must_use]
    pub fn remaining(&self, user_id: i64, daily_limit: u32, today: NaiveDate) -> Option<u32> {
        if self.tier(user_id).is_premium() {
            return None;
        }
        Some(daily_limit.saturating_sub(self.used_on(user_id, today)))
    }

    /// Counts `files` downloads, resetting the counter on a new day.
    pub fn record(&mut self, user_id: i64, files: u32, today: NaiveDate) {
        let entry = self.usage.entry(user_id).or_insert(DailyUsage {
            date: today,
            count: 0,
        });
        if entry.date != today {
            *entry = DailyUsage {
                date: today,
                count: 0,
            };
        }
        entry.count = entry.count.saturating_add(files);
    }
}

/// Shared, file-backed user directory.
#[derive(Debug)]
pub struct UserStore {
    path: PathBuf,
    free_daily_limit: u32,
    directory: RwLock<UserDirectory>,
    /// Serializes file writes so an older snapshot never lands last.
    save_lock: Mutex<()>,
}

impl UserStore {
    #[must_use]
    pub fn new(path: PathBuf, free_daily_limit: u32, directory: UserDirectory) -> Self {
        Self {
            path,
            free_daily_limit,
            directory: RwLock::new(directory),
            save_lock: Mutex::new(()),
        }
    }

    /// Opens the users file, creating an empty directory if it does not exist.
    pub fn open(path: PathBuf, free_daily_limit: u32) -> Result<Self, UserStoreError> {
        let directory = UserDirectory::load_or_default(&path)?;
        directory.validate(today())?;
        Ok(Self::new(path, free_daily_limit, directory))
    }

    pub async fn tier(&self, user_id: i64) -> UserTier {
        self.directory.read().await.tier(user_id)
    }

    #[must_use]
    pub const fn free_daily_limit(&self) -> u32 {
        self.free_daily_limit
    }

    /// Remaining downloads for today, `None` when unlimited.
    pub async fn remaining(&self, user_id: i64) -> Option<u32> {
        self.directory
            .read()
            .await
            .remaining(user_id, self.free_daily_limit, today())
    }

    /// Records `files` finished downloads and persists the counters.
    pub async fn record_usage(&self, user_id: i64, files: u32) {
        {
            let mut directory = self.directory.write().await;
            if files == 0 || directory.tier(user_id).is_premium() {
                return;
            }
            directory.record(user_id, files, today());
            debug!(
                "Recorded {} download(s) for user {} ({} today)",
                files,
                user_id,
                directory.used_on(user_id, today())
            );
        }
        self.save().await;
    }

    /// The user's custom thumbnail, if one is set.
    pub async fn thumbnail(&self, user_id: i64) -> Option<PathBuf> {
        self.directory.read().await.thumbnails.get(&user_id).cloned()
    }

    pub async fn set_thumbnail(&self, user_id: i64, path: PathBuf) {
        self.directory.write().await.thumbnails.insert(user_id, path);
        info!("User {} set a custom thumbnail", user_id);
        self.save().await;
    }

    /// Forgets the user's thumbnail and returns its file.
    pub async fn clear_thumbnail(&self, user_id: i64) -> Option<PathBuf> {
        let removed = self.directory.write().await.thumbnails.remove(&user_id);
        if removed.is_some() {
            info!("User {} removed their custom thumbnail", user_id);
            self.save().await;
        }
        removed
    }

    /// Writes the current directory to disk off the async runtime.
    async fn save(&self) {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.directory.read().await.clone();
        let path = self.path.clone();

        match tokio::task::spawn_blocking(move || snapshot.save_to_file(&path)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to save users file {}: {}", self.path.display(), e),
            Err(e) => warn!("Users file save task failed: {}", e),
        }
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}
