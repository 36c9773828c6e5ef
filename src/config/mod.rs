//! Configuration module for the downloader bot.
//!
//! Handles loading and validation of limits, Telegram API credentials
//! and the user directory.

mod settings;
mod users;

pub use settings::{BotSettings, ConfigError, TelegramConfig, is_constrained_host};
pub use users::{DailyUsage, UserDirectory, UserStore, UserStoreError, UserTier};
