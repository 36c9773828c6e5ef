//! Telegram client wrapper module.
//!
//! Per-user `MTProto` clients that read restricted posts, the phone login
//! flow, the bot account that talks to users, link parsing and rate
//! limiting.

mod auth;
mod bot;
mod client;
mod link;
mod rate_limiter;

pub use auth::{LoginBackend, LoginError, LoginStep, PhoneLogin};
pub use bot::{BotReply, IncomingMessage, run_bot};
pub use client::{GrammersConnector, RemoteFile, TelegramError, UserClient};
pub use link::{ChatRef, LinkError, PostLink, looks_like_link};
pub use rate_limiter::{BACKOFF_BASE, BACKOFF_MAX, RateLimiter, backoff_delay};
