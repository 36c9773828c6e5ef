//! Restricted Downloader Bot Library
//!
//! A Telegram bot that downloads media from channels with forwarding and
//! saving restricted, using the requesting user's own account.
//!
//! This crate provides the core functionality for:
//! - Admitting download jobs into a priority queue with a concurrency limit
//! - Sharing a budget of parallel connections between transfers
//! - Keeping a bounded pool of per-user Telegram sessions
//! - Handling user commands and the phone login flow via chat messages

pub mod commands;
pub mod config;
pub mod maintenance;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod session;
pub mod telegram;
pub mod transfer;
