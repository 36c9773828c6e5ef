//! Command handling module.
//!
//! Parses messages sent to the bot (`/cmd`, `/cmd@botname` or a bare post
//! link) and runs them against the queue, the session pool and the login
//! flow.

mod handler;
mod types;

pub use handler::{CommandHandler, HandlerDeps};
pub use types::{BotCommand, CommandResult};
