//! Session module.
//!
//! Keeps a bounded set of connected per-user Telegram clients.

mod manager;

pub use manager::{BusyUsers, SessionClient, SessionConnector, SessionError, SessionLimits, SessionManager};

#[cfg(test)]
pub(crate) use manager::tests;
