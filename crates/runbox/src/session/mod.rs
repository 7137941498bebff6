//! Execution session state and management.

mod manager;
mod models;

pub use manager::{ExpiredSession, OverdueRun, SessionManager, SessionRef};
pub use models::{ExecutionSession, KillReason, SessionBusy};
