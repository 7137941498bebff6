//! Wire protocol for the stdio relay channel.

use serde::{Deserialize, Serialize};

/// Server-to-client relay events.
///
/// Ordering within one stream is preserved; interleaving between stdout and
/// stderr reflects arrival order, not necessarily write order in the guest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayEvent {
    /// A chunk of the process's standard output.
    Stdout { data: String },
    /// A chunk of the process's standard error.
    Stderr { data: String },
    /// Terminal event: the process exited on its own.
    Exit { code: i32 },
    /// Terminal event for abnormal endings (timeout, infrastructure fault).
    Error { message: String },
}

impl RelayEvent {
    /// Whether this event ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayEvent::Exit { .. } | RelayEvent::Error { .. })
    }
}

/// Client-to-server relay commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayCommand {
    /// Data for the running process's standard input.
    Input { data: String },
}
