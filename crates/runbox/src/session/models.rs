//! Session data models.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::sandbox::RuntimeHandle;

/// An execute request arrived while the session already had a live process.
#[derive(Debug, Error)]
#[error("session {0} already has a live process")]
pub struct SessionBusy(pub String);

/// Why a run was killed before the process exited on its own.
///
/// Recorded under the session lock before the kill is issued; the I/O pump
/// takes it when the process goes down so the single terminal event carries
/// a distinguishable reason.
#[derive(Debug, Clone)]
pub enum KillReason {
    /// The run exceeded its language's execution timeout.
    Timeout { limit: Duration },
    /// The session idled out and was reaped.
    Expired,
    /// The session was ended (explicitly or by a language switch).
    Ended,
}

/// One caller-visible execution session.
///
/// Owned exclusively by the [`SessionManager`](super::SessionManager); all
/// access goes through the per-session mutex.
#[derive(Debug)]
pub struct ExecutionSession {
    /// Unique session ID (caller-supplied).
    pub id: String,
    /// Current language; part of the runtime's identity, not just a field.
    pub language: String,
    /// Last submitted source, kept for replay/debugging.
    pub code: String,
    /// Provisioned runtime, lazily allocated on first execute.
    pub runtime_handle: Option<RuntimeHandle>,
    /// Host-side pid of the current run's exec client, when known.
    pub process_id: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// True from creation until explicit end or reaper expiry.
    pub is_active: bool,
    /// True while an accepted execute is provisioning/compiling, before the
    /// process itself is up. Counts as busy.
    pub preparing: bool,
    /// When the current run started; `Some` means the process is live.
    pub run_started_at: Option<DateTime<Utc>>,
    /// Cancels the current run's I/O pump on teardown.
    pub cancel: Option<CancellationToken>,
    /// Pending kill reason for the pump's terminal event.
    pub kill_reason: Option<KillReason>,
}

impl ExecutionSession {
    pub fn new(id: impl Into<String>, language: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            language: language.into(),
            code: String::new(),
            runtime_handle: None,
            process_id: None,
            created_at: now,
            last_activity_at: now,
            is_active: true,
            preparing: false,
            run_started_at: None,
            cancel: None,
            kill_reason: None,
        }
    }

    /// Whether the session is busy with an accepted execute, from acceptance
    /// through the live process.
    ///
    /// Keyed off `preparing`/`run_started_at` rather than `process_id`: the
    /// exec client's pid can be unknown while the run is very much alive.
    pub fn is_running(&self) -> bool {
        self.preparing || self.run_started_at.is_some()
    }

    /// Refresh the idle-expiry clock.
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Claim the session for an accepted execute, before the slow
    /// provision/compile phase. Fails when a run is already in flight.
    ///
    /// The cancellation token is installed here so teardown can interrupt
    /// the request at any point, not just once the process is up. Any stale
    /// kill reason from a prior run is discarded.
    pub fn begin_run(&mut self, cancel: CancellationToken) -> Result<(), SessionBusy> {
        if self.is_running() {
            return Err(SessionBusy(self.id.clone()));
        }
        self.preparing = true;
        self.cancel = Some(cancel);
        self.kill_reason = None;
        self.touch();
        Ok(())
    }

    /// Transition to running, enforcing at-most-one-live-process.
    pub fn mark_running(&mut self, pid: Option<u32>) -> Result<(), SessionBusy> {
        if self.run_started_at.is_some() {
            return Err(SessionBusy(self.id.clone()));
        }
        self.preparing = false;
        self.process_id = pid;
        self.run_started_at = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// Transition back to idle after the run's terminal event. A kill reason
    /// nobody consumed is dropped here so it cannot leak into the next run.
    pub fn mark_idle(&mut self) {
        self.preparing = false;
        self.process_id = None;
        self.run_started_at = None;
        self.cancel = None;
        self.kill_reason = None;
        self.touch();
    }

    /// Take the pending kill reason, if the run was killed rather than
    /// exiting on its own.
    pub fn take_kill_reason(&mut self) -> Option<KillReason> {
        self.kill_reason.take()
    }
}
