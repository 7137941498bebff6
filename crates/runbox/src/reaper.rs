//! Background reaper: run-timeout enforcement and idle-session expiry.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::languages::LanguageRegistry;
use crate::sandbox::Provisioner;
use crate::session::SessionManager;

/// Periodic sweep over all sessions.
///
/// Each tick does two passes: kill runs that exceeded their language's
/// execution timeout (keeping the runtime for reuse), then destroy sessions
/// idle past the idle timeout.
pub struct Reaper {
    sessions: Arc<SessionManager>,
    registry: Arc<LanguageRegistry>,
    provisioner: Arc<dyn Provisioner>,
    idle_timeout: Duration,
    sweep_interval: Duration,
}

impl Reaper {
    pub fn new(
        sessions: Arc<SessionManager>,
        registry: Arc<LanguageRegistry>,
        provisioner: Arc<dyn Provisioner>,
        idle_timeout: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            sessions,
            registry,
            provisioner,
            idle_timeout,
            sweep_interval,
        }
    }

    /// Spawn the sweep loop. Abort the handle to stop it.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            "Reaper started: sweep every {}s, idle timeout {}s",
            self.sweep_interval.as_secs(),
            self.idle_timeout.as_secs()
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.sweep_interval);
            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }

    async fn sweep(&self) {
        for overdue in self.sessions.collect_overdue(&self.registry).await {
            info!(
                "Killing overdue run in session {} ({})",
                overdue.session_id, overdue.runtime_handle
            );
            if let Err(e) = self.provisioner.kill(&overdue.runtime_handle).await {
                warn!(
                    "Failed to kill overdue run for session {}: {}",
                    overdue.session_id, e
                );
            }
        }

        let expired = self.sessions.sweep_expired(self.idle_timeout).await;
        if !expired.is_empty() {
            debug!("Reaping {} expired session(s)", expired.len());
        }
        for session in expired {
            if let Some(handle) = session.runtime_handle {
                if let Err(e) = self.provisioner.destroy(&handle).await {
                    warn!(
                        "Failed to destroy runtime of expired session {}: {}",
                        session.id, e
                    );
                }
            }
        }
    }
}
