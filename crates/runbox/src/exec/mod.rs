//! Execution controller: accept/reject decisions and run orchestration.

mod pump;

use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::languages::LanguageRegistry;
use crate::relay::{RelayEvent, RelayHub};
use crate::sandbox::{CompileOutcome, Provisioner, RuntimeHandle, SandboxError};
use crate::session::{SessionBusy, SessionManager, SessionRef};

use pump::{PumpContext, spawn_pump};

/// Grace period for a cancelled run's output drain.
const RUN_KILL_GRACE: Duration = Duration::from_secs(5);

/// Why an execute request was not accepted.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("unsupported language: {0}")]
    UnknownLanguage(String),

    #[error(transparent)]
    Busy(#[from] SessionBusy),

    /// Provisioning failed. The session is left idle with no runtime, so a
    /// retry starts clean.
    #[error("could not provision an execution environment: {0}")]
    Provision(#[source] SandboxError),

    /// The runtime faulted after provisioning.
    #[error("execution environment fault: {0}")]
    Sandbox(#[source] SandboxError),
}

/// Orchestrates one run per session: provision, write, compile, start, pump.
pub struct ExecutionController {
    registry: Arc<LanguageRegistry>,
    sessions: Arc<SessionManager>,
    provisioner: Arc<dyn Provisioner>,
    hub: Arc<RelayHub>,
}

impl ExecutionController {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        sessions: Arc<SessionManager>,
        provisioner: Arc<dyn Provisioner>,
        hub: Arc<RelayHub>,
    ) -> Self {
        Self {
            registry,
            sessions,
            provisioner,
            hub,
        }
    }

    /// Accept and start an execute request.
    ///
    /// Returns once the run is started (or rejected); output flows through
    /// the relay afterwards. A compile failure counts as accepted: the
    /// diagnostics are relayed as ordinary program output.
    ///
    /// The session lock is held only to claim and to transition state, never
    /// across the provision/write/compile phase, so `end` stays responsive
    /// while a slow compile is in flight. Teardown during that phase is
    /// observed at the next step boundary; destroying the container kills
    /// any in-container work with it.
    pub async fn execute(
        &self,
        session_id: &str,
        language: &str,
        code: &str,
    ) -> Result<(), ExecError> {
        let config = self
            .registry
            .resolve(language)
            .ok_or_else(|| ExecError::UnknownLanguage(language.to_string()))?
            .clone();

        let entry = self.sessions.get_or_create(session_id, language).await?;

        let cancel = CancellationToken::new();
        let existing = {
            let mut session = entry.lock().await;
            session.begin_run(cancel.clone())?;
            session.code = code.to_string();
            // Reuse the session's runtime when one survives from a prior run.
            session.runtime_handle.clone()
        };

        let handle = match existing {
            Some(handle) => handle,
            None => match self.provisioner.provision(session_id, &config).await {
                Ok(handle) => {
                    let mut session = entry.lock().await;
                    if !session.is_active {
                        // Ended while provisioning; release the fresh runtime
                        // nobody will ever reference.
                        drop(session);
                        self.discard_runtime(session_id, &handle).await;
                        return Ok(());
                    }
                    session.runtime_handle = Some(handle.clone());
                    handle
                }
                Err(e) => {
                    warn!("Provisioning for session {} failed: {}", session_id, e);
                    entry.lock().await.mark_idle();
                    self.hub
                        .broadcast(
                            session_id,
                            RelayEvent::Error {
                                message: "could not provision an execution environment"
                                    .to_string(),
                            },
                        )
                        .await;
                    return Err(ExecError::Provision(e));
                }
            },
        };

        if cancel.is_cancelled() {
            return Ok(());
        }
        if let Err(e) = self
            .provisioner
            .write_source(&handle, code, &config.source_extension)
            .await
        {
            return self.runtime_fault(session_id, &entry, e).await;
        }

        if cancel.is_cancelled() {
            return Ok(());
        }
        let outcome = match self.provisioner.compile_if_needed(&handle, &config).await {
            Ok(outcome) => outcome,
            Err(e) => return self.runtime_fault(session_id, &entry, e).await,
        };
        match outcome {
            CompileOutcome::Skipped => {}
            CompileOutcome::Success { output } => {
                // Compiler warnings still reach the client.
                if !output.is_empty() {
                    self.hub
                        .broadcast(session_id, RelayEvent::Stderr { data: output })
                        .await;
                }
            }
            CompileOutcome::Failure { output, exit_code } => {
                info!(
                    "Compile for session {} failed with code {}",
                    session_id, exit_code
                );
                entry.lock().await.mark_idle();
                if !output.is_empty() {
                    self.hub
                        .broadcast(session_id, RelayEvent::Stderr { data: output })
                        .await;
                }
                self.hub
                    .broadcast(session_id, RelayEvent::Exit { code: exit_code })
                    .await;
                return Ok(());
            }
        }

        if cancel.is_cancelled() {
            return Ok(());
        }
        let process = match self.provisioner.run(&handle, &config).await {
            Ok(process) => process,
            Err(e) => return self.runtime_fault(session_id, &entry, e).await,
        };

        {
            let mut session = entry.lock().await;
            if !session.is_active || cancel.is_cancelled() {
                // Ended while the process was starting; dropping it kills
                // the exec client and the container is already being torn
                // down.
                return Ok(());
            }
            session.mark_running(process.pid)?;
        }

        info!("Started {} run for session {}", language, session_id);
        spawn_pump(
            PumpContext {
                session_id: session_id.to_string(),
                session: entry.clone(),
                sessions: self.sessions.clone(),
                hub: self.hub.clone(),
                kill_grace: RUN_KILL_GRACE,
            },
            process,
            cancel,
        );
        Ok(())
    }

    /// Handle a mid-session runtime fault: the runtime is destroyed rather
    /// than reused, one `error` event is delivered, and the session is left
    /// idle with no handle so a retry starts clean.
    async fn runtime_fault(
        &self,
        session_id: &str,
        entry: &SessionRef,
        e: SandboxError,
    ) -> Result<(), ExecError> {
        warn!("Runtime fault for session {}: {}", session_id, e);
        let (handle, active) = {
            let mut session = entry.lock().await;
            let handle = session.runtime_handle.take();
            let active = session.is_active;
            session.mark_idle();
            (handle, active)
        };
        if let Some(handle) = handle {
            self.discard_runtime(session_id, &handle).await;
        }
        // A session torn down mid-request gets no event; its stream is gone.
        if active {
            self.hub
                .broadcast(
                    session_id,
                    RelayEvent::Error {
                        message: "execution environment fault".to_string(),
                    },
                )
                .await;
        }
        Err(ExecError::Sandbox(e))
    }

    async fn discard_runtime(&self, session_id: &str, handle: &RuntimeHandle) {
        if let Err(e) = self.provisioner.destroy(handle).await {
            warn!(
                "Failed to destroy runtime for session {}: {}",
                session_id, e
            );
        }
    }
}
