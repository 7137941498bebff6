//! Session manager - authoritative table of execution sessions.
//!
//! Mutations to one session are serialized through its own mutex; operations
//! on different sessions proceed independently. There is deliberately no
//! global lock: the table is a [`DashMap`] and entry guards are never held
//! across await points.

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::languages::LanguageRegistry;
use crate::sandbox::{Provisioner, RuntimeHandle};

use super::models::{ExecutionSession, KillReason, SessionBusy};

/// Shared, lockable reference to one session.
pub type SessionRef = Arc<Mutex<ExecutionSession>>;

/// A session removed by the idle sweep. The caller must release the runtime
/// before the session is considered fully gone.
#[derive(Debug)]
pub struct ExpiredSession {
    pub id: String,
    pub runtime_handle: Option<RuntimeHandle>,
}

/// A run that exceeded its language's execution timeout.
#[derive(Debug)]
pub struct OverdueRun {
    pub session_id: String,
    pub runtime_handle: RuntimeHandle,
}

/// Authoritative owner of all execution sessions.
pub struct SessionManager {
    sessions: DashMap<String, SessionRef>,
    provisioner: Arc<dyn Provisioner>,
}

impl SessionManager {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            sessions: DashMap::new(),
            provisioner,
        }
    }

    /// Get the session for `session_id`, creating an idle one if absent.
    ///
    /// When the requested language differs from the session's current one,
    /// the old runtime is torn down here — language is part of the runtime's
    /// identity, so callers never see a stale-language handle. A switch is
    /// refused while a run is in flight: busy means busy, whatever the
    /// language, and the live run keeps its runtime.
    pub async fn get_or_create(
        &self,
        session_id: &str,
        language: &str,
    ) -> Result<SessionRef, SessionBusy> {
        loop {
            let entry = self
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| {
                    info!("Creating session {} for language {}", session_id, language);
                    Arc::new(Mutex::new(ExecutionSession::new(session_id, language)))
                })
                .clone();

            let mut session = entry.lock().await;
            if !session.is_active {
                // Lost a race with end(); the entry is already gone from the
                // table. Retry against a fresh row.
                drop(session);
                continue;
            }

            if session.language != language {
                if session.is_running() {
                    return Err(SessionBusy(session_id.to_string()));
                }
                info!(
                    "Session {} switching language {} -> {}, tearing down runtime",
                    session_id, session.language, language
                );
                if let Some(handle) = session.runtime_handle.take() {
                    if let Err(e) = self.provisioner.destroy(&handle).await {
                        warn!("Failed to destroy runtime for session {}: {}", session_id, e);
                    }
                }
                session.process_id = None;
                session.language = language.to_string();
            }

            session.touch();
            drop(session);
            return Ok(entry);
        }
    }

    fn get(&self, session_id: &str) -> Option<SessionRef> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    /// Update the session's activity timestamp. Unknown ids are ignored.
    pub async fn touch(&self, session_id: &str) {
        if let Some(entry) = self.get(session_id) {
            entry.lock().await.touch();
        }
    }

    /// Transition a session to running. Fails when a process is already live.
    pub async fn mark_running(
        &self,
        session_id: &str,
        pid: Option<u32>,
    ) -> Result<(), SessionBusy> {
        match self.get(session_id) {
            Some(entry) => entry.lock().await.mark_running(pid),
            None => Ok(()),
        }
    }

    /// Transition a session back to idle after its run's terminal event.
    pub async fn mark_idle(&self, session_id: &str) {
        if let Some(entry) = self.get(session_id) {
            entry.lock().await.mark_idle();
        }
    }

    /// Caller-initiated teardown. Idempotent: ending an unknown or already
    /// ended session is a no-op.
    ///
    /// The runtime is released before the session row is removed, so no
    /// session ever references a freed runtime.
    pub async fn end(&self, session_id: &str) {
        let Some(entry) = self.get(session_id) else {
            debug!("End for unknown session {} ignored", session_id);
            return;
        };

        let mut session = entry.lock().await;
        if !session.is_active {
            return;
        }
        session.is_active = false;
        if let Some(cancel) = session.cancel.take() {
            session.kill_reason = Some(KillReason::Ended);
            cancel.cancel();
        }
        if let Some(handle) = session.runtime_handle.take() {
            if let Err(e) = self.provisioner.destroy(&handle).await {
                warn!("Failed to destroy runtime for session {}: {}", session_id, e);
            }
        }
        self.sessions.remove(session_id);
        info!("Ended session {}", session_id);
    }

    /// End every session; used during shutdown.
    pub async fn end_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.end(&id).await;
        }
    }

    /// Remove sessions idle for longer than `idle_timeout`.
    ///
    /// Returned entries carry their runtime handle; the caller (the reaper)
    /// destroys each before the session counts as fully gone.
    pub async fn sweep_expired(&self, idle_timeout: Duration) -> Vec<ExpiredSession> {
        let cutoff = Utc::now() - chrono::Duration::seconds(idle_timeout.as_secs() as i64);
        let candidates: Vec<(String, SessionRef)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut expired = Vec::new();
        for (id, entry) in candidates {
            let mut session = entry.lock().await;
            if !session.is_active || session.last_activity_at > cutoff {
                continue;
            }
            session.is_active = false;
            if let Some(cancel) = session.cancel.take() {
                session.kill_reason = Some(KillReason::Expired);
                cancel.cancel();
            }
            let runtime_handle = session.runtime_handle.take();
            drop(session);

            self.sessions.remove(&id);
            info!("Session {} expired after idle timeout", id);
            expired.push(ExpiredSession { id, runtime_handle });
        }
        expired
    }

    /// Find runs that exceeded their language's execution timeout.
    ///
    /// Marks each with a timeout kill reason (so the pump's terminal event is
    /// distinguishable) and returns the handles for the reaper to kill. Each
    /// overdue run is reported exactly once.
    pub async fn collect_overdue(&self, registry: &LanguageRegistry) -> Vec<OverdueRun> {
        let now = Utc::now();
        let candidates: Vec<(String, SessionRef)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut overdue = Vec::new();
        for (session_id, entry) in candidates {
            let mut session = entry.lock().await;
            if session.kill_reason.is_some() {
                continue;
            }
            let Some(started) = session.run_started_at else {
                continue;
            };
            let Some(config) = registry.resolve(&session.language) else {
                continue;
            };
            let limit = config.execution_timeout;
            let elapsed = (now - started).to_std().unwrap_or(Duration::ZERO);
            if elapsed < limit {
                continue;
            }
            let Some(runtime_handle) = session.runtime_handle.clone() else {
                continue;
            };
            warn!(
                "Session {} run exceeded {}s execution timeout",
                session_id,
                limit.as_secs()
            );
            session.kill_reason = Some(KillReason::Timeout { limit });
            overdue.push(OverdueRun {
                session_id,
                runtime_handle,
            });
        }
        overdue
    }

    /// Number of live sessions in the table.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether a session is present in the table.
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::LanguageConfig;
    use crate::sandbox::{
        CompileOutcome, RunningProcess, SandboxError,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provisioner stub recording lifecycle calls.
    #[derive(Default)]
    struct RecordingProvisioner {
        destroys: AtomicUsize,
        kills: AtomicUsize,
        calls: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingProvisioner {
        fn log(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl Provisioner for RecordingProvisioner {
        async fn provision(
            &self,
            session_id: &str,
            _config: &LanguageConfig,
        ) -> Result<RuntimeHandle, SandboxError> {
            self.log(format!("provision:{}", session_id));
            Ok(RuntimeHandle {
                container_id: format!("ctr-{}", session_id),
            })
        }

        async fn write_source(
            &self,
            _handle: &RuntimeHandle,
            _code: &str,
            _extension: &str,
        ) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn compile_if_needed(
            &self,
            _handle: &RuntimeHandle,
            _config: &LanguageConfig,
        ) -> Result<CompileOutcome, SandboxError> {
            Ok(CompileOutcome::Skipped)
        }

        async fn run(
            &self,
            _handle: &RuntimeHandle,
            _config: &LanguageConfig,
        ) -> Result<RunningProcess, SandboxError> {
            unimplemented!("not used by manager tests")
        }

        async fn kill(&self, handle: &RuntimeHandle) -> Result<(), SandboxError> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.log(format!("kill:{}", handle.container_id));
            Ok(())
        }

        async fn destroy(&self, handle: &RuntimeHandle) -> Result<(), SandboxError> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            self.log(format!("destroy:{}", handle.container_id));
            Ok(())
        }
    }

    fn manager() -> (Arc<SessionManager>, Arc<RecordingProvisioner>) {
        let provisioner = Arc::new(RecordingProvisioner::default());
        let manager = Arc::new(SessionManager::new(provisioner.clone()));
        (manager, provisioner)
    }

    #[tokio::test]
    async fn test_get_or_create_returns_idle_session() {
        let (manager, _) = manager();
        let entry = manager.get_or_create("s1", "python").await.unwrap();
        let session = entry.lock().await;
        assert_eq!(session.language, "python");
        assert!(!session.is_running());
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_same_language() {
        let (manager, provisioner) = manager();
        {
            let entry = manager.get_or_create("s1", "python").await.unwrap();
            entry.lock().await.runtime_handle = Some(RuntimeHandle {
                container_id: "ctr-1".to_string(),
            });
        }

        let entry = manager.get_or_create("s1", "python").await.unwrap();
        let session = entry.lock().await;
        assert!(session.runtime_handle.is_some());
        assert_eq!(provisioner.destroys.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_language_switch_destroys_old_runtime() {
        let (manager, provisioner) = manager();
        {
            let entry = manager.get_or_create("s1", "python").await.unwrap();
            entry.lock().await.runtime_handle = Some(RuntimeHandle {
                container_id: "ctr-python".to_string(),
            });
        }

        let entry = manager.get_or_create("s1", "javascript").await.unwrap();
        let session = entry.lock().await;
        assert_eq!(session.language, "javascript");
        assert!(session.runtime_handle.is_none());
        assert_eq!(provisioner.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_language_switch_rejected_while_running() {
        let (manager, provisioner) = manager();
        {
            let entry = manager.get_or_create("s1", "python").await.unwrap();
            let mut session = entry.lock().await;
            session.runtime_handle = Some(RuntimeHandle {
                container_id: "ctr-python".to_string(),
            });
            session.mark_running(Some(1)).unwrap();
        }

        // Busy means busy, whatever the language: the live run is untouched.
        assert!(manager.get_or_create("s1", "javascript").await.is_err());
        assert_eq!(provisioner.destroys.load(Ordering::SeqCst), 0);

        let entry = manager.get_or_create("s1", "python").await.unwrap();
        let session = entry.lock().await;
        assert_eq!(session.language, "python");
        assert!(session.runtime_handle.is_some());
    }

    #[tokio::test]
    async fn test_end_is_idempotent_and_destroys_once() {
        let (manager, provisioner) = manager();
        {
            let entry = manager.get_or_create("s1", "python").await.unwrap();
            entry.lock().await.runtime_handle = Some(RuntimeHandle {
                container_id: "ctr-1".to_string(),
            });
        }

        manager.end("s1").await;
        manager.end("s1").await;
        manager.end("never-existed").await;

        assert!(!manager.contains("s1"));
        assert_eq!(provisioner.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_session_recreated_after_end() {
        let (manager, _) = manager();
        manager.get_or_create("s1", "python").await.unwrap();
        manager.end("s1").await;

        let entry = manager.get_or_create("s1", "python").await.unwrap();
        let session = entry.lock().await;
        assert!(session.is_active);
        assert!(session.runtime_handle.is_none());
    }

    #[tokio::test]
    async fn test_mark_running_rejects_second_process() {
        let (manager, _) = manager();
        manager.get_or_create("s1", "python").await.unwrap();

        manager.mark_running("s1", Some(100)).await.unwrap();
        assert!(manager.mark_running("s1", Some(101)).await.is_err());

        manager.mark_idle("s1").await;
        manager.mark_running("s1", Some(102)).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_expired_removes_idle_sessions() {
        let (manager, _) = manager();
        {
            let entry = manager.get_or_create("stale", "python").await.unwrap();
            let mut session = entry.lock().await;
            session.runtime_handle = Some(RuntimeHandle {
                container_id: "ctr-stale".to_string(),
            });
            session.last_activity_at = Utc::now() - chrono::Duration::seconds(3600);
        }
        manager.get_or_create("fresh", "python").await.unwrap();

        let expired = manager.sweep_expired(Duration::from_secs(600)).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "stale");
        assert!(expired[0].runtime_handle.is_some());
        assert!(!manager.contains("stale"));
        assert!(manager.contains("fresh"));
    }

    #[tokio::test]
    async fn test_collect_overdue_marks_timeout_once() {
        let (manager, _) = manager();
        let registry =
            LanguageRegistry::builtin_with_overrides(&std::collections::HashMap::new()).unwrap();
        {
            let entry = manager.get_or_create("s1", "python").await.unwrap();
            let mut session = entry.lock().await;
            session.runtime_handle = Some(RuntimeHandle {
                container_id: "ctr-1".to_string(),
            });
            session.mark_running(Some(1)).unwrap();
            session.run_started_at = Some(Utc::now() - chrono::Duration::seconds(120));
        }

        let first = manager.collect_overdue(&registry).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].session_id, "s1");

        // Already marked; not reported again.
        let second = manager.collect_overdue(&registry).await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_collect_overdue_ignores_fresh_runs() {
        let (manager, _) = manager();
        let registry =
            LanguageRegistry::builtin_with_overrides(&std::collections::HashMap::new()).unwrap();
        {
            let entry = manager.get_or_create("s1", "python").await.unwrap();
            let mut session = entry.lock().await;
            session.runtime_handle = Some(RuntimeHandle {
                container_id: "ctr-1".to_string(),
            });
            session.mark_running(Some(1)).unwrap();
        }

        assert!(manager.collect_overdue(&registry).await.is_empty());
    }
}
