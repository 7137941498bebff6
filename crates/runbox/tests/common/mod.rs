//! Test utilities and common setup.

use async_trait::async_trait;
use axum::Router;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{DuplexStream, duplex};
use tokio::sync::oneshot;

use runbox::api::{self, AppState};
use runbox::container::ContainerError;
use runbox::exec::ExecutionController;
use runbox::languages::{LanguageConfig, LanguageRegistry};
use runbox::relay::RelayHub;
use runbox::sandbox::{
    CompileOutcome, Provisioner, RunningProcess, RuntimeHandle, SandboxError,
};
use runbox::session::SessionManager;

/// Test-side ends of a mock run's stdio.
///
/// Drop this before expecting the run's terminal event; the pump drains
/// output until EOF.
pub struct RunHandles {
    /// Reads what the program received on stdin.
    pub stdin: DuplexStream,
    /// Writes the program's stdout.
    pub stdout: DuplexStream,
    /// Writes the program's stderr.
    pub stderr: DuplexStream,
}

/// Provisioner double backed by in-memory pipes.
#[derive(Default)]
pub struct MockProvisioner {
    pub calls: Mutex<Vec<String>>,
    pub provisions: AtomicUsize,
    pub kills: AtomicUsize,
    pub destroys: AtomicUsize,
    /// When set, `provision` fails with a retryable error.
    pub fail_provision: AtomicBool,
    /// When set, `run` fails with a runtime fault.
    pub fail_run: AtomicBool,
    /// When set, `compile_if_needed` reports this diagnostic and exit code.
    pub compile_failure: Mutex<Option<(String, i32)>>,
    /// When set, `compile_if_needed` stalls this long before returning.
    pub compile_delay: Mutex<Option<std::time::Duration>>,
    run: Mutex<Option<RunHandles>>,
    exit_tx: Mutex<Option<oneshot::Sender<i32>>>,
}

impl MockProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn log(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Take the test-side stdio of the most recently started run.
    pub fn take_run(&self) -> RunHandles {
        self.run
            .lock()
            .unwrap()
            .take()
            .expect("no run was started")
    }

    /// Resolve the current run's waiter with an exit code.
    pub fn send_exit(&self, code: i32) {
        if let Some(tx) = self.exit_tx.lock().unwrap().take() {
            let _ = tx.send(code);
        }
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn provision(
        &self,
        session_id: &str,
        config: &LanguageConfig,
    ) -> Result<RuntimeHandle, SandboxError> {
        if self.fail_provision.load(Ordering::SeqCst) {
            self.log(format!("provision-failed:{}", session_id));
            return Err(SandboxError::Provision(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: "mock provisioning failure".to_string(),
            }));
        }
        let n = self.provisions.fetch_add(1, Ordering::SeqCst);
        self.log(format!("provision:{}:{}", session_id, config.id));
        Ok(RuntimeHandle {
            container_id: format!("mock-{}-{}", session_id, n),
        })
    }

    async fn write_source(
        &self,
        handle: &RuntimeHandle,
        _code: &str,
        extension: &str,
    ) -> Result<(), SandboxError> {
        self.log(format!("write:{}:main.{}", handle.container_id, extension));
        Ok(())
    }

    async fn compile_if_needed(
        &self,
        handle: &RuntimeHandle,
        config: &LanguageConfig,
    ) -> Result<CompileOutcome, SandboxError> {
        self.log(format!("compile:{}", handle.container_id));
        let delay = *self.compile_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((output, exit_code)) = self.compile_failure.lock().unwrap().clone() {
            return Ok(CompileOutcome::Failure { output, exit_code });
        }
        if config.compile_command.is_some() {
            Ok(CompileOutcome::Success {
                output: String::new(),
            })
        } else {
            Ok(CompileOutcome::Skipped)
        }
    }

    async fn run(
        &self,
        handle: &RuntimeHandle,
        config: &LanguageConfig,
    ) -> Result<RunningProcess, SandboxError> {
        if self.fail_run.load(Ordering::SeqCst) {
            self.log(format!("run-failed:{}", handle.container_id));
            return Err(SandboxError::Runtime(ContainerError::CommandFailed {
                command: "exec".to_string(),
                message: "mock runtime fault".to_string(),
            }));
        }
        self.log(format!("run:{}:{}", handle.container_id, config.id));

        let (stdin_proc, stdin_test) = duplex(64 * 1024);
        let (stdout_proc, stdout_test) = duplex(64 * 1024);
        let (stderr_proc, stderr_test) = duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();

        *self.run.lock().unwrap() = Some(RunHandles {
            stdin: stdin_test,
            stdout: stdout_test,
            stderr: stderr_test,
        });
        *self.exit_tx.lock().unwrap() = Some(exit_tx);

        Ok(RunningProcess {
            pid: Some(4242),
            stdin: Box::new(stdin_proc),
            stdout: Box::new(stdout_proc),
            stderr: Box::new(stderr_proc),
            waiter: Box::pin(async move { exit_rx.await.unwrap_or(-1) }),
        })
    }

    async fn kill(&self, handle: &RuntimeHandle) -> Result<(), SandboxError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.log(format!("kill:{}", handle.container_id));
        self.send_exit(137);
        Ok(())
    }

    async fn destroy(&self, handle: &RuntimeHandle) -> Result<(), SandboxError> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.log(format!("destroy:{}", handle.container_id));
        Ok(())
    }
}

/// Registry with the builtin languages.
pub fn test_registry() -> Arc<LanguageRegistry> {
    Arc::new(LanguageRegistry::builtin_with_overrides(&HashMap::new()).unwrap())
}

/// Full application state wired to a mock provisioner.
pub fn test_state() -> (AppState, Arc<MockProvisioner>) {
    test_state_with_registry(test_registry())
}

pub fn test_state_with_registry(
    registry: Arc<LanguageRegistry>,
) -> (AppState, Arc<MockProvisioner>) {
    let provisioner = MockProvisioner::new();
    let sessions = Arc::new(SessionManager::new(provisioner.clone()));
    let relay = Arc::new(RelayHub::new());
    let controller = Arc::new(ExecutionController::new(
        registry.clone(),
        sessions.clone(),
        provisioner.clone(),
        relay.clone(),
    ));

    (
        AppState {
            registry,
            sessions,
            controller,
            relay,
        },
        provisioner,
    )
}

/// Router over a mock-backed application.
#[allow(dead_code)]
pub fn test_app() -> (Router, Arc<MockProvisioner>) {
    let (state, provisioner) = test_state();
    (api::create_router(state, &[]), provisioner)
}
