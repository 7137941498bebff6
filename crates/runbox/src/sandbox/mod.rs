//! Isolated runtime provisioner.
//!
//! One sandbox container per session: provisioned lazily on first execute,
//! reused across runs of the same language, and destroyed on session end.
//! Killing the active process (`kill`) is separate from tearing down the
//! container (`destroy`) so repeated edit/run cycles skip re-provisioning.

use async_trait::async_trait;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::container::{ContainerError, ContainerRuntime, ResourceLimits, SandboxSpec};
use crate::languages::LanguageConfig;

/// Working directory inside every sandbox container.
const SANDBOX_WORKDIR: &str = "/sandbox";

/// Pidfile recording the in-container pid of the active run.
const RUN_PIDFILE: &str = "/sandbox/.run.pid";

/// Upper bound for the in-container kill command itself.
const KILL_DEADLINE: Duration = Duration::from_secs(5);

/// Errors from provisioning or driving a sandbox runtime.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Infrastructure failed to create or start the isolated runtime.
    /// Retryable; the session is left idle with no handle.
    #[error("failed to provision sandbox: {0}")]
    Provision(#[source] ContainerError),

    /// The runtime became unreachable or misbehaved mid-session.
    #[error("sandbox runtime fault: {0}")]
    Runtime(#[source] ContainerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque reference to one provisioned sandbox runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    /// Container ID as reported by the runtime.
    pub container_id: String,
}

impl std::fmt::Display for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form for logs.
        write!(f, "{}", &self.container_id[..self.container_id.len().min(12)])
    }
}

/// Result of the compile step.
#[derive(Debug, Clone)]
pub enum CompileOutcome {
    /// Language has no compile step.
    Skipped,
    /// Compile succeeded; diagnostics (warnings) captured.
    Success { output: String },
    /// Compiler exited non-zero. Program data, not an infrastructure error:
    /// the controller relays the diagnostics as ordinary output.
    Failure { output: String, exit_code: i32 },
}

/// A started run: live stdio streams plus an exit waiter.
///
/// The streams are boxed so tests can substitute in-memory pipes for the
/// exec client's pipes.
pub struct RunningProcess {
    /// Host-side pid of the exec client, when available.
    pub pid: Option<u32>,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    /// Resolves with the process exit code (-1 when killed or unknown).
    pub waiter: BoxFuture<'static, i32>,
}

/// Seam between the execution controller and the container runtime.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Allocate a fresh isolated runtime for a session.
    ///
    /// The "reuse the existing handle" half of ensure lives with the session
    /// state under its lock; this method always allocates.
    async fn provision(
        &self,
        session_id: &str,
        config: &LanguageConfig,
    ) -> Result<RuntimeHandle, SandboxError>;

    /// Materialize submitted code as `main.<extension>` inside the runtime,
    /// overwriting any prior submission.
    async fn write_source(
        &self,
        handle: &RuntimeHandle,
        code: &str,
        extension: &str,
    ) -> Result<(), SandboxError>;

    /// Run the compile step to completion, if the language has one.
    async fn compile_if_needed(
        &self,
        handle: &RuntimeHandle,
        config: &LanguageConfig,
    ) -> Result<CompileOutcome, SandboxError>;

    /// Start the run step and return immediately with its live streams.
    async fn run(
        &self,
        handle: &RuntimeHandle,
        config: &LanguageConfig,
    ) -> Result<RunningProcess, SandboxError>;

    /// Forcibly terminate the active process, keeping the runtime for reuse.
    /// Idempotent.
    async fn kill(&self, handle: &RuntimeHandle) -> Result<(), SandboxError>;

    /// Tear down the runtime and reclaim all its resources. Idempotent, and
    /// safe while a process is running (implies kill).
    async fn destroy(&self, handle: &RuntimeHandle) -> Result<(), SandboxError>;
}

/// Provisioner configuration.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Resource limits applied to every sandbox.
    pub limits: ResourceLimits,
    /// Wall-clock bound for the compile step.
    pub compile_timeout: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            compile_timeout: Duration::from_secs(30),
        }
    }
}

/// Production provisioner backed by the docker/podman CLI.
pub struct ContainerProvisioner {
    runtime: Arc<ContainerRuntime>,
    config: ProvisionerConfig,
}

impl ContainerProvisioner {
    pub fn new(runtime: Arc<ContainerRuntime>, config: ProvisionerConfig) -> Self {
        Self { runtime, config }
    }

    /// Build a unique, CLI-safe container name for a session.
    fn container_name(session_id: &str) -> String {
        let safe: String = session_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .take(24)
            .collect();
        let suffix = Uuid::new_v4().simple().to_string();
        format!("runbox-{}-{}", safe, &suffix[..8])
    }
}

#[async_trait]
impl Provisioner for ContainerProvisioner {
    async fn provision(
        &self,
        session_id: &str,
        config: &LanguageConfig,
    ) -> Result<RuntimeHandle, SandboxError> {
        let image = &config.runtime_image;
        if !self
            .runtime
            .image_exists(image)
            .await
            .map_err(SandboxError::Provision)?
        {
            info!("Pulling image {} for language {}", image, config.id);
            self.runtime
                .pull_image(image)
                .await
                .map_err(SandboxError::Provision)?;
        }

        let spec = SandboxSpec {
            name: Self::container_name(session_id),
            image: image.clone(),
            workdir: SANDBOX_WORKDIR.to_string(),
            limits: self.config.limits.clone(),
            command: vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()],
        };

        let container_id = self
            .runtime
            .create_sandbox(&spec)
            .await
            .map_err(SandboxError::Provision)?;

        info!(
            "Provisioned sandbox {} ({}) for session {}",
            spec.name,
            &container_id[..container_id.len().min(12)],
            session_id
        );

        Ok(RuntimeHandle { container_id })
    }

    async fn write_source(
        &self,
        handle: &RuntimeHandle,
        code: &str,
        extension: &str,
    ) -> Result<(), SandboxError> {
        // Extension is validated at registry construction; the path stays
        // within the fixed sandbox workdir.
        let shell_command = format!("cat > {}/main.{}", SANDBOX_WORKDIR, extension);
        self.runtime
            .exec_with_stdin(&handle.container_id, &shell_command, code.as_bytes())
            .await
            .map_err(SandboxError::Runtime)
    }

    async fn compile_if_needed(
        &self,
        handle: &RuntimeHandle,
        config: &LanguageConfig,
    ) -> Result<CompileOutcome, SandboxError> {
        let Some(compile_command) = &config.compile_command else {
            return Ok(CompileOutcome::Skipped);
        };

        let result = self
            .runtime
            .exec_capture(
                &handle.container_id,
                SANDBOX_WORKDIR,
                compile_command,
                Some(self.config.compile_timeout),
            )
            .await
            .map_err(SandboxError::Runtime)?;

        if result.success() {
            Ok(CompileOutcome::Success {
                output: result.output,
            })
        } else {
            debug!(
                "Compile step for {} failed with code {}",
                handle, result.exit_code
            );
            Ok(CompileOutcome::Failure {
                output: result.output,
                exit_code: result.exit_code,
            })
        }
    }

    async fn run(
        &self,
        handle: &RuntimeHandle,
        config: &LanguageConfig,
    ) -> Result<RunningProcess, SandboxError> {
        // Record the in-container pid so kill() can target the run without
        // touching the container's init process.
        let mut command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo $$ > {}; exec \"$@\"", RUN_PIDFILE),
            "runbox".to_string(),
        ];
        command.extend(config.run_command.iter().cloned());

        let mut child = self
            .runtime
            .exec_piped(&handle.container_id, SANDBOX_WORKDIR, &command)
            .map_err(SandboxError::Runtime)?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Io(std::io::Error::other("missing stdin pipe")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Io(std::io::Error::other("missing stdout pipe")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Io(std::io::Error::other("missing stderr pipe")))?;

        let waiter: BoxFuture<'static, i32> = Box::pin(async move {
            match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!("Failed to wait for exec client: {}", e);
                    -1
                }
            }
        });

        Ok(RunningProcess {
            pid,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            waiter,
        })
    }

    async fn kill(&self, handle: &RuntimeHandle) -> Result<(), SandboxError> {
        let script = format!(
            "test -f {pidfile} && kill -9 \"$(cat {pidfile})\" 2>/dev/null; rm -f {pidfile}; :",
            pidfile = RUN_PIDFILE
        );
        let command = vec!["sh".to_string(), "-c".to_string(), script];

        match self
            .runtime
            .exec_capture(
                &handle.container_id,
                SANDBOX_WORKDIR,
                &command,
                Some(KILL_DEADLINE),
            )
            .await
        {
            Ok(_) => Ok(()),
            // The container may already be gone; kill stays idempotent.
            Err(e) => {
                debug!("Kill on {} skipped: {}", handle, e);
                Ok(())
            }
        }
    }

    async fn destroy(&self, handle: &RuntimeHandle) -> Result<(), SandboxError> {
        self.runtime
            .remove_container(&handle.container_id, true)
            .await
            .map_err(SandboxError::Runtime)?;
        info!("Destroyed sandbox {}", handle);
        Ok(())
    }
}
