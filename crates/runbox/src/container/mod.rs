//! Container runtime management module.
//!
//! Provides an async interface to the Docker or Podman CLI for creating and
//! tearing down the isolated containers that back execution sessions. The
//! runtime is auto-detected or can be configured explicitly.

mod error;

pub use error::{ContainerError, ContainerResult};

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime (default for macOS/Windows dev)
    Docker,
    /// Podman runtime (default for Linux prod)
    #[default]
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

/// Resource limits applied to every sandbox container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory limit, in the CLI's `--memory` syntax (e.g. "256m").
    pub memory: String,
    /// CPU share limit (`--cpus`).
    pub cpus: f64,
    /// Maximum number of processes (`--pids-limit`).
    pub pids: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: "256m".to_string(),
            cpus: 1.0,
            pids: 128,
        }
    }
}

/// Specification for a sandbox container.
///
/// Sandboxes never get port mappings, volume mounts, or host networking:
/// the submitted source is piped in over `exec`, and the container runs with
/// networking disabled.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Container name.
    pub name: String,
    /// OCI image to use.
    pub image: String,
    /// Working directory inside the container.
    pub workdir: String,
    /// Resource limits.
    pub limits: ResourceLimits,
    /// Init command keeping the container alive between runs.
    pub command: Vec<String>,
}

impl SandboxSpec {
    /// Validate all fields before they are interpolated into CLI argv.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;
        validate_container_id_or_name(&self.name)?;
        validate_container_path(&self.workdir)?;
        if self.command.is_empty() {
            return Err(ContainerError::InvalidInput(
                "sandbox init command cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Captured result of an in-container command run to completion.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Process exit code (-1 when unavailable).
    pub exit_code: i32,
    /// Combined stdout and stderr.
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Validate a container ID or name.
///
/// Container IDs are hex strings (12 or 64 chars for docker/podman).
/// Container names follow the same rules as container creation.
fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Validate an image name before passing it to the CLI.
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters; only alphanumeric, '.', '-', '_', '/', ':', '@' are allowed",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate an absolute path used inside a container.
fn validate_container_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(format!(
            "container path '{}' must be absolute",
            path
        )));
    }
    if path.contains("..") {
        return Err(ContainerError::InvalidInput(
            "container path cannot contain '..'".to_string(),
        ));
    }
    Ok(())
}

/// Container runtime client for managing sandbox containers.
///
/// Supports both Docker and Podman with automatic detection.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    /// The runtime type (docker or podman)
    runtime_type: RuntimeType,
    /// Path to the container binary
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Tries Docker first (for macOS dev), then falls back to Podman.
    pub fn new() -> Self {
        #[cfg(target_os = "macos")]
        {
            if Self::is_binary_available("docker") {
                return Self {
                    runtime_type: RuntimeType::Docker,
                    binary: "docker".to_string(),
                };
            }
        }

        if Self::is_binary_available("podman") {
            Self {
                runtime_type: RuntimeType::Podman,
                binary: "podman".to_string(),
            }
        } else if Self::is_binary_available("docker") {
            Self {
                runtime_type: RuntimeType::Docker,
                binary: "docker".to_string(),
            }
        } else {
            // Fall back to podman, will fail at runtime
            Self {
                runtime_type: RuntimeType::Podman,
                binary: "podman".to_string(),
            }
        }
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Test seam: point the client at an arbitrary binary.
    #[cfg(test)]
    fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let output = Command::new(&self.binary)
            .args(["version", "--format", "json"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "version".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: "version".to_string(),
                message: stderr.to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Build the argv for `run -d` from a sandbox spec.
    fn run_args(&self, spec: &SandboxSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--network".to_string(),
            "none".to_string(),
            "--memory".to_string(),
            spec.limits.memory.clone(),
            "--cpus".to_string(),
            spec.limits.cpus.to_string(),
            "--pids-limit".to_string(),
            spec.limits.pids.to_string(),
            "-w".to_string(),
            spec.workdir.clone(),
        ];

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    /// Create and start a new sandbox container, returning its ID.
    pub async fn create_sandbox(&self, spec: &SandboxSpec) -> ContainerResult<String> {
        spec.validate()?;

        let args = self.run_args(spec);
        let output = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "run".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: stderr.to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Execute a command in a container and capture its combined output.
    ///
    /// An optional deadline bounds the whole command; on expiry the exec
    /// client is killed and a timeout result is returned.
    pub async fn exec_capture(
        &self,
        container_id: &str,
        workdir: &str,
        command: &[String],
        deadline: Option<Duration>,
    ) -> ContainerResult<ExecOutput> {
        validate_container_id_or_name(container_id)?;
        validate_container_path(workdir)?;

        let mut args: Vec<String> = vec![
            "exec".to_string(),
            "-w".to_string(),
            workdir.to_string(),
            container_id.to_string(),
        ];
        args.extend(command.iter().cloned());

        // kill_on_drop so a blown deadline below also takes down the exec
        // client instead of leaving it (and the in-container command) running.
        let fut = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match deadline {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => {
                    return Ok(ExecOutput {
                        exit_code: -1,
                        output: format!("command timed out after {}s", limit.as_secs()),
                    });
                }
            },
            None => fut.await,
        }
        .map_err(|e| ContainerError::CommandFailed {
            command: "exec".to_string(),
            message: e.to_string(),
        })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }

    /// Spawn a command in a container with all three stdio streams piped.
    ///
    /// Returns immediately with the child handle; the caller owns the pipes
    /// and is responsible for pumping and waiting.
    pub fn exec_piped(
        &self,
        container_id: &str,
        workdir: &str,
        command: &[String],
    ) -> ContainerResult<Child> {
        validate_container_id_or_name(container_id)?;
        validate_container_path(workdir)?;

        let mut args: Vec<String> = vec![
            "exec".to_string(),
            "-i".to_string(),
            "-w".to_string(),
            workdir.to_string(),
            container_id.to_string(),
        ];
        args.extend(command.iter().cloned());

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ContainerError::CommandFailed {
                command: "exec".to_string(),
                message: e.to_string(),
            })?;

        Ok(child)
    }

    /// Run a shell command in a container, feeding `input` to its stdin.
    ///
    /// Used to materialize source files without any volume mounts.
    pub async fn exec_with_stdin(
        &self,
        container_id: &str,
        shell_command: &str,
        input: &[u8],
    ) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut child = Command::new(&self.binary)
            .args(["exec", "-i", container_id, "sh", "-c", shell_command])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ContainerError::CommandFailed {
                command: "exec".to_string(),
                message: e.to_string(),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "exec".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: "exec".to_string(),
                message: stderr.to_string(),
            });
        }

        Ok(())
    }

    /// Remove a container, forcing termination of anything still running.
    ///
    /// A missing container is not an error; removal is idempotent.
    pub async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(container_id);

        let output = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "rm".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("no such container") {
                return Ok(());
            }
            return Err(ContainerError::CommandFailed {
                command: "rm".to_string(),
                message: stderr.to_string(),
            });
        }

        Ok(())
    }

    /// Check if an image exists locally.
    ///
    /// Uses `image inspect` (works for both Docker and Podman) instead of
    /// `podman image exists` which is Podman-specific.
    pub async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;

        let output = Command::new(&self.binary)
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "image inspect".to_string(),
                message: e.to_string(),
            })?;

        Ok(output.status.success())
    }

    /// Pull an image.
    pub async fn pull_image(&self, image: &str) -> ContainerResult<()> {
        validate_image_name(image)?;

        let output = Command::new(&self.binary)
            .args(["pull", image])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: "pull".to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::ImageUnavailable(format!(
                "{}: {}",
                image,
                stderr.trim()
            )));
        }

        Ok(())
    }
}
