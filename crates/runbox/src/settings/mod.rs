//! Server configuration: defaults, TOML file, environment overrides.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use log::info;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::container::{ResourceLimits, RuntimeType};
use crate::languages::LanguageOverride;

/// Environment variable prefix; `RUNBOX_SERVER__PORT=9000` overrides
/// `server.port`.
const ENV_PREFIX: &str = "RUNBOX";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub container: ContainerSettings,
    pub sessions: SessionSettings,
    /// Per-language overrides layered on the builtin registry.
    pub languages: HashMap<String, LanguageOverride>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins; empty means any.
    pub cors_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Container runtime type: "docker" or "podman" (auto-detected if not set)
    pub runtime: Option<RuntimeType>,
    /// Resource limits applied to every sandbox.
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Seconds of inactivity before a session is reaped.
    pub idle_timeout_secs: u64,
    /// Seconds between reaper sweeps.
    pub sweep_interval_secs: u64,
    /// Wall-clock bound for the compile step, in seconds.
    pub compile_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 600,
            sweep_interval_secs: 2,
            compile_timeout_secs: 30,
        }
    }
}

impl SessionSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }
}

impl Settings {
    /// Load settings: defaults, then the TOML file (optional), then
    /// `RUNBOX_`-prefixed environment variables.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_file {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        let built = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .context("building configuration")?;

        built
            .try_deserialize()
            .context("deserializing configuration")
    }
}
