//! Language registry: static table of execution recipes.
//!
//! Maps a language identifier to the container image, compile/run commands,
//! source extension, and execution timeout used for that language. Read-only
//! after construction; shared freely across the controller, provisioner, and
//! reaper without locking.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::container::validate_image_name;

/// Default per-run execution timeout in seconds.
const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 10;

/// Execution recipe for one language.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    /// Language identifier (e.g. "python").
    pub id: String,
    /// Container image providing the toolchain.
    pub runtime_image: String,
    /// Compile step argv; `None` for interpreted languages.
    pub compile_command: Option<Vec<String>>,
    /// Run step argv. Never empty.
    pub run_command: Vec<String>,
    /// Source file extension (without the dot).
    pub source_extension: String,
    /// Hard wall-clock limit for one run of this language.
    #[serde(with = "timeout_secs")]
    pub execution_timeout: Duration,
}

mod timeout_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Partial language entry from the settings file, layered over a builtin.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LanguageOverride {
    pub runtime_image: Option<String>,
    pub compile_command: Option<Vec<String>>,
    pub run_command: Option<Vec<String>>,
    pub source_extension: Option<String>,
    pub execution_timeout_secs: Option<u64>,
}

/// Registry of supported languages.
pub struct LanguageRegistry {
    languages: HashMap<String, LanguageConfig>,
}

impl LanguageRegistry {
    /// Build a registry from explicit configs, rejecting malformed entries.
    pub fn new(configs: Vec<LanguageConfig>) -> anyhow::Result<Self> {
        let mut languages = HashMap::new();
        for config in configs {
            validate_config(&config)?;
            if languages.insert(config.id.clone(), config).is_some() {
                anyhow::bail!("duplicate language id in registry");
            }
        }
        Ok(Self { languages })
    }

    /// Build the builtin registry, applying any overrides from settings.
    pub fn builtin_with_overrides(
        overrides: &HashMap<String, LanguageOverride>,
    ) -> anyhow::Result<Self> {
        let mut configs = builtin_languages();
        for config in &mut configs {
            if let Some(patch) = overrides.get(&config.id) {
                apply_override(config, patch);
            }
        }
        Self::new(configs)
    }

    /// Look up the execution recipe for a language id.
    pub fn resolve(&self, language_id: &str) -> Option<&LanguageConfig> {
        self.languages.get(language_id)
    }

    /// All registered language ids, for diagnostics.
    pub fn language_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.languages.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}

fn validate_config(config: &LanguageConfig) -> anyhow::Result<()> {
    if config.id.is_empty() || !config.id.chars().all(|c| c.is_ascii_alphanumeric()) {
        anyhow::bail!("invalid language id: {:?}", config.id);
    }
    if config.run_command.is_empty() {
        anyhow::bail!("language {} has an empty run command", config.id);
    }
    if let Some(compile) = &config.compile_command
        && compile.is_empty()
    {
        anyhow::bail!("language {} has an empty compile command", config.id);
    }
    if config.source_extension.is_empty()
        || !config
            .source_extension
            .chars()
            .all(|c| c.is_ascii_alphanumeric())
    {
        anyhow::bail!(
            "language {} has an invalid source extension: {:?}",
            config.id,
            config.source_extension
        );
    }
    validate_image_name(&config.runtime_image)
        .map_err(|e| anyhow::anyhow!("language {}: {}", config.id, e))?;
    Ok(())
}

fn apply_override(config: &mut LanguageConfig, patch: &LanguageOverride) {
    if let Some(image) = &patch.runtime_image {
        config.runtime_image = image.clone();
    }
    if let Some(compile) = &patch.compile_command {
        config.compile_command = Some(compile.clone());
    }
    if let Some(run) = &patch.run_command {
        config.run_command = run.clone();
    }
    if let Some(ext) = &patch.source_extension {
        config.source_extension = ext.clone();
    }
    if let Some(secs) = patch.execution_timeout_secs {
        config.execution_timeout = Duration::from_secs(secs);
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Builtin execution recipes.
///
/// Source files are written as `main.<ext>`; compiled binaries as `main`.
fn builtin_languages() -> Vec<LanguageConfig> {
    let timeout = Duration::from_secs(DEFAULT_EXECUTION_TIMEOUT_SECS);
    vec![
        LanguageConfig {
            id: "python".to_string(),
            runtime_image: "python:3.11-alpine".to_string(),
            compile_command: None,
            run_command: args(&["python3", "-u", "main.py"]),
            source_extension: "py".to_string(),
            execution_timeout: timeout,
        },
        LanguageConfig {
            id: "javascript".to_string(),
            runtime_image: "node:20-alpine".to_string(),
            compile_command: None,
            run_command: args(&["node", "main.js"]),
            source_extension: "js".to_string(),
            execution_timeout: timeout,
        },
        LanguageConfig {
            id: "c".to_string(),
            runtime_image: "gcc:13".to_string(),
            compile_command: Some(args(&["gcc", "main.c", "-O2", "-o", "main"])),
            run_command: args(&["./main"]),
            source_extension: "c".to_string(),
            execution_timeout: timeout,
        },
        LanguageConfig {
            id: "cpp".to_string(),
            runtime_image: "gcc:13".to_string(),
            compile_command: Some(args(&["g++", "main.cpp", "-O2", "-o", "main"])),
            run_command: args(&["./main"]),
            source_extension: "cpp".to_string(),
            execution_timeout: timeout,
        },
        LanguageConfig {
            id: "go".to_string(),
            runtime_image: "golang:1.22-alpine".to_string(),
            compile_command: Some(args(&["go", "build", "-o", "main", "main.go"])),
            run_command: args(&["./main"]),
            source_extension: "go".to_string(),
            execution_timeout: timeout,
        },
        LanguageConfig {
            id: "rust".to_string(),
            runtime_image: "rust:1.79-slim".to_string(),
            compile_command: Some(args(&["rustc", "main.rs", "-O", "-o", "main"])),
            run_command: args(&["./main"]),
            source_extension: "rs".to_string(),
            execution_timeout: timeout,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> LanguageRegistry {
        LanguageRegistry::builtin_with_overrides(&HashMap::new()).unwrap()
    }

    #[test]
    fn test_resolve_known_language() {
        let registry = registry();
        let python = registry.resolve("python").unwrap();
        assert_eq!(python.runtime_image, "python:3.11-alpine");
        assert!(python.compile_command.is_none());
        assert_eq!(python.source_extension, "py");
    }

    #[test]
    fn test_resolve_unknown_language() {
        assert!(registry().resolve("cobol").is_none());
    }

    #[test]
    fn test_builtins_satisfy_invariants() {
        let registry = registry();
        for id in registry.language_ids() {
            let config = registry.resolve(id).unwrap();
            assert!(!config.run_command.is_empty(), "{} run command empty", id);
            assert!(config.execution_timeout > Duration::ZERO);
        }
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let config = registry().resolve("python").unwrap().clone();
        let result = LanguageRegistry::new(vec![config.clone(), config]);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_run_command_rejected() {
        let mut config = registry().resolve("python").unwrap().clone();
        config.run_command.clear();
        assert!(LanguageRegistry::new(vec![config]).is_err());
    }

    #[test]
    fn test_override_applies_to_builtin() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "python".to_string(),
            LanguageOverride {
                runtime_image: Some("python:3.12-alpine".to_string()),
                execution_timeout_secs: Some(30),
                ..Default::default()
            },
        );

        let registry = LanguageRegistry::builtin_with_overrides(&overrides).unwrap();
        let python = registry.resolve("python").unwrap();
        assert_eq!(python.runtime_image, "python:3.12-alpine");
        assert_eq!(python.execution_timeout, Duration::from_secs(30));
        // Untouched fields keep their builtin values.
        assert_eq!(python.source_extension, "py");
    }

    #[test]
    fn test_bad_override_rejected() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "c".to_string(),
            LanguageOverride {
                runtime_image: Some("gcc:13; rm -rf /".to_string()),
                ..Default::default()
            },
        );
        assert!(LanguageRegistry::builtin_with_overrides(&overrides).is_err());
    }
}
