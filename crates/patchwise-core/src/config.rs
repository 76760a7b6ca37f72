//! Configuration loading.
//!
//! Sources, lowest to highest precedence: built-in defaults, a TOML file
//! (`--config`, or `./patchwise.toml` when present), environment variables,
//! then whatever the CLI applies on top.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::domain::check::CheckSpec;
use crate::domain::error::{PatchwiseError, Result};
use crate::domain::policy::{EquivalenceRule, FindingOrder};

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "patchwise.toml";

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// How check environments are provided.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Host toolchain, scratch directory per invocation.
    #[default]
    Local,
    /// One container per invocation from a content-addressed image.
    Docker,
}

fn default_max_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Scheduling and aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunSettings {
    pub max_concurrency: usize,
    /// Overrides every check's own timeout when set.
    pub timeout_secs: Option<u64>,
    pub equivalence: EquivalenceRule,
    pub order: FindingOrder,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            timeout_secs: None,
            equivalence: EquivalenceRule::default(),
            order: FindingOrder::default(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_CACHE_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir).join("patchwise");
        }
    }
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => PathBuf::from(home).join(".cache").join("patchwise"),
        _ => std::env::temp_dir().join("patchwise"),
    }
}

/// Where and how environments are built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    /// Root for the environment index and per-invocation scratch space.
    pub cache_dir: PathBuf,
    /// Directory holding `base.Dockerfile` and `<environment>.Dockerfile`.
    pub dockerfiles_dir: Option<PathBuf>,
    pub docker_bin: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            cache_dir: default_cache_dir(),
            dockerfiles_dir: None,
            docker_bin: "docker".to_string(),
        }
    }
}

/// Language-model backend settings.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendSettings {
    pub api_base: String,
    pub model: String,
    /// Never written back out.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub max_retries: u32,
    pub request_timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            max_retries: 3,
            request_timeout_secs: 300,
        }
    }
}

impl std::fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSettings")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("max_retries", &self.max_retries)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PatchwiseConfig {
    pub run: RunSettings,
    pub provider: ProviderSettings,
    pub backend: BackendSettings,
    /// Additional checks, or replacements for built-ins with the same id.
    pub checks: Vec<CheckSpec>,
}

impl PatchwiseConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| PatchwiseError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PatchwiseError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Load from `path`, or from `./patchwise.toml` when it exists, or fall
    /// back to defaults. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let local = Path::new(DEFAULT_CONFIG_FILE);
                if local.is_file() {
                    Self::from_file(local)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `PATCHWISE_*` and `OPENAI_API_KEY` overrides using `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = get("PATCHWISE_CACHE_DIR") {
            self.provider.cache_dir = PathBuf::from(dir);
        }
        if let Some(n) = get("PATCHWISE_MAX_CONCURRENCY") {
            self.run.max_concurrency = n.trim().parse().map_err(|_| {
                PatchwiseError::Config(format!("PATCHWISE_MAX_CONCURRENCY is not a number: {n}"))
            })?;
        }
        if let Some(kind) = get("PATCHWISE_PROVIDER") {
            self.provider.kind = ProviderKind::from_str(kind.trim(), true).map_err(|_| {
                PatchwiseError::Config(format!(
                    "unknown provider '{kind}' (expected local or docker)"
                ))
            })?;
        }
        if let Some(key) = get(API_KEY_ENV) {
            self.backend.api_key = Some(key);
        }
        if let Some(base) = get("PATCHWISE_API_BASE") {
            self.backend.api_base = base;
        }
        if let Some(model) = get("PATCHWISE_MODEL") {
            self.backend.model = model;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.run.max_concurrency == 0 {
            return Err(PatchwiseError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        for check in &self.checks {
            check.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::check::{CheckPolicy, ReviewKind};
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = PatchwiseConfig::default();
        assert!(config.run.max_concurrency >= 1);
        assert_eq!(config.provider.kind, ProviderKind::Local);
        assert_eq!(config.backend.api_base, DEFAULT_API_BASE);
        assert!(config.checks.is_empty());
    }

    #[test]
    fn test_parse_file_with_checks() {
        let config = PatchwiseConfig::from_toml_str(
            r#"
            [run]
            max_concurrency = 2
            equivalence = "same_line"
            order = "location"

            [provider]
            kind = "docker"
            cache_dir = "/var/cache/patchwise"

            [backend]
            model = "local-llm"

            [[checks]]
            id = "code-review"
            environment_id = "base"
            policy = "mandatory"
            execution = { type = "review", kind = "code_review" }
            output = { kind = "free_text_review" }
            "#,
        )
        .unwrap();

        assert_eq!(config.run.max_concurrency, 2);
        assert_eq!(config.run.equivalence, EquivalenceRule::SameLine);
        assert_eq!(config.run.order, FindingOrder::Location);
        assert_eq!(config.provider.kind, ProviderKind::Docker);
        assert_eq!(config.backend.model, "local-llm");
        assert_eq!(config.backend.api_base, DEFAULT_API_BASE);
        assert_eq!(config.checks.len(), 1);
        assert_eq!(config.checks[0].policy, CheckPolicy::Mandatory);
        assert!(matches!(
            config.checks[0].execution,
            crate::domain::check::Execution::Review {
                kind: ReviewKind::CodeReview
            }
        ));
    }

    #[test]
    fn test_invalid_check_in_file_rejected() {
        let err = PatchwiseConfig::from_toml_str(
            r#"
            [[checks]]
            id = "bad"
            environment_id = "base"
            execution = { type = "command", argv = ["make", "{nope}"] }
            output = { kind = "structured_diagnostics", format = "gcc" }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("{nope}"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PATCHWISE_CACHE_DIR", "/tmp/pw"),
            ("PATCHWISE_MAX_CONCURRENCY", "3"),
            ("OPENAI_API_KEY", "sk-test"),
            ("PATCHWISE_MODEL", ""),
        ]
        .into_iter()
        .collect();

        let mut config = PatchwiseConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.provider.cache_dir, PathBuf::from("/tmp/pw"));
        assert_eq!(config.run.max_concurrency, 3);
        assert_eq!(config.backend.api_key.as_deref(), Some("sk-test"));
        // Empty values are ignored.
        assert_eq!(config.backend.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = PatchwiseConfig::default();
        let result = config.apply_overrides(|k| {
            (k == "PATCHWISE_MAX_CONCURRENCY").then(|| "0".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_api_key_redacted_and_not_serialized() {
        let mut config = PatchwiseConfig::default();
        config.backend.api_key = Some("sk-secret".to_string());
        assert!(!format!("{:?}", config).contains("sk-secret"));
        let text = toml::to_string(&config).unwrap();
        assert!(!text.contains("sk-secret"));
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(PatchwiseConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_provider_kind_from_env() {
        let mut config = PatchwiseConfig::default();
        config
            .apply_overrides(|key| (key == "PATCHWISE_PROVIDER").then(|| "Docker".to_string()))
            .unwrap();
        assert_eq!(config.provider.kind, ProviderKind::Docker);

        let err = PatchwiseConfig::default()
            .apply_overrides(|key| (key == "PATCHWISE_PROVIDER").then(|| "podman".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("podman"));
    }
}
