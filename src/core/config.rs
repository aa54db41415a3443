//! Store-level configuration (`<store>/config.toml`).

use crate::core::error::GuardError;
use crate::core::finding::Severity;
use crate::core::lookup::RetryPolicy;
use crate::core::store::Store;
use crate::plugins::guardian::Environment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Reports at or above this severity need an approval decision.
    pub approval_threshold: Severity,
    /// Environment the invoking process runs in.
    pub environment: Environment,
    /// Rule override; the embedded rule set is used when unset.
    pub rules_file: Option<PathBuf>,
    /// Newline-separated list of known package names.
    pub registry_file: Option<PathBuf>,
    /// Newline-separated `METHOD /path` list of known routes.
    pub routes_file: Option<PathBuf>,
    pub lookup: LookupConfig,
    pub backup: BackupConfig,
    pub locks: LockConfig,
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    pub attempts: u32,
    pub backoff_ms: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long an apply waits for paths held by another process.
    pub wait_secs: u64,
    /// Leases older than this are treated as abandoned by `recover`.
    pub stale_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Checker command; touched paths are appended as arguments.
    pub command: Option<Vec<String>>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            approval_threshold: Severity::High,
            environment: Environment::Development,
            rules_file: None,
            registry_file: None,
            routes_file: None,
            lookup: LookupConfig::default(),
            backup: BackupConfig::default(),
            locks: LockConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            attempts: 2,
            backoff_ms: 50,
            timeout_ms: 2_000,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_secs: 300,
            stale_secs: 6 * 3600,
        }
    }
}

impl LookupConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts.max(1),
            backoff: Duration::from_millis(self.backoff_ms),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

impl GuardConfig {
    pub fn parse(content: &str) -> Result<Self, GuardError> {
        toml::from_str(content).map_err(|e| GuardError::ConfigError(format!("config: {e}")))
    }

    /// Loads `<store>/config.toml`, falling back to defaults when absent.
    pub fn load(store: &Store) -> Result<Self, GuardError> {
        let path = store.config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        let mut config = Self::parse(&content)?;
        // Relative file references resolve against the store root.
        for file in [
            &mut config.rules_file,
            &mut config.registry_file,
            &mut config.routes_file,
        ]
        .into_iter()
        .flatten()
        {
            if file.is_relative() {
                *file = store.root.join(&*file);
            }
        }
        Ok(config)
    }
}
