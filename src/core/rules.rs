//! Versioned rule data for the validators.
//!
//! Patterns and thresholds live in TOML (`rules/default.toml` is embedded) so
//! the classification boundary can be reviewed, versioned and overridden
//! without touching validator code.

use crate::core::error::GuardError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

const DEFAULT_RULES: &str = include_str!("../../rules/default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub version: String,
    pub database: DatabaseRules,
    pub security: SecurityRules,
    pub hallucination: HallucinationRules,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseRules {
    pub critical_pattern: String,
    pub schema_alter_pattern: String,
    pub read_only_pattern: String,
    pub tautology_patterns: Vec<String>,
    pub production_markers: Vec<String>,
    pub embedded_sql_pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityRules {
    pub entropy_threshold: f64,
    pub min_secret_length: usize,
    pub secret_patterns: Vec<String>,
    pub secret_assignment_pattern: String,
    pub sql_concat_patterns: Vec<String>,
    pub xss_patterns: Vec<String>,
    pub route_pattern: String,
    pub mutating_methods: Vec<String>,
    pub csrf_markers: Vec<String>,
    pub auth_markers: Vec<String>,
    pub rate_limit_markers: Vec<String>,
    pub global_middleware_pattern: String,
    pub weak_password_patterns: Vec<String>,
    pub plaintext_password_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricatedPattern {
    pub name: String,
    pub pattern: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HallucinationRules {
    pub ignored_packages: Vec<String>,
    pub historical_field_pattern: String,
    pub count_field_pattern: String,
    pub perfect_rate_pattern: String,
    pub zero_variance_pattern: String,
    pub fabricated: Vec<FabricatedPattern>,
}

impl RuleConfig {
    /// The embedded default rule set.
    pub fn builtin() -> Result<Self, GuardError> {
        Self::parse(DEFAULT_RULES)
    }

    pub fn parse(content: &str) -> Result<Self, GuardError> {
        toml::from_str(content).map_err(|e| GuardError::ConfigError(format!("rules: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self, GuardError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }
}

pub fn compile(pattern: &str) -> Result<Regex, GuardError> {
    Regex::new(pattern).map_err(|e| GuardError::ConfigError(format!("pattern {pattern:?}: {e}")))
}

pub fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, GuardError> {
    patterns.iter().map(|p| compile(p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_rules_parse_and_compile() {
        let rules = RuleConfig::builtin().expect("builtin rules");
        assert!(!rules.version.is_empty());
        compile_all(&rules.security.secret_patterns).expect("secret patterns");
        compile_all(&rules.security.sql_concat_patterns).expect("sql patterns");
        compile_all(&rules.security.xss_patterns).expect("xss patterns");
        compile_all(&rules.database.tautology_patterns).expect("tautologies");
        for f in &rules.hallucination.fabricated {
            compile(&f.pattern).expect("fabricated pattern");
        }
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let err = compile("(unclosed").expect_err("must fail");
        assert!(matches!(err, GuardError::ConfigError(_)));
    }
}
