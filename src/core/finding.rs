//! Findings, reports and the validator seam.
//!
//! Every rule set (security, hallucination, database risk) reports against the
//! same [`Severity`] scale, so the pipeline aggregates findings without knowing
//! which validator produced them.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::core::group::FileOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub path: String,
    pub line: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub severity: Severity,
    pub kind: String,
    pub message: String,
    pub source_validator: String,
    pub location: Option<Location>,
    /// False when an external lookup could not confirm the finding either way.
    pub verified: bool,
}

impl ValidationFinding {
    pub fn new(
        severity: Severity,
        kind: &str,
        message: impl Into<String>,
        source_validator: &str,
    ) -> Self {
        Self {
            severity,
            kind: kind.to_string(),
            message: message.into(),
            source_validator: source_validator.to_string(),
            location: None,
            verified: true,
        }
    }

    pub fn at(mut self, path: &str, line: Option<usize>) -> Self {
        self.location = Some(Location {
            path: path.to_string(),
            line,
        });
        self
    }

    pub fn unverified(mut self) -> Self {
        self.verified = false;
        self
    }

    fn sort_key(&self) -> (Option<&Location>, &str, &str, &str, std::cmp::Reverse<Severity>) {
        (
            self.location.as_ref(),
            self.source_validator.as_str(),
            self.kind.as_str(),
            self.message.as_str(),
            std::cmp::Reverse(self.severity),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub group_id: String,
    pub findings: Vec<ValidationFinding>,
    pub overall_severity: Severity,
    pub requires_approval: bool,
    pub rules_version: String,
}

impl ValidationReport {
    /// Builds a report from unordered findings. Findings are sorted into a
    /// total order and deduplicated so equal input always yields equal output.
    pub fn from_findings(
        group_id: &str,
        mut findings: Vec<ValidationFinding>,
        approval_threshold: Severity,
        rules_version: &str,
    ) -> Self {
        findings.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        findings.dedup();
        let overall_severity = findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(Severity::Low);
        let requires_approval = !findings.is_empty() && overall_severity >= approval_threshold;
        Self {
            group_id: group_id.to_string(),
            findings,
            overall_severity,
            requires_approval,
            rules_version: rules_version.to_string(),
        }
    }

    pub fn to_canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// SHA-256 of the canonical JSON form.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        let mut hasher = Sha256::new();
        hasher.update(self.to_canonical_json()?.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn count_at(&self, severity: Severity) -> usize {
        self.findings.iter().filter(|f| f.severity == severity).count()
    }
}

/// One file as seen by validators: post-change content plus static metadata.
#[derive(Debug, Clone, Copy)]
pub struct FileUnderReview<'a> {
    pub path: &'a str,
    pub content: &'a str,
    pub op: FileOp,
    /// Reference date for temporal checks (the group's creation date).
    pub as_of: NaiveDate,
}

impl FileUnderReview<'_> {
    pub fn extension(&self) -> &str {
        std::path::Path::new(self.path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
    }
}

/// A stateless content classifier. Implementations must be pure functions of
/// the file plus their own read-only configuration.
pub trait Validator: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self, file: &FileUnderReview<'_>) -> Vec<ValidationFinding>;
}
