//! Approval gate: decides from a report whether a group may be applied.

use crate::core::finding::{Severity, ValidationReport};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Approved => "approved",
            Decision::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "approved" => Some(Decision::Approved),
            "rejected" => Some(Decision::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub group_id: String,
    pub approver: String,
    pub decision: Decision,
    pub reason: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateVerdict {
    /// Below the threshold: proceeds without sign-off (still audited).
    AutoPass,
    ApprovalRequired,
    Approved,
    Rejected,
}

impl GateVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            GateVerdict::AutoPass => "auto_pass",
            GateVerdict::ApprovalRequired => "approval_required",
            GateVerdict::Approved => "approved",
            GateVerdict::Rejected => "rejected",
        }
    }

    pub fn may_apply(self) -> bool {
        matches!(self, GateVerdict::AutoPass | GateVerdict::Approved)
    }
}

/// Critical reports never auto-pass, whatever the configured threshold.
pub fn needs_approval(report: &ValidationReport) -> bool {
    report.requires_approval || report.overall_severity == Severity::Critical
}

pub fn evaluate(report: &ValidationReport, decision: Option<&ApprovalDecision>) -> GateVerdict {
    match decision.map(|d| d.decision) {
        Some(Decision::Rejected) => GateVerdict::Rejected,
        Some(Decision::Approved) if needs_approval(report) => GateVerdict::Approved,
        _ if needs_approval(report) => GateVerdict::ApprovalRequired,
        _ => GateVerdict::AutoPass,
    }
}
