//! Change groups: the atomic unit of proposed file edits and its lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::error::GuardError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOp {
    Create,
    Modify,
    Delete,
}

/// Pre-apply state of a path, captured immediately before it is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Snapshot {
    Absent,
    Present(Vec<u8>),
}

impl Snapshot {
    pub fn from_read(bytes: Option<Vec<u8>>) -> Self {
        match bytes {
            Some(b) => Snapshot::Present(b),
            None => Snapshot::Absent,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Snapshot::Absent => 0,
            Snapshot::Present(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    /// `None` until the applier captures it; never populated at submission.
    pub previous_content: Option<Snapshot>,
    pub new_content: Vec<u8>,
    pub op: FileOp,
}

impl FileChange {
    pub fn create(path: &str, content: impl Into<Vec<u8>>) -> Self {
        Self::new(path, FileOp::Create, content.into())
    }

    pub fn modify(path: &str, content: impl Into<Vec<u8>>) -> Self {
        Self::new(path, FileOp::Modify, content.into())
    }

    pub fn delete(path: &str) -> Self {
        Self::new(path, FileOp::Delete, Vec::new())
    }

    fn new(path: &str, op: FileOp, new_content: Vec<u8>) -> Self {
        Self {
            path: path.to_string(),
            previous_content: None,
            new_content,
            op,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Created,
    Validating,
    /// Validation finished below the approval threshold.
    Validated,
    NeedsApproval,
    Approved,
    Rejected,
    Applying,
    Applied,
    RolledBack,
    Failed,
}

impl GroupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupStatus::Created => "created",
            GroupStatus::Validating => "validating",
            GroupStatus::Validated => "validated",
            GroupStatus::NeedsApproval => "needs_approval",
            GroupStatus::Approved => "approved",
            GroupStatus::Rejected => "rejected",
            GroupStatus::Applying => "applying",
            GroupStatus::Applied => "applied",
            GroupStatus::RolledBack => "rolled_back",
            GroupStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "created" => GroupStatus::Created,
            "validating" => GroupStatus::Validating,
            "validated" => GroupStatus::Validated,
            "needs_approval" => GroupStatus::NeedsApproval,
            "approved" => GroupStatus::Approved,
            "rejected" => GroupStatus::Rejected,
            "applying" => GroupStatus::Applying,
            "applied" => GroupStatus::Applied,
            "rolled_back" => GroupStatus::RolledBack,
            "failed" => GroupStatus::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GroupStatus::Applied | GroupStatus::RolledBack | GroupStatus::Rejected | GroupStatus::Failed
        )
    }

    pub fn can_transition_to(self, next: GroupStatus) -> bool {
        use GroupStatus::*;
        matches!(
            (self, next),
            (Created, Validating)
                | (Validating, Validated)
                | (Validating, NeedsApproval)
                | (Validated, Applying)
                | (Validated, Rejected)
                | (NeedsApproval, Approved)
                | (NeedsApproval, Rejected)
                | (Approved, Applying)
                | (Approved, Rejected)
                | (Applying, Applied)
                | (Applying, RolledBack)
                | (Applying, Failed)
        )
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeGroup {
    pub id: String,
    pub files: Vec<FileChange>,
    pub created_at: String,
    status: GroupStatus,
}

impl ChangeGroup {
    pub fn new(id: String, files: Vec<FileChange>, created_at: String) -> Self {
        Self {
            id,
            files,
            created_at,
            status: GroupStatus::Created,
        }
    }

    /// Rebuilds a persisted group in the status it was stored with.
    pub fn restore(id: String, files: Vec<FileChange>, created_at: String, status: GroupStatus) -> Self {
        Self {
            id,
            files,
            created_at,
            status,
        }
    }

    pub fn status(&self) -> GroupStatus {
        self.status
    }

    pub fn transition(&mut self, next: GroupStatus) -> Result<(), GuardError> {
        if !self.status.can_transition_to(next) {
            return Err(GuardError::InvalidTransition(format!(
                "group {}: {} -> {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.path.as_str())
    }
}
