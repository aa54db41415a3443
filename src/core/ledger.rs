//! Durable group and approval ledger (`guard.db`).
//!
//! Groups are stored with their immutable validation report and current
//! status so that submit, approve and apply can run in separate processes.
//! Approval decisions are append-only; the latest one for a group wins.

use crate::core::db;
use crate::core::error::GuardError;
use crate::core::finding::ValidationReport;
use crate::core::gate::{ApprovalDecision, Decision};
use crate::core::group::{ChangeGroup, FileChange, GroupStatus};
use crate::core::time;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use ulid::Ulid;

#[derive(Debug, Clone)]
pub struct StoredGroup {
    pub group: ChangeGroup,
    pub report: ValidationReport,
    pub report_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group_id: String,
    pub status: GroupStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    db_path: PathBuf,
}

impl Ledger {
    pub fn open(db_path: &Path) -> Result<Self, GuardError> {
        db::initialize_guard_db(db_path)?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn save_group(&self, group: &ChangeGroup, report: &ValidationReport) -> Result<(), GuardError> {
        let conn = db::db_connect(&self.db_path)?;
        conn.execute(
            "INSERT INTO change_groups(group_id, created_at, status, group_json, report_json, report_digest, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                group.id,
                group.created_at,
                group.status().as_str(),
                serde_json::to_string(&group.files)?,
                report.to_canonical_json()?,
                report.digest()?,
                time::now_epoch_z()
            ],
        )?;
        Ok(())
    }

    /// Moves a stored group from `from` to `to`. Fails if another writer
    /// changed the status in between.
    pub fn update_status(
        &self,
        group_id: &str,
        from: GroupStatus,
        to: GroupStatus,
    ) -> Result<(), GuardError> {
        let conn = db::db_connect(&self.db_path)?;
        let changed = conn.execute(
            "UPDATE change_groups SET status = ?1, updated_at = ?2 WHERE group_id = ?3 AND status = ?4",
            params![to.as_str(), time::now_epoch_z(), group_id, from.as_str()],
        )?;
        if changed == 0 {
            return Err(GuardError::InvalidTransition(format!(
                "group {group_id} is no longer {from}"
            )));
        }
        Ok(())
    }

    pub fn load_group(&self, group_id: &str) -> Result<StoredGroup, GuardError> {
        let conn = db::db_connect(&self.db_path)?;
        let row = conn
            .query_row(
                "SELECT created_at, status, group_json, report_json, report_digest FROM change_groups WHERE group_id = ?1",
                params![group_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((created_at, status, files_json, report_json, report_digest)) = row else {
            return Err(GuardError::NotFound(format!("change group {group_id}")));
        };
        let status = GroupStatus::parse(&status)
            .ok_or_else(|| GuardError::ValidationFailure(format!("unknown status {status}")))?;
        let files: Vec<FileChange> = serde_json::from_str(&files_json)?;
        Ok(StoredGroup {
            group: ChangeGroup::restore(group_id.to_string(), files, created_at, status),
            report: serde_json::from_str(&report_json)?,
            report_digest,
        })
    }

    pub fn status(&self, group_id: &str) -> Result<Option<GroupStatus>, GuardError> {
        let conn = db::db_connect(&self.db_path)?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT status FROM change_groups WHERE group_id = ?1",
                params![group_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.and_then(|s| GroupStatus::parse(&s)))
    }

    pub fn list_groups(&self) -> Result<Vec<GroupSummary>, GuardError> {
        let conn = db::db_connect(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT group_id, status, created_at, updated_at FROM change_groups ORDER BY group_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for r in rows {
            let (group_id, status, created_at, updated_at) = r?;
            let Some(status) = GroupStatus::parse(&status) else {
                continue;
            };
            out.push(GroupSummary {
                group_id,
                status,
                created_at,
                updated_at,
            });
        }
        Ok(out)
    }

    pub fn record_decision(&self, decision: &ApprovalDecision) -> Result<String, GuardError> {
        let conn = db::db_connect(&self.db_path)?;
        let approval_id = Ulid::new().to_string();
        conn.execute(
            "INSERT INTO approvals(approval_id, group_id, approver, decision, reason, ts) VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                approval_id,
                decision.group_id,
                decision.approver,
                decision.decision.as_str(),
                decision.reason,
                decision.timestamp
            ],
        )?;
        Ok(approval_id)
    }

    pub fn latest_decision(&self, group_id: &str) -> Result<Option<ApprovalDecision>, GuardError> {
        let conn = db::db_connect(&self.db_path)?;
        let row = conn
            .query_row(
                "SELECT approver, decision, reason, ts FROM approvals WHERE group_id = ?1 ORDER BY rowid DESC LIMIT 1",
                params![group_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((approver, decision, reason, timestamp)) = row else {
            return Ok(None);
        };
        let decision = Decision::parse(&decision)
            .ok_or_else(|| GuardError::ValidationFailure(format!("unknown decision {decision}")))?;
        Ok(Some(ApprovalDecision {
            group_id: group_id.to_string(),
            approver,
            decision,
            reason,
            timestamp,
        }))
    }
}
