//! Atomic Applier
//!
//! Applies every file of a change group or none of them.
//!
//! For each file, in declared order:
//! 1. read the current content (the snapshot),
//! 2. append the snapshot to the group's write-ahead manifest and sync it,
//! 3. write or delete.
//!
//! After all writes the diagnostics provider is asked about the touched
//! files; anything new relative to the pre-apply baseline fails the group.
//! Any failure restores every touched path in reverse order. If a restore
//! itself fails the remaining paths are still restored, the group ends
//! `Failed` with `partial_rollback` set and its manifest is quarantined for
//! manual remediation.

use crate::core::audit::{AuditRecord, AuditSink, stage};
use crate::core::diagnostics::{self, DiagnosticsProvider};
use crate::core::error::GuardError;
use crate::core::files::FileStore;
use crate::core::group::{ChangeGroup, FileOp, GroupStatus, Snapshot};
use crate::core::locks::PathLocks;
use crate::core::manifest::{ManifestStore, PendingManifest, sha256_hex};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    Applied,
    RolledBack,
    Failed,
    ApprovalRequired,
    Rejected,
}

impl ApplyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApplyStatus::Applied => "applied",
            ApplyStatus::RolledBack => "rolled_back",
            ApplyStatus::Failed => "failed",
            ApplyStatus::ApprovalRequired => "approval_required",
            ApplyStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Locking, baseline diagnostics, manifest setup, or a file whose
    /// current state contradicts its declared operation.
    Precondition,
    Write,
    PostCheck,
    /// A panic while writing.
    Unexpected,
}

impl FailureStage {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureStage::Precondition => "precondition",
            FailureStage::Write => "write",
            FailureStage::PostCheck => "post_check",
            FailureStage::Unexpected => "unexpected",
        }
    }

    fn audit_stage(self) -> &'static str {
        match self {
            FailureStage::PostCheck => stage::POST_CHECK,
            _ => stage::APPLY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReason {
    pub stage: FailureStage,
    pub detail: String,
}

/// Per-file before/after summary recorded with a successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub op: FileOp,
    pub bytes_before: Option<usize>,
    pub bytes_after: Option<usize>,
    pub sha256_before: Option<String>,
    pub sha256_after: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub group_id: String,
    pub status: ApplyStatus,
    pub applied_files: Vec<String>,
    pub rollback_reason: Option<RollbackReason>,
    pub partial_rollback: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diff: Vec<FileDiff>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unrestored: Vec<String>,
}

impl ApplyOutcome {
    /// Outcome for a group the gate did not let through; nothing was touched.
    pub fn not_applied(group_id: &str, status: ApplyStatus) -> Self {
        Self {
            group_id: group_id.to_string(),
            status,
            applied_files: Vec::new(),
            rollback_reason: None,
            partial_rollback: false,
            diff: Vec::new(),
            unrestored: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    RolledBack,
    PartialRollback,
    /// Left by an earlier partial rollback; never replayed.
    Quarantined,
    /// Its paths are locked by an apply that is still running.
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub group_id: String,
    pub outcome: RecoveryOutcome,
    pub restored: Vec<String>,
    pub unrestored: Vec<String>,
}

struct Failure {
    stage: FailureStage,
    detail: String,
}

impl Failure {
    fn new(stage: FailureStage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            detail: detail.into(),
        }
    }
}

pub struct AtomicApplier {
    files: Arc<dyn FileStore>,
    diagnostics: Arc<dyn DiagnosticsProvider>,
    locks: Arc<PathLocks>,
    manifests: ManifestStore,
    audit: Arc<AuditSink>,
}

impl AtomicApplier {
    pub fn new(
        files: Arc<dyn FileStore>,
        diagnostics: Arc<dyn DiagnosticsProvider>,
        locks: Arc<PathLocks>,
        manifests: ManifestStore,
        audit: Arc<AuditSink>,
    ) -> Self {
        Self {
            files,
            diagnostics,
            locks,
            manifests,
            audit,
        }
    }

    /// Applies a group already in `Applying` and moves it to its terminal
    /// status. Never returns early with the workspace half-written.
    pub fn apply(&self, group: &mut ChangeGroup, actor: &str) -> ApplyOutcome {
        let paths: Vec<String> = group.paths().map(str::to_string).collect();

        let _held = match self.locks.acquire(paths.iter().cloned()) {
            Ok(guard) => guard,
            Err(e) => {
                return self.finish_untouched(group, actor, Failure::new(FailureStage::Precondition, e.to_string()));
            }
        };
        tracing::info!(group_id = %group.id, files = paths.len(), "applying change group");

        let baseline = match self.diagnostics.diagnose(&paths) {
            Ok(d) => d,
            Err(e) => {
                return self.finish_untouched(
                    group,
                    actor,
                    Failure::new(FailureStage::Precondition, format!("baseline diagnostics failed: {e}")),
                );
            }
        };

        let mut manifest = match self.manifests.begin(&group.id, &paths) {
            Ok(m) => m,
            Err(e) => {
                return self.finish_untouched(
                    group,
                    actor,
                    Failure::new(FailureStage::Precondition, format!("manifest setup failed: {e}")),
                );
            }
        };

        let mut touched: Vec<(String, Snapshot)> = Vec::with_capacity(group.files.len());
        let written = panic::catch_unwind(AssertUnwindSafe(|| {
            self.write_all(group, &mut manifest, &mut touched)
        }));
        let failure = match written {
            Ok(Ok(())) => self.post_check(&paths, &baseline).err(),
            Ok(Err(failure)) => Some(failure),
            Err(payload) => Some(Failure::new(FailureStage::Unexpected, panic_message(&*payload))),
        };

        match failure {
            None => self.finish_applied(group, actor, manifest, &touched),
            Some(failure) => self.roll_back(group, actor, manifest, touched, failure),
        }
    }

    fn write_all(
        &self,
        group: &mut ChangeGroup,
        manifest: &mut PendingManifest,
        touched: &mut Vec<(String, Snapshot)>,
    ) -> Result<(), Failure> {
        for file in group.files.iter_mut() {
            let current = self
                .files
                .read(&file.path)
                .map_err(|e| Failure::new(FailureStage::Write, format!("read {}: {e}", file.path)))?;
            match (file.op, current.is_some()) {
                (FileOp::Create, true) => {
                    return Err(Failure::new(
                        FailureStage::Precondition,
                        format!("{} already exists", file.path),
                    ));
                }
                (FileOp::Modify | FileOp::Delete, false) => {
                    return Err(Failure::new(
                        FailureStage::Precondition,
                        format!("{} does not exist", file.path),
                    ));
                }
                _ => {}
            }

            let snapshot = Snapshot::from_read(current);
            manifest.record(&file.path, &snapshot).map_err(|e| {
                Failure::new(FailureStage::Write, format!("manifest record {}: {e}", file.path))
            })?;
            file.previous_content = Some(snapshot.clone());
            touched.push((file.path.clone(), snapshot));

            let result = match file.op {
                FileOp::Create | FileOp::Modify => self.files.write(&file.path, &file.new_content),
                FileOp::Delete => self.files.delete(&file.path),
            };
            result.map_err(|e| Failure::new(FailureStage::Write, format!("{} {}: {e}", op_verb(file.op), file.path)))?;
        }
        Ok(())
    }

    fn post_check(&self, paths: &[String], baseline: &[diagnostics::Diagnostic]) -> Result<(), Failure> {
        let after = self
            .diagnostics
            .diagnose(paths)
            .map_err(|e| Failure::new(FailureStage::PostCheck, format!("diagnostics failed: {e}")))?;
        let regressions = diagnostics::regressions(baseline, &after);
        if regressions.is_empty() {
            return Ok(());
        }
        let summary: Vec<String> = regressions
            .iter()
            .map(|d| match d.line {
                Some(line) => format!("{}:{line}: {}", d.path, d.message),
                None => format!("{}: {}", d.path, d.message),
            })
            .collect();
        Err(Failure::new(
            FailureStage::PostCheck,
            format!("{} new diagnostic(s): {}", regressions.len(), summary.join("; ")),
        ))
    }

    fn finish_applied(
        &self,
        group: &mut ChangeGroup,
        actor: &str,
        manifest: PendingManifest,
        touched: &[(String, Snapshot)],
    ) -> ApplyOutcome {
        if let Err(e) = manifest.complete() {
            tracing::warn!(group_id = %group.id, error = %e, "could not remove completed manifest");
        }
        set_status(group, GroupStatus::Applied);

        let diff: Vec<FileDiff> = group
            .files
            .iter()
            .zip(touched)
            .map(|(file, (_, before))| {
                let (bytes_before, sha256_before) = match before {
                    Snapshot::Present(b) => (Some(b.len()), Some(sha256_hex(b))),
                    Snapshot::Absent => (None, None),
                };
                let (bytes_after, sha256_after) = match file.op {
                    FileOp::Delete => (None, None),
                    _ => (Some(file.new_content.len()), Some(sha256_hex(&file.new_content))),
                };
                FileDiff {
                    path: file.path.clone(),
                    op: file.op,
                    bytes_before,
                    bytes_after,
                    sha256_before,
                    sha256_after,
                }
            })
            .collect();

        self.audit.record(
            AuditRecord::new(actor, &group.id, stage::APPLY, ApplyStatus::Applied.as_str())
                .detail(json!({ "files": diff })),
        );
        tracing::info!(group_id = %group.id, "change group applied");

        ApplyOutcome {
            group_id: group.id.clone(),
            status: ApplyStatus::Applied,
            applied_files: group.files.iter().map(|f| f.path.clone()).collect(),
            rollback_reason: None,
            partial_rollback: false,
            diff,
            unrestored: Vec::new(),
        }
    }

    /// Failure before any file was touched; there is nothing to restore.
    fn finish_untouched(&self, group: &mut ChangeGroup, actor: &str, failure: Failure) -> ApplyOutcome {
        if let Err(e) = self.manifests.discard(&group.id) {
            tracing::warn!(group_id = %group.id, error = %e, "could not discard manifest");
        }
        self.rolled_back(group, actor, failure, Vec::new())
    }

    fn roll_back(
        &self,
        group: &mut ChangeGroup,
        actor: &str,
        manifest: PendingManifest,
        touched: Vec<(String, Snapshot)>,
        failure: Failure,
    ) -> ApplyOutcome {
        tracing::warn!(
            group_id = %group.id,
            stage = failure.stage.as_str(),
            detail = %failure.detail,
            "rolling back change group"
        );
        let (restored, unrestored) = self.restore(&touched);

        if unrestored.is_empty() {
            if let Err(e) = manifest.complete() {
                tracing::warn!(group_id = %group.id, error = %e, "could not remove rolled-back manifest");
            }
            return self.rolled_back(group, actor, failure, restored);
        }

        let kept = match manifest.quarantine(&unrestored) {
            Ok(dir) => dir.display().to_string(),
            Err(e) => format!("(quarantine failed: {e})"),
        };
        set_status(group, GroupStatus::Failed);
        tracing::error!(
            group_id = %group.id,
            unrestored = ?unrestored,
            manifest = %kept,
            "PARTIAL ROLLBACK: workspace left inconsistent, manual remediation required"
        );
        self.audit.record(
            AuditRecord::new(actor, &group.id, stage::ROLLBACK, "partial_rollback").detail(json!({
                "stage": failure.stage,
                "detail": failure.detail,
                "restored": restored,
                "unrestored": unrestored,
                "manifest": kept,
            })),
        );
        ApplyOutcome {
            group_id: group.id.clone(),
            status: ApplyStatus::Failed,
            applied_files: Vec::new(),
            rollback_reason: Some(RollbackReason {
                stage: failure.stage,
                detail: failure.detail,
            }),
            partial_rollback: true,
            diff: Vec::new(),
            unrestored,
        }
    }

    fn rolled_back(
        &self,
        group: &mut ChangeGroup,
        actor: &str,
        failure: Failure,
        restored: Vec<String>,
    ) -> ApplyOutcome {
        set_status(group, GroupStatus::RolledBack);
        self.audit.record(
            AuditRecord::new(actor, &group.id, failure.stage.audit_stage(), ApplyStatus::RolledBack.as_str())
                .detail(json!({
                    "stage": failure.stage,
                    "detail": failure.detail,
                    "restored": restored,
                })),
        );
        ApplyOutcome {
            group_id: group.id.clone(),
            status: ApplyStatus::RolledBack,
            applied_files: Vec::new(),
            rollback_reason: Some(RollbackReason {
                stage: failure.stage,
                detail: failure.detail,
            }),
            partial_rollback: false,
            diff: Vec::new(),
            unrestored: Vec::new(),
        }
    }

    /// Restores snapshots newest first. Keeps going past failures; returns
    /// (restored, unrestored-with-reason).
    fn restore(&self, touched: &[(String, Snapshot)]) -> (Vec<String>, Vec<String>) {
        let mut restored = Vec::new();
        let mut unrestored = Vec::new();
        for (path, snapshot) in touched.iter().rev() {
            let result = match snapshot {
                Snapshot::Present(bytes) => self.files.write(path, bytes),
                Snapshot::Absent => self.files.delete(path),
            };
            match result {
                Ok(()) => restored.push(path.clone()),
                Err(e) => {
                    tracing::error!(path = %path, error = %e, "restore failed");
                    unrestored.push(format!("{path}: {e}"));
                }
            }
        }
        (restored, unrestored)
    }

    /// Rolls back every manifest left by an interrupted apply. Quarantined
    /// manifests are reported but never replayed, and a manifest whose
    /// paths are still locked belongs to a live apply and is left alone.
    pub fn recover(&self, actor: &str) -> Result<Vec<RecoveryReport>, GuardError> {
        self.locks.clear_stale()?;
        let mut reports = Vec::new();
        for group_id in self.manifests.pending()? {
            let header = self.manifests.header(&group_id)?;
            let Some(_held) = self.locks.try_acquire(header.paths.iter().cloned())? else {
                tracing::info!(group_id = %group_id, "change group still applying; manifest left alone");
                reports.push(RecoveryReport {
                    group_id,
                    outcome: RecoveryOutcome::InProgress,
                    restored: Vec::new(),
                    unrestored: Vec::new(),
                });
                continue;
            };
            // The owning apply may have finished between listing and locking.
            if !self.manifests.exists(&group_id) {
                continue;
            }
            if self.manifests.is_quarantined(&group_id) {
                tracing::warn!(group_id = %group_id, "manifest quarantined after partial rollback; skipping");
                reports.push(RecoveryReport {
                    group_id,
                    outcome: RecoveryOutcome::Quarantined,
                    restored: Vec::new(),
                    unrestored: Vec::new(),
                });
                continue;
            }

            let recovered = self.manifests.load(&group_id)?;
            let (restored, unrestored) = self.restore(&recovered.entries);

            let outcome = if unrestored.is_empty() {
                self.manifests.discard(&group_id)?;
                RecoveryOutcome::RolledBack
            } else {
                self.manifests.quarantine(&group_id, &unrestored)?;
                tracing::error!(group_id = %group_id, unrestored = ?unrestored, "PARTIAL ROLLBACK during recovery");
                RecoveryOutcome::PartialRollback
            };

            self.audit.record(
                AuditRecord::new(actor, &group_id, stage::RECOVERY, match outcome {
                    RecoveryOutcome::RolledBack => "rolled_back",
                    _ => "partial_rollback",
                })
                .detail(json!({
                    "started_at": recovered.header.started_at,
                    "restored": restored,
                    "unrestored": unrestored,
                })),
            );
            reports.push(RecoveryReport {
                group_id,
                outcome,
                restored,
                unrestored,
            });
        }
        Ok(reports)
    }
}

/// Terminal transitions out of `Applying` are always legal; a group handed
/// over in another status is only logged.
fn set_status(group: &mut ChangeGroup, next: GroupStatus) {
    if let Err(e) = group.transition(next) {
        tracing::error!(group_id = %group.id, error = %e, "unexpected status transition");
    }
}

fn op_verb(op: FileOp) -> &'static str {
    match op {
        FileOp::Create => "create",
        FileOp::Modify => "write",
        FileOp::Delete => "delete",
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic during apply: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic during apply: {s}")
    } else {
        "panic during apply".to_string()
    }
}
