//! The exposed operations: submit, report, approve, reject, cancel, apply,
//! audit trail, recovery and guarded database operations.
//!
//! Group state lives in the ledger and every status change is a
//! compare-and-set there, so two callers racing on one group (in one process
//! or several) cannot both move it.

use crate::core::applier::{ApplyOutcome, ApplyStatus, AtomicApplier, RecoveryOutcome, RecoveryReport};
use crate::core::audit::{AuditEntry, AuditFilter, AuditRecord, AuditSink, stage};
use crate::core::config::GuardConfig;
use crate::core::diagnostics::{CommandDiagnostics, DiagnosticsProvider, NoDiagnostics};
use crate::core::error::GuardError;
use crate::core::files::{FileStore, FsFileStore, normalize_path};
use crate::core::finding::{Severity, ValidationReport};
use crate::core::gate::{self, ApprovalDecision, Decision, GateVerdict};
use crate::core::group::{ChangeGroup, FileChange, GroupStatus};
use crate::core::ledger::{GroupSummary, Ledger};
use crate::core::locks::PathLocks;
use crate::core::lookup::{PackageRegistry, RouteTable, StaticRegistry, StaticRouteTable};
use crate::core::manifest::ManifestStore;
use crate::core::pipeline::ValidationPipeline;
use crate::core::rules::RuleConfig;
use crate::core::store::{STORE_DIR, Store};
use crate::core::time;
use crate::plugins::backup::{BackupManager, DatabaseTarget};
use crate::plugins::guardian::{DatabaseGuardian, DbContext, OperationOutcome};
use crate::plugins::hallucination::HallucinationDetector;
use crate::plugins::security::SecurityValidator;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// External collaborators the service is built from.
pub struct Collaborators {
    pub files: Arc<dyn FileStore>,
    pub diagnostics: Arc<dyn DiagnosticsProvider>,
    pub registry: Option<Arc<dyn PackageRegistry>>,
    pub routes: Option<Arc<dyn RouteTable>>,
    pub audit: Arc<AuditSink>,
}

impl Collaborators {
    /// Filesystem-backed collaborators as described by `config`.
    pub fn from_config(workspace: &Path, store: &Store, config: &GuardConfig) -> Result<Self, GuardError> {
        let diagnostics: Arc<dyn DiagnosticsProvider> = match &config.diagnostics.command {
            Some(command) => Arc::new(CommandDiagnostics::new(command, workspace)?),
            None => Arc::new(NoDiagnostics),
        };
        let registry = match &config.registry_file {
            Some(path) => Some(Arc::new(StaticRegistry::load(path)?) as Arc<dyn PackageRegistry>),
            None => None,
        };
        let routes = match &config.routes_file {
            Some(path) => Some(Arc::new(StaticRouteTable::load(path)?) as Arc<dyn RouteTable>),
            None => None,
        };
        Ok(Self {
            files: Arc::new(FsFileStore::new(workspace)),
            diagnostics,
            registry,
            routes,
            audit: Arc::new(AuditSink::jsonl(&store.audit_log_path())?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The group had not started applying and is now `Rejected`.
    Cancelled,
    /// The group is applying; the request is recorded and the apply runs to
    /// its terminal state.
    Deferred,
    AlreadyTerminal(GroupStatus),
}

pub struct ChangeGuard {
    store: Store,
    config: GuardConfig,
    pipeline: ValidationPipeline,
    applier: AtomicApplier,
    ledger: Ledger,
    audit: Arc<AuditSink>,
    guardian: Arc<DatabaseGuardian>,
    backups: BackupManager,
}

impl ChangeGuard {
    /// Opens (creating if needed) the store of `workspace` and wires every
    /// collaborator from its configuration.
    pub fn open(workspace: &Path) -> Result<Self, GuardError> {
        let store = Store::for_workspace(workspace);
        store.ensure()?;
        let config = GuardConfig::load(&store)?;
        let rules = match &config.rules_file {
            Some(path) => RuleConfig::load(path)?,
            None => RuleConfig::builtin()?,
        };
        let collaborators = Collaborators::from_config(workspace, &store, &config)?;
        Self::new(store, config, &rules, collaborators)
    }

    pub fn new(
        store: Store,
        config: GuardConfig,
        rules: &RuleConfig,
        collaborators: Collaborators,
    ) -> Result<Self, GuardError> {
        store.ensure()?;
        let ledger = Ledger::open(&store.ledger_db_path())?;

        let guardian = Arc::new(DatabaseGuardian::from_rules(&rules.database)?);
        let mut hallucination =
            HallucinationDetector::from_rules(&rules.hallucination, config.lookup.retry_policy())?;
        if let Some(registry) = collaborators.registry {
            hallucination = hallucination.with_registry(registry);
        }
        if let Some(routes) = collaborators.routes {
            hallucination = hallucination.with_routes(routes);
        }
        let pipeline = ValidationPipeline::new(config.approval_threshold, &rules.version)
            .with_validator(Arc::new(SecurityValidator::from_rules(&rules.security)?))
            .with_validator(Arc::new(hallucination))
            .with_validator(guardian.clone());

        let applier = AtomicApplier::new(
            collaborators.files,
            collaborators.diagnostics,
            PathLocks::shared(
                store.locks_dir(),
                Duration::from_secs(config.locks.wait_secs),
                Duration::from_secs(config.locks.stale_secs),
            )?,
            ManifestStore::new(store.pending_dir()),
            Arc::clone(&collaborators.audit),
        );
        let backups = BackupManager::new(
            store.backups_dir(),
            Duration::from_secs(config.backup.timeout_secs),
        )
        .with_ledger(store.ledger_db_path());

        Ok(Self {
            store,
            config,
            pipeline,
            applier,
            ledger,
            audit: collaborators.audit,
            guardian,
            backups,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Validates a proposed set of edits and stores it as a new group.
    /// Returns the group id; the report is available immediately.
    pub fn submit_change_group(&self, actor: &str, files: Vec<FileChange>) -> Result<String, GuardError> {
        let files = normalize_files(files)?;
        let mut group = ChangeGroup::new(ulid::Ulid::new().to_string(), files, time::now_epoch_z());
        self.audit.append(
            AuditRecord::new(actor, &group.id, stage::SUBMISSION, "accepted").detail(json!({
                "files": group.files.iter().map(|f| json!({ "path": f.path, "op": f.op })).collect::<Vec<_>>(),
            })),
        )?;

        group.transition(GroupStatus::Validating)?;
        let report = self.pipeline.run(&group);
        let verdict = gate::evaluate(&report, None);
        group.transition(if verdict.may_apply() {
            GroupStatus::Validated
        } else {
            GroupStatus::NeedsApproval
        })?;
        self.ledger.save_group(&group, &report)?;

        self.audit.append(
            AuditRecord::new(actor, &group.id, stage::VALIDATION, verdict.as_str())
                .detail(validation_detail(&report, &self.pipeline.validator_names())?),
        )?;
        tracing::info!(
            group_id = %group.id,
            severity = %report.overall_severity,
            findings = report.findings.len(),
            verdict = verdict.as_str(),
            "change group validated"
        );
        Ok(group.id)
    }

    pub fn get_validation_report(&self, group_id: &str) -> Result<ValidationReport, GuardError> {
        Ok(self.ledger.load_group(group_id)?.report)
    }

    pub fn group_status(&self, group_id: &str) -> Result<GroupStatus, GuardError> {
        self.ledger
            .status(group_id)?
            .ok_or_else(|| GuardError::NotFound(format!("change group {group_id}")))
    }

    pub fn list_groups(&self) -> Result<Vec<GroupSummary>, GuardError> {
        self.ledger.list_groups()
    }

    pub fn approve(
        &self,
        group_id: &str,
        approver: &str,
        reason: Option<&str>,
    ) -> Result<ApprovalDecision, GuardError> {
        let status = self.group_status(group_id)?;
        if status != GroupStatus::NeedsApproval {
            return Err(GuardError::InvalidTransition(format!(
                "group {group_id} is {status}; only groups awaiting approval can be approved"
            )));
        }
        self.decide(group_id, approver, Decision::Approved, reason, status, GroupStatus::Approved)
    }

    pub fn reject(&self, group_id: &str, actor: &str, reason: &str) -> Result<ApprovalDecision, GuardError> {
        let status = self.group_status(group_id)?;
        if !status.can_transition_to(GroupStatus::Rejected) {
            return Err(GuardError::InvalidTransition(format!(
                "group {group_id} is {status} and can no longer be rejected"
            )));
        }
        self.decide(group_id, actor, Decision::Rejected, Some(reason), status, GroupStatus::Rejected)
    }

    fn decide(
        &self,
        group_id: &str,
        actor: &str,
        decision: Decision,
        reason: Option<&str>,
        from: GroupStatus,
        to: GroupStatus,
    ) -> Result<ApprovalDecision, GuardError> {
        self.ledger.update_status(group_id, from, to)?;
        let decision = ApprovalDecision {
            group_id: group_id.to_string(),
            approver: actor.to_string(),
            decision,
            reason: reason.map(str::to_string),
            timestamp: time::now_epoch_z(),
        };
        let approval_id = self.ledger.record_decision(&decision)?;
        self.audit.append(
            AuditRecord::new(actor, group_id, stage::APPROVAL, decision.decision.as_str()).detail(json!({
                "approval_id": approval_id,
                "reason": decision.reason,
                "from": from,
            })),
        )?;
        tracing::info!(group_id, decision = decision.decision.as_str(), actor, "approval decision recorded");
        Ok(decision)
    }

    /// Cancels a group that has not started applying.
    pub fn cancel(&self, group_id: &str, actor: &str) -> Result<CancelOutcome, GuardError> {
        let status = self.group_status(group_id)?;
        let outcome = match status {
            GroupStatus::Applying => CancelOutcome::Deferred,
            s if s.is_terminal() => CancelOutcome::AlreadyTerminal(s),
            s => match self.ledger.update_status(group_id, s, GroupStatus::Rejected) {
                Ok(()) => CancelOutcome::Cancelled,
                // Lost a race with apply or another decision.
                Err(GuardError::InvalidTransition(_)) => match self.group_status(group_id)? {
                    GroupStatus::Applying => CancelOutcome::Deferred,
                    other => CancelOutcome::AlreadyTerminal(other),
                },
                Err(e) => return Err(e),
            },
        };
        let label = match outcome {
            CancelOutcome::Cancelled => "cancelled",
            CancelOutcome::Deferred => "cancel_deferred",
            CancelOutcome::AlreadyTerminal(_) => "cancel_ignored",
        };
        self.audit.append(
            AuditRecord::new(actor, group_id, stage::APPROVAL, label).detail(json!({ "status": status })),
        )?;
        Ok(outcome)
    }

    /// Applies a gated group. A group is consumed at most once: after any
    /// terminal outcome a retry needs a fresh submission.
    pub fn apply(&self, group_id: &str, actor: &str) -> Result<ApplyOutcome, GuardError> {
        let stored = self.ledger.load_group(group_id)?;
        let mut group = stored.group;
        let status = group.status();

        match status {
            GroupStatus::Rejected => return Ok(ApplyOutcome::not_applied(group_id, ApplyStatus::Rejected)),
            GroupStatus::Validated | GroupStatus::Approved | GroupStatus::NeedsApproval => {}
            other => {
                return Err(GuardError::InvalidTransition(format!(
                    "group {group_id} is {other} and cannot be applied"
                )));
            }
        }

        let decision = self.ledger.latest_decision(group_id)?;
        let verdict = gate::evaluate(&stored.report, decision.as_ref());
        if !verdict.may_apply() {
            let status = match verdict {
                GateVerdict::Rejected => ApplyStatus::Rejected,
                _ => ApplyStatus::ApprovalRequired,
            };
            self.audit.append(
                AuditRecord::new(actor, group_id, stage::APPROVAL, status.as_str()).detail(json!({
                    "overall_severity": stored.report.overall_severity,
                    "verdict": verdict.as_str(),
                })),
            )?;
            return Ok(ApplyOutcome::not_applied(group_id, status));
        }

        self.ledger.update_status(group_id, status, GroupStatus::Applying)?;
        group.transition(GroupStatus::Applying)?;

        let outcome = self.applier.apply(&mut group, actor);
        if let Err(e) = self
            .ledger
            .update_status(group_id, GroupStatus::Applying, group.status())
        {
            tracing::error!(group_id, error = %e, "could not persist terminal status");
            self.audit.record(
                AuditRecord::new(actor, group_id, stage::APPLY, "ledger_conflict").detail(json!({
                    "outcome": outcome.status,
                    "error": e.to_string(),
                })),
            );
            return Err(GuardError::InvalidTransition(format!(
                "group {group_id} finished {} but its ledger status could not be recorded: {e}",
                outcome.status.as_str()
            )));
        }
        Ok(outcome)
    }

    pub fn get_audit_trail(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, GuardError> {
        self.audit.query(filter)
    }

    /// Rolls back groups interrupted mid-apply (left in `pending/`). Groups
    /// another process is still applying are reported and left alone.
    pub fn recover(&self, actor: &str) -> Result<Vec<RecoveryReport>, GuardError> {
        let reports = self.applier.recover(actor)?;
        for report in &reports {
            let terminal = match report.outcome {
                RecoveryOutcome::RolledBack => GroupStatus::RolledBack,
                RecoveryOutcome::PartialRollback => GroupStatus::Failed,
                RecoveryOutcome::Quarantined | RecoveryOutcome::InProgress => continue,
            };
            if self.ledger.status(&report.group_id)? == Some(GroupStatus::Applying) {
                self.ledger
                    .update_status(&report.group_id, GroupStatus::Applying, terminal)?;
            }
        }
        Ok(reports)
    }

    /// Runs `sql` against `target` through the database guardian, as the
    /// configured environment.
    pub fn guard_database_operation(
        &self,
        target: &Arc<dyn DatabaseTarget>,
        sql: &str,
        actor: &str,
        approver: Option<&str>,
    ) -> Result<OperationOutcome, GuardError> {
        let ctx = DbContext::new(actor, self.config.environment, target.as_ref());
        self.guardian
            .guard_operation(target, sql, &ctx, approver, &self.backups, &self.audit)
    }

    /// Validates content without submitting it.
    pub fn scan(&self, files: Vec<FileChange>) -> Result<ValidationReport, GuardError> {
        let group = ChangeGroup::new("scan".to_string(), normalize_files(files)?, time::now_epoch_z());
        Ok(self.pipeline.run(&group))
    }
}

fn normalize_files(files: Vec<FileChange>) -> Result<Vec<FileChange>, GuardError> {
    if files.is_empty() {
        return Err(GuardError::ValidationFailure("change group has no files".to_string()));
    }
    let mut seen = FxHashSet::default();
    files
        .into_iter()
        .map(|mut f| {
            f.path = normalize_path(&f.path)?;
            if f.path == STORE_DIR || f.path.starts_with(&format!("{STORE_DIR}/")) {
                return Err(GuardError::PathError(format!("{} is inside the guard store", f.path)));
            }
            if !seen.insert(f.path.clone()) {
                return Err(GuardError::ValidationFailure(format!(
                    "{} appears more than once in the group",
                    f.path
                )));
            }
            f.previous_content = None;
            Ok(f)
        })
        .collect()
}

fn validation_detail(report: &ValidationReport, validators: &[&str]) -> Result<serde_json::Value, GuardError> {
    Ok(json!({
        "overall_severity": report.overall_severity,
        "requires_approval": report.requires_approval,
        "counts": {
            "critical": report.count_at(Severity::Critical),
            "high": report.count_at(Severity::High),
            "medium": report.count_at(Severity::Medium),
            "low": report.count_at(Severity::Low),
        },
        "rules_version": report.rules_version,
        "report_digest": report.digest()?,
        "validators": validators,
        "findings": report.findings.iter().map(|f| json!({
            "severity": f.severity,
            "kind": f.kind,
            "source": f.source_validator,
            "location": f.location,
            "verified": f.verified,
        })).collect::<Vec<_>>(),
    }))
}
