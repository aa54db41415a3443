//! ChangeGuard: safety gates and all-or-nothing apply for machine-proposed
//! changes.
//!
//! A proposed set of file edits (a *change group*) is validated by a
//! pipeline of validators, held at an approval gate when the findings are
//! severe enough, and finally applied atomically: either every file is
//! written and the post-apply diagnostics show no regressions, or every
//! file is restored byte-for-byte.
//!
//! # Validators
//!
//! - `security`: hardcoded secrets, SQL injection, XSS, missing CSRF and
//!   auth guards, weak password handling
//! - `hallucination`: imports of packages that do not exist, calls to
//!   endpoints the project does not serve, fabricated or impossible data
//! - `database_guardian`: destructive SQL embedded in proposed code
//!
//! Database statements run directly (outside change groups) go through the
//! same guardian, which refuses cross-environment access and takes a
//! verified backup before anything destructive.
//!
//! # State
//!
//! Everything lives under `<workspace>/.changeguard/`: the group and
//! approval ledger (`guard.db`), the append-only audit log, write-ahead
//! apply manifests (`pending/`) and database backups.
//!
//! ```bash
//! changeguard submit --request changes.json
//! changeguard report --group 01J...
//! changeguard approve --group 01J... --approver alice --reason "reviewed"
//! changeguard apply --group 01J...
//! ```

pub mod core;
pub mod logging;
pub mod plugins;

use crate::core::applier::ApplyStatus;
use crate::core::audit::AuditFilter;
use crate::core::error::GuardError;
use crate::core::group::{FileChange, FileOp};
use crate::core::service::ChangeGuard;
use crate::core::time::command_envelope;
use crate::plugins::backup::{DatabaseTarget, SqliteTarget};

use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(
    name = "changeguard",
    version = env!("CARGO_PKG_VERSION"),
    about = "Validate, gate and atomically apply proposed changes"
)]
struct Cli {
    /// Workspace the change groups apply to (defaults to the current directory).
    #[clap(long, global = true)]
    workspace: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a set of proposed edits and record it as a change group.
    Submit {
        /// JSON array of `{path, op, content}` objects, or `-` for stdin.
        #[clap(long)]
        request: String,
        #[clap(long, default_value = "agent")]
        actor: String,
    },
    /// Show the validation report of a group.
    Report {
        #[clap(long)]
        group: String,
    },
    /// List known change groups and their status.
    Groups,
    /// Approve a group held at the gate.
    Approve {
        #[clap(long)]
        group: String,
        #[clap(long)]
        approver: String,
        #[clap(long)]
        reason: Option<String>,
    },
    /// Reject a group; it can never be applied afterwards.
    Reject {
        #[clap(long)]
        group: String,
        #[clap(long, default_value = "operator")]
        actor: String,
        #[clap(long)]
        reason: String,
    },
    /// Cancel a group that has not started applying.
    Cancel {
        #[clap(long)]
        group: String,
        #[clap(long, default_value = "agent")]
        actor: String,
    },
    /// Apply a validated or approved group atomically.
    Apply {
        #[clap(long)]
        group: String,
        #[clap(long, default_value = "agent")]
        actor: String,
    },
    /// Query the audit trail.
    Audit {
        #[clap(long)]
        group: Option<String>,
        #[clap(long)]
        stage: Option<String>,
        #[clap(long)]
        actor: Option<String>,
        #[clap(long)]
        outcome: Option<String>,
    },
    /// Roll back applies interrupted by a crash.
    Recover {
        #[clap(long, default_value = "operator")]
        actor: String,
    },
    /// Classify the risk of a SQL statement without running it.
    Classify {
        #[clap(long)]
        sql: String,
    },
    /// Validate proposed edits without recording a group.
    Scan {
        #[clap(long)]
        request: String,
    },
    /// Run SQL against a SQLite database through the database guardian.
    DbExec {
        #[clap(long)]
        db: PathBuf,
        #[clap(long)]
        sql: String,
        #[clap(long, default_value = "agent")]
        actor: String,
        /// Required for high and critical statements.
        #[clap(long)]
        approver: Option<String>,
    },
    /// List database backups taken by the guardian.
    Backups,
    /// Print the audit and ledger storage schemas.
    Schema,
}

/// One entry of a submit/scan request file.
#[derive(Debug, Deserialize)]
struct ChangeRequest {
    path: String,
    op: FileOp,
    #[serde(default)]
    content: String,
}

impl From<ChangeRequest> for FileChange {
    fn from(req: ChangeRequest) -> Self {
        match req.op {
            FileOp::Create => FileChange::create(&req.path, req.content),
            FileOp::Modify => FileChange::modify(&req.path, req.content),
            FileOp::Delete => FileChange::delete(&req.path),
        }
    }
}

fn read_request(source: &str) -> Result<Vec<FileChange>, GuardError> {
    let raw = if source == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(source)?
    };
    let requests: Vec<ChangeRequest> = serde_json::from_str(&raw)?;
    Ok(requests.into_iter().map(FileChange::from).collect())
}

fn emit(cmd: &str, status: &str, extra: serde_json::Value) -> Result<(), GuardError> {
    println!(
        "{}",
        serde_json::to_string_pretty(&command_envelope(cmd, status, extra))?
    );
    Ok(())
}

fn resolve_workspace(raw: Option<PathBuf>) -> Result<PathBuf, GuardError> {
    match raw {
        Some(p) => Ok(p),
        None => Ok(std::env::current_dir()?),
    }
}

/// Parses arguments and runs one command. JSON envelopes go to stdout; the
/// exit code is non-zero when a group was not applied.
pub fn run() -> Result<ExitCode, GuardError> {
    let cli = Cli::parse();
    let workspace = resolve_workspace(cli.workspace)?;

    // Classification needs no store.
    if let Command::Classify { sql } = &cli.command {
        classify(sql)?;
        return Ok(ExitCode::SUCCESS);
    }

    let guard = ChangeGuard::open(&workspace)?;
    run_command(&guard, &workspace, cli.command)
}

fn classify(sql: &str) -> Result<(), GuardError> {
    let guardian = crate::plugins::guardian::DatabaseGuardian::builtin()?;
    let severity = guardian.classify(sql);
    emit(
        "classify",
        "ok",
        json!({
            "severity": severity,
            "requires_approval": guardian.requires_approval(severity),
            "read_only": guardian.is_read_only(sql),
        }),
    )
}

fn run_command(guard: &ChangeGuard, workspace: &Path, command: Command) -> Result<ExitCode, GuardError> {
    match command {
        Command::Submit { request, actor } => {
            let files = read_request(&request)?;
            let group_id = guard.submit_change_group(&actor, files)?;
            let report = guard.get_validation_report(&group_id)?;
            emit(
                "submit",
                "ok",
                json!({
                    "group_id": group_id,
                    "group_status": guard.group_status(&group_id)?,
                    "report": report,
                }),
            )?;
        }
        Command::Report { group } => {
            let report = guard.get_validation_report(&group)?;
            emit(
                "report",
                "ok",
                json!({ "group_status": guard.group_status(&group)?, "report": report }),
            )?;
        }
        Command::Groups => {
            emit("groups", "ok", json!({ "groups": guard.list_groups()? }))?;
        }
        Command::Approve {
            group,
            approver,
            reason,
        } => {
            let decision = guard.approve(&group, &approver, reason.as_deref())?;
            emit("approve", "ok", json!({ "decision": decision }))?;
        }
        Command::Reject { group, actor, reason } => {
            let decision = guard.reject(&group, &actor, &reason)?;
            emit("reject", "ok", json!({ "decision": decision }))?;
        }
        Command::Cancel { group, actor } => {
            let outcome = guard.cancel(&group, &actor)?;
            emit("cancel", "ok", json!({ "result": outcome }))?;
        }
        Command::Apply { group, actor } => {
            let outcome = guard.apply(&group, &actor)?;
            if outcome.partial_rollback {
                use colored::Colorize;
                eprintln!(
                    "{} group {} could not be fully restored; manual repair needed for: {}",
                    "PARTIAL ROLLBACK".bright_red().bold(),
                    outcome.group_id,
                    outcome.unrestored.join(", ")
                );
            }
            let applied = outcome.status == ApplyStatus::Applied;
            emit(
                "apply",
                if applied { "ok" } else { "not_applied" },
                json!({ "outcome": outcome }),
            )?;
            if !applied {
                return Ok(ExitCode::from(2));
            }
        }
        Command::Audit {
            group,
            stage,
            actor,
            outcome,
        } => {
            let filter = AuditFilter {
                group_id: group,
                stage,
                actor,
                outcome,
            };
            emit("audit", "ok", json!({ "entries": guard.get_audit_trail(&filter)? }))?;
        }
        Command::Recover { actor } => {
            let reports = guard.recover(&actor)?;
            emit("recover", "ok", json!({ "recovered": reports }))?;
        }
        Command::Scan { request } => {
            let report = guard.scan(read_request(&request)?)?;
            emit("scan", "ok", json!({ "report": report }))?;
        }
        Command::DbExec {
            db,
            sql,
            actor,
            approver,
        } => {
            let path = if db.is_absolute() { db } else { workspace.join(db) };
            let target: Arc<dyn DatabaseTarget> = Arc::new(SqliteTarget::new(path));
            match guard.guard_database_operation(&target, &sql, &actor, approver.as_deref()) {
                Ok(outcome) => emit("db-exec", "ok", json!({ "outcome": outcome }))?,
                Err(e @ (GuardError::ValidationFailure(_) | GuardError::BackupFailure(_))) => {
                    emit("db-exec", "blocked", json!({ "error": e.to_string() }))?;
                    return Ok(ExitCode::from(2));
                }
                Err(e) => return Err(e),
            }
        }
        Command::Backups => {
            emit("backups", "ok", json!({ "backups": guard.backups().list()? }))?;
        }
        Command::Schema => {
            emit(
                "schema",
                "ok",
                json!({ "audit": crate::core::audit::schema(), "ledger": crate::core::schemas::all() }),
            )?;
        }
        Command::Classify { sql } => classify(&sql)?,
    }
    Ok(ExitCode::SUCCESS)
}
