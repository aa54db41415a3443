//! Centralized database schema definitions.
//!
//! changeguard keeps one SQLite database (`guard.db`) for durable state that
//! has to survive between CLI invocations:
//! 1. change_groups: submitted groups, their validation report and status.
//! 2. approvals: approval/rejection decisions (append-only ledger).
//! 3. backups: verified database backups taken before destructive operations.
//!
//! The audit trail is a separate append-only JSONL file.

pub const GUARD_DB_NAME: &str = "guard.db";
pub const AUDIT_LOG_NAME: &str = "audit.events.jsonl";

pub const GUARD_DB_SCHEMA_GROUPS: &str = "
    CREATE TABLE IF NOT EXISTS change_groups (
        group_id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        status TEXT NOT NULL,
        group_json TEXT NOT NULL,
        report_json TEXT NOT NULL,
        report_digest TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

pub const GUARD_DB_SCHEMA_APPROVALS: &str = "
    CREATE TABLE IF NOT EXISTS approvals (
        approval_id TEXT PRIMARY KEY,
        group_id TEXT NOT NULL,
        approver TEXT NOT NULL,
        decision TEXT NOT NULL,
        reason TEXT,
        ts TEXT NOT NULL
    )
";
pub const GUARD_DB_SCHEMA_APPROVALS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_approvals_group ON approvals(group_id)";

pub const GUARD_DB_SCHEMA_BACKUPS: &str = "
    CREATE TABLE IF NOT EXISTS backups (
        backup_id TEXT PRIMARY KEY,
        source TEXT NOT NULL,
        path TEXT NOT NULL,
        sha256 TEXT NOT NULL,
        bytes INTEGER NOT NULL,
        created_at TEXT NOT NULL
    )
";

pub fn all() -> [&'static str; 4] {
    [
        GUARD_DB_SCHEMA_GROUPS,
        GUARD_DB_SCHEMA_APPROVALS,
        GUARD_DB_SCHEMA_APPROVALS_INDEX,
        GUARD_DB_SCHEMA_BACKUPS,
    ]
}
