use changeguard::core::audit::AuditFilter;
use changeguard::core::error::GuardError;
use changeguard::core::finding::Severity;
use changeguard::core::group::{FileChange, GroupStatus};
use changeguard::core::service::ChangeGuard;
use changeguard::core::store::Store;
use changeguard::plugins::backup::{DatabaseTarget, SqliteTarget};
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn seeded_db(path: &Path) -> Arc<dyn DatabaseTarget> {
    Connection::open(path)
        .unwrap()
        .execute_batch(
            "CREATE TABLE users(id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO users(name) VALUES ('ada'), ('grace'), ('linus');",
        )
        .unwrap();
    Arc::new(SqliteTarget::new(path))
}

fn row_count(path: &Path) -> i64 {
    Connection::open(path)
        .unwrap()
        .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
        .unwrap()
}

#[test]
fn unscoped_delete_is_blocked_without_approver() {
    let tmp = tempdir().unwrap();
    let guard = ChangeGuard::open(tmp.path()).unwrap();
    let db = tmp.path().join("app.db");
    let target = seeded_db(&db);

    let err = guard
        .guard_database_operation(&target, "DELETE FROM users", "agent", None)
        .unwrap_err();
    assert!(matches!(err, GuardError::ValidationFailure(_)));
    assert_eq!(row_count(&db), 3);
    assert!(guard.backups().list().unwrap().is_empty());
}

#[test]
fn approved_delete_runs_after_a_restorable_backup() {
    let tmp = tempdir().unwrap();
    let guard = ChangeGuard::open(tmp.path()).unwrap();
    let db = tmp.path().join("app.db");
    let target = seeded_db(&db);

    let outcome = guard
        .guard_database_operation(&target, "DELETE FROM users", "agent", Some("dba"))
        .unwrap();
    assert_eq!(outcome.severity, Severity::High);
    assert_eq!(outcome.rows_affected, 3);
    assert_eq!(row_count(&db), 0);

    let backup = outcome.backup.unwrap();
    assert!(backup.id.starts_with("bk_"));
    assert_eq!(row_count(&backup.path), 3);
    assert_eq!(guard.backups().list().unwrap(), vec![backup.clone()]);

    let entries = guard
        .get_audit_trail(&AuditFilter {
            stage: Some("database".to_string()),
            ..AuditFilter::default()
        })
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, "executed");
    assert_eq!(entries[0].detail["backup_id"], backup.id.as_str());
}

#[test]
fn scoped_statements_skip_backup() {
    let tmp = tempdir().unwrap();
    let guard = ChangeGuard::open(tmp.path()).unwrap();
    let db = tmp.path().join("app.db");
    let target = seeded_db(&db);

    let outcome = guard
        .guard_database_operation(&target, "DELETE FROM users WHERE id = 1", "agent", None)
        .unwrap();
    assert_eq!(outcome.severity, Severity::Low);
    assert_eq!(outcome.rows_affected, 1);
    assert!(outcome.backup.is_none());
}

#[test]
fn production_target_is_refused_from_development() {
    let tmp = tempdir().unwrap();
    let db = tmp.path().join("prod.db");
    let target = seeded_db(&db);

    let dev = ChangeGuard::open(tmp.path()).unwrap();
    let err = dev
        .guard_database_operation(&target, "SELECT * FROM users", "agent", None)
        .unwrap_err();
    assert!(err.to_string().contains("cross-environment"));
    drop(dev);

    let store = Store::for_workspace(tmp.path());
    fs::write(store.config_path(), "environment = \"production\"\n").unwrap();
    let prod = ChangeGuard::open(tmp.path()).unwrap();
    let outcome = prod
        .guard_database_operation(&target, "UPDATE users SET name = 'ada l.' WHERE id = 1", "agent", None)
        .unwrap();
    assert_eq!(outcome.rows_affected, 1);
}

#[test]
fn destructive_migration_in_a_change_group_needs_approval() {
    let tmp = tempdir().unwrap();
    let guard = ChangeGuard::open(tmp.path()).unwrap();

    let id = guard
        .submit_change_group(
            "agent",
            vec![FileChange::create(
                "migrations/0007_cleanup.sql",
                "-- remove the old table\nDROP TABLE sessions;\n",
            )],
        )
        .unwrap();
    let report = guard.get_validation_report(&id).unwrap();

    assert_eq!(report.overall_severity, Severity::Critical);
    assert_eq!(report.findings[0].source_validator, "database_guardian");
    assert_eq!(guard.group_status(&id).unwrap(), GroupStatus::NeedsApproval);
}
