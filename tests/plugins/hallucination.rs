use changeguard::core::finding::Severity;
use changeguard::core::group::{FileChange, GroupStatus};
use changeguard::core::service::ChangeGuard;
use changeguard::core::store::Store;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

/// Workspace whose config points at a package list and a route table.
fn guard_with_catalogs(workspace: &Path) -> ChangeGuard {
    let store = Store::for_workspace(workspace);
    store.ensure().unwrap();
    fs::write(store.root.join("packages.txt"), "# npm\nexpress\nzod\n\n# pypi\nrequests\n").unwrap();
    fs::write(
        store.root.join("routes.txt"),
        "GET /api/users\nPOST /api/users/:id/avatar\n",
    )
    .unwrap();
    fs::write(
        store.config_path(),
        "registry_file = \"packages.txt\"\nroutes_file = \"routes.txt\"\n",
    )
    .unwrap();
    ChangeGuard::open(workspace).unwrap()
}

#[test]
fn invented_package_holds_the_group() {
    let tmp = tempdir().unwrap();
    let guard = guard_with_catalogs(tmp.path());

    let id = guard
        .submit_change_group(
            "agent",
            vec![FileChange::create(
                "src/server.js",
                "import express from 'express';\nimport magic from 'express-auto-magic';\n",
            )],
        )
        .unwrap();
    let report = guard.get_validation_report(&id).unwrap();

    assert_eq!(report.overall_severity, Severity::High);
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].kind, "missing_package");
    assert!(report.findings[0].message.contains("express-auto-magic"));
    assert_eq!(guard.group_status(&id).unwrap(), GroupStatus::NeedsApproval);
}

#[test]
fn known_routes_pass_and_unknown_routes_are_flagged() {
    let tmp = tempdir().unwrap();
    let guard = guard_with_catalogs(tmp.path());

    let known = guard
        .scan(vec![FileChange::create(
            "web/api.ts",
            "await fetch('/api/users');\nawait axios.post(`/api/users/${id}/avatar`, form);\n",
        )])
        .unwrap();
    assert!(known.findings.is_empty(), "{:?}", known.findings);

    let unknown = guard
        .scan(vec![FileChange::create("web/api.ts", "await fetch('/api/user-profiles');\n")])
        .unwrap();
    assert_eq!(unknown.findings.len(), 1);
    assert_eq!(unknown.findings[0].kind, "missing_endpoint");
    assert!(unknown.findings[0].message.contains("GET /api/user-profiles"));
}

#[test]
fn fabricated_and_impossible_data_is_medium_and_auto_passes() {
    let tmp = tempdir().unwrap();
    let guard = guard_with_catalogs(tmp.path());

    let id = guard
        .submit_change_group(
            "agent",
            vec![FileChange::create(
                "fixtures/users.json",
                r#"{"email": "test@example.com", "createdAt": "2999-12-31", "age": -4}"#,
            )],
        )
        .unwrap();
    let report = guard.get_validation_report(&id).unwrap();

    assert_eq!(report.overall_severity, Severity::Medium);
    let kinds: Vec<&str> = report.findings.iter().map(|f| f.kind.as_str()).collect();
    assert!(kinds.contains(&"fabricated_data"));
    assert!(kinds.contains(&"temporal_impossibility"));
    assert!(kinds.contains(&"numeric_impossibility"));
    assert_eq!(guard.group_status(&id).unwrap(), GroupStatus::Validated);
}

#[test]
fn without_catalogs_imports_are_not_guessed_at() {
    let tmp = tempdir().unwrap();
    let guard = ChangeGuard::open(tmp.path()).unwrap();

    let report = guard
        .scan(vec![FileChange::create(
            "tool.py",
            "import definitely_not_real\nfrom somewhere import thing\n",
        )])
        .unwrap();
    assert!(report.findings.is_empty());
}
