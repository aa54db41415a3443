use changeguard::core::finding::Severity;
use changeguard::core::group::{FileChange, GroupStatus};
use changeguard::core::rules::RuleConfig;
use changeguard::core::service::ChangeGuard;
use changeguard::plugins::security::SecurityValidator;
use tempfile::tempdir;

fn validator() -> SecurityValidator {
    SecurityValidator::from_rules(&RuleConfig::builtin().unwrap().security).unwrap()
}

fn kinds(path: &str, code: &str) -> Vec<String> {
    validator()
        .check(path, code)
        .into_iter()
        .map(|f| f.kind)
        .collect()
}

#[test]
fn injection_in_a_handler_is_critical_and_held() {
    let tmp = tempdir().unwrap();
    let guard = ChangeGuard::open(tmp.path()).unwrap();
    let code = concat!(
        "app.use(csrf());\n",
        "app.get('/users', requireAuth, async (req, res) => {\n",
        "  const rows = await db.query(`SELECT * FROM users WHERE name = '${req.query.name}'`);\n",
        "  res.json(rows);\n",
        "});\n",
    );

    let id = guard
        .submit_change_group("agent", vec![FileChange::create("src/routes/users.js", code)])
        .unwrap();
    let report = guard.get_validation_report(&id).unwrap();

    assert_eq!(report.overall_severity, Severity::Critical);
    let finding = report
        .findings
        .iter()
        .find(|f| f.kind == "sql_injection")
        .unwrap();
    assert_eq!(finding.source_validator, "security");
    assert_eq!(finding.location.as_ref().and_then(|l| l.line), Some(3));
    assert_eq!(guard.group_status(&id).unwrap(), GroupStatus::NeedsApproval);
}

#[test]
fn auth_is_only_missing_when_no_guard_of_any_kind_is_present() {
    let bare = kinds("api.js", "router.delete('/api/items/:id', handler);");
    assert!(bare.contains(&"missing_auth".to_string()));

    let rate_limited = kinds(
        "api.js",
        "router.delete('/api/items/:id', rateLimit({ max: 5 }), handler);",
    );
    assert!(!rate_limited.contains(&"missing_auth".to_string()));
}

#[test]
fn read_only_routes_do_not_need_csrf() {
    let found = kinds("api.js", "app.get('/api/items', requireAuth, handler);");
    assert!(found.is_empty(), "{found:?}");
}

#[test]
fn clean_change_auto_passes() {
    let tmp = tempdir().unwrap();
    let guard = ChangeGuard::open(tmp.path()).unwrap();
    let code = "import bcrypt from 'bcrypt';\nexport const hash = (pw) => bcrypt.hash(pw, 12);\n";

    let report = guard
        .scan(vec![FileChange::create("src/auth/hash.js", code)])
        .unwrap();
    assert!(report.findings.is_empty(), "{:?}", report.findings);
    assert!(!report.requires_approval);
}
