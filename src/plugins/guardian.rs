//! Database Guardian
//!
//! Classifies SQL by blast radius and gates destructive statements:
//! - `DROP` / `TRUNCATE` are Critical
//! - unscoped `DELETE` and schema `ALTER` are High
//! - unscoped `UPDATE` is Medium
//! - reads and scoped writes are Low
//!
//! High and Critical statements need an approver and a verified backup before
//! they run. A development process is never allowed to touch a production
//! target. Every guarded operation is audited, whether it ran or was blocked.

use crate::core::audit::{AuditRecord, AuditSink, stage};
use crate::core::error::GuardError;
use crate::core::finding::{FileUnderReview, Severity, ValidationFinding, Validator};
use crate::core::rules::{self, DatabaseRules, RuleConfig};
use crate::plugins::backup::{BackupManager, BackupRecord, DatabaseTarget};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, LazyLock};

pub const NAME: &str = "database_guardian";

static LINE_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--[^\n]*").expect("static regex"));
static BLOCK_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("static regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));
static CLAUSE_TAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(RETURNING|ORDER\s+BY|LIMIT|GROUP\s+BY)\b").expect("static regex")
});
static CTE_BODY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(DELETE|UPDATE|INSERT)\b").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Environment::Development),
            "staging" | "stage" => Some(Environment::Staging),
            "production" | "prod" => Some(Environment::Production),
            _ => None,
        }
    }
}

/// Who is running a statement, from where, against what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbContext {
    pub actor: String,
    pub invoking_env: Environment,
    pub connection_target: String,
}

impl DbContext {
    pub fn new(actor: &str, invoking_env: Environment, target: &dyn DatabaseTarget) -> Self {
        Self {
            actor: actor.to_string(),
            invoking_env,
            connection_target: target.connection_target(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub severity: Severity,
    pub rows_affected: u64,
    pub backup: Option<BackupRecord>,
}

pub struct DatabaseGuardian {
    critical: Regex,
    schema_alter: Regex,
    read_only: Regex,
    tautologies: Vec<Regex>,
    production_markers: Vec<String>,
    embedded_sql: Regex,
}

impl DatabaseGuardian {
    pub fn from_rules(r: &DatabaseRules) -> Result<Self, GuardError> {
        Ok(Self {
            critical: rules::compile(&r.critical_pattern)?,
            schema_alter: rules::compile(&r.schema_alter_pattern)?,
            read_only: rules::compile(&r.read_only_pattern)?,
            tautologies: rules::compile_all(&r.tautology_patterns)?,
            production_markers: r
                .production_markers
                .iter()
                .map(|m| m.to_ascii_lowercase())
                .collect(),
            embedded_sql: rules::compile(&r.embedded_sql_pattern)?,
        })
    }

    pub fn builtin() -> Result<Self, GuardError> {
        Self::from_rules(&RuleConfig::builtin()?.database)
    }

    /// Highest severity over every statement in `sql`.
    pub fn classify(&self, sql: &str) -> Severity {
        statements(sql)
            .iter()
            .map(|stmt| self.classify_statement(stmt))
            .max()
            .unwrap_or(Severity::Low)
    }

    fn classify_statement(&self, stmt: &str) -> Severity {
        if stmt.starts_with("WITH ") {
            return match CTE_BODY.find(stmt) {
                Some(m) => self.classify_statement(&stmt[m.start()..]),
                None => Severity::Low,
            };
        }
        if self.critical.is_match(stmt) {
            return Severity::Critical;
        }
        if self.schema_alter.is_match(stmt) {
            return Severity::High;
        }
        if stmt.starts_with("DELETE ") || stmt == "DELETE" {
            return if self.is_scoped(stmt) {
                Severity::Low
            } else {
                Severity::High
            };
        }
        if stmt.starts_with("UPDATE ") {
            return if self.is_scoped(stmt) {
                Severity::Low
            } else {
                Severity::Medium
            };
        }
        Severity::Low
    }

    /// True when every statement only reads.
    pub fn is_read_only(&self, sql: &str) -> bool {
        let stmts = statements(sql);
        !stmts.is_empty() && stmts.iter().all(|s| self.read_only.is_match(s))
    }

    /// A top-level WHERE clause that is present and not a tautology. A WHERE
    /// inside a subquery scopes the subquery, not the statement.
    fn is_scoped(&self, stmt: &str) -> bool {
        let Some(mut clause) = top_level_where(stmt) else {
            return false;
        };
        if let Some(tail) = CLAUSE_TAIL.find(clause) {
            clause = &clause[..tail.start()];
        }
        let mut clause = clause.trim();
        while clause.starts_with('(') && clause.ends_with(')') {
            clause = clause[1..clause.len() - 1].trim();
        }
        !clause.is_empty() && !self.tautologies.iter().any(|t| t.is_match(clause))
    }

    pub fn requires_approval(&self, severity: Severity) -> bool {
        severity >= Severity::High
    }

    /// Environment a connection target points at, from its name tokens.
    pub fn target_environment(&self, connection_target: &str) -> Environment {
        let lowered = connection_target.to_ascii_lowercase();
        let production = lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| self.production_markers.iter().any(|m| m == token));
        if production {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    /// Rejects a development process reaching a production target.
    pub fn cross_environment_check(&self, ctx: &DbContext) -> Result<(), GuardError> {
        let target_env = self.target_environment(&ctx.connection_target);
        if target_env == Environment::Production && ctx.invoking_env == Environment::Development {
            return Err(GuardError::ValidationFailure(format!(
                "cross-environment access: {} context may not operate on production target {}",
                ctx.invoking_env.as_str(),
                ctx.connection_target
            )));
        }
        Ok(())
    }

    /// Classifies, gates, backs up when needed, then executes `sql` against
    /// `target`. Blocks are returned as errors and audited like successes.
    pub fn guard_operation(
        &self,
        target: &Arc<dyn DatabaseTarget>,
        sql: &str,
        ctx: &DbContext,
        approver: Option<&str>,
        backups: &BackupManager,
        audit: &AuditSink,
    ) -> Result<OperationOutcome, GuardError> {
        let severity = self.classify(sql);
        let log = |outcome: &str, detail: serde_json::Value| {
            log_operation(audit, target.name(), ctx, sql, severity, approver, outcome, detail);
        };

        if let Err(e) = self.cross_environment_check(ctx) {
            log("blocked", json!({ "reason": e.to_string() }));
            return Err(e);
        }

        let gated = self.requires_approval(severity);
        if gated && approver.is_none() {
            let e = GuardError::ValidationFailure(format!(
                "{severity} database operation requires approval"
            ));
            log("blocked", json!({ "reason": e.to_string() }));
            return Err(e);
        }

        let backup = if gated {
            match backups.create_backup(target, severity.as_str()) {
                Ok(record) => Some(record),
                Err(e) => {
                    log("blocked", json!({ "reason": e.to_string(), "stage": stage::BACKUP }));
                    return Err(e);
                }
            }
        } else {
            None
        };

        match target.execute(sql) {
            Ok(rows_affected) => {
                log(
                    "executed",
                    json!({
                        "rows_affected": rows_affected,
                        "backup_id": backup.as_ref().map(|b| b.id.clone()),
                    }),
                );
                Ok(OperationOutcome {
                    severity,
                    rows_affected,
                    backup,
                })
            }
            Err(e) => {
                log("failed", json!({ "reason": e.to_string() }));
                Err(e)
            }
        }
    }

    fn scan(&self, file: &FileUnderReview<'_>) -> Vec<ValidationFinding> {
        let mut findings = Vec::new();
        let mut flag = |sql: &str, offset: usize| {
            let severity = self.classify(sql);
            if severity > Severity::Low {
                let excerpt: String = collapse(sql).chars().take(80).collect();
                findings.push(
                    ValidationFinding::new(
                        severity,
                        "database_risk",
                        format!("{severity} database statement: {excerpt}"),
                        NAME,
                    )
                    .at(file.path, Some(line_of(file.content, offset))),
                );
            }
        };

        match file.extension() {
            "sql" => {
                for (offset, raw) in split_statements(file.content) {
                    flag(raw, offset);
                }
            }
            "md" | "txt" | "rst" => {}
            _ => {
                for caps in self.embedded_sql.captures_iter(file.content) {
                    if let Some(m) = caps.get(1) {
                        flag(m.as_str(), m.start());
                    }
                }
            }
        }
        findings
    }
}

impl Validator for DatabaseGuardian {
    fn name(&self) -> &'static str {
        NAME
    }

    fn validate(&self, file: &FileUnderReview<'_>) -> Vec<ValidationFinding> {
        self.scan(file)
    }
}

#[allow(clippy::too_many_arguments)]
fn log_operation(
    audit: &AuditSink,
    target_name: &str,
    ctx: &DbContext,
    sql: &str,
    severity: Severity,
    approver: Option<&str>,
    outcome: &str,
    mut detail: serde_json::Value,
) {
    if let Some(obj) = detail.as_object_mut() {
        obj.insert("sql".to_string(), json!(sql));
        obj.insert("severity".to_string(), json!(severity));
        obj.insert("approver".to_string(), json!(approver));
        obj.insert("invoking_env".to_string(), json!(ctx.invoking_env));
        obj.insert("connection_target".to_string(), json!(ctx.connection_target));
    }
    if outcome == "executed" {
        tracing::info!(target_db = target_name, %severity, "guarded database operation executed");
    } else {
        tracing::warn!(target_db = target_name, %severity, outcome, "guarded database operation not executed");
    }
    audit.record(
        AuditRecord::new(&ctx.actor, &format!("db:{target_name}"), stage::DATABASE, outcome)
            .detail(detail),
    );
}

/// Raw statements with their byte offset (first non-blank character).
/// Semicolons inside string literals and comments do not split.
fn split_statements(sql: &str) -> Vec<(usize, &str)> {
    let mut bounds: Vec<usize> = code_bytes(sql)
        .into_iter()
        .filter(|c| c.byte == b';')
        .map(|c| c.offset)
        .collect();
    bounds.push(sql.len());

    let mut out = Vec::new();
    let mut start = 0;
    for end in bounds {
        let piece = &sql[start..end];
        let lead = piece.len() - piece.trim_start().len();
        if !piece.trim().is_empty() {
            out.push((start + lead, piece));
        }
        start = end + 1;
    }
    out
}

/// Text after the first WHERE keyword at parenthesis depth zero.
fn top_level_where(stmt: &str) -> Option<&str> {
    let bytes = stmt.as_bytes();
    code_bytes(stmt)
        .into_iter()
        .find(|c| c.depth == 0 && keyword_at(bytes, c.offset, b"WHERE"))
        .map(|c| &stmt[c.offset + 5..])
}

struct CodeByte {
    offset: usize,
    byte: u8,
    depth: usize,
}

/// Bytes of `sql` outside string literals, quoted identifiers and comments,
/// with the parenthesis depth they sit at.
fn code_bytes(sql: &str) -> Vec<CodeByte> {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Code,
        Quoted(u8),
        LineComment,
        BlockComment,
    }
    let bytes = sql.as_bytes();
    let mut state = State::Code;
    let mut depth = 0usize;
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        match state {
            State::Quoted(q) if b == q => state = State::Code,
            State::Quoted(_) => {}
            State::LineComment if b == b'\n' => state = State::Code,
            State::LineComment => {}
            State::BlockComment if b == b'*' && next == Some(b'/') => {
                state = State::Code;
                i += 1;
            }
            State::BlockComment => {}
            State::Code => match b {
                b'\'' | b'"' | b'`' => state = State::Quoted(b),
                b'-' if next == Some(b'-') => state = State::LineComment,
                b'/' if next == Some(b'*') => {
                    state = State::BlockComment;
                    i += 1;
                }
                b'(' => {
                    out.push(CodeByte { offset: i, byte: b, depth });
                    depth += 1;
                }
                b')' => {
                    depth = depth.saturating_sub(1);
                    out.push(CodeByte { offset: i, byte: b, depth });
                }
                _ => out.push(CodeByte { offset: i, byte: b, depth }),
            },
        }
        i += 1;
    }
    out
}

fn keyword_at(bytes: &[u8], at: usize, keyword: &[u8]) -> bool {
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    bytes.len() >= at + keyword.len()
        && bytes[at..at + keyword.len()].eq_ignore_ascii_case(keyword)
        && (at == 0 || !is_word(bytes[at - 1]))
        && bytes.get(at + keyword.len()).is_none_or(|&b| !is_word(b))
}

/// Normalized statements: comments stripped, whitespace collapsed, uppercased.
fn statements(sql: &str) -> Vec<String> {
    let stripped = BLOCK_COMMENT.replace_all(sql, " ");
    let stripped = LINE_COMMENT.replace_all(&stripped, " ");
    split_statements(&stripped)
        .into_iter()
        .map(|(_, raw)| collapse(raw).to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn collapse(sql: &str) -> String {
    WHITESPACE.replace_all(sql.trim(), " ").into_owned()
}

fn line_of(content: &str, offset: usize) -> usize {
    content[..offset].bytes().filter(|b| *b == b'\n').count() + 1
}
