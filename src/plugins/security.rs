//! Security Validator
//!
//! Static pattern checks over proposed source:
//! - String-built SQL (possible injection)
//! - Unescaped output into HTML (XSS)
//! - Mutating routes without CSRF enforcement
//! - Hardcoded secrets (known key formats, plus entropy on secret-named literals)
//! - Routes without authentication or rate-limit middleware
//! - Plaintext or weak-hash password handling
//!
//! Every check is independent and side-effect free.

use crate::core::error::GuardError;
use crate::core::finding::{FileUnderReview, Severity, ValidationFinding, Validator};
use crate::core::rules::{self, RuleConfig, SecurityRules};
use regex::Regex;

pub const NAME: &str = "security";

pub struct SecurityValidator {
    secret_patterns: Vec<Regex>,
    secret_assignment: Regex,
    entropy_threshold: f64,
    min_secret_length: usize,
    sql_concat: Vec<Regex>,
    xss: Vec<Regex>,
    route: Regex,
    mutating_methods: Vec<String>,
    csrf_markers: Vec<String>,
    auth_markers: Vec<String>,
    rate_limit_markers: Vec<String>,
    global_middleware: Regex,
    weak_password: Vec<Regex>,
    plaintext_password: Vec<Regex>,
}

impl SecurityValidator {
    pub fn from_rules(r: &SecurityRules) -> Result<Self, GuardError> {
        Ok(Self {
            secret_patterns: rules::compile_all(&r.secret_patterns)?,
            secret_assignment: rules::compile(&r.secret_assignment_pattern)?,
            entropy_threshold: r.entropy_threshold,
            min_secret_length: r.min_secret_length,
            sql_concat: rules::compile_all(&r.sql_concat_patterns)?,
            xss: rules::compile_all(&r.xss_patterns)?,
            route: rules::compile(&r.route_pattern)?,
            mutating_methods: lowercased(&r.mutating_methods),
            csrf_markers: lowercased(&r.csrf_markers),
            auth_markers: lowercased(&r.auth_markers),
            rate_limit_markers: lowercased(&r.rate_limit_markers),
            global_middleware: rules::compile(&r.global_middleware_pattern)?,
            weak_password: rules::compile_all(&r.weak_password_patterns)?,
            plaintext_password: rules::compile_all(&r.plaintext_password_patterns)?,
        })
    }

    pub fn builtin() -> Result<Self, GuardError> {
        Self::from_rules(&RuleConfig::builtin()?.security)
    }

    /// Runs every check over `code`, attributing findings to `path`.
    pub fn check(&self, path: &str, code: &str) -> Vec<ValidationFinding> {
        let mut findings = Vec::new();
        let global = self.global_middleware(code);

        for (idx, line) in code.lines().enumerate() {
            let line_no = Some(idx + 1);
            let mut push = |severity, kind: &str, message: String| {
                findings.push(ValidationFinding::new(severity, kind, message, NAME).at(path, line_no));
            };

            if let Some(p) = self.sql_concat.iter().find(|p| p.is_match(line)) {
                push(
                    Severity::Critical,
                    "sql_injection",
                    format!("SQL built by string concatenation/interpolation ({})", p.as_str()),
                );
            }

            if let Some(p) = self.xss.iter().find(|p| p.is_match(line)) {
                push(
                    Severity::High,
                    "xss",
                    format!("unescaped output into HTML context ({})", p.as_str()),
                );
            }

            if let Some(message) = self.secret_on_line(line) {
                push(Severity::Critical, "hardcoded_secret", message);
            }

            if self.weak_password.iter().any(|p| p.is_match(line)) {
                push(
                    Severity::Critical,
                    "weak_password_hash",
                    "password hashed with a weak algorithm (md5/sha1)".to_string(),
                );
            }
            if self.plaintext_password.iter().any(|p| p.is_match(line)) {
                push(
                    Severity::Critical,
                    "plaintext_password",
                    "password stored or compared in plaintext".to_string(),
                );
            }

            if let Some(caps) = self.route.captures(line) {
                let method = caps[2].to_ascii_lowercase();
                let route = caps[3].to_string();
                let lowered = line.to_ascii_lowercase();
                let has = |markers: &[String]| {
                    markers.iter().any(|m| lowered.contains(m) || global.contains(m))
                };

                if self.mutating_methods.contains(&method) && !has(&self.csrf_markers) {
                    push(
                        Severity::High,
                        "missing_csrf",
                        format!("{} {route} mutates state without CSRF token enforcement", method.to_ascii_uppercase()),
                    );
                }
                if !has(&self.auth_markers) && !has(&self.rate_limit_markers) {
                    push(
                        Severity::High,
                        "missing_auth",
                        format!("{} {route} has no authentication or rate-limit middleware", method.to_ascii_uppercase()),
                    );
                }
            }
        }
        findings
    }

    /// Lowercased arguments of every global `use(...)` registration.
    fn global_middleware(&self, code: &str) -> String {
        self.global_middleware
            .captures_iter(code)
            .map(|c| c[2].to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn secret_on_line(&self, line: &str) -> Option<String> {
        if let Some(p) = self.secret_patterns.iter().find(|p| p.is_match(line)) {
            return Some(format!("hardcoded credential matches known key format ({})", p.as_str()));
        }
        let caps = self.secret_assignment.captures(line)?;
        let value = caps.get(2)?.as_str();
        let entropy = shannon_entropy(value);
        (value.chars().count() >= self.min_secret_length && entropy >= self.entropy_threshold).then(|| {
            format!("high-entropy literal assigned to secret-like name (entropy {entropy:.2})")
        })
    }
}

impl Validator for SecurityValidator {
    fn name(&self) -> &'static str {
        NAME
    }

    fn validate(&self, file: &FileUnderReview<'_>) -> Vec<ValidationFinding> {
        self.check(file.path, file.content)
    }
}

fn lowercased(markers: &[String]) -> Vec<String> {
    markers.iter().map(|m| m.to_ascii_lowercase()).collect()
}

/// Shannon entropy in bits per character.
pub fn shannon_entropy(s: &str) -> f64 {
    let mut counts = [0usize; 256];
    let mut total = 0usize;
    for b in s.bytes() {
        counts[b as usize] += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }
    counts
        .iter()
        .filter(|c| **c > 0)
        .map(|c| {
            let p = *c as f64 / total as f64;
            -p * p.log2()
        })
        .sum()
}
