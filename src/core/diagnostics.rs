//! Post-apply verification collaborator.
//!
//! The applier asks a [`DiagnosticsProvider`] about the touched files before
//! and after writing. Anything reported afterwards that was not in the
//! baseline is a regression and fails the group.

use crate::core::error::GuardError;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Command;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: DiagnosticSeverity,
    pub path: String,
    pub line: Option<u32>,
    pub message: String,
}

pub trait DiagnosticsProvider: Send + Sync {
    fn diagnose(&self, paths: &[String]) -> Result<Vec<Diagnostic>, GuardError>;
}

/// Reports nothing; post-apply verification always passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDiagnostics;

impl DiagnosticsProvider for NoDiagnostics {
    fn diagnose(&self, _paths: &[String]) -> Result<Vec<Diagnostic>, GuardError> {
        Ok(Vec::new())
    }
}

/// Runs an external checker with the touched paths appended to its
/// arguments and parses `path:line[:col]: severity: message` lines from its
/// combined output. Lines that do not parse are ignored; a checker that
/// cannot be spawned is an error (the apply fails closed).
#[derive(Debug, Clone)]
pub struct CommandDiagnostics {
    program: String,
    args: Vec<String>,
    workdir: PathBuf,
}

impl CommandDiagnostics {
    pub fn new(command: &[String], workdir: impl Into<PathBuf>) -> Result<Self, GuardError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| GuardError::ConfigError("diagnostics command is empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            workdir: workdir.into(),
        })
    }
}

impl DiagnosticsProvider for CommandDiagnostics {
    fn diagnose(&self, paths: &[String]) -> Result<Vec<Diagnostic>, GuardError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .args(paths)
            .current_dir(&self.workdir)
            .output()?;
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push('\n');
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(parse_diagnostics(&text))
    }
}

fn diagnostic_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<path>[^\s:][^:]*):(?P<line>\d+)(?::\d+)?:\s*(?P<sev>error|warning|info|note)\b:?\s*(?P<msg>.*)$")
            .expect("valid diagnostics pattern")
    })
}

pub fn parse_diagnostics(text: &str) -> Vec<Diagnostic> {
    let re = diagnostic_line_regex();
    text.lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim())?;
            let severity = match caps["sev"].to_ascii_lowercase().as_str() {
                "error" => DiagnosticSeverity::Error,
                "warning" => DiagnosticSeverity::Warning,
                _ => DiagnosticSeverity::Info,
            };
            Some(Diagnostic {
                severity,
                path: caps["path"].to_string(),
                line: caps["line"].parse().ok(),
                message: caps["msg"].trim().to_string(),
            })
        })
        .collect()
}

/// Diagnostics in `after` that have no counterpart in `baseline`. Matching
/// ignores line numbers (edits shift them) and counts duplicates.
pub fn regressions(baseline: &[Diagnostic], after: &[Diagnostic]) -> Vec<Diagnostic> {
    let mut remaining: FxHashMap<(&str, DiagnosticSeverity, &str), usize> = FxHashMap::default();
    for d in baseline {
        *remaining
            .entry((d.path.as_str(), d.severity, d.message.as_str()))
            .or_insert(0) += 1;
    }
    after
        .iter()
        .filter(|d| {
            match remaining.get_mut(&(d.path.as_str(), d.severity, d.message.as_str())) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    false
                }
                _ => true,
            }
        })
        .cloned()
        .collect()
}
