//! Hallucination Detector
//!
//! Flags content that references things which do not exist or could not be
//! true: imports of unknown packages, calls to endpoints the route table does
//! not know, placeholder data, dates in the future for things that already
//! happened, negative counts and test results that look too good.
//!
//! Registry and route lookups go through [`lookup_with_retry`]; a lookup that
//! cannot be answered produces an unverified Medium finding instead of
//! stalling validation.

use crate::core::error::GuardError;
use crate::core::finding::{FileUnderReview, Severity, ValidationFinding, Validator};
use crate::core::lookup::{
    Lookup, PackageRegistry, RetryPolicy, RouteTable, lookup_with_retry,
};
use crate::core::rules::{self, HallucinationRules, RuleConfig};
use chrono::NaiveDate;
use rayon::prelude::*;
use regex::Regex;
use rustc_hash::FxHashSet;
use std::sync::{Arc, LazyLock};

pub const NAME: &str = "hallucination";

static JS_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*(?:import|export)\s+(?:[\w*{}\s,$]+\s+from\s+)?["']([^"']+)["']"#)
        .expect("static regex")
});
static JS_REQUIRE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(?:require|import)\s*\(\s*["']([^"']+)["']\s*\)"#).expect("static regex")
});
static PY_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*import\s+([\w.]+(?:\s+as\s+\w+)?(?:\s*,\s*[\w.]+(?:\s+as\s+\w+)?)*)")
        .expect("static regex")
});
static PY_FROM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*from\s+([\w.]+)\s+import\b").expect("static regex"));
static RS_USE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:pub(?:\([\w:]+\))?\s+)?use\s+(?:::)?(\w+)").expect("static regex")
});
static RS_EXTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*extern\s+crate\s+(\w+)").expect("static regex"));
static RS_MOD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:pub(?:\([\w:]+\))?\s+)?mod\s+(\w+)").expect("static regex")
});
static FETCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bfetch\s*\(\s*["'`]([^"'`]+)["'`]\s*(?:,\s*\{([^}]*)\})?"#)
        .expect("static regex")
});
static FETCH_METHOD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bmethod\s*:\s*["'](\w+)["']"#).expect("static regex")
});
static AXIOS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\baxios\.(get|post|put|patch|delete|head|options)\s*\(\s*["'`]([^"'`]+)["'`]"#)
        .expect("static regex")
});
static TEMPLATE_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{[^}]*\}").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceLang {
    JavaScript,
    Python,
    Rust,
}

impl SourceLang {
    fn of(extension: &str) -> Option<Self> {
        match extension {
            "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx" => Some(SourceLang::JavaScript),
            "py" => Some(SourceLang::Python),
            "rs" => Some(SourceLang::Rust),
            _ => None,
        }
    }
}

struct Fabricated {
    name: String,
    pattern: Regex,
    message: String,
}

/// Package and endpoint checks run only when a registry or route table is
/// attached; the content checks always run.
pub struct HallucinationDetector {
    registry: Option<Arc<dyn PackageRegistry>>,
    routes: Option<Arc<dyn RouteTable>>,
    policy: RetryPolicy,
    ignored: FxHashSet<String>,
    historical_field: Regex,
    count_field: Regex,
    perfect_rate: Regex,
    zero_variance: Regex,
    fabricated: Vec<Fabricated>,
}

impl HallucinationDetector {
    pub fn from_rules(r: &HallucinationRules, policy: RetryPolicy) -> Result<Self, GuardError> {
        let fabricated = r
            .fabricated
            .iter()
            .map(|f| {
                Ok(Fabricated {
                    name: f.name.clone(),
                    pattern: rules::compile(&f.pattern)?,
                    message: f.message.clone(),
                })
            })
            .collect::<Result<Vec<_>, GuardError>>()?;
        Ok(Self {
            registry: None,
            routes: None,
            policy,
            ignored: r.ignored_packages.iter().cloned().collect(),
            historical_field: rules::compile(&r.historical_field_pattern)?,
            count_field: rules::compile(&r.count_field_pattern)?,
            perfect_rate: rules::compile(&r.perfect_rate_pattern)?,
            zero_variance: rules::compile(&r.zero_variance_pattern)?,
            fabricated,
        })
    }

    pub fn builtin(policy: RetryPolicy) -> Result<Self, GuardError> {
        Self::from_rules(&RuleConfig::builtin()?.hallucination, policy)
    }

    pub fn with_registry(mut self, registry: Arc<dyn PackageRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_routes(mut self, routes: Arc<dyn RouteTable>) -> Self {
        self.routes = Some(routes);
        self
    }

    pub fn detect(&self, file: &FileUnderReview<'_>) -> Vec<ValidationFinding> {
        let mut findings = Vec::new();
        let lang = SourceLang::of(file.extension());
        if let (Some(lang), Some(registry)) = (lang, &self.registry) {
            findings.extend(self.check_packages(file, lang, registry));
        }
        if let (Some(SourceLang::JavaScript), Some(routes)) = (lang, &self.routes) {
            findings.extend(self.check_endpoints(file, routes));
        }
        findings.extend(self.check_fabricated(file));
        findings.extend(self.check_impossible_values(file));
        findings.extend(self.check_perfect_results(file));
        findings
    }

    fn check_packages(
        &self,
        file: &FileUnderReview<'_>,
        lang: SourceLang,
        registry: &Arc<dyn PackageRegistry>,
    ) -> Vec<ValidationFinding> {
        let imports = self.imported_packages(file.content, lang);
        imports
            .par_iter()
            .filter_map(|(name, line)| {
                let registry = Arc::clone(registry);
                let candidates = registry_names(name, lang);
                let outcome = lookup_with_retry(&self.policy, move || {
                    for candidate in &candidates {
                        if registry.exists(candidate)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                });
                match outcome {
                    Lookup::Verified(true) => None,
                    Lookup::Verified(false) => Some(
                        ValidationFinding::new(
                            Severity::High,
                            "missing_package",
                            format!("package does not exist: `{name}`"),
                            NAME,
                        )
                        .at(file.path, Some(*line)),
                    ),
                    Lookup::Unverified(err) => {
                        tracing::warn!(package = %name, error = %err, "package lookup unverified");
                        Some(
                            ValidationFinding::new(
                                Severity::Medium,
                                "unverified_package",
                                format!("could not verify package `{name}` exists: {err}"),
                                NAME,
                            )
                            .at(file.path, Some(*line))
                            .unverified(),
                        )
                    }
                }
            })
            .collect()
    }

    /// Distinct external package names with the line of their first import.
    fn imported_packages(&self, content: &str, lang: SourceLang) -> Vec<(String, usize)> {
        let mut raw: Vec<(String, usize)> = Vec::new();
        let mut push = |name: &str, offset: usize| raw.push((name.to_string(), line_of(content, offset)));

        match lang {
            SourceLang::JavaScript => {
                for re in [&*JS_IMPORT, &*JS_REQUIRE] {
                    for caps in re.captures_iter(content) {
                        let m = caps.get(1).map(|m| (m.as_str(), m.start()));
                        if let Some((spec, offset)) = m
                            && let Some(pkg) = js_package(spec)
                        {
                            push(pkg, offset);
                        }
                    }
                }
            }
            SourceLang::Python => {
                for caps in PY_IMPORT.captures_iter(content) {
                    let Some(m) = caps.get(1) else { continue };
                    for item in m.as_str().split(',') {
                        let module = item.split_whitespace().next().unwrap_or("");
                        if let Some(pkg) = python_package(module) {
                            push(pkg, m.start());
                        }
                    }
                }
                for caps in PY_FROM.captures_iter(content) {
                    if let Some(m) = caps.get(1)
                        && let Some(pkg) = python_package(m.as_str())
                    {
                        push(pkg, m.start());
                    }
                }
            }
            SourceLang::Rust => {
                let local: FxHashSet<&str> = RS_MOD
                    .captures_iter(content)
                    .filter_map(|c| c.get(1).map(|m| m.as_str()))
                    .collect();
                for re in [&*RS_USE, &*RS_EXTERN] {
                    for caps in re.captures_iter(content) {
                        if let Some(m) = caps.get(1)
                            && !local.contains(m.as_str())
                        {
                            push(m.as_str(), m.start());
                        }
                    }
                }
            }
        }

        raw.sort_by_key(|(_, line)| *line);
        let mut seen = FxHashSet::default();
        raw.into_iter()
            .filter(|(name, _)| !self.ignored.contains(name) && seen.insert(name.clone()))
            .collect()
    }

    fn check_endpoints(
        &self,
        file: &FileUnderReview<'_>,
        routes: &Arc<dyn RouteTable>,
    ) -> Vec<ValidationFinding> {
        let mut calls: Vec<(String, String, usize)> = Vec::new();
        for caps in FETCH.captures_iter(file.content) {
            let Some(url) = caps.get(1) else { continue };
            let method = caps
                .get(2)
                .and_then(|opts| FETCH_METHOD.captures(opts.as_str()))
                .map(|m| m[1].to_ascii_uppercase())
                .unwrap_or_else(|| "GET".to_string());
            calls.push((method, url.as_str().to_string(), line_of(file.content, url.start())));
        }
        for caps in AXIOS.captures_iter(file.content) {
            let Some(url) = caps.get(2) else { continue };
            calls.push((
                caps[1].to_ascii_uppercase(),
                url.as_str().to_string(),
                line_of(file.content, url.start()),
            ));
        }

        calls
            .into_iter()
            .filter(|(_, url, _)| url.starts_with('/'))
            .filter_map(|(method, url, line)| {
                let route = TEMPLATE_PARAM.replace_all(&url, ":param").into_owned();
                let routes = Arc::clone(routes);
                let (m, p) = (method.clone(), route.clone());
                match lookup_with_retry(&self.policy, move || routes.exists(&m, &p)) {
                    Lookup::Verified(true) => None,
                    Lookup::Verified(false) => Some(
                        ValidationFinding::new(
                            Severity::High,
                            "missing_endpoint",
                            format!("endpoint does not exist: {method} {url}"),
                            NAME,
                        )
                        .at(file.path, Some(line)),
                    ),
                    Lookup::Unverified(err) => {
                        tracing::warn!(%method, %url, error = %err, "route lookup unverified");
                        Some(
                            ValidationFinding::new(
                                Severity::Medium,
                                "unverified_endpoint",
                                format!("could not verify endpoint {method} {url}: {err}"),
                                NAME,
                            )
                            .at(file.path, Some(line))
                            .unverified(),
                        )
                    }
                }
            })
            .collect()
    }

    fn check_fabricated(&self, file: &FileUnderReview<'_>) -> Vec<ValidationFinding> {
        let mut findings = Vec::new();
        for f in &self.fabricated {
            for m in f.pattern.find_iter(file.content) {
                findings.push(
                    ValidationFinding::new(
                        Severity::Medium,
                        "fabricated_data",
                        format!("{} ({}): {}", f.message, f.name, m.as_str()),
                        NAME,
                    )
                    .at(file.path, Some(line_of(file.content, m.start()))),
                );
            }
        }
        findings
    }

    fn check_impossible_values(&self, file: &FileUnderReview<'_>) -> Vec<ValidationFinding> {
        let mut findings = Vec::new();
        for caps in self.historical_field.captures_iter(file.content) {
            let (Some(field), Some(date)) = (caps.get(1), caps.get(3)) else {
                continue;
            };
            let Ok(parsed) = NaiveDate::parse_from_str(date.as_str(), "%Y-%m-%d") else {
                continue;
            };
            if parsed > file.as_of {
                findings.push(
                    ValidationFinding::new(
                        Severity::Medium,
                        "temporal_impossibility",
                        format!(
                            "temporal impossibility: `{}` records {} which is after {}",
                            field.as_str(),
                            date.as_str(),
                            file.as_of
                        ),
                        NAME,
                    )
                    .at(file.path, Some(line_of(file.content, date.start()))),
                );
            }
        }
        for caps in self.count_field.captures_iter(file.content) {
            let (Some(field), Some(value)) = (caps.get(1), caps.get(3)) else {
                continue;
            };
            findings.push(
                ValidationFinding::new(
                    Severity::Medium,
                    "numeric_impossibility",
                    format!(
                        "numeric impossibility: `{}` cannot be negative ({})",
                        field.as_str(),
                        value.as_str()
                    ),
                    NAME,
                )
                .at(file.path, Some(line_of(file.content, value.start()))),
            );
        }
        findings
    }

    /// A perfect pass rate alone is common; paired with zero variance it
    /// usually means the numbers were made up.
    fn check_perfect_results(&self, file: &FileUnderReview<'_>) -> Option<ValidationFinding> {
        let perfect = self.perfect_rate.find(file.content)?;
        self.zero_variance.find(file.content)?;
        Some(
            ValidationFinding::new(
                Severity::Low,
                "suspicious_results",
                format!(
                    "suspiciously perfect test results: {}",
                    perfect.as_str().trim()
                ),
                NAME,
            )
            .at(file.path, Some(line_of(file.content, perfect.start()))),
        )
    }
}

impl Validator for HallucinationDetector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn validate(&self, file: &FileUnderReview<'_>) -> Vec<ValidationFinding> {
        self.detect(file)
    }
}

/// `@scope/pkg/sub` -> `@scope/pkg`, `pkg/sub` -> `pkg`. Relative, absolute
/// and `node:` specifiers are not packages.
fn js_package(spec: &str) -> Option<&str> {
    if spec.starts_with('.') || spec.starts_with('/') || spec.starts_with("node:") {
        return None;
    }
    if spec.starts_with('@') {
        let mut parts = spec.splitn(3, '/');
        let scope = parts.next()?;
        let name = parts.next()?;
        return Some(&spec[..scope.len() + 1 + name.len()]);
    }
    spec.split('/').next().filter(|s| !s.is_empty())
}

fn python_package(module: &str) -> Option<&str> {
    if module.starts_with('.') {
        return None;
    }
    module.split('.').next().filter(|s| !s.is_empty())
}

/// Rust crates are imported with underscores but published with either.
fn registry_names(name: &str, lang: SourceLang) -> Vec<String> {
    let mut names = vec![name.to_string()];
    if lang == SourceLang::Rust && name.contains('_') {
        names.push(name.replace('_', "-"));
    }
    names
}

fn line_of(content: &str, offset: usize) -> usize {
    content[..offset].bytes().filter(|b| *b == b'\n').count() + 1
}
