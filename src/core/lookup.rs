//! External lookups used by the hallucination detector.
//!
//! Lookups are bounded: each attempt runs against a deadline, attempts are
//! retried with linear backoff, and the caller only ever learns "verified
//! (exists or not)" or "unverified". An unreachable registry never blocks
//! validation.

use rustc_hash::FxHashSet;
use std::path::Path;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::core::error::GuardError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("lookup timed out")]
    Timeout,
    #[error("lookup unavailable: {0}")]
    Unavailable(String),
}

pub trait PackageRegistry: Send + Sync {
    fn exists(&self, name: &str) -> Result<bool, LookupError>;
}

pub trait RouteTable: Send + Sync {
    fn exists(&self, method: &str, path: &str) -> Result<bool, LookupError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            backoff: Duration::from_millis(50),
            timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Verified(bool),
    Unverified(LookupError),
}

/// Runs `f` under the retry policy. Each attempt runs on its own thread so a
/// hung collaborator is abandoned at the deadline instead of stalling the
/// pipeline.
pub fn lookup_with_retry<F>(policy: &RetryPolicy, f: F) -> Lookup
where
    F: Fn() -> Result<bool, LookupError> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let mut last = LookupError::Timeout;
    for attempt in 0..policy.attempts.max(1) {
        if attempt > 0 {
            thread::sleep(policy.backoff * attempt);
        }
        let (tx, rx) = mpsc::channel();
        let job = Arc::clone(&f);
        thread::spawn(move || {
            let _ = tx.send(job());
        });
        match rx.recv_timeout(policy.timeout) {
            Ok(Ok(exists)) => return Lookup::Verified(exists),
            Ok(Err(e)) => last = e,
            Err(_) => last = LookupError::Timeout,
        }
        tracing::debug!(attempt, error = %last, "lookup attempt failed");
    }
    Lookup::Unverified(last)
}

/// In-memory package registry.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    names: FxHashSet<String>,
}

impl StaticRegistry {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// One package name per line; blank lines and `#` comments ignored.
    pub fn load(path: &Path) -> Result<Self, GuardError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::new(significant_lines(&content)))
    }
}

impl PackageRegistry for StaticRegistry {
    fn exists(&self, name: &str) -> Result<bool, LookupError> {
        Ok(self.names.contains(name))
    }
}

/// In-memory route table. Route segments starting with `:` or wrapped in
/// braces match any single segment.
#[derive(Debug, Clone, Default)]
pub struct StaticRouteTable {
    routes: Vec<(String, Vec<String>)>,
}

impl StaticRouteTable {
    pub fn new<'a, I>(routes: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Self {
            routes: routes
                .into_iter()
                .map(|(method, path)| (method.to_ascii_uppercase(), segments(path)))
                .collect(),
        }
    }

    /// One `METHOD /path` per line; blank lines and `#` comments ignored.
    pub fn load(path: &Path) -> Result<Self, GuardError> {
        let content = std::fs::read_to_string(path)?;
        let mut routes = Vec::new();
        for line in significant_lines(&content) {
            let Some((method, route)) = line.split_once(char::is_whitespace) else {
                return Err(GuardError::ConfigError(format!(
                    "route table line must be `METHOD /path`: {line}"
                )));
            };
            routes.push((method.to_ascii_uppercase(), segments(route.trim())));
        }
        Ok(Self { routes })
    }
}

impl RouteTable for StaticRouteTable {
    fn exists(&self, method: &str, path: &str) -> Result<bool, LookupError> {
        let method = method.to_ascii_uppercase();
        let wanted = segments(path);
        Ok(self.routes.iter().any(|(m, route)| {
            (*m == method || m == "ANY")
                && route.len() == wanted.len()
                && route
                    .iter()
                    .zip(&wanted)
                    .all(|(r, w)| is_param(r) || is_param(w) || r == w)
        }))
    }
}

fn is_param(segment: &str) -> bool {
    segment.starts_with(':') || (segment.starts_with('{') && segment.ends_with('}'))
}

fn segments(path: &str) -> Vec<String> {
    let path = path.split(['?', '#']).next().unwrap_or("");
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn significant_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 2,
            backoff: Duration::from_millis(5),
            timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn verified_on_first_success() {
        let registry = Arc::new(StaticRegistry::new(["serde"]));
        let r = Arc::clone(&registry);
        assert_eq!(
            lookup_with_retry(&fast_policy(), move || r.exists("serde")),
            Lookup::Verified(true)
        );
        let r = Arc::clone(&registry);
        assert_eq!(
            lookup_with_retry(&fast_policy(), move || r.exists("serde-fake")),
            Lookup::Verified(false)
        );
    }

    #[test]
    fn retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result = lookup_with_retry(&fast_policy(), move || {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(LookupError::Unavailable("503".to_string()))
            } else {
                Ok(true)
            }
        });
        assert_eq!(result, Lookup::Verified(true));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn hung_lookup_degrades_to_unverified() {
        let result = lookup_with_retry(&fast_policy(), || {
            thread::sleep(Duration::from_millis(500));
            Ok(true)
        });
        assert_eq!(result, Lookup::Unverified(LookupError::Timeout));
    }

    #[test]
    fn route_table_matches_params_and_ignores_query() {
        let routes = StaticRouteTable::new([("GET", "/api/users/:id"), ("POST", "/api/users")]);
        assert_eq!(routes.exists("get", "/api/users/42?x=1"), Ok(true));
        assert_eq!(routes.exists("POST", "/api/users/"), Ok(true));
        assert_eq!(routes.exists("DELETE", "/api/users/42"), Ok(false));
        assert_eq!(routes.exists("GET", "/api/orders"), Ok(false));
    }

    #[test]
    fn load_lists_from_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pkgs = tmp.path().join("packages.txt");
        std::fs::write(&pkgs, "# known\nreact\n\nlodash\n").expect("write");
        let registry = StaticRegistry::load(&pkgs).expect("load");
        assert_eq!(registry.exists("lodash"), Ok(true));

        let routes_path = tmp.path().join("routes.txt");
        std::fs::write(&routes_path, "GET /health\nPOST /api/login\n").expect("write");
        let routes = StaticRouteTable::load(&routes_path).expect("load");
        assert_eq!(routes.exists("POST", "/api/login"), Ok(true));

        std::fs::write(&routes_path, "garbage").expect("write");
        assert!(StaticRouteTable::load(&routes_path).is_err());
    }
}
