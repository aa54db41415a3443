//! Per-path exclusive locks for the applier.
//!
//! A group locks every path it touches, one at a time in lexicographic order.
//! Groups with disjoint paths never wait on each other; groups sharing a path
//! serialize, and the global order rules out lock cycles.
//!
//! Within a process the lock table is a `Mutex` + `Condvar`. When the table is
//! backed by a lock directory, each held path also owns a lease file there,
//! created with `create_new` so exactly one process wins it. The lease is
//! removed when the guard drops. A process that dies while holding leases
//! leaves them behind; `clear_stale` removes leases whose holder is gone.

use crate::core::error::GuardError;
use crate::core::manifest::sha256_hex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Default)]
pub struct PathLocks {
    held: Mutex<FxHashSet<String>>,
    released: Condvar,
    leases: Option<LeaseDir>,
}

struct LeaseDir {
    dir: PathBuf,
    wait: Duration,
    stale_after: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
struct LeaseInfo {
    path: String,
    pid: u32,
    acquired_at: u64,
}

impl PathLocks {
    /// Lock table private to this process.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lock table shared with every process using `dir`. Acquiring a path
    /// held by another process waits at most `wait`.
    pub fn shared(dir: impl Into<PathBuf>, wait: Duration, stale_after: Duration) -> Result<Arc<Self>, GuardError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Arc::new(Self {
            leases: Some(LeaseDir {
                dir,
                wait,
                stale_after,
            }),
            ..Self::default()
        }))
    }

    /// Blocks until every path is held by the caller. Paths are expected to
    /// be normalized; duplicates are collapsed.
    pub fn acquire<I, S>(self: &Arc<Self>, paths: I) -> Result<PathLockGuard, GuardError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let deadline = self.leases.as_ref().map(|l| Instant::now() + l.wait);
        let mut guard = self.empty_guard();
        for path in sorted(paths) {
            let mut held = self.held.lock().map_err(|_| poisoned())?;
            while held.contains(&path) {
                held = self.released.wait(held).map_err(|_| poisoned())?;
            }
            held.insert(path.clone());
            drop(held);
            guard.paths.push(path.clone());

            if let (Some(leases), Some(deadline)) = (&self.leases, deadline) {
                guard.leases.push(leases.wait_for(&path, deadline)?);
            }
        }
        Ok(guard)
    }

    /// Takes every path without waiting; `None` when any of them is held,
    /// here or by another process.
    pub fn try_acquire<I, S>(self: &Arc<Self>, paths: I) -> Result<Option<PathLockGuard>, GuardError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut guard = self.empty_guard();
        for path in sorted(paths) {
            {
                let mut held = self.held.lock().map_err(|_| poisoned())?;
                if !held.insert(path.clone()) {
                    return Ok(None);
                }
            }
            guard.paths.push(path.clone());

            if let Some(leases) = &self.leases {
                match leases.try_lease(&path)? {
                    Some(lease) => guard.leases.push(lease),
                    None => return Ok(None),
                }
            }
        }
        Ok(Some(guard))
    }

    pub fn is_held(&self, path: &str) -> bool {
        let local = self.held.lock().map(|h| h.contains(path)).unwrap_or(false);
        local || self.leases.as_ref().is_some_and(|l| l.lease_path(path).exists())
    }

    /// Removes leases left by processes that no longer run (or that are
    /// older than the stale limit). Returns the freed paths.
    pub fn clear_stale(&self) -> Result<Vec<String>, GuardError> {
        let Some(leases) = &self.leases else {
            return Ok(Vec::new());
        };
        let mut freed = Vec::new();
        for entry in fs::read_dir(&leases.dir)? {
            let file = entry?.path();
            if file.extension().is_none_or(|e| e != "lock") {
                continue;
            }
            if let Some(info) = leases.stale_lease(&file) {
                tracing::warn!(path = %info.path, pid = info.pid, "removing stale path lease");
                match fs::remove_file(&file) {
                    Ok(()) => freed.push(info.path),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        freed.sort();
        Ok(freed)
    }

    fn empty_guard(self: &Arc<Self>) -> PathLockGuard {
        PathLockGuard {
            locks: Arc::clone(self),
            paths: Vec::new(),
            leases: Vec::new(),
        }
    }

    fn release(&self, paths: &[String]) {
        // Release must happen even after a panic elsewhere poisoned the set.
        let mut held = match self.held.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        for p in paths {
            held.remove(p);
        }
        drop(held);
        self.released.notify_all();
    }
}

impl LeaseDir {
    fn lease_path(&self, path: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", sha256_hex(path.as_bytes())))
    }

    fn try_lease(&self, path: &str) -> Result<Option<Lease>, GuardError> {
        let file_path = self.lease_path(path);
        let body = serde_json::to_vec(&LeaseInfo {
            path: path.to_string(),
            pid: std::process::id(),
            acquired_at: epoch_secs(SystemTime::now()),
        })?;
        // create_new gives single-winner semantics per path.
        let mut file = match OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&file_path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if let Err(e) = file.write_all(&body).and_then(|()| file.sync_data()) {
            let _ = fs::remove_file(&file_path);
            return Err(e.into());
        }
        Ok(Some(Lease {
            path: file_path,
            _file: file,
        }))
    }

    fn wait_for(&self, path: &str, deadline: Instant) -> Result<Lease, GuardError> {
        let mut attempts = 0u64;
        loop {
            if let Some(lease) = self.try_lease(path)? {
                return Ok(lease);
            }
            if Instant::now() >= deadline {
                let holder = fs::read(self.lease_path(path))
                    .ok()
                    .and_then(|b| serde_json::from_slice::<LeaseInfo>(&b).ok())
                    .map(|i| format!("pid {}", i.pid))
                    .unwrap_or_else(|| "another process".to_string());
                return Err(GuardError::PathLocked(format!(
                    "{path} is held by {holder}; run `changeguard recover` if that process is gone"
                )));
            }
            attempts += 1;
            std::thread::sleep(Duration::from_millis(10 + (attempts * 7) % 40));
        }
    }

    /// The lease's owner when the lease at `file` is stale.
    fn stale_lease(&self, file: &Path) -> Option<LeaseInfo> {
        let age = fs::metadata(file)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok())
            .unwrap_or_default();
        // A lease whose body is not written yet belongs to a live acquire.
        let info: LeaseInfo = serde_json::from_slice(&fs::read(file).ok()?).ok()?;
        if age >= self.stale_after || !process_alive(info.pid) {
            return Some(info);
        }
        None
    }
}

fn sorted<I, S>(paths: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut ordered: Vec<String> = paths.into_iter().map(Into::into).collect();
    ordered.sort();
    ordered.dedup();
    ordered
}

fn epoch_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Without a process table only the age limit frees a lease.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

fn poisoned() -> GuardError {
    GuardError::LockPoisoned("path lock table".to_string())
}

struct Lease {
    path: PathBuf,
    _file: File,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Holds a group's paths until dropped.
pub struct PathLockGuard {
    locks: Arc<PathLocks>,
    paths: Vec<String>,
    leases: Vec<Lease>,
}

impl PathLockGuard {
    pub fn paths(&self) -> &[String] {
        &self.paths
    }
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        // Lease files go first so a local waiter never sees its slot free
        // while the file is still there.
        self.leases.clear();
        self.locks.release(&self.paths);
    }
}
