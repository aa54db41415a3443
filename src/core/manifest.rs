//! Write-ahead manifests for in-flight change groups.
//!
//! Before the applier writes a file it records that file's snapshot here and
//! syncs it to disk. If the process dies mid-apply, the manifest left behind
//! under `<store>/pending/<group_id>/` is enough to restore every touched path
//! on the next start. A manifest is removed once its group reaches `Applied`
//! or a clean `RolledBack`; after a partial rollback it is kept for the operator.

use crate::core::error::GuardError;
use crate::core::group::Snapshot;
use crate::core::time;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

const HEADER_FILE: &str = "header.json";
const ENTRIES_FILE: &str = "manifest.jsonl";
const QUARANTINE_FILE: &str = "PARTIAL_ROLLBACK";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestHeader {
    pub group_id: String,
    pub started_at: String,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SnapshotRef {
    Absent,
    Present {
        file: String,
        sha256: String,
        bytes: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ManifestEntry {
    index: usize,
    path: String,
    snapshot: SnapshotRef,
}

/// Manifest read back from disk: snapshots in capture order.
#[derive(Debug, Clone)]
pub struct RecoveredManifest {
    pub header: ManifestHeader,
    pub entries: Vec<(String, Snapshot)>,
}

#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn begin(&self, group_id: &str, paths: &[String]) -> Result<PendingManifest, GuardError> {
        let dir = self.dir.join(group_id);
        fs::create_dir_all(&dir)?;
        let header = ManifestHeader {
            group_id: group_id.to_string(),
            started_at: time::now_epoch_z(),
            paths: paths.to_vec(),
        };
        // The header is renamed into place, so a listed manifest always has
        // a complete one.
        let tmp = dir.join(format!("{HEADER_FILE}.tmp"));
        write_synced(&tmp, &serde_json::to_vec_pretty(&header)?)?;
        fs::rename(&tmp, dir.join(HEADER_FILE))?;
        sync_dir(&self.dir);
        Ok(PendingManifest {
            dir,
            next_index: 0,
        })
    }

    /// Group ids with a manifest still on disk.
    pub fn pending(&self) -> Result<Vec<String>, GuardError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() && entry.path().join(HEADER_FILE).exists() {
                ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Reads only the header; safe while the owning apply is still running.
    pub fn header(&self, group_id: &str) -> Result<ManifestHeader, GuardError> {
        let raw = fs::read(self.dir.join(group_id).join(HEADER_FILE))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// True while a manifest for `group_id` is on disk.
    pub fn exists(&self, group_id: &str) -> bool {
        self.dir.join(group_id).join(HEADER_FILE).exists()
    }

    pub fn load(&self, group_id: &str) -> Result<RecoveredManifest, GuardError> {
        let dir = self.dir.join(group_id);
        let header = self.header(group_id)?;
        let mut entries = Vec::new();
        let entries_path = dir.join(ENTRIES_FILE);
        if entries_path.exists() {
            for line in BufReader::new(File::open(&entries_path)?).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                // A torn last line means the crash happened before that
                // file's write started; nothing to restore for it.
                let Ok(entry) = serde_json::from_str::<ManifestEntry>(&line) else {
                    tracing::warn!(group_id, "ignoring torn manifest line");
                    continue;
                };
                let snapshot = match entry.snapshot {
                    SnapshotRef::Absent => Snapshot::Absent,
                    SnapshotRef::Present { file, sha256, .. } => {
                        let bytes = fs::read(dir.join(&file))?;
                        if sha256_hex(&bytes) != sha256 {
                            return Err(GuardError::ValidationFailure(format!(
                                "manifest snapshot {file} for {} is corrupt",
                                entry.path
                            )));
                        }
                        Snapshot::Present(bytes)
                    }
                };
                entries.push((entry.path, snapshot));
            }
        }
        Ok(RecoveredManifest { header, entries })
    }

    /// True when a partial rollback left this manifest for manual remediation.
    pub fn is_quarantined(&self, group_id: &str) -> bool {
        self.dir.join(group_id).join(QUARANTINE_FILE).exists()
    }

    /// Marks a manifest so recovery never replays it again.
    pub fn quarantine(&self, group_id: &str, failures: &[String]) -> Result<PathBuf, GuardError> {
        let dir = self.dir.join(group_id);
        mark_quarantined(&dir, failures)?;
        Ok(dir)
    }

    pub fn discard(&self, group_id: &str) -> Result<(), GuardError> {
        let dir = self.dir.join(group_id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Manifest of the group currently being applied.
pub struct PendingManifest {
    dir: PathBuf,
    next_index: usize,
}

impl PendingManifest {
    /// Durably records `path`'s pre-write snapshot. Must return before the
    /// corresponding write starts.
    pub fn record(&mut self, path: &str, snapshot: &Snapshot) -> Result<(), GuardError> {
        let index = self.next_index;
        let snapshot_ref = match snapshot {
            Snapshot::Absent => SnapshotRef::Absent,
            Snapshot::Present(bytes) => {
                let file = format!("{index:05}.snap");
                write_synced(&self.dir.join(&file), bytes)?;
                SnapshotRef::Present {
                    file,
                    sha256: sha256_hex(bytes),
                    bytes: bytes.len() as u64,
                }
            }
        };
        let entry = ManifestEntry {
            index,
            path: path.to_string(),
            snapshot: snapshot_ref,
        };
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(ENTRIES_FILE))?;
        writeln!(f, "{}", serde_json::to_string(&entry)?)?;
        f.sync_data()?;
        self.next_index += 1;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Removes the manifest; the group no longer needs recovery.
    pub fn complete(self) -> Result<(), GuardError> {
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    /// Keeps the manifest but marks it so recovery never replays it.
    pub fn quarantine(self, failures: &[String]) -> Result<PathBuf, GuardError> {
        mark_quarantined(&self.dir, failures)?;
        Ok(self.dir)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn mark_quarantined(dir: &Path, failures: &[String]) -> Result<(), GuardError> {
    write_synced(&dir.join(QUARANTINE_FILE), failures.join("\n").as_bytes())
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), GuardError> {
    let mut f = File::create(path)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    Ok(())
}

fn sync_dir(dir: &Path) {
    // Directory fsync is best-effort; not every platform allows opening a dir.
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}
