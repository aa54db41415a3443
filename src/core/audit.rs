//! Append-only audit sink.
//!
//! Every decision and outcome (submission, validation, approval, apply,
//! rollback, database operation) is recorded here. The sink is the single
//! process-wide serialized writer; entries are never mutated or deleted.

use crate::core::error::GuardError;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub mod stage {
    pub const SUBMISSION: &str = "submission";
    pub const VALIDATION: &str = "validation";
    pub const APPROVAL: &str = "approval";
    pub const APPLY: &str = "apply";
    pub const POST_CHECK: &str = "post_check";
    pub const ROLLBACK: &str = "rollback";
    pub const RECOVERY: &str = "recovery";
    pub const DATABASE: &str = "database";
    pub const BACKUP: &str = "backup";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: String,
    pub actor: String,
    pub group_id: String,
    pub stage: String,
    pub outcome: String,
    pub detail: serde_json::Value,
}

/// Entry before the sink assigns its sequence number and timestamp.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub actor: String,
    pub group_id: String,
    pub stage: &'static str,
    pub outcome: String,
    pub detail: serde_json::Value,
}

impl AuditRecord {
    pub fn new(actor: &str, group_id: &str, stage: &'static str, outcome: &str) -> Self {
        Self {
            actor: actor.to_string(),
            group_id: group_id.to_string(),
            stage,
            outcome: outcome.to_string(),
            detail: serde_json::Value::Null,
        }
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub group_id: Option<String>,
    pub stage: Option<String>,
    pub actor: Option<String>,
    pub outcome: Option<String>,
}

impl AuditFilter {
    pub fn for_group(group_id: &str) -> Self {
        Self {
            group_id: Some(group_id.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.group_id.as_ref().is_none_or(|g| *g == entry.group_id)
            && self.stage.as_ref().is_none_or(|s| *s == entry.stage)
            && self.actor.as_ref().is_none_or(|a| *a == entry.actor)
            && self.outcome.as_ref().is_none_or(|o| *o == entry.outcome)
    }
}

/// Durable persistence behind the sink.
pub trait AuditStore: Send {
    fn append(&mut self, entry: &AuditEntry) -> Result<(), GuardError>;

    fn entries(&self) -> Result<Vec<AuditEntry>, GuardError>;
}

/// JSON-lines file, one entry per line, synced to disk on every append.
pub struct JsonlAuditStore {
    path: PathBuf,
}

impl JsonlAuditStore {
    pub fn open(path: &Path) -> Result<Self, GuardError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl AuditStore for JsonlAuditStore {
    fn append(&mut self, entry: &AuditEntry) -> Result<(), GuardError> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(f, "{}", serde_json::to_string(entry)?)?;
        f.sync_data()?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<AuditEntry>, GuardError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line)?);
        }
        Ok(out)
    }
}

#[derive(Default)]
pub struct MemoryAuditStore {
    entries: Vec<AuditEntry>,
}

impl AuditStore for MemoryAuditStore {
    fn append(&mut self, entry: &AuditEntry) -> Result<(), GuardError> {
        self.entries.push(entry.clone());
        Ok(())
    }

    fn entries(&self) -> Result<Vec<AuditEntry>, GuardError> {
        Ok(self.entries.clone())
    }
}

struct SinkState {
    store: Box<dyn AuditStore>,
    next_seq: u64,
}

pub struct AuditSink {
    state: Mutex<SinkState>,
}

impl AuditSink {
    pub fn new(store: Box<dyn AuditStore>) -> Result<Self, GuardError> {
        let next_seq = store
            .entries()?
            .iter()
            .map(|e| e.seq + 1)
            .max()
            .unwrap_or(0);
        Ok(Self {
            state: Mutex::new(SinkState { store, next_seq }),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(SinkState {
                store: Box::new(MemoryAuditStore::default()),
                next_seq: 0,
            }),
        }
    }

    pub fn jsonl(path: &Path) -> Result<Self, GuardError> {
        Self::new(Box::new(JsonlAuditStore::open(path)?))
    }

    /// Appends one entry. Sequence numbers are assigned under the writer lock,
    /// so each group's entries keep the order in which it emitted them.
    pub fn append(&self, record: AuditRecord) -> Result<AuditEntry, GuardError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| GuardError::LockPoisoned("audit sink".to_string()))?;
        let entry = AuditEntry {
            seq: state.next_seq,
            timestamp: time::now_epoch_z(),
            actor: record.actor,
            group_id: record.group_id,
            stage: record.stage.to_string(),
            outcome: record.outcome,
            detail: record.detail,
        };
        state.store.append(&entry)?;
        state.next_seq += 1;
        Ok(entry)
    }

    /// Appends, logging instead of failing. For call sites that are already
    /// reporting a more important error and must not mask it.
    pub fn record(&self, record: AuditRecord) {
        let stage = record.stage;
        if let Err(e) = self.append(record) {
            tracing::error!(stage, error = %e, "audit append failed");
        }
    }

    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, GuardError> {
        let state = self
            .state
            .lock()
            .map_err(|_| GuardError::LockPoisoned("audit sink".to_string()))?;
        Ok(state
            .store
            .entries()?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect())
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "audit",
        "version": "0.1.0",
        "description": "Append-only audit sink for every gate decision and apply outcome",
        "stages": [
            stage::SUBMISSION, stage::VALIDATION, stage::APPROVAL, stage::APPLY,
            stage::POST_CHECK, stage::ROLLBACK, stage::RECOVERY, stage::DATABASE, stage::BACKUP
        ],
        "storage": [crate::core::schemas::AUDIT_LOG_NAME]
    })
}
