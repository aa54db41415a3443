//! Backup Manager
//!
//! Takes a verified backup of a database before a destructive operation is
//! allowed to run. The backup runs on a worker thread with a deadline; a
//! timeout, a failed integrity check or an empty file is a hard
//! [`GuardError::BackupFailure`] and the caller must not proceed.

use crate::core::db;
use crate::core::error::GuardError;
use crate::core::manifest::sha256_hex;
use crate::core::time;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

/// A database the guardian can back up and run statements against.
pub trait DatabaseTarget: Send + Sync {
    fn name(&self) -> &str;

    /// Connection string or path; production markers are matched against it.
    fn connection_target(&self) -> String;

    fn backup_to(&self, dest: &Path) -> Result<(), GuardError>;

    fn verify_backup(&self, backup: &Path) -> Result<(), GuardError>;

    /// Executes `sql`, returning the number of rows changed by its last statement.
    fn execute(&self, sql: &str) -> Result<u64, GuardError>;
}

/// SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteTarget {
    path: PathBuf,
}

impl SqliteTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Connection, GuardError> {
        if !self.path.exists() {
            return Err(GuardError::NotFound(format!(
                "database {}",
                self.path.display()
            )));
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }
}

impl DatabaseTarget for SqliteTarget {
    fn name(&self) -> &str {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("database")
    }

    fn connection_target(&self) -> String {
        self.path.display().to_string()
    }

    fn backup_to(&self, dest: &Path) -> Result<(), GuardError> {
        let conn = self.open()?;
        conn.execute("VACUUM INTO ?1", params![dest.to_string_lossy().to_string()])?;
        Ok(())
    }

    fn verify_backup(&self, backup: &Path) -> Result<(), GuardError> {
        let conn = Connection::open(backup)?;
        let verdict: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if verdict != "ok" {
            return Err(GuardError::BackupFailure(format!(
                "integrity check on {} reported: {verdict}",
                backup.display()
            )));
        }
        Ok(())
    }

    fn execute(&self, sql: &str) -> Result<u64, GuardError> {
        let conn = self.open()?;
        conn.execute_batch(sql)?;
        Ok(conn.changes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub source: String,
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
    pub created_at: String,
}

pub struct BackupManager {
    dir: PathBuf,
    timeout: Duration,
    ledger: Option<PathBuf>,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
            ledger: None,
        }
    }

    /// Also records each verified backup in the `backups` table of `db_path`.
    pub fn with_ledger(mut self, db_path: impl Into<PathBuf>) -> Self {
        self.ledger = Some(db_path.into());
        self
    }

    pub fn create_backup(
        &self,
        target: &Arc<dyn DatabaseTarget>,
        label: &str,
    ) -> Result<BackupRecord, GuardError> {
        fs::create_dir_all(&self.dir)?;
        let id = format!("bk_{}", ulid::Ulid::new());
        let path = self
            .dir
            .join(format!("{}-{}-{id}.sqlite", file_safe(target.name()), file_safe(label)));

        let (tx, rx) = mpsc::channel();
        let worker_target = Arc::clone(target);
        let dest = path.clone();
        thread::spawn(move || {
            let result = worker_target
                .backup_to(&dest)
                .and_then(|_| worker_target.verify_backup(&dest));
            let _ = tx.send(result);
        });

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = fs::remove_file(&path);
                return Err(match e {
                    GuardError::BackupFailure(msg) => GuardError::BackupFailure(msg),
                    other => GuardError::BackupFailure(format!(
                        "backup of {} failed: {other}",
                        target.name()
                    )),
                });
            }
            Err(_) => {
                // The worker is abandoned; whatever it leaves behind is never
                // recorded as a usable backup.
                tracing::error!(database = target.name(), timeout = ?self.timeout, "backup timed out");
                return Err(GuardError::BackupFailure(format!(
                    "backup of {} timed out after {:?}",
                    target.name(),
                    self.timeout
                )));
            }
        }

        let bytes = fs::read(&path)?;
        if bytes.is_empty() {
            let _ = fs::remove_file(&path);
            return Err(GuardError::BackupFailure(format!(
                "backup of {} is empty",
                target.name()
            )));
        }

        let record = BackupRecord {
            id,
            source: target.connection_target(),
            path,
            sha256: sha256_hex(&bytes),
            bytes: bytes.len() as u64,
            created_at: time::now_epoch_z(),
        };
        if let Some(ledger) = &self.ledger {
            record_backup(ledger, &record)?;
        }
        tracing::info!(backup_id = %record.id, bytes = record.bytes, "backup verified");
        Ok(record)
    }

    /// Backups recorded in the ledger, newest first.
    pub fn list(&self) -> Result<Vec<BackupRecord>, GuardError> {
        let Some(ledger) = &self.ledger else {
            return Ok(Vec::new());
        };
        let conn = db::db_connect(ledger)?;
        let mut stmt = conn.prepare(
            "SELECT backup_id, source, path, sha256, bytes, created_at FROM backups ORDER BY backup_id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BackupRecord {
                id: row.get(0)?,
                source: row.get(1)?,
                path: PathBuf::from(row.get::<_, String>(2)?),
                sha256: row.get(3)?,
                bytes: row.get::<_, i64>(4)? as u64,
                created_at: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

fn record_backup(ledger: &Path, record: &BackupRecord) -> Result<(), GuardError> {
    let conn = db::db_connect(ledger)?;
    conn.execute(
        "INSERT INTO backups(backup_id, source, path, sha256, bytes, created_at) VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.id,
            record.source,
            record.path.to_string_lossy().to_string(),
            record.sha256,
            record.bytes as i64,
            record.created_at
        ],
    )?;
    Ok(())
}

fn file_safe(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
