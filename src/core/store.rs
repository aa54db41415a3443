//! Store abstraction for changeguard's on-disk state.
//!
//! A store is the `.changeguard/` directory next to a workspace. It holds the
//! SQLite ledger, the audit log, write-ahead manifests of in-flight groups,
//! path lock leases and database backups.

use crate::core::error::GuardError;
use crate::core::schemas;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory name of a store inside its workspace.
pub const STORE_DIR: &str = ".changeguard";

#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the store root directory
    pub root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store for a workspace: `<workspace>/.changeguard`.
    pub fn for_workspace(workspace: &Path) -> Self {
        Self::new(workspace.join(STORE_DIR))
    }

    /// Creates the store layout if missing.
    pub fn ensure(&self) -> Result<(), GuardError> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.pending_dir())?;
        fs::create_dir_all(self.backups_dir())?;
        fs::create_dir_all(self.locks_dir())?;
        Ok(())
    }

    pub fn ledger_db_path(&self) -> PathBuf {
        self.root.join(schemas::GUARD_DB_NAME)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.root.join(schemas::AUDIT_LOG_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.root.join("pending")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    /// Path lease files shared by every process applying in this workspace.
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }
}
