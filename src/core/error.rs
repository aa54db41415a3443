use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Path error: {0}")]
    PathError(String),
    #[error("Validation failure: {0}")]
    ValidationFailure(String),
    #[error("Backup failure: {0}")]
    BackupFailure(String),
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
    #[error("Path locked: {0}")]
    PathLocked(String),
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
    #[error("Not found: {0}")]
    NotFound(String),
}
