use crate::core::error::GuardError;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub fn db_connect(db_path: &Path) -> Result<Connection, GuardError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute("PRAGMA foreign_keys=ON;", [])?;
    Ok(conn)
}

pub fn initialize_guard_db(db_path: &Path) -> Result<(), GuardError> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let conn = db_connect(db_path)?;
    for ddl in schemas::all() {
        conn.execute(ddl, [])?;
    }
    Ok(())
}
