//! SQLite connection utilities for collection databases.

use crate::core::error::TidepoolError;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// Establish a SQLite connection with Tidepool's standard configuration.
///
/// Enables:
/// - WAL (Write-Ahead Logging) mode so collection reads proceed during writes
/// - 5-second busy timeout for lock contention
pub fn db_connect(db_path: &Path) -> Result<Connection, TidepoolError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_creates_file_and_enables_wal() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("vectors.db");
        let conn = db_connect(&path).expect("connect");
        assert!(path.exists());
        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("journal_mode");
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
