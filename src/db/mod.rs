//! SQLite persistence for enforcement rules, traffic events and threat indicators.
//!
//! Uses `rusqlite` with bundled SQLite. Handles:
//! - Enforcement rules (reloaded on start, rewritten on every mutation)
//! - Append-only traffic events with age-based pruning
//! - Threat indicators keyed by (type, value, source)

mod history;
mod indicators;
mod rules;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use rusqlite::Connection;

/// Manages the SQLite database. One connection behind a mutex.
pub struct Database {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS rules (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        target TEXT NOT NULL,
        port INTEGER,
        mechanism TEXT NOT NULL,
        params TEXT NOT NULL DEFAULT '{}',
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS traffic_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        flow_key TEXT NOT NULL,
        description TEXT NOT NULL,
        severity TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_events_timestamp ON traffic_events(timestamp);

    CREATE TABLE IF NOT EXISTS threat_indicators (
        indicator_type TEXT NOT NULL,
        value TEXT NOT NULL,
        source TEXT NOT NULL,
        confidence REAL NOT NULL,
        first_seen INTEGER NOT NULL,
        last_seen INTEGER NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (indicator_type, value, source)
    );
";

impl Database {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Database that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;

        // Enable WAL mode for better concurrent read performance.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database connection mutex poisoned"))
    }
}

/// Current Unix timestamp in seconds.
pub fn chrono_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::analyzer::TrafficEvent;
    use crate::core::detection::Severity;

    pub(crate) fn open_memory_db() -> Database {
        Database::open_in_memory().expect("in-memory database")
    }

    pub(crate) fn make_event(timestamp: i64, kind: &str, severity: Severity) -> TrafficEvent {
        TrafficEvent {
            id: None,
            kind: kind.to_string(),
            flow_key: "192.168.1.5:40000-10.0.0.1:443-TCP".to_string(),
            description: format!("{kind} detected"),
            severity,
            timestamp,
        }
    }

    #[test]
    fn test_open_on_disk_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("lanward.db");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());
        drop(db);
        // Reopening an existing file keeps the schema.
        assert!(Database::open(&path).is_ok());
    }

    #[test]
    fn test_chrono_timestamp_is_recent() {
        // 2023-01-01T00:00:00Z
        assert!(chrono_timestamp() > 1_672_531_200);
    }
}
