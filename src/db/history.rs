//! Traffic event table operations (append-only, pruned by age).

use anyhow::Result;
use rusqlite::params;

use super::{chrono_timestamp, Database};
use crate::core::analyzer::TrafficEvent;
use crate::core::detection::Severity;

impl Database {
    /// Append events in one transaction.
    pub fn insert_events(&self, events: &[TrafficEvent]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO traffic_events (kind, flow_key, description, severity, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for e in events {
                stmt.execute(params![
                    e.kind,
                    e.flow_key,
                    e.description,
                    e.severity.as_str(),
                    e.timestamp,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Most recent events first, insertion order breaking timestamp ties.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<TrafficEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, kind, flow_key, description, severity, timestamp
             FROM traffic_events
             ORDER BY id DESC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], map_event_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Number of stored events at or after `from_timestamp`.
    pub fn count_events_since(&self, from_timestamp: i64) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM traffic_events WHERE timestamp >= ?1",
            params![from_timestamp],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Prune events older than the specified number of days.
    pub fn prune_old_events(&self, max_age_days: u64) -> Result<usize> {
        let cutoff = chrono_timestamp() - (max_age_days * 86400) as i64;
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM traffic_events WHERE timestamp < ?1",
            params![cutoff],
        )?;
        if deleted > 0 {
            tracing::info!("Pruned {deleted} traffic events older than {max_age_days} days");
        }
        Ok(deleted)
    }
}

fn map_event_row(row: &rusqlite::Row) -> rusqlite::Result<TrafficEvent> {
    let severity: String = row.get(4)?;
    Ok(TrafficEvent {
        id: Some(row.get(0)?),
        kind: row.get(1)?,
        flow_key: row.get(2)?,
        description: row.get(3)?,
        severity: Severity::parse(&severity).unwrap_or(Severity::Low),
        timestamp: row.get(5)?,
    })
}
