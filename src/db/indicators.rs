//! Threat indicator table operations.

use anyhow::Result;
use rusqlite::params;

use super::Database;
use crate::core::analyzer::ThreatIndicator;

impl Database {
    /// Insert or update by (type, value, source). Confidence only ever rises.
    pub fn upsert_indicator(&self, indicator: &ThreatIndicator) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO threat_indicators
                (indicator_type, value, source, confidence, first_seen, last_seen, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(indicator_type, value, source) DO UPDATE SET
                confidence = MAX(confidence, excluded.confidence),
                last_seen = excluded.last_seen,
                active = excluded.active",
            params![
                indicator.indicator_type,
                indicator.value,
                indicator.source,
                indicator.confidence,
                indicator.first_seen,
                indicator.last_seen,
                indicator.active as i32,
            ],
        )?;
        Ok(())
    }

    pub fn load_indicators(&self) -> Result<Vec<ThreatIndicator>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT indicator_type, value, source, confidence, first_seen, last_seen, active
             FROM threat_indicators ORDER BY last_seen DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ThreatIndicator {
                indicator_type: row.get(0)?,
                value: row.get(1)?,
                source: row.get(2)?,
                confidence: row.get(3)?,
                first_seen: row.get(4)?,
                last_seen: row.get(5)?,
                active: row.get::<_, i32>(6)? != 0,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Explicit cleanup: delete indicators not seen since `before`.
    pub fn delete_indicators_before(&self, before: i64) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM threat_indicators WHERE last_seen < ?1",
            params![before],
        )?)
    }
}
