//! Enforcement rule table CRUD operations.

use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use rusqlite::params;

use super::Database;
use crate::enforcement::rule::{Mechanism, Rule, RuleKind, RuleParams, RuleState};

impl Database {
    /// Insert or replace a rule by id.
    pub fn save_rule(&self, rule: &Rule) -> Result<()> {
        let params_json = serde_json::to_string(&rule.params)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO rules (id, kind, target, port, mechanism, params, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                rule.id,
                rule.kind.as_str(),
                rule.target.to_string(),
                rule.port,
                rule.mechanism.as_str(),
                params_json,
                rule.enabled as i32,
                rule.created_at,
            ],
        )?;
        Ok(())
    }

    /// Load all rules, oldest first. Stored rules come back `Applied` or
    /// `Disabled` according to their enabled flag.
    pub fn load_rules(&self) -> Result<Vec<Rule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, kind, target, port, mechanism, params, enabled, created_at
             FROM rules ORDER BY created_at ASC, rowid ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(RawRule {
                id: row.get(0)?,
                kind: row.get(1)?,
                target: row.get(2)?,
                port: row.get(3)?,
                mechanism: row.get(4)?,
                params: row.get(5)?,
                enabled: row.get::<_, i32>(6)? != 0,
                created_at: row.get(7)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            let raw = row?;
            let id = raw.id.clone();
            results.push(raw.into_rule().with_context(|| format!("stored rule {id} is corrupt"))?);
        }
        Ok(results)
    }

    /// Delete a rule. Returns whether a row was removed.
    pub fn delete_rule(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM rules WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub fn set_rule_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE rules SET enabled = ?2 WHERE id = ?1",
            params![id, enabled as i32],
        )?;
        Ok(updated > 0)
    }

    /// Delete every rule. Returns the number removed.
    pub fn clear_rules(&self) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM rules", [])?)
    }
}

struct RawRule {
    id: String,
    kind: String,
    target: String,
    port: Option<u16>,
    mechanism: String,
    params: String,
    enabled: bool,
    created_at: i64,
}

impl RawRule {
    fn into_rule(self) -> Result<Rule> {
        let kind: RuleKind = self.kind.parse()?;
        let mechanism: Mechanism = self.mechanism.parse()?;
        let target: Ipv4Addr = self
            .target
            .parse()
            .with_context(|| format!("invalid target '{}'", self.target))?;
        let params: RuleParams = serde_json::from_str(&self.params)?;
        Ok(Rule {
            id: self.id,
            kind,
            target,
            port: self.port,
            mechanism,
            params,
            enabled: self.enabled,
            state: if self.enabled {
                RuleState::Applied
            } else {
                RuleState::Disabled
            },
            created_at: self.created_at,
            advisory: mechanism.is_advisory(),
        })
    }
}
