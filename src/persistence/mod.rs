//! SQLite journal for hedge bookkeeping.
//!
//! Venue balances stay the source of truth for money. The journal keeps what
//! the venues cannot tell us after a restart:
//! - Armed profit-taking timers
//! - Consecutive failure counters (quarantine)
//! - A ledger snapshot for status display
//! - Execution history

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::risk::Position;

/// One row of execution history.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub action: String,
    pub notional_usd: Decimal,
    pub spot_quantity: Decimal,
    pub contracts: Decimal,
    pub success: bool,
    pub detail: Option<String>,
}

/// SQLite-backed state journal.
pub struct StateStore {
    conn: Connection,
}

fn parse_decimal(raw: &str) -> Decimal {
    Decimal::from_str(raw).unwrap_or_default()
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl StateStore {
    /// Open (or create) the journal at `db_path`.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self { conn };
        store.init_schema()?;

        info!("State journal opened at {:?}", db_path.as_ref());
        Ok(store)
    }

    /// In-memory journal, discarded on drop.
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS stage_timers (
                symbol TEXT NOT NULL,
                threshold_pct TEXT NOT NULL,
                armed_at TEXT NOT NULL,
                PRIMARY KEY (symbol, threshold_pct)
            );

            CREATE TABLE IF NOT EXISTS failure_counters (
                symbol TEXT PRIMARY KEY,
                consecutive_failures INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                value_usd TEXT NOT NULL,
                spot_quantity TEXT NOT NULL,
                derivative_contracts TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                long_value_usd TEXT NOT NULL,
                short_value_usd TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                symbol TEXT NOT NULL,
                action TEXT NOT NULL,
                notional_usd TEXT NOT NULL,
                spot_quantity TEXT NOT NULL,
                contracts TEXT NOT NULL,
                success INTEGER NOT NULL,
                detail TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_executions_symbol ON executions(symbol);
            "#,
        )?;

        debug!("Journal schema initialized");
        Ok(())
    }

    /// Replace all armed timers.
    pub fn save_timers(&self, timers: &[(String, Decimal, DateTime<Utc>)]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM stage_timers", [])?;
        for (symbol, threshold, armed_at) in timers {
            tx.execute(
                "INSERT INTO stage_timers (symbol, threshold_pct, armed_at) VALUES (?1, ?2, ?3)",
                params![symbol, threshold.to_string(), armed_at.to_rfc3339()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_timers(&self) -> Result<Vec<(String, Decimal, DateTime<Utc>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT symbol, threshold_pct, armed_at FROM stage_timers ORDER BY symbol, threshold_pct",
        )?;
        let timers = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    parse_decimal(&row.get::<_, String>(1)?),
                    parse_time(&row.get::<_, String>(2)?),
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(timers)
    }

    /// Replace all failure counters.
    pub fn save_failures(&self, counts: &HashMap<String, u32>) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM failure_counters", [])?;
        for (symbol, count) in counts {
            tx.execute(
                "INSERT INTO failure_counters (symbol, consecutive_failures) VALUES (?1, ?2)",
                params![symbol, count],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_failures(&self) -> Result<HashMap<String, u32>> {
        let mut stmt = self
            .conn
            .prepare("SELECT symbol, consecutive_failures FROM failure_counters")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(counts)
    }

    /// Clear a quarantine. Returns false when the symbol had no counter.
    pub fn reset_failures(&self, symbol: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE failure_counters SET consecutive_failures = 0 WHERE symbol = ?1",
            params![symbol],
        )?;
        info!(%symbol, found = changed > 0, "Failure counter reset in journal");
        Ok(changed > 0)
    }

    /// Replace the ledger snapshot.
    pub fn save_positions(&self, positions: &[Position]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM positions", [])?;
        for pos in positions {
            tx.execute(
                r#"
                INSERT INTO positions (symbol, value_usd, spot_quantity, derivative_contracts,
                                       entry_price, long_value_usd, short_value_usd,
                                       opened_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    pos.symbol,
                    pos.value_usd.to_string(),
                    pos.spot_quantity.to_string(),
                    pos.derivative_contracts.to_string(),
                    pos.entry_price.to_string(),
                    pos.long_value_usd.to_string(),
                    pos.short_value_usd.to_string(),
                    pos.opened_at.to_rfc3339(),
                    pos.updated_at.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        debug!(positions = positions.len(), "Ledger snapshot saved");
        Ok(())
    }

    pub fn load_positions(&self) -> Result<Vec<Position>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT symbol, value_usd, spot_quantity, derivative_contracts, entry_price,
                   long_value_usd, short_value_usd, opened_at, updated_at
            FROM positions ORDER BY symbol
            "#,
        )?;
        let positions = stmt
            .query_map([], |row| {
                Ok(Position {
                    symbol: row.get(0)?,
                    value_usd: parse_decimal(&row.get::<_, String>(1)?),
                    spot_quantity: parse_decimal(&row.get::<_, String>(2)?),
                    derivative_contracts: parse_decimal(&row.get::<_, String>(3)?),
                    entry_price: parse_decimal(&row.get::<_, String>(4)?),
                    long_value_usd: parse_decimal(&row.get::<_, String>(5)?),
                    short_value_usd: parse_decimal(&row.get::<_, String>(6)?),
                    opened_at: parse_time(&row.get::<_, String>(7)?),
                    updated_at: parse_time(&row.get::<_, String>(8)?),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(positions)
    }

    /// Append to execution history.
    pub fn record_execution(&self, record: &ExecutionRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO executions (timestamp, symbol, action, notional_usd, spot_quantity,
                                    contracts, success, detail)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                record.timestamp.to_rfc3339(),
                record.symbol,
                record.action,
                record.notional_usd.to_string(),
                record.spot_quantity.to_string(),
                record.contracts.to_string(),
                record.success,
                record.detail,
            ],
        )?;
        Ok(())
    }

    /// Most recent executions, newest first.
    pub fn recent_executions(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, symbol, action, notional_usd, spot_quantity, contracts, success, detail
            FROM executions ORDER BY id DESC LIMIT ?1
            "#,
        )?;
        let records = stmt
            .query_map(params![limit as i64], |row| {
                Ok(ExecutionRecord {
                    timestamp: parse_time(&row.get::<_, String>(0)?),
                    symbol: row.get(1)?,
                    action: row.get(2)?,
                    notional_usd: parse_decimal(&row.get::<_, String>(3)?),
                    spot_quantity: parse_decimal(&row.get::<_, String>(4)?),
                    contracts: parse_decimal(&row.get::<_, String>(5)?),
                    success: row.get(6)?,
                    detail: row.get(7)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(records)
    }

    /// Drop timers, counter and ledger row of a fully closed symbol.
    pub fn forget_symbol(&self, symbol: &str) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM stage_timers WHERE symbol = ?1", params![symbol])?;
        tx.execute("DELETE FROM failure_counters WHERE symbol = ?1", params![symbol])?;
        tx.execute("DELETE FROM positions WHERE symbol = ?1", params![symbol])?;
        tx.commit()?;
        debug!(%symbol, "Symbol removed from journal");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn t(raw: &str) -> DateTime<Utc> {
        parse_time(raw)
    }

    #[test]
    fn test_timers_replace_on_save() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .save_timers(&[
                ("XRP".into(), dec!(10), t("2026-01-01T00:00:00Z")),
                ("XRP".into(), dec!(25), t("2026-01-01T00:05:00Z")),
            ])
            .unwrap();
        store
            .save_timers(&[("ETH".into(), dec!(10), t("2026-01-01T01:00:00Z"))])
            .unwrap();

        let timers = store.load_timers().unwrap();
        assert_eq!(timers, vec![("ETH".into(), dec!(10), t("2026-01-01T01:00:00Z"))]);
    }

    #[test]
    fn test_failures_and_reset() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .save_failures(&HashMap::from([("XRP".to_string(), 3), ("ETH".to_string(), 1)]))
            .unwrap();

        assert!(store.reset_failures("XRP").unwrap());
        assert!(!store.reset_failures("DOGE").unwrap());

        let counts = store.load_failures().unwrap();
        assert_eq!(counts.get("XRP"), Some(&0));
        assert_eq!(counts.get("ETH"), Some(&1));
    }

    #[test]
    fn test_positions_snapshot() {
        let store = StateStore::open_in_memory().unwrap();
        let mut pos = Position::empty("XRP");
        pos.value_usd = dec!(300.5);
        pos.derivative_contracts = dec!(42);
        store.save_positions(&[pos.clone()]).unwrap();

        let loaded = store.load_positions().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].value_usd, dec!(300.5));
        assert_eq!(loaded[0].derivative_contracts, dec!(42));
    }

    #[test]
    fn test_forget_symbol() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .save_timers(&[("XRP".into(), dec!(10), t("2026-01-01T00:00:00Z"))])
            .unwrap();
        store
            .save_failures(&HashMap::from([("XRP".to_string(), 2)]))
            .unwrap();
        store.save_positions(&[Position::empty("XRP")]).unwrap();

        store.forget_symbol("XRP").unwrap();
        assert!(store.load_timers().unwrap().is_empty());
        assert!(store.load_failures().unwrap().is_empty());
        assert!(store.load_positions().unwrap().is_empty());
    }

    #[test]
    fn test_execution_history_newest_first() {
        let store = StateStore::open_in_memory().unwrap();
        for (i, action) in ["open", "close"].iter().enumerate() {
            store
                .record_execution(&ExecutionRecord {
                    timestamp: Utc::now(),
                    symbol: "XRP".into(),
                    action: action.to_string(),
                    notional_usd: dec!(100),
                    spot_quantity: dec!(140),
                    contracts: dec!(14),
                    success: i == 0,
                    detail: None,
                })
                .unwrap();
        }

        let records = store.recent_executions(10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].action, "close");
        assert!(!records[0].success);
        assert!(records[1].success);
    }
}
