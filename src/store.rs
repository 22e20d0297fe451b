// =============================================================================
// Store — persistent key-value + trade log + command queue + system log
// =============================================================================
//
// A single embedded SQLite database backs four tables: kv_store, trade_logs,
// command_queue, system_logs. WAL mode plus a generous busy timeout let
// multiple tasks share one connection without blocking each other for long.
//
// Every public method is best-effort: readers return an empty/default value
// on error, writers log and swallow. The engine must keep running on
// in-memory state even if the disk backing the Store misbehaves.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::types::{Command, CommandStatus, CommandType, Symbol, TradeRecord};

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(db_path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 30_000i64)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---------------------------------------------------------------
    // kv_store
    // ---------------------------------------------------------------

    pub async fn get_kv<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let conn = self.conn.lock().await;
        let raw: rusqlite::Result<Option<String>> = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional();

        match raw {
            Ok(Some(text)) => serde_json::from_str(&text).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "store: get_kv failed");
                None
            }
        }
    }

    pub async fn set_kv<T: Serialize>(&self, key: &str, value: &T) {
        let text = match serde_json::to_string(value) {
            Ok(t) => t,
            Err(e) => {
                warn!(key, error = %e, "store: set_kv serialize failed");
                return;
            }
        };
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        if let Err(e) = conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, text, now],
        ) {
            warn!(key, error = %e, "store: set_kv write failed");
        }
    }

    // ---------------------------------------------------------------
    // trade_logs
    // ---------------------------------------------------------------

    pub async fn log_trade(&self, record: &TradeRecord) {
        let conn = self.conn.lock().await;
        let res = conn.execute(
            "INSERT INTO trade_logs
                (timestamp, action, symbol, symbol_name, qty, price, reason, profit_rate, profit_amount, vision_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.timestamp.to_rfc3339(),
                record.action.to_string(),
                record.symbol,
                record.symbol_name,
                record.qty,
                record.price,
                record.reason,
                record.profit_rate,
                record.profit_amount,
                record.vision_reason,
            ],
        );
        if let Err(e) = res {
            warn!(symbol = %record.symbol, error = %e, "store: log_trade failed");
        }
    }

    pub async fn recent_trades(&self, limit: i64) -> Vec<TradeRecord> {
        let conn = self.conn.lock().await;
        let mut stmt = match conn.prepare(
            "SELECT timestamp, action, symbol, symbol_name, qty, price, reason, profit_rate, profit_amount, vision_reason
             FROM trade_logs ORDER BY id DESC LIMIT ?1",
        ) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "store: recent_trades prepare failed");
                return Vec::new();
            }
        };

        let rows = stmt.query_map(params![limit], |row| {
            let ts: String = row.get(0)?;
            let action: String = row.get(1)?;
            Ok(TradeRecord {
                timestamp: DateTime::parse_from_rfc3339(&ts)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                action: if action == "BUY" {
                    crate::types::TradeAction::Buy
                } else {
                    crate::types::TradeAction::Sell
                },
                symbol: row.get(2)?,
                symbol_name: row.get(3)?,
                qty: row.get(4)?,
                price: row.get(5)?,
                reason: row.get(6)?,
                profit_rate: row.get(7)?,
                profit_amount: row.get(8)?,
                vision_reason: row.get(9)?,
            })
        });

        match rows {
            Ok(iter) => iter.filter_map(|r| r.ok()).collect(),
            Err(e) => {
                warn!(error = %e, "store: recent_trades query failed");
                Vec::new()
            }
        }
    }

    // ---------------------------------------------------------------
    // command_queue
    // ---------------------------------------------------------------

    pub async fn push_command(&self, cmd_type: CommandType, payload: serde_json::Value) {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let type_str = match cmd_type {
            CommandType::BulkSell => "BULK_SELL",
            CommandType::BacktestReq => "BACKTEST_REQ",
        };
        let payload_str = payload.to_string();
        if let Err(e) = conn.execute(
            "INSERT INTO command_queue (cmd_type, payload, status, created_at) VALUES (?1, ?2, 'PENDING', ?3)",
            params![type_str, payload_str, now],
        ) {
            warn!(error = %e, "store: push_command failed");
        }
    }

    /// Atomically pop the oldest PENDING command and mark it DONE.
    /// For any PENDING row, exactly one call observes it.
    pub async fn pop_command(&self) -> Option<Command> {
        let mut conn = self.conn.lock().await;
        let tx = match conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate) {
            Ok(tx) => tx,
            Err(e) => {
                warn!(error = %e, "store: pop_command begin-immediate failed");
                return None;
            }
        };

        let row: rusqlite::Result<Option<(i64, String, String, String)>> = tx
            .query_row(
                "SELECT id, cmd_type, payload, created_at FROM command_queue
                 WHERE status = 'PENDING' ORDER BY id ASC LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional();

        let row = match row {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "store: pop_command select failed");
                return None;
            }
        };

        let Some((id, cmd_type, payload, created_at)) = row else {
            let _ = tx.commit();
            return None;
        };

        if let Err(e) = tx.execute(
            "UPDATE command_queue SET status = 'DONE' WHERE id = ?1",
            params![id],
        ) {
            warn!(id, error = %e, "store: pop_command update failed");
            return None;
        }
        if let Err(e) = tx.commit() {
            warn!(error = %e, "store: pop_command commit failed");
            return None;
        }

        let cmd_type = match cmd_type.as_str() {
            "BULK_SELL" => CommandType::BulkSell,
            _ => CommandType::BacktestReq,
        };
        let payload_value = serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null);
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Some(Command {
            id,
            cmd_type,
            payload: payload_value,
            status: CommandStatus::Done,
            created_at,
        })
    }

    // ---------------------------------------------------------------
    // symbol master
    // ---------------------------------------------------------------

    /// The listed-security master, refreshed daily by the Scheduler and
    /// consulted by the Signal Pipeline's index regime gate.
    pub async fn load_master_stocks(&self) -> Vec<Symbol> {
        self.get_kv("master_stocks").await.unwrap_or_default()
    }

    pub async fn save_master_stocks(&self, symbols: &[Symbol]) {
        self.set_kv("master_stocks", &symbols).await;
    }

    // ---------------------------------------------------------------
    // system_logs
    // ---------------------------------------------------------------

    pub async fn save_system_log(&self, level: &str, module: &str, message: &str) {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        if let Err(e) = conn.execute(
            "INSERT INTO system_logs (timestamp, level, module, message) VALUES (?1, ?2, ?3, ?4)",
            params![now, level, module, message],
        ) {
            warn!(error = %e, "store: save_system_log failed");
        }
    }

    // ---------------------------------------------------------------
    // retention
    // ---------------------------------------------------------------

    /// Delete trade_logs and system_logs older than `age_days`, plus DONE
    /// command_queue rows older than the same cutoff.
    pub async fn cleanup(&self, age_days: i64) -> (usize, usize) {
        let conn = self.conn.lock().await;
        let cutoff = (Utc::now() - chrono::Duration::days(age_days)).to_rfc3339();

        let trades = conn
            .execute("DELETE FROM trade_logs WHERE timestamp < ?1", params![cutoff])
            .unwrap_or_else(|e| {
                warn!(error = %e, "store: cleanup trade_logs failed");
                0
            });
        let logs = conn
            .execute("DELETE FROM system_logs WHERE timestamp < ?1", params![cutoff])
            .unwrap_or_else(|e| {
                warn!(error = %e, "store: cleanup system_logs failed");
                0
            });
        if let Err(e) = conn.execute(
            "DELETE FROM command_queue WHERE status = 'DONE' AND created_at < ?1",
            params![cutoff],
        ) {
            warn!(error = %e, "store: cleanup command_queue failed");
        }

        (trades, logs)
    }
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT
         );
         CREATE TABLE IF NOT EXISTS trade_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT,
            action TEXT,
            symbol TEXT,
            symbol_name TEXT,
            qty INTEGER,
            price REAL,
            reason TEXT,
            profit_rate REAL,
            profit_amount INTEGER,
            vision_reason TEXT
         );
         CREATE TABLE IF NOT EXISTS command_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cmd_type TEXT,
            payload TEXT,
            status TEXT DEFAULT 'PENDING',
            created_at TEXT
         );
         CREATE TABLE IF NOT EXISTS system_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT,
            level TEXT,
            module TEXT,
            message TEXT
         );",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().expect("open in-memory store")
    }

    #[tokio::test]
    async fn kv_roundtrip() {
        let s = store();
        s.set_kv("hello", &serde_json::json!({"a": 1})).await;
        let back: serde_json::Value = s.get_kv("hello").await.unwrap();
        assert_eq!(back["a"], 1);
    }

    #[tokio::test]
    async fn missing_kv_returns_none() {
        let s = store();
        let back: Option<serde_json::Value> = s.get_kv("missing").await;
        assert!(back.is_none());
    }

    #[tokio::test]
    async fn command_pop_is_atomic_and_single_delivery() {
        let s = store();
        s.push_command(CommandType::BulkSell, serde_json::Value::Null).await;

        let first = s.pop_command().await;
        assert!(first.is_some());
        assert_eq!(first.unwrap().status, CommandStatus::Done);

        let second = s.pop_command().await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn command_pop_returns_oldest_first() {
        let s = store();
        s.push_command(CommandType::BulkSell, serde_json::json!({"n": 1})).await;
        s.push_command(CommandType::BulkSell, serde_json::json!({"n": 2})).await;

        let first = s.pop_command().await.unwrap();
        assert_eq!(first.payload["n"], 1);
        let second = s.pop_command().await.unwrap();
        assert_eq!(second.payload["n"], 2);
    }

    #[tokio::test]
    async fn cleanup_removes_old_rows_only() {
        let s = store();
        let old = TradeRecord {
            timestamp: Utc::now() - chrono::Duration::days(10),
            action: crate::types::TradeAction::Buy,
            symbol: "000660".to_string(),
            symbol_name: "SK Hynix".to_string(),
            qty: 1,
            price: 100.0,
            reason: "test".to_string(),
            profit_rate: None,
            profit_amount: None,
            vision_reason: None,
        };
        let recent = TradeRecord {
            timestamp: Utc::now(),
            ..old.clone()
        };
        s.log_trade(&old).await;
        s.log_trade(&recent).await;

        let (trades, _) = s.cleanup(7).await;
        assert_eq!(trades, 1);
        assert_eq!(s.recent_trades(10).await.len(), 1);
    }
}
