pub mod schema;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use rusqlite::types::Type;

use crate::core::{NormalizedRecord, ScoredRecord};
use crate::error::Result;

/// Idempotent sink for normalized and scored transactions, keyed by tx hash.
pub trait TransactionStore: Send + Sync {
    /// Insert or overwrite rows; returns the number of rows written.
    fn upsert_transactions(&self, records: &[NormalizedRecord]) -> Result<usize>;

    fn upsert_scores(&self, scored: &[ScoredRecord]) -> Result<usize>;

    /// Stored transactions sent by any of `senders` with a block timestamp in
    /// `(since, until]`.
    fn sender_history(&self, senders: &[String], since: i64, until: i64) -> Result<Vec<NormalizedRecord>>;
}

/// Durable home of the batch pipeline cursor.
pub trait CursorStore: Send + Sync {
    fn load_cursor(&self) -> Result<u64>;
    fn save_cursor(&self, height: u64) -> Result<()>;
}

pub struct Database {
    conn: Connection,
}

/// Thread-safe wrapper around Database.
#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<Mutex<Database>>,
}

impl SharedDatabase {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }

    /// Most recent stored transactions, newest block first.
    pub fn recent_transactions(&self, limit: usize) -> Result<Vec<NormalizedRecord>> {
        Ok(self.inner.lock().recent_transactions(limit)?)
    }

    pub fn transaction_count(&self) -> Result<usize> {
        Ok(self.inner.lock().transaction_count()?)
    }

    pub fn score_count(&self) -> Result<usize> {
        Ok(self.inner.lock().score_count()?)
    }

    /// Highest-probability stored scores as `(tx_hash, probability, risk_level)`.
    pub fn top_scores(&self, limit: usize) -> Result<Vec<(String, f64, String)>> {
        Ok(self.inner.lock().top_scores(limit)?)
    }
}

impl TransactionStore for SharedDatabase {
    fn upsert_transactions(&self, records: &[NormalizedRecord]) -> Result<usize> {
        Ok(self.inner.lock().upsert_transactions(records)?)
    }

    fn upsert_scores(&self, scored: &[ScoredRecord]) -> Result<usize> {
        Ok(self.inner.lock().upsert_scores(scored)?)
    }

    fn sender_history(&self, senders: &[String], since: i64, until: i64) -> Result<Vec<NormalizedRecord>> {
        Ok(self.inner.lock().sender_history(senders, since, until)?)
    }
}

impl CursorStore for SharedDatabase {
    fn load_cursor(&self) -> Result<u64> {
        Ok(self.inner.lock().load_cursor()?)
    }

    fn save_cursor(&self, height: u64) -> Result<()> {
        Ok(self.inner.lock().save_cursor(height)?)
    }
}

const RECORD_COLUMNS: &str = "tx_hash, block_number, block_hash, block_timestamp, tx_index, from_addr, to_addr, value, gas, gas_price, gas_used, cumulative_gas_used, status, contract_addr, effective_gas_price, processed_at";

/// SQLite caps bound parameters per statement; sender lookups are chunked.
const SENDER_CHUNK: usize = 500;

impl Database {
    pub fn open(path: &Path) -> std::result::Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    /// Batch-upsert normalized rows in a single transaction.
    pub fn upsert_transactions(&self, records: &[NormalizedRecord]) -> std::result::Result<usize, rusqlite::Error> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT INTO transaction_receipts ({RECORD_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(tx_hash) DO UPDATE SET
                    block_number = excluded.block_number,
                    block_hash = excluded.block_hash,
                    block_timestamp = excluded.block_timestamp,
                    tx_index = excluded.tx_index,
                    from_addr = excluded.from_addr,
                    to_addr = excluded.to_addr,
                    value = excluded.value,
                    gas = excluded.gas,
                    gas_price = excluded.gas_price,
                    gas_used = excluded.gas_used,
                    cumulative_gas_used = excluded.cumulative_gas_used,
                    status = excluded.status,
                    contract_addr = excluded.contract_addr,
                    effective_gas_price = excluded.effective_gas_price,
                    processed_at = excluded.processed_at"
            ))?;
            for r in records {
                stmt.execute(rusqlite::params![
                    r.tx_hash, r.block_number, r.block_hash, r.block_timestamp,
                    r.tx_index, r.from_addr, r.to_addr, r.value, r.gas, r.gas_price,
                    r.gas_used, r.cumulative_gas_used, r.status, r.contract_addr,
                    r.effective_gas_price, r.processed_at.to_rfc3339()
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    pub fn upsert_scores(&self, scored: &[ScoredRecord]) -> std::result::Result<usize, rusqlite::Error> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO fraud_scores (tx_hash, fraud_probability, is_fraud, risk_level, anomaly_flag, anomaly_score, scored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
                 ON CONFLICT(tx_hash) DO UPDATE SET
                    fraud_probability = excluded.fraud_probability,
                    is_fraud = excluded.is_fraud,
                    risk_level = excluded.risk_level,
                    anomaly_flag = excluded.anomaly_flag,
                    anomaly_score = excluded.anomaly_score,
                    scored_at = excluded.scored_at",
            )?;
            for s in scored {
                stmt.execute(rusqlite::params![
                    s.record.tx_hash,
                    s.fraud_probability,
                    s.is_fraud as i32,
                    s.risk_level.as_str(),
                    s.anomaly.map(|a| a.is_anomaly as i32),
                    s.anomaly.map(|a| a.score),
                ])?;
            }
        }
        tx.commit()?;
        Ok(scored.len())
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<NormalizedRecord> {
        let processed_at: String = row.get(15)?;
        let processed_at = DateTime::parse_from_rfc3339(&processed_at)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(15, Type::Text, Box::new(e)))?
            .with_timezone(&Utc);
        Ok(NormalizedRecord {
            tx_hash: row.get(0)?,
            block_number: row.get(1)?,
            block_hash: row.get(2)?,
            block_timestamp: row.get(3)?,
            tx_index: row.get(4)?,
            from_addr: row.get(5)?,
            to_addr: row.get(6)?,
            value: row.get(7)?,
            gas: row.get(8)?,
            gas_price: row.get(9)?,
            gas_used: row.get(10)?,
            cumulative_gas_used: row.get(11)?,
            status: row.get(12)?,
            contract_addr: row.get(13)?,
            effective_gas_price: row.get(14)?,
            processed_at,
        })
    }

    pub fn sender_history(
        &self,
        senders: &[String],
        since: i64,
        until: i64,
    ) -> std::result::Result<Vec<NormalizedRecord>, rusqlite::Error> {
        let mut history = Vec::new();
        for chunk in senders.chunks(SENDER_CHUNK) {
            let placeholders = (0..chunk.len())
                .map(|i| format!("?{}", i + 3))
                .collect::<Vec<_>>()
                .join(",");
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM transaction_receipts
                 WHERE block_timestamp > ?1 AND block_timestamp <= ?2 AND from_addr IN ({placeholders})
                 ORDER BY block_timestamp"
            ))?;
            let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(chunk.len() + 2);
            params.push(&since);
            params.push(&until);
            for sender in chunk {
                params.push(sender);
            }
            let rows = stmt.query_map(params.as_slice(), Self::row_to_record)?;
            for row in rows {
                history.push(row?);
            }
        }
        Ok(history)
    }

    pub fn recent_transactions(&self, limit: usize) -> std::result::Result<Vec<NormalizedRecord>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM transaction_receipts
             ORDER BY block_number DESC, tx_index ASC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(rusqlite::params![limit as i64], Self::row_to_record)?;
        rows.collect()
    }

    pub fn transaction_count(&self) -> std::result::Result<usize, rusqlite::Error> {
        self.conn.query_row("SELECT COUNT(*) FROM transaction_receipts", [], |row| {
            row.get::<_, i64>(0).map(|c| c as usize)
        })
    }

    pub fn score_count(&self) -> std::result::Result<usize, rusqlite::Error> {
        self.conn.query_row("SELECT COUNT(*) FROM fraud_scores", [], |row| {
            row.get::<_, i64>(0).map(|c| c as usize)
        })
    }

    pub fn top_scores(&self, limit: usize) -> std::result::Result<Vec<(String, f64, String)>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT tx_hash, fraud_probability, risk_level FROM fraud_scores
             ORDER BY fraud_probability DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?, row.get::<_, String>(2)?))
        })?;
        rows.collect()
    }

    pub fn load_cursor(&self) -> std::result::Result<u64, rusqlite::Error> {
        self.conn.query_row("SELECT last_block FROM pipeline_state WHERE id = 1", [], |row| {
            row.get::<_, i64>(0).map(|h| h.max(0) as u64)
        })
    }

    pub fn save_cursor(&self, height: u64) -> std::result::Result<(), rusqlite::Error> {
        self.conn.execute(
            "UPDATE pipeline_state SET last_block = ?1, updated_at = datetime('now') WHERE id = 1",
            rusqlite::params![height as i64],
        )?;
        Ok(())
    }
}
