use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{info, warn};

use super::{NormalizedRecord, RawTransactionRecord};
use crate::error::{PipelineError, Result};

/// Normalize raw rows, stamping them with the current instant.
pub fn normalize(rows: Vec<RawTransactionRecord>) -> Result<Vec<NormalizedRecord>> {
    normalize_at(rows, Utc::now())
}

/// Convert raw rows into the canonical typed record set.
///
/// Nullable addresses become empty strings and nullable prices become zero.
/// A row that cannot be represented (integer overflow, missing or unknown
/// status) fails the whole batch.
pub fn normalize_at(
    rows: Vec<RawTransactionRecord>,
    processed_at: DateTime<Utc>,
) -> Result<Vec<NormalizedRecord>> {
    if rows.is_empty() {
        warn!("No rows to normalize");
        return Ok(Vec::new());
    }

    let count = rows.len();
    let records = rows
        .into_iter()
        .map(|row| normalize_row(row, processed_at))
        .collect::<Result<Vec<_>>>()?;

    info!("Normalized {count} rows");
    Ok(records)
}

fn normalize_row(row: RawTransactionRecord, processed_at: DateTime<Utc>) -> Result<NormalizedRecord> {
    let status = match row.status {
        Some(s @ (0 | 1)) => s as u8,
        Some(other) => {
            return Err(PipelineError::Validation(format!(
                "tx {} has unknown status {other}",
                row.tx_hash
            )));
        }
        None => {
            return Err(PipelineError::Validation(format!(
                "tx {} has no receipt status",
                row.tx_hash
            )));
        }
    };

    Ok(NormalizedRecord {
        block_number: to_i64(row.block_number, "block_number", &row.tx_hash)?,
        block_hash: row.block_hash.unwrap_or_default(),
        block_timestamp: to_i64(row.block_timestamp, "block_timestamp", &row.tx_hash)?,
        tx_index: to_i64(row.tx_index, "tx_index", &row.tx_hash)?,
        value: to_f64(row.value_ether),
        gas: to_i64(row.gas, "gas", &row.tx_hash)?,
        gas_price: to_f64(row.gas_price_gwei),
        gas_used: to_i64(row.gas_used, "gas_used", &row.tx_hash)?,
        cumulative_gas_used: to_i64(row.cumulative_gas_used, "cumulative_gas_used", &row.tx_hash)?,
        status,
        to_addr: row.to_addr.unwrap_or_default(),
        contract_addr: row.contract_addr.unwrap_or_default(),
        effective_gas_price: row.effective_gas_price_gwei.map(to_f64).unwrap_or(0.0),
        tx_hash: row.tx_hash,
        from_addr: row.from_addr,
        processed_at,
    })
}

fn to_i64(value: u64, column: &str, tx_hash: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| PipelineError::Validation(format!("tx {tx_hash}: {column}={value} overflows i64")))
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Batch-level quality checks run before anything is committed.
pub fn validate(records: &[NormalizedRecord]) -> Result<()> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        let missing: Vec<&str> = [
            ("tx_hash", record.tx_hash.is_empty()),
            ("from_addr", record.from_addr.is_empty()),
            ("block_hash", record.block_hash.is_empty()),
        ]
        .into_iter()
        .filter_map(|(column, empty)| empty.then_some(column))
        .collect();
        if !missing.is_empty() {
            return Err(PipelineError::Validation(format!(
                "block {} tx {}: missing required columns {missing:?}",
                record.block_number, record.tx_index
            )));
        }
        if !seen.insert(record.tx_hash.as_str()) {
            return Err(PipelineError::Validation(format!(
                "duplicate tx hash {} in batch",
                record.tx_hash
            )));
        }
    }
    info!("Data validation passed for {} rows", records.len());
    Ok(())
}
