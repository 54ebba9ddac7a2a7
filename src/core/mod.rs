pub mod cursor;
pub mod normalize;
pub mod pipeline;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One transaction as extracted from a block and its receipt, before any
/// type normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransactionRecord {
    pub block_number: u64,
    pub block_hash: Option<String>,
    pub block_timestamp: u64,
    pub tx_hash: String,
    pub tx_index: u64,
    pub from_addr: String,
    /// `None` for contract creation.
    pub to_addr: Option<String>,
    pub value_ether: Decimal,
    pub gas: u64,
    pub gas_price_gwei: Decimal,
    pub gas_used: u64,
    pub cumulative_gas_used: u64,
    /// 1 = success, 0 = reverted.
    pub status: Option<u64>,
    pub contract_addr: Option<String>,
    pub effective_gas_price_gwei: Option<Decimal>,
}

/// Canonical typed row handed to storage and scoring. The column set is the
/// same whatever shape the source data had.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub block_number: i64,
    pub block_hash: String,
    pub block_timestamp: i64,
    pub tx_hash: String,
    pub tx_index: i64,
    pub from_addr: String,
    pub to_addr: String,
    pub value: f64,
    pub gas: i64,
    pub gas_price: f64,
    pub gas_used: i64,
    pub cumulative_gas_used: i64,
    pub status: u8,
    pub contract_addr: String,
    pub effective_gas_price: f64,
    pub processed_at: DateTime<Utc>,
}

impl NormalizedRecord {
    /// Sort key that totally orders transactions across blocks.
    pub fn position(&self) -> (i64, i64) {
        (self.block_number, self.tx_index)
    }
}

/// A normalized transaction enriched with fraud-risk output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record: NormalizedRecord,
    pub fraud_probability: f64, // 0-1
    pub is_fraud: bool,
    pub risk_level: RiskLevel,
    pub anomaly: Option<AnomalyVerdict>,
}

/// Isolation-forest output for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyVerdict {
    pub is_anomaly: bool,
    /// Higher is more anomalous.
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_probability(probability: f64) -> Self {
        if probability > 0.8 {
            RiskLevel::Critical
        } else if probability > 0.6 {
            RiskLevel::High
        } else if probability > 0.4 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Critical => "CRITICAL",
            RiskLevel::High => "HIGH",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::Low => "LOW",
        }
    }
}

/// Per-block summary accumulated by the streaming loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockAggregate {
    pub block_number: u64,
    pub block_hash: Option<String>,
    pub timestamp: u64,
    pub transaction_count: usize,
    pub total_value_ether: f64,
    pub transactions: Vec<RawTransactionRecord>,
}
