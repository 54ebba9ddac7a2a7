use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::core::NormalizedRecord;

pub const FEATURE_COUNT: usize = 9;

/// Column order of [`FeatureVector::as_array`]; models are trained against it.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "tx_volume_1h",
    "avg_value_1h",
    "gas_price_zscore",
    "value_zscore",
    "address_age_days",
    "unique_addresses",
    "time_of_day",
    "value_deviation",
    "gas_deviation",
];

pub type FeatureRow = [f64; FEATURE_COUNT];

// Network-wide population constants
const GAS_PRICE_MEAN_GWEI: f64 = 50.0;
const GAS_PRICE_STD_GWEI: f64 = 20.0;
const VALUE_MEAN_ETHER: f64 = 1.0;
const VALUE_STD_ETHER: f64 = 5.0;

pub const DEFAULT_HISTORY_WINDOW_SECS: i64 = 3600;
const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub tx_volume_1h: f64,
    pub avg_value_1h: f64,
    pub gas_price_zscore: f64,
    pub value_zscore: f64,
    pub address_age_days: f64,
    pub unique_addresses: f64,
    pub time_of_day: f64,
    pub value_deviation: f64,
    pub gas_deviation: f64,
}

impl FeatureVector {
    pub fn as_array(&self) -> FeatureRow {
        [
            self.tx_volume_1h,
            self.avg_value_1h,
            self.gas_price_zscore,
            self.value_zscore,
            self.address_age_days,
            self.unique_addresses,
            self.time_of_day,
            self.value_deviation,
            self.gas_deviation,
        ]
    }
}

/// Derives per-transaction behavioural features from the transaction itself
/// and, optionally, prior transactions by the same sender.
pub struct FeatureExtractor {
    window_secs: i64,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureExtractor {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_HISTORY_WINDOW_SECS)
    }

    pub fn with_window(window_secs: i64) -> Self {
        Self { window_secs }
    }

    /// One vector per record, in input order.
    pub fn extract_batch(&self, records: &[NormalizedRecord], history: Option<&[NormalizedRecord]>) -> Vec<FeatureVector> {
        let by_sender = history.map(index_by_sender);
        records
            .iter()
            .map(|record| {
                let sender_rows = by_sender
                    .as_ref()
                    .and_then(|index| index.get(record.from_addr.as_str()))
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                self.extract(record, sender_rows)
            })
            .collect()
    }

    /// Features for `record` given the sender's own history rows. A sender
    /// with no rows at or before the transaction is seen for the first time.
    pub fn extract(&self, record: &NormalizedRecord, sender_history: &[&NormalizedRecord]) -> FeatureVector {
        let t = record.block_timestamp;
        let gas_price_zscore = (record.gas_price - GAS_PRICE_MEAN_GWEI) / GAS_PRICE_STD_GWEI;
        let value_zscore = (record.value - VALUE_MEAN_ETHER) / VALUE_STD_ETHER;

        // Rows after the transaction itself never contribute.
        let prior: Vec<&NormalizedRecord> = sender_history.iter().copied().filter(|h| h.block_timestamp <= t).collect();
        let (tx_volume_1h, avg_value_1h, address_age_days, unique_addresses) = if prior.is_empty() {
            (1.0, record.value, 0.0, 1.0)
        } else {
            let recent: Vec<&NormalizedRecord> =
                prior.iter().copied().filter(|h| h.block_timestamp > t - self.window_secs).collect();
            let avg = if recent.is_empty() {
                record.value
            } else {
                recent.iter().map(|h| h.value).sum::<f64>() / recent.len() as f64
            };
            let first_seen = prior.iter().map(|h| h.block_timestamp).min().unwrap_or(t);
            let age_days = ((t - first_seen) / SECS_PER_DAY) as f64;
            let counterparties: HashSet<&str> = recent.iter().map(|h| h.to_addr.as_str()).collect();
            (recent.len() as f64, avg, age_days, counterparties.len() as f64)
        };

        FeatureVector {
            tx_volume_1h,
            avg_value_1h,
            gas_price_zscore,
            value_zscore,
            address_age_days,
            unique_addresses,
            time_of_day: utc_hour(t),
            value_deviation: value_zscore.abs(),
            gas_deviation: gas_price_zscore.abs(),
        }
    }
}

fn index_by_sender(history: &[NormalizedRecord]) -> HashMap<&str, Vec<&NormalizedRecord>> {
    let mut index: HashMap<&str, Vec<&NormalizedRecord>> = HashMap::new();
    for row in history {
        index.entry(row.from_addr.as_str()).or_default().push(row);
    }
    index
}

fn utc_hour(timestamp: i64) -> f64 {
    DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.hour() as f64)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::normalized;

    const T: i64 = 1_700_000_000; // 22:13:20 UTC

    #[test]
    fn first_seen_sender_defaults() {
        let tx = normalized("0x1", "0xa", "0xb", T, 1000.0, 500.0);
        let f = FeatureExtractor::new().extract_batch(std::slice::from_ref(&tx), None)[0];

        assert_eq!(f.tx_volume_1h, 1.0);
        assert_eq!(f.avg_value_1h, 1000.0);
        assert_eq!(f.address_age_days, 0.0);
        assert_eq!(f.unique_addresses, 1.0);
        assert!((f.value_zscore - (1000.0 - 1.0) / 5.0).abs() < 1e-9);
        assert!((f.gas_price_zscore - (500.0 - 50.0) / 20.0).abs() < 1e-9);
        assert_eq!(f.value_deviation, f.value_zscore.abs());
        assert_eq!(f.time_of_day, 22.0);
    }

    #[test]
    fn deviations_are_absolute() {
        let tx = normalized("0x1", "0xa", "0xb", T, 0.0, 10.0);
        let f = FeatureExtractor::new().extract(&tx, &[]);
        assert!(f.gas_price_zscore < 0.0);
        assert_eq!(f.gas_deviation, 2.0);
        assert_eq!(f.value_deviation, 0.2);
    }

    #[test]
    fn history_window_and_counterparties() {
        let tx = normalized("0x9", "0xa", "0xz", T, 3.0, 30.0);
        let history = vec![
            normalized("0x1", "0xa", "0xb", T - 3 * SECS_PER_DAY, 100.0, 30.0),
            normalized("0x2", "0xa", "0xc", T - 3600, 50.0, 30.0), // outside (t-3600, t]
            normalized("0x3", "0xa", "0xc", T - 60, 2.0, 30.0),
            normalized("0x4", "0xother", "0xd", T - 10, 9.0, 30.0),
            tx.clone(),
        ];
        let f = FeatureExtractor::new().extract_batch(std::slice::from_ref(&tx), Some(&history))[0];

        assert_eq!(f.tx_volume_1h, 2.0);
        assert_eq!(f.avg_value_1h, 2.5);
        assert_eq!(f.address_age_days, 3.0);
        // 0xc and 0xz inside the window; 0xb only three days back
        assert_eq!(f.unique_addresses, 2.0);
    }

    #[test]
    fn later_rows_of_the_sender_are_ignored() {
        let tx = normalized("0x1", "0xa", "0xb", T, 1.0, 30.0);
        let history = vec![
            tx.clone(),
            normalized("0x2", "0xa", "0xc", T + 60, 40.0, 30.0),
            normalized("0x3", "0xa", "0xd", T + 120, 80.0, 30.0),
        ];
        let f = FeatureExtractor::new().extract_batch(std::slice::from_ref(&tx), Some(&history))[0];
        assert_eq!(f.tx_volume_1h, 1.0);
        assert_eq!(f.avg_value_1h, 1.0);
        assert_eq!(f.unique_addresses, 1.0);
        assert_eq!(f.address_age_days, 0.0);
    }

    #[test]
    fn only_future_history_counts_as_first_seen() {
        let tx = normalized("0x1", "0xa", "0xb", T, 2.0, 30.0);
        let history = vec![normalized("0x2", "0xa", "0xc", T + 5 * SECS_PER_DAY, 9.0, 30.0)];
        let f = FeatureExtractor::new().extract_batch(std::slice::from_ref(&tx), Some(&history))[0];
        assert_eq!(f.tx_volume_1h, 1.0);
        assert_eq!(f.avg_value_1h, 2.0);
        assert_eq!(f.address_age_days, 0.0);
        assert_eq!(f.unique_addresses, 1.0);
    }

    #[test]
    fn sender_missing_from_history_is_first_seen() {
        let tx = normalized("0x9", "0xnew", "0xz", T, 3.0, 30.0);
        let history = vec![normalized("0x1", "0xa", "0xb", T - 60, 100.0, 30.0)];
        let f = FeatureExtractor::new().extract_batch(std::slice::from_ref(&tx), Some(&history))[0];
        assert_eq!(f.tx_volume_1h, 1.0);
        assert_eq!(f.avg_value_1h, 3.0);
        assert_eq!(f.unique_addresses, 1.0);
    }

    #[test]
    fn array_follows_feature_names() {
        let tx = normalized("0x1", "0xa", "0xb", T, 6.0, 70.0);
        let f = FeatureExtractor::new().extract(&tx, &[]);
        let row = f.as_array();
        let idx = |name: &str| FEATURE_NAMES.iter().position(|n| *n == name).unwrap();
        assert_eq!(row[idx("value_zscore")], 1.0);
        assert_eq!(row[idx("gas_price_zscore")], 1.0);
        assert_eq!(row[idx("time_of_day")], 22.0);
    }
}
