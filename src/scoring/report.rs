use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::core::{RiskLevel, ScoredRecord};
use crate::error::Result;

const HIGH_RISK_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HighRiskEntry {
    pub tx_hash: String,
    pub block: i64,
    pub from: String,
    pub to: String,
    pub value: f64,
    pub fraud_probability: f64,
    pub risk: RiskLevel,
}

/// Summary of one scored batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FraudReport {
    pub generated_at: DateTime<Utc>,
    pub total_transactions: usize,
    pub suspicious_transactions: usize,
    pub fraud_rate: f64,
    pub risk_distribution: BTreeMap<String, usize>,
    pub avg_fraud_probability: f64,
    pub anomalies: usize,
    /// Flagged transactions with the highest probability, at most ten.
    pub high_risk: Vec<HighRiskEntry>,
}

impl FraudReport {
    pub fn from_scored(scored: &[ScoredRecord]) -> Self {
        let total = scored.len();
        let mut suspicious: Vec<&ScoredRecord> = scored.iter().filter(|s| s.is_fraud).collect();
        suspicious.sort_by(|a, b| b.fraud_probability.total_cmp(&a.fraud_probability));

        let mut risk_distribution = BTreeMap::new();
        for s in scored {
            *risk_distribution.entry(s.risk_level.as_str().to_string()).or_insert(0) += 1;
        }
        let avg_fraud_probability = if total == 0 {
            0.0
        } else {
            scored.iter().map(|s| s.fraud_probability).sum::<f64>() / total as f64
        };

        Self {
            generated_at: Utc::now(),
            total_transactions: total,
            suspicious_transactions: suspicious.len(),
            fraud_rate: if total == 0 { 0.0 } else { suspicious.len() as f64 / total as f64 },
            risk_distribution,
            avg_fraud_probability,
            anomalies: scored.iter().filter(|s| s.anomaly.is_some_and(|a| a.is_anomaly)).count(),
            high_risk: suspicious
                .iter()
                .take(HIGH_RISK_LIMIT)
                .map(|s| HighRiskEntry {
                    tx_hash: s.record.tx_hash.clone(),
                    block: s.record.block_number,
                    from: s.record.from_addr.clone(),
                    to: s.record.to_addr.clone(),
                    value: s.record.value,
                    fraud_probability: s.fraud_probability,
                    risk: s.risk_level,
                })
                .collect(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        info!("Report saved to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::normalized;

    fn scored(i: usize, probability: f64) -> ScoredRecord {
        ScoredRecord {
            record: normalized(&format!("0x{i}"), "0xa", "0xb", 1_700_000_000, 1.0, 30.0),
            fraud_probability: probability,
            is_fraud: probability >= 0.5,
            risk_level: RiskLevel::from_probability(probability),
            anomaly: None,
        }
    }

    #[test]
    fn summarises_batch() {
        let batch: Vec<ScoredRecord> = (0..20).map(|i| scored(i, i as f64 / 20.0)).collect();
        let report = FraudReport::from_scored(&batch);

        assert_eq!(report.total_transactions, 20);
        assert_eq!(report.suspicious_transactions, 10);
        assert_eq!(report.fraud_rate, 0.5);
        assert_eq!(report.high_risk.len(), 10);
        assert_eq!(report.high_risk[0].tx_hash, "0x19");
        assert!(report.high_risk.windows(2).all(|w| w[0].fraud_probability >= w[1].fraud_probability));
        assert_eq!(report.risk_distribution.values().sum::<usize>(), 20);
        assert_eq!(report.risk_distribution["CRITICAL"], 3);
    }

    #[test]
    fn empty_batch() {
        let report = FraudReport::from_scored(&[]);
        assert_eq!(report.fraud_rate, 0.0);
        assert_eq!(report.avg_fraud_probability, 0.0);
        assert!(report.high_risk.is_empty());
    }
}
