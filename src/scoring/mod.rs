pub mod features;
pub mod forest;
pub mod isolation;
pub mod model;
pub mod report;
pub mod scaler;
pub mod train;

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::ScoringConfig;
use crate::core::{AnomalyVerdict, NormalizedRecord, RiskLevel, ScoredRecord};
use crate::error::{PipelineError, Result};
use features::{FeatureExtractor, FeatureRow, FeatureVector};
use isolation::IsolationForest;
use model::ModelArtifact;

pub use report::FraudReport;
pub use train::{HeuristicLabeler, LabelingStrategy, TrainingParams, TrainingReport};

/// Attaches fraud probabilities and risk bands to normalized records.
///
/// The supervised path needs a trained [`ModelArtifact`]; without one,
/// [`score`](Self::score) reports `ModelUnavailable` so callers can pass the
/// records through unscored.
pub struct FraudScorer {
    artifact: Option<Arc<ModelArtifact>>,
    extractor: FeatureExtractor,
    config: ScoringConfig,
}

impl FraudScorer {
    pub fn new(artifact: Option<ModelArtifact>, config: ScoringConfig) -> Self {
        Self {
            artifact: artifact.map(Arc::new),
            extractor: FeatureExtractor::with_window(config.history_window_secs),
            config,
        }
    }

    /// Load the model named by `config.model_path`. A missing file is not an
    /// error; an unreadable one is.
    pub fn from_config(config: ScoringConfig) -> Result<Self> {
        let path = Path::new(&config.model_path);
        let artifact = if path.exists() {
            Some(ModelArtifact::load(path)?)
        } else {
            warn!("No model found at {}. Train a model first with `chain-etl train`", path.display());
            None
        };
        Ok(Self::new(artifact, config))
    }

    pub fn is_ready(&self) -> bool {
        self.artifact.is_some()
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn features(&self, records: &[NormalizedRecord], history: Option<&[NormalizedRecord]>) -> Vec<FeatureVector> {
        self.extractor.extract_batch(records, history)
    }

    pub fn score(&self, records: &[NormalizedRecord], history: Option<&[NormalizedRecord]>) -> Result<Vec<ScoredRecord>> {
        let artifact = self
            .artifact
            .clone()
            .ok_or_else(|| PipelineError::ModelUnavailable(format!("no model loaded from {}", self.config.model_path)))?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<FeatureRow> = self.features(records, history).iter().map(FeatureVector::as_array).collect();
        let anomalies = (self.config.anomaly_detection && rows.len() >= 2).then(|| self.detect(&rows));

        let scored: Vec<ScoredRecord> = records
            .iter()
            .zip(&rows)
            .enumerate()
            .map(|(i, (record, row))| {
                let fraud_probability = artifact.predict_proba(row);
                ScoredRecord {
                    record: record.clone(),
                    fraud_probability,
                    is_fraud: fraud_probability >= self.config.threshold,
                    risk_level: RiskLevel::from_probability(fraud_probability),
                    anomaly: anomalies.as_ref().map(|a| a[i]),
                }
            })
            .collect();

        let flagged = scored.iter().filter(|s| s.is_fraud).count();
        info!("Scored {} transactions, {flagged} flagged", scored.len());
        Ok(scored)
    }

    /// Unsupervised pass: fits an isolation forest on this batch alone.
    pub fn anomalies(&self, records: &[NormalizedRecord], history: Option<&[NormalizedRecord]>) -> Vec<AnomalyVerdict> {
        let rows: Vec<FeatureRow> = self.features(records, history).iter().map(FeatureVector::as_array).collect();
        self.detect(&rows)
    }

    fn detect(&self, rows: &[FeatureRow]) -> Vec<AnomalyVerdict> {
        let verdicts = IsolationForest::with_contamination(self.config.contamination).fit_predict(rows);
        let flagged = verdicts.iter().filter(|v| v.is_anomaly).count();
        info!(
            "Detected {flagged} anomalies ({:.1}%)",
            flagged as f64 * 100.0 / verdicts.len().max(1) as f64
        );
        verdicts
    }

    /// Importance per feature, highest first; `None` without a model.
    pub fn feature_importance(&self) -> Option<Vec<(String, f64)>> {
        self.artifact.as_ref().map(|a| a.feature_importance())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::normalized;
    use crate::scoring::forest::ForestParams;

    fn batch(n: usize) -> Vec<NormalizedRecord> {
        (0..n)
            .map(|i| {
                let (value, gas) = if i % 5 == 0 { (80.0, 250.0) } else { (0.2, 25.0) };
                normalized(&format!("0x{i:04x}"), &format!("0xs{}", i % 7), "0xd", 1_700_000_000 + i as i64, value, gas)
            })
            .collect()
    }

    fn trained() -> ModelArtifact {
        let params = TrainingParams {
            forest: ForestParams { n_trees: 15, ..Default::default() },
            ..Default::default()
        };
        train::train(&batch(120), None, &HeuristicLabeler, &params).unwrap().0
    }

    #[test]
    fn missing_model_is_explicit() {
        let scorer = FraudScorer::new(None, ScoringConfig::default());
        assert!(!scorer.is_ready());
        let err = scorer.score(&batch(3), None).unwrap_err();
        assert!(matches!(err, PipelineError::ModelUnavailable(_)));
        assert!(scorer.feature_importance().is_none());
    }

    #[test]
    fn missing_model_file_is_not_fatal() {
        let config = ScoringConfig {
            model_path: "/nonexistent/chain_etl/model.json".into(),
            ..Default::default()
        };
        let scorer = FraudScorer::from_config(config).unwrap();
        assert!(!scorer.is_ready());
    }

    #[test]
    fn scores_flag_extremes() {
        let scorer = FraudScorer::new(Some(trained()), ScoringConfig::default());
        let records = batch(20);
        let scored = scorer.score(&records, Some(&records)).unwrap();

        assert_eq!(scored.len(), 20);
        assert!(scored.iter().all(|s| (0.0..=1.0).contains(&s.fraud_probability)));
        assert!(scored[0].is_fraud);
        assert!(scored[0].fraud_probability > scored[1].fraud_probability);
        assert_eq!(scored[0].risk_level, RiskLevel::from_probability(scored[0].fraud_probability));
        assert!(scored.iter().all(|s| s.anomaly.is_some()));
        assert_eq!(scored.iter().filter(|s| s.anomaly.is_some_and(|a| a.is_anomaly)).count(), 2);
    }

    #[test]
    fn anomaly_detection_can_be_disabled() {
        let config = ScoringConfig {
            anomaly_detection: false,
            ..Default::default()
        };
        let scorer = FraudScorer::new(Some(trained()), config);
        let scored = scorer.score(&batch(10), None).unwrap();
        assert!(scored.iter().all(|s| s.anomaly.is_none()));
    }

    #[test]
    fn unsupervised_path_needs_no_model() {
        let scorer = FraudScorer::new(None, ScoringConfig::default());
        let verdicts = scorer.anomalies(&batch(50), None);
        assert_eq!(verdicts.len(), 50);
        assert_eq!(verdicts.iter().filter(|v| v.is_anomaly).count(), 5);
    }
}
