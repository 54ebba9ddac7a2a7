use rand::rngs::StdRng;
use rand::seq::{SliceRandom, index};
use rand::SeedableRng;
use serde::Serialize;
use tracing::info;

use super::features::{FeatureExtractor, FeatureRow, FeatureVector};
use super::forest::{ForestParams, RandomForest};
use super::model::ModelArtifact;
use super::scaler::StandardScaler;
use crate::core::NormalizedRecord;
use crate::error::{PipelineError, Result};

pub const MIN_TRAINING_SAMPLES: usize = 10;

/// Source of training labels when no ground truth is available.
pub trait LabelingStrategy {
    fn name(&self) -> &str;
    fn label(&self, features: &[FeatureVector], rng: &mut StdRng) -> Vec<bool>;
}

/// Bootstrapping fallback: flags extreme value and gas price together, or
/// very high sender activity, then injects a small share of random positives
/// so both classes are present.
pub struct HeuristicLabeler;

impl LabelingStrategy for HeuristicLabeler {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn label(&self, features: &[FeatureVector], rng: &mut StdRng) -> Vec<bool> {
        let mut labels: Vec<bool> = features
            .iter()
            .map(|f| (f.value_zscore > 2.0 && f.gas_price_zscore > 2.0) || f.tx_volume_1h > 100.0)
            .collect();
        let n = labels.len();
        if n > 0 {
            for i in index::sample(rng, n, (n / 20).max(1)).into_vec() {
                labels[i] = true;
            }
        }
        labels
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrainingParams {
    pub forest: ForestParams,
    pub test_fraction: f64,
    pub seed: u64,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            forest: ForestParams::default(),
            test_fraction: 0.2,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub samples: usize,
    pub positives: usize,
    pub train_size: usize,
    pub test_size: usize,
    pub accuracy: f64,
    /// `None` when the held-out split contains a single class.
    pub roc_auc: Option<f64>,
    pub feature_importances: Vec<(String, f64)>,
    pub label_source: String,
}

/// Fit scaler and classifier on `records`. Without `labels`, `labeler`
/// synthesizes them. The records double as sender history so training sees
/// the same features as batch scoring.
pub fn train(
    records: &[NormalizedRecord],
    labels: Option<&[bool]>,
    labeler: &dyn LabelingStrategy,
    params: &TrainingParams,
) -> Result<(ModelArtifact, TrainingReport)> {
    if records.len() < MIN_TRAINING_SAMPLES {
        return Err(PipelineError::Validation(format!(
            "need at least {MIN_TRAINING_SAMPLES} transactions to train, got {}",
            records.len()
        )));
    }
    info!("Training fraud detection model on {} transactions", records.len());

    let features = FeatureExtractor::new().extract_batch(records, Some(records));
    let mut rng = StdRng::seed_from_u64(params.seed);
    let (labels, label_source) = match labels {
        Some(given) if given.len() != records.len() => {
            return Err(PipelineError::Validation(format!(
                "{} labels for {} transactions",
                given.len(),
                records.len()
            )));
        }
        Some(given) => (given.to_vec(), "provided".to_string()),
        None => {
            info!("No labels supplied, generating synthetic labels ({})", labeler.name());
            (labeler.label(&features, &mut rng), labeler.name().to_string())
        }
    };
    let positives = labels.iter().filter(|&&l| l).count();
    info!(
        "Training on {} samples, {positives} fraud cases ({:.1}%)",
        labels.len(),
        positives as f64 * 100.0 / labels.len() as f64
    );

    let rows: Vec<FeatureRow> = features.iter().map(FeatureVector::as_array).collect();
    let mut order: Vec<usize> = (0..rows.len()).collect();
    order.shuffle(&mut rng);
    let test_size = ((rows.len() as f64 * params.test_fraction).ceil() as usize).clamp(1, rows.len() - 1);
    let (test_idx, train_idx) = order.split_at(test_size);

    let train_rows: Vec<FeatureRow> = train_idx.iter().map(|&i| rows[i]).collect();
    let train_labels: Vec<bool> = train_idx.iter().map(|&i| labels[i]).collect();
    let scaler = StandardScaler::fit(&train_rows);
    let scaled: Vec<FeatureRow> = train_rows.iter().map(|r| scaler.transform(r)).collect();
    let classifier = RandomForest::fit(&scaled, &train_labels, &params.forest);
    let artifact = ModelArtifact::new(scaler, classifier);

    let test_probs: Vec<f64> = test_idx.iter().map(|&i| artifact.predict_proba(&rows[i])).collect();
    let test_labels: Vec<bool> = test_idx.iter().map(|&i| labels[i]).collect();
    let correct = test_probs
        .iter()
        .zip(&test_labels)
        .filter(|&(&p, &l)| (p >= 0.5) == l)
        .count();
    let accuracy = correct as f64 / test_labels.len() as f64;
    let roc_auc = roc_auc(&test_probs, &test_labels);

    info!("Accuracy: {accuracy:.3}");
    match roc_auc {
        Some(auc) => info!("ROC-AUC: {auc:.3}"),
        None => info!("ROC-AUC: undefined, test split has a single class"),
    }
    let feature_importances = artifact.feature_importance();
    for (name, importance) in &feature_importances {
        info!("{name:25}: {importance:.3}");
    }

    let report = TrainingReport {
        samples: rows.len(),
        positives,
        train_size: train_idx.len(),
        test_size,
        accuracy,
        roc_auc,
        feature_importances,
        label_source,
    };
    Ok((artifact, report))
}

/// Area under the ROC curve via the rank-sum statistic, ties averaged.
pub fn roc_auc(scores: &[f64], labels: &[bool]) -> Option<f64> {
    let pos = labels.iter().filter(|&&l| l).count();
    let neg = labels.len() - pos;
    if pos == 0 || neg == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));
    let mut ranks = vec![0.0; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &k in &order[i..=j] {
            ranks[k] = avg_rank;
        }
        i = j + 1;
    }

    let pos_rank_sum: f64 = ranks.iter().zip(labels).filter(|(_, l)| **l).map(|(r, _)| r).sum();
    let pos = pos as f64;
    Some((pos_rank_sum - pos * (pos + 1.0) / 2.0) / (pos * neg as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::normalized;

    fn records(n: usize) -> Vec<NormalizedRecord> {
        (0..n)
            .map(|i| {
                let (value, gas) = if i % 4 == 0 { (50.0, 200.0) } else { (0.5, 30.0) };
                normalized(&format!("0x{i:04x}"), &format!("0xsender{}", i % 13), "0xdest", 1_700_000_000 + i as i64 * 12, value, gas)
            })
            .collect()
    }

    #[test]
    fn heuristic_labels_extremes_and_injects_positives() {
        let features = FeatureExtractor::new().extract_batch(&records(40), None);
        let mut rng = StdRng::seed_from_u64(42);
        let labels = HeuristicLabeler.label(&features, &mut rng);
        // every 4th record is extreme on both z-scores
        for (i, label) in labels.iter().enumerate() {
            if i % 4 == 0 {
                assert!(*label);
            }
        }
        let positives = labels.iter().filter(|&&l| l).count();
        assert!((10..=12).contains(&positives));
    }

    #[test]
    fn injects_at_least_one_positive() {
        let features = FeatureExtractor::new().extract_batch(&records(3)[1..], None);
        let mut rng = StdRng::seed_from_u64(42);
        let labels = HeuristicLabeler.label(&features, &mut rng);
        assert_eq!(labels.iter().filter(|&&l| l).count(), 1);
    }

    #[test]
    fn trains_and_reports() {
        let params = TrainingParams {
            forest: ForestParams { n_trees: 20, ..Default::default() },
            ..Default::default()
        };
        let (model, report) = train(&records(200), None, &HeuristicLabeler, &params).unwrap();
        assert_eq!(report.samples, 200);
        assert_eq!(report.test_size, 40);
        assert_eq!(report.train_size, 160);
        assert_eq!(report.label_source, "heuristic");
        assert!(report.accuracy > 0.8);
        assert_eq!(report.feature_importances.len(), 9);
        assert_eq!(model.classifier.n_trees(), 20);
    }

    #[test]
    fn provided_labels_must_match() {
        let err = train(&records(20), Some(&[true; 5]), &HeuristicLabeler, &TrainingParams::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn too_few_samples() {
        assert!(train(&records(5), None, &HeuristicLabeler, &TrainingParams::default()).is_err());
    }

    #[test]
    fn auc_extremes_and_ties() {
        assert_eq!(roc_auc(&[0.1, 0.9], &[false, true]), Some(1.0));
        assert_eq!(roc_auc(&[0.9, 0.1], &[false, true]), Some(0.0));
        assert_eq!(roc_auc(&[0.5, 0.5], &[false, true]), Some(0.5));
        assert_eq!(roc_auc(&[0.3, 0.4], &[true, true]), None);
    }
}
