use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, RngCore, SeedableRng};

use super::features::{FEATURE_COUNT, FeatureRow};
use crate::core::AnomalyVerdict;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Unsupervised outlier detector. Fitted and applied in one call; nothing is
/// persisted between batches.
#[derive(Debug, Clone, Copy)]
pub struct IsolationForest {
    pub n_trees: usize,
    pub max_samples: usize,
    /// Fraction of the batch flagged as anomalous.
    pub contamination: f64,
    pub seed: u64,
}

impl Default for IsolationForest {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_samples: 256,
            contamination: 0.1,
            seed: 42,
        }
    }
}

enum INode {
    External { size: usize },
    Internal { feature: usize, split: f64, left: Box<INode>, right: Box<INode> },
}

impl IsolationForest {
    pub fn with_contamination(contamination: f64) -> Self {
        Self {
            contamination,
            ..Default::default()
        }
    }

    /// Score every row and flag the `contamination` share with the highest
    /// scores. Scores lie in (0, 1]; values near 1 are clear outliers.
    pub fn fit_predict(&self, rows: &[FeatureRow]) -> Vec<AnomalyVerdict> {
        let n = rows.len();
        if n < 2 {
            return vec![AnomalyVerdict { is_anomaly: false, score: 0.5 }; n];
        }

        let psi = self.max_samples.min(n).max(2);
        let height_limit = (psi as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let trees: Vec<INode> = (0..self.n_trees.max(1))
            .map(|_| {
                let mut tree_rng = StdRng::seed_from_u64(rng.next_u64());
                let sample = index::sample(&mut tree_rng, n, psi).into_vec();
                grow(rows, sample, 0, height_limit, &mut tree_rng)
            })
            .collect();

        let norm = average_path_length(psi);
        let scores: Vec<f64> = rows
            .iter()
            .map(|row| {
                let mean_depth = trees.iter().map(|t| path_length(t, row, 0)).sum::<f64>() / trees.len() as f64;
                2f64.powf(-mean_depth / norm)
            })
            .collect();

        let flagged = ((self.contamination.clamp(0.0, 1.0) * n as f64).round() as usize).min(n);
        let mut ranked: Vec<usize> = (0..n).collect();
        ranked.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
        let mut is_anomaly = vec![false; n];
        for &i in ranked.iter().take(flagged) {
            is_anomaly[i] = true;
        }

        scores
            .into_iter()
            .zip(is_anomaly)
            .map(|(score, is_anomaly)| AnomalyVerdict { is_anomaly, score })
            .collect()
    }
}

fn grow(rows: &[FeatureRow], sample: Vec<usize>, depth: usize, limit: usize, rng: &mut StdRng) -> INode {
    if depth >= limit || sample.len() <= 1 {
        return INode::External { size: sample.len() };
    }
    let splittable: Vec<(usize, f64, f64)> = (0..FEATURE_COUNT)
        .filter_map(|f| {
            let (lo, hi) = sample.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                (lo.min(rows[i][f]), hi.max(rows[i][f]))
            });
            (hi > lo).then_some((f, lo, hi))
        })
        .collect();
    if splittable.is_empty() {
        return INode::External { size: sample.len() };
    }

    let (feature, lo, hi) = splittable[rng.gen_range(0..splittable.len())];
    let split = rng.gen_range(lo..hi);
    let (left, right): (Vec<usize>, Vec<usize>) = sample.into_iter().partition(|&i| rows[i][feature] < split);
    INode::Internal {
        feature,
        split,
        left: Box::new(grow(rows, left, depth + 1, limit, rng)),
        right: Box::new(grow(rows, right, depth + 1, limit, rng)),
    }
}

fn path_length(node: &INode, row: &FeatureRow, depth: usize) -> f64 {
    match node {
        INode::External { size } => depth as f64 + average_path_length(*size),
        INode::Internal { feature, split, left, right } => {
            if row[*feature] < *split {
                path_length(left, row, depth + 1)
            } else {
                path_length(right, row, depth + 1)
            }
        }
    }
}

/// Average unsuccessful-search path length in a binary search tree of `n`
/// nodes, used to normalize isolation depths.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}
