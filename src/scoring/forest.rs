use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

use super::features::{FEATURE_COUNT, FeatureRow};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 15,
            min_samples_split: 10,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Node {
    Leaf {
        /// Fraction of positive samples that reached this leaf.
        probability: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DecisionTree {
    nodes: Vec<Node>,
}

impl DecisionTree {
    fn predict(&self, row: &FeatureRow) -> f64 {
        let mut idx = 0;
        loop {
            match self.nodes.get(idx) {
                Some(Node::Leaf { probability }) => return *probability,
                Some(Node::Split { feature, threshold, left, right }) => {
                    idx = if row[*feature] <= *threshold { *left } else { *right };
                }
                None => return 0.0,
            }
        }
    }
}

/// Bagged ensemble of gini-split binary decision trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    trees: Vec<DecisionTree>,
    /// Mean impurity decrease per feature, normalized to sum to 1.
    feature_importances: FeatureRow,
}

impl RandomForest {
    pub fn fit(rows: &[FeatureRow], labels: &[bool], params: &ForestParams) -> Self {
        let mut rng = StdRng::seed_from_u64(params.seed);
        let max_features = (FEATURE_COUNT as f64).sqrt().round().max(1.0) as usize;
        let mut trees = Vec::with_capacity(params.n_trees);
        let mut importances = [0.0; FEATURE_COUNT];

        for _ in 0..params.n_trees {
            let mut tree_rng = StdRng::seed_from_u64(rng.next_u64());
            let sample: Vec<usize> = (0..rows.len()).map(|_| tree_rng.gen_range(0..rows.len())).collect();
            let mut builder = TreeBuilder {
                rows,
                labels,
                params,
                max_features,
                rng: tree_rng,
                nodes: Vec::new(),
                importances: [0.0; FEATURE_COUNT],
                total: sample.len().max(1) as f64,
            };
            if !sample.is_empty() {
                builder.build(sample, 0);
            } else {
                builder.nodes.push(Node::Leaf { probability: 0.0 });
            }

            let tree_total: f64 = builder.importances.iter().sum();
            if tree_total > 0.0 {
                for (acc, imp) in importances.iter_mut().zip(builder.importances.iter()) {
                    *acc += imp / tree_total;
                }
            }
            trees.push(DecisionTree { nodes: builder.nodes });
        }

        let total: f64 = importances.iter().sum();
        if total > 0.0 {
            importances.iter_mut().for_each(|v| *v /= total);
        }
        Self {
            trees,
            feature_importances: importances,
        }
    }

    /// Probability of the positive class, averaged over trees.
    pub fn predict_proba(&self, row: &FeatureRow) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        self.trees.iter().map(|t| t.predict(row)).sum::<f64>() / self.trees.len() as f64
    }

    pub fn feature_importances(&self) -> &FeatureRow {
        &self.feature_importances
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}

struct TreeBuilder<'a> {
    rows: &'a [FeatureRow],
    labels: &'a [bool],
    params: &'a ForestParams,
    max_features: usize,
    rng: StdRng,
    nodes: Vec<Node>,
    importances: FeatureRow,
    total: f64,
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    impurity: f64,
}

impl TreeBuilder<'_> {
    /// Grows the subtree for `sample` and returns its root index.
    fn build(&mut self, sample: Vec<usize>, depth: usize) -> usize {
        let n = sample.len();
        let positives = sample.iter().filter(|&&i| self.labels[i]).count();
        let probability = positives as f64 / n as f64;
        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf { probability });

        if depth >= self.params.max_depth || n < self.params.min_samples_split || positives == 0 || positives == n {
            return idx;
        }
        let parent_impurity = gini(positives, n);
        let Some(best) = self.best_split(&sample) else {
            return idx;
        };
        if best.impurity >= parent_impurity {
            return idx;
        }

        self.importances[best.feature] += (n as f64 / self.total) * (parent_impurity - best.impurity);
        let (left, right): (Vec<usize>, Vec<usize>) = sample
            .into_iter()
            .partition(|&i| self.rows[i][best.feature] <= best.threshold);
        let left = self.build(left, depth + 1);
        let right = self.build(right, depth + 1);
        self.nodes[idx] = Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left,
            right,
        };
        idx
    }

    /// Scans features in random order until `max_features` non-constant ones
    /// have been evaluated.
    fn best_split(&mut self, sample: &[usize]) -> Option<BestSplit> {
        let mut features: Vec<usize> = (0..FEATURE_COUNT).collect();
        features.shuffle(&mut self.rng);

        let n = sample.len();
        let total_pos = sample.iter().filter(|&&i| self.labels[i]).count();
        let mut best: Option<BestSplit> = None;
        let mut evaluated = 0;

        for feature in features {
            if evaluated >= self.max_features && best.is_some() {
                break;
            }
            let mut values: Vec<(f64, bool)> = sample.iter().map(|&i| (self.rows[i][feature], self.labels[i])).collect();
            values.sort_by(|a, b| a.0.total_cmp(&b.0));
            if values[0].0 == values[n - 1].0 {
                continue;
            }
            evaluated += 1;

            let mut left_pos = 0;
            for k in 1..n {
                if values[k - 1].1 {
                    left_pos += 1;
                }
                if values[k - 1].0 == values[k].0 {
                    continue;
                }
                let right_pos = total_pos - left_pos;
                let impurity = (k as f64 * gini(left_pos, k) + (n - k) as f64 * gini(right_pos, n - k)) / n as f64;
                if best.as_ref().is_none_or(|b| impurity < b.impurity) {
                    best = Some(BestSplit {
                        feature,
                        threshold: (values[k - 1].0 + values[k].0) / 2.0,
                        impurity,
                    });
                }
            }
        }
        best
    }
}

fn gini(positives: usize, n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = positives as f64 / n as f64;
    2.0 * p * (1.0 - p)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> (Vec<FeatureRow>, Vec<bool>) {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..200 {
            let mut row = [0.0; FEATURE_COUNT];
            row[3] = i as f64 / 10.0; // informative
            row[6] = (i % 24) as f64; // noise
            rows.push(row);
            labels.push(row[3] > 12.0);
        }
        (rows, labels)
    }

    #[test]
    fn learns_threshold_rule() {
        let (rows, labels) = dataset();
        let forest = RandomForest::fit(&rows, &labels, &ForestParams::default());
        assert_eq!(forest.n_trees(), 100);

        let mut high = [0.0; FEATURE_COUNT];
        high[3] = 18.0;
        let mut low = [0.0; FEATURE_COUNT];
        low[3] = 2.0;
        assert!(forest.predict_proba(&high) > 0.9);
        assert!(forest.predict_proba(&low) < 0.1);
    }

    #[test]
    fn importances_favour_informative_feature() {
        let (rows, labels) = dataset();
        let forest = RandomForest::fit(&rows, &labels, &ForestParams::default());
        let imp = forest.feature_importances();
        assert!((imp.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        let top = imp.iter().enumerate().max_by(|a, b| a.1.total_cmp(b.1)).map(|(i, _)| i);
        assert_eq!(top, Some(3));
    }

    #[test]
    fn same_seed_same_forest() {
        let (rows, labels) = dataset();
        let params = ForestParams { n_trees: 10, ..Default::default() };
        assert_eq!(RandomForest::fit(&rows, &labels, &params), RandomForest::fit(&rows, &labels, &params));
    }

    #[test]
    fn single_class_predicts_constant() {
        let (rows, _) = dataset();
        let labels = vec![false; rows.len()];
        let forest = RandomForest::fit(&rows, &labels, &ForestParams { n_trees: 5, ..Default::default() });
        assert_eq!(forest.predict_proba(&rows[0]), 0.0);
    }

    #[test]
    fn serde_roundtrip_preserves_predictions() {
        let (rows, labels) = dataset();
        let forest = RandomForest::fit(&rows, &labels, &ForestParams { n_trees: 5, ..Default::default() });
        let json = serde_json::to_string(&forest).unwrap();
        let back: RandomForest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.predict_proba(&rows[150]), forest.predict_proba(&rows[150]));
    }
}
