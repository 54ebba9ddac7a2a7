use serde::{Deserialize, Serialize};

use super::features::{FEATURE_COUNT, FeatureRow};

/// Per-column standardisation to zero mean and unit variance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: FeatureRow,
    /// Population standard deviation; constant columns get 1.0.
    pub scale: FeatureRow,
}

impl StandardScaler {
    pub fn fit(rows: &[FeatureRow]) -> Self {
        let mut mean = [0.0; FEATURE_COUNT];
        let mut scale = [1.0; FEATURE_COUNT];
        if rows.is_empty() {
            return Self { mean, scale };
        }
        let n = rows.len() as f64;
        for col in 0..FEATURE_COUNT {
            let m = rows.iter().map(|r| r[col]).sum::<f64>() / n;
            let var = rows.iter().map(|r| (r[col] - m).powi(2)).sum::<f64>() / n;
            mean[col] = m;
            let std = var.sqrt();
            scale[col] = if std > f64::EPSILON { std } else { 1.0 };
        }
        Self { mean, scale }
    }

    pub fn transform(&self, row: &FeatureRow) -> FeatureRow {
        let mut out = [0.0; FEATURE_COUNT];
        for col in 0..FEATURE_COUNT {
            out[col] = (row[col] - self.mean[col]) / self.scale[col];
        }
        out
    }
}
