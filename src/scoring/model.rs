use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::features::{FEATURE_NAMES, FeatureRow};
use super::forest::RandomForest;
use super::scaler::StandardScaler;
use crate::error::{PipelineError, Result};

/// Fitted scaler and classifier, stored together so they can never drift
/// apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub feature_names: Vec<String>,
    pub scaler: StandardScaler,
    pub classifier: RandomForest,
    pub trained_at: DateTime<Utc>,
}

impl ModelArtifact {
    pub fn new(scaler: StandardScaler, classifier: RandomForest) -> Self {
        Self {
            feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            scaler,
            classifier,
            trained_at: Utc::now(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let artifact: Self = serde_json::from_str(&contents)?;
        if artifact.feature_names != FEATURE_NAMES {
            return Err(PipelineError::ModelUnavailable(format!(
                "{} was trained on features {:?}",
                path.display(),
                artifact.feature_names
            )));
        }
        info!("Loaded fraud model from {} (trained {})", path.display(), artifact.trained_at);
        Ok(artifact)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        info!("Model saved to {}", path.display());
        Ok(())
    }

    pub fn predict_proba(&self, row: &FeatureRow) -> f64 {
        self.classifier.predict_proba(&self.scaler.transform(row))
    }

    /// Feature importances, highest first.
    pub fn feature_importance(&self) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self
            .feature_names
            .iter()
            .cloned()
            .zip(self.classifier.feature_importances().iter().copied())
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }
}
