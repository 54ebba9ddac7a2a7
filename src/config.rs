use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub rpc: RpcConfig,
    pub extract: ExtractConfig,
    pub batch: BatchConfig,
    pub stream: StreamConfig,
    pub scoring: ScoringConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RpcConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExtractConfig {
    pub workers: usize,
    pub cache_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BatchConfig {
    pub blocks_per_batch: u64,
    /// Blocks behind the head left unprocessed.
    pub confirmations: u64,
    /// First height when the cursor has never been set.
    pub start_block: Option<u64>,
    /// Period of the `schedule` command.
    pub schedule_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StreamConfig {
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    /// Buffer bound, in batches, while flushes keep failing.
    pub max_buffered_batches: usize,
    pub retry_delay_secs: u64,
    pub join_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScoringConfig {
    pub model_path: String,
    pub threshold: f64,
    pub contamination: f64,
    pub history_window_secs: i64,
    pub anomaly_detection: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8545".into(),
            user: None,
            password: None,
            timeout_secs: 30,
        }
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            cache_capacity: 100,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            blocks_per_batch: 10,
            confirmations: 1,
            start_block: None,
            schedule_interval_secs: 86_400,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 12,
            batch_size: 10,
            max_buffered_batches: 10,
            retry_delay_secs: 5,
            join_timeout_secs: 10,
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            model_path: "data/fraud_model.json".into(),
            threshold: 0.5,
            contamination: 0.1,
            history_window_secs: 3600,
            anomaly_detection: true,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/chain_etl.db".into(),
        }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl BatchConfig {
    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs)
    }
}

impl StreamConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn buffer_capacity(&self) -> usize {
        self.batch_size.saturating_mul(self.max_buffered_batches.max(1))
    }
}

impl Config {
    /// Load config from a TOML file. Falls back to defaults if file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse {}: {e}, using defaults", path.display());
                Self::default()
            }),
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}
