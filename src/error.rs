use std::time::Duration;

use thiserror::Error;

use crate::rpc::RpcError;
use crate::stream::StreamState;

/// Errors surfaced by the extraction, storage and scoring layers.
///
/// Per-height and per-transaction failures are absorbed by the fetcher and
/// only show up here when a caller asks for them explicitly
/// (`BlockFetcher::try_fetch_block`). Batch-level variants block cursor
/// advancement.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Endpoint unreachable or answered with an error.
    #[error("RPC failure: {0}")]
    Rpc(#[from] RpcError),

    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// A single receipt lookup failed; the transaction is dropped.
    #[error("receipt lookup for {tx_hash} failed: {reason}")]
    PartialExtraction { tx_hash: String, reason: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("fraud model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cannot {action} while stream is {state:?}")]
    InvalidState {
        action: &'static str,
        state: StreamState,
    },
}

impl PipelineError {
    /// Whether retrying later may succeed without any operator action.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Rpc(_) | PipelineError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_are_transient() {
        let timeout = PipelineError::Timeout {
            operation: "eth_getBlockByNumber",
            after: Duration::from_secs(30),
        };
        assert!(timeout.is_transient());
        assert_eq!(timeout.to_string(), "eth_getBlockByNumber timed out after 30s");

        let rpc = PipelineError::Rpc(RpcError::Decode("bad hex".into()));
        assert!(rpc.is_transient());
    }

    #[test]
    fn batch_errors_are_not_transient() {
        assert!(!PipelineError::Validation("empty tx_hash".into()).is_transient());
        assert!(!PipelineError::ModelUnavailable("no artifact".into()).is_transient());
    }
}
