pub mod eth;
#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use eth::EthRpc;

/// Remote chain capability the pipeline depends on.
///
/// Latency and availability of this collaborator are the dominant failure
/// source; callers wrap every call in a timeout.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Height of the latest block known to the endpoint.
    async fn current_height(&self) -> Result<u64, RpcError>;

    /// Fetch a block. With `include_transactions` the full transaction
    /// objects are returned, otherwise only their hashes.
    async fn get_block(&self, height: u64, include_transactions: bool) -> Result<RpcBlock, RpcError>;

    async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<RpcReceipt, RpcError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcBlock {
    pub number: u64,
    pub hash: Option<String>,
    pub timestamp: u64,
    pub transaction_hashes: Vec<String>,
    /// Empty unless the block was requested with full transactions.
    pub transactions: Vec<RpcTransaction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcTransaction {
    pub hash: String,
    pub transaction_index: u64,
    pub from: String,
    /// `None` for contract creation.
    pub to: Option<String>,
    pub value_wei: u128,
    pub gas: u64,
    pub gas_price_wei: u128,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcReceipt {
    pub gas_used: u64,
    pub cumulative_gas_used: u64,
    pub status: Option<u64>,
    pub contract_address: Option<String>,
    pub effective_gas_price_wei: Option<u128>,
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("RPC error: {0}")]
    Rpc(Value),
    #[error("{0} not found")]
    NotFound(String),
    #[error("malformed response: {0}")]
    Decode(String),
}

/// Decode a hex `QUANTITY` ("0x1b4") into an integer.
pub(crate) fn parse_quantity(raw: &str) -> Result<u128, RpcError> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .ok_or_else(|| RpcError::Decode(format!("quantity without 0x prefix: {raw}")))?;
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16).map_err(|e| RpcError::Decode(format!("{raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_decoding() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x").unwrap(), 0);
        assert_eq!(parse_quantity("0x1b4").unwrap(), 436);
        assert_eq!(
            parse_quantity("0xde0b6b3a7640000").unwrap(),
            1_000_000_000_000_000_000
        );
    }

    #[test]
    fn quantity_rejects_garbage() {
        assert!(parse_quantity("1b4").is_err());
        assert!(parse_quantity("0xzz").is_err());
    }
}
