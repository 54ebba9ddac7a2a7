pub mod cache;
pub mod coordinator;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, error, warn};

use crate::core::{BlockAggregate, RawTransactionRecord};
use crate::error::{PipelineError, Result};
use crate::rpc::{ChainRpc, RpcBlock, RpcError, RpcReceipt, RpcTransaction};

pub use cache::{BlockCache, DEFAULT_CACHE_CAPACITY};
pub use coordinator::{ExtractionCoordinator, ExtractionReport};

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

const ETHER_SCALE: u32 = 18;
const GWEI_SCALE: u32 = 9;

/// Everything extracted for one height. This is what the cache holds.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBlock {
    pub height: u64,
    pub hash: Option<String>,
    pub timestamp: u64,
    /// Number of transactions the block itself declared.
    pub declared_tx_count: usize,
    /// Ordered by tx index.
    pub records: Vec<RawTransactionRecord>,
    /// At least one receipt lookup failed and its transaction is missing.
    pub dropped: bool,
}

impl FetchedBlock {
    pub fn aggregate(&self) -> BlockAggregate {
        let total: Decimal = self.records.iter().map(|r| r.value_ether).sum();
        BlockAggregate {
            block_number: self.height,
            block_hash: self.hash.clone(),
            timestamp: self.timestamp,
            transaction_count: self.records.len(),
            total_value_ether: total.to_f64().unwrap_or(0.0),
            transactions: self.records.clone(),
        }
    }
}

/// Retrieves one block plus every transaction receipt and flattens them into
/// raw records, caching complete blocks by height.
pub struct BlockFetcher {
    rpc: Arc<dyn ChainRpc>,
    cache: Mutex<BlockCache>,
    timeout: Duration,
}

impl BlockFetcher {
    pub fn new(rpc: Arc<dyn ChainRpc>) -> Self {
        Self::with_options(rpc, DEFAULT_CACHE_CAPACITY, DEFAULT_RPC_TIMEOUT)
    }

    pub fn with_options(rpc: Arc<dyn ChainRpc>, cache_capacity: usize, timeout: Duration) -> Self {
        Self {
            rpc,
            cache: Mutex::new(BlockCache::new(cache_capacity)),
            timeout,
        }
    }

    pub fn cached_blocks(&self) -> usize {
        self.cache.lock().len()
    }

    /// Chain head as reported by the endpoint, bounded by the RPC timeout.
    pub async fn current_height(&self) -> Result<u64> {
        self.with_timeout("eth_blockNumber", self.rpc.current_height()).await
    }

    /// Raw records for `height`. A block-level failure is logged and yields
    /// no rows; use [`try_fetch_block`](Self::try_fetch_block) to observe it.
    pub async fn fetch(&self, height: u64) -> Vec<RawTransactionRecord> {
        match self.try_fetch_block(height).await {
            Ok(block) => block.records.clone(),
            Err(e) => {
                error!(height, "Error fetching block: {e}");
                Vec::new()
            }
        }
    }

    pub async fn try_fetch_block(&self, height: u64) -> Result<Arc<FetchedBlock>> {
        let cached = self.cache.lock().get(height);
        if let Some(hit) = cached {
            debug!(height, "Block cache hit");
            return Ok(hit);
        }

        let block = self
            .with_timeout("eth_getBlockByNumber", self.rpc.get_block(height, true))
            .await?;

        let mut transactions: Vec<&RpcTransaction> = block.transactions.iter().collect();
        transactions.sort_by_key(|tx| tx.transaction_index);

        let mut records = Vec::with_capacity(transactions.len());
        let mut dropped = false;
        for tx in transactions {
            match self.receipt_record(&block, tx).await {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(height, "{e}");
                    dropped = true;
                }
            }
        }

        let declared_tx_count = block.transaction_hashes.len().max(block.transactions.len());
        let fetched = Arc::new(FetchedBlock {
            height,
            hash: block.hash,
            timestamp: block.timestamp,
            declared_tx_count,
            records,
            dropped,
        });

        if !dropped {
            if let Some(evicted) = self.cache.lock().insert(fetched.clone()) {
                debug!(evicted, "Evicted block from cache");
            }
        }
        debug!(height, txs = fetched.records.len(), "Fetched block");
        Ok(fetched)
    }

    async fn receipt_record(&self, block: &RpcBlock, tx: &RpcTransaction) -> Result<RawTransactionRecord> {
        let partial = |reason: String| PipelineError::PartialExtraction {
            tx_hash: tx.hash.clone(),
            reason,
        };
        let receipt = self
            .with_timeout("eth_getTransactionReceipt", self.rpc.get_transaction_receipt(&tx.hash))
            .await
            .map_err(|e| partial(e.to_string()))?;
        build_record(block, tx, receipt).map_err(|e| partial(e.to_string()))
    }

    async fn with_timeout<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = std::result::Result<T, RpcError>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(PipelineError::Timeout {
                operation,
                after: self.timeout,
            }),
        }
    }
}

fn build_record(block: &RpcBlock, tx: &RpcTransaction, receipt: RpcReceipt) -> std::result::Result<RawTransactionRecord, RpcError> {
    Ok(RawTransactionRecord {
        block_number: block.number,
        block_hash: block.hash.clone(),
        block_timestamp: block.timestamp,
        tx_hash: tx.hash.clone(),
        tx_index: tx.transaction_index,
        from_addr: tx.from.clone(),
        to_addr: tx.to.clone(),
        value_ether: from_wei(tx.value_wei, ETHER_SCALE)?,
        gas: tx.gas,
        gas_price_gwei: from_wei(tx.gas_price_wei, GWEI_SCALE)?,
        gas_used: receipt.gas_used,
        cumulative_gas_used: receipt.cumulative_gas_used,
        status: receipt.status,
        contract_addr: receipt.contract_address,
        effective_gas_price_gwei: receipt
            .effective_gas_price_wei
            .map(|wei| from_wei(wei, GWEI_SCALE))
            .transpose()?,
    })
}

/// Exact wei to ether (scale 18) or gwei (scale 9) conversion.
fn from_wei(wei: u128, scale: u32) -> std::result::Result<Decimal, RpcError> {
    let wei = i128::try_from(wei).map_err(|_| RpcError::Decode(format!("{wei} wei out of range")))?;
    Decimal::try_from_i128_with_scale(wei, scale)
        .map(|d| d.normalize())
        .map_err(|e| RpcError::Decode(format!("{wei} wei: {e}")))
}
