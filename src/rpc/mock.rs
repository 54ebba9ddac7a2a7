//! Scripted in-memory chain used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ChainRpc, RpcBlock, RpcError, RpcReceipt, RpcTransaction};

pub const BASE_TIMESTAMP: u64 = 1_700_000_000;

#[derive(Default)]
pub struct ScriptedRpc {
    pub head: AtomicU64,
    blocks: Mutex<HashMap<u64, RpcBlock>>,
    receipts: Mutex<HashMap<String, RpcReceipt>>,
    failing_blocks: Mutex<HashSet<u64>>,
    failing_receipts: Mutex<HashSet<String>>,
    slow_blocks: Mutex<HashMap<u64, Duration>>,
    pub head_calls: AtomicUsize,
    pub block_calls: AtomicUsize,
    pub receipt_calls: AtomicUsize,
    head_unreachable: AtomicBool,
}

pub fn tx_hash(height: u64, index: u64) -> String {
    format!("0x{height:08x}{index:04x}")
}

impl ScriptedRpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a block with `tx_count` simple transfers. Block `h` is stamped
    /// `BASE_TIMESTAMP + 12 * h`.
    pub fn with_block(self, height: u64, tx_count: u64) -> Self {
        self.add_block(height, tx_count);
        self
    }

    pub fn add_block(&self, height: u64, tx_count: u64) {
        let transactions: Vec<RpcTransaction> = (0..tx_count)
            .map(|i| RpcTransaction {
                hash: tx_hash(height, i),
                transaction_index: i,
                from: format!("0xsender{i}"),
                to: if i == 2 { None } else { Some(format!("0xrecipient{i}")) },
                value_wei: (i as u128 + 1) * 1_000_000_000_000_000_000,
                gas: 21_000,
                gas_price_wei: 30_000_000_000,
            })
            .collect();
        let mut receipts = self.receipts.lock();
        for tx in &transactions {
            receipts.insert(
                tx.hash.clone(),
                RpcReceipt {
                    gas_used: 21_000,
                    cumulative_gas_used: 21_000 * (tx.transaction_index + 1),
                    status: Some(1),
                    contract_address: tx.to.is_none().then(|| format!("0xcontract{height}")),
                    effective_gas_price_wei: Some(31_000_000_000),
                },
            );
        }
        self.blocks.lock().insert(
            height,
            RpcBlock {
                number: height,
                hash: Some(format!("0xblock{height}")),
                timestamp: BASE_TIMESTAMP + 12 * height,
                transaction_hashes: transactions.iter().map(|t| t.hash.clone()).collect(),
                transactions,
            },
        );
        self.head.fetch_max(height, Ordering::SeqCst);
    }

    pub fn fail_block(&self, height: u64) {
        self.failing_blocks.lock().insert(height);
    }

    pub fn heal_block(&self, height: u64) {
        self.failing_blocks.lock().remove(&height);
    }

    pub fn fail_receipt(&self, tx_hash: &str) {
        self.failing_receipts.lock().insert(tx_hash.to_string());
    }

    pub fn heal_receipt(&self, tx_hash: &str) {
        self.failing_receipts.lock().remove(tx_hash);
    }

    pub fn delay_block(&self, height: u64, delay: Duration) {
        self.slow_blocks.lock().insert(height, delay);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.head_unreachable.store(unreachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChainRpc for ScriptedRpc {
    async fn current_height(&self) -> Result<u64, RpcError> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        if self.head_unreachable.load(Ordering::SeqCst) {
            return Err(RpcError::Decode("endpoint unreachable".into()));
        }
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_block(&self, height: u64, include_transactions: bool) -> Result<RpcBlock, RpcError> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.slow_blocks.lock().get(&height).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_blocks.lock().contains(&height) {
            return Err(RpcError::Decode(format!("scripted failure for block {height}")));
        }
        let mut block = self
            .blocks
            .lock()
            .get(&height)
            .cloned()
            .ok_or_else(|| RpcError::NotFound(format!("block {height}")))?;
        if !include_transactions {
            block.transactions.clear();
        }
        Ok(block)
    }

    async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<RpcReceipt, RpcError> {
        self.receipt_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_receipts.lock().contains(tx_hash) {
            return Err(RpcError::Decode(format!("scripted failure for receipt {tx_hash}")));
        }
        self.receipts
            .lock()
            .get(tx_hash)
            .cloned()
            .ok_or_else(|| RpcError::NotFound(format!("receipt {tx_hash}")))
    }
}
