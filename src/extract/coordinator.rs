use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::BlockFetcher;
use crate::core::RawTransactionRecord;

pub const DEFAULT_WORKERS: usize = 5;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExtractionReport {
    /// Unordered across heights; sort by `(block_number, tx_index)` if needed.
    pub records: Vec<RawTransactionRecord>,
    /// Heights whose block retrieval failed, ascending.
    pub failed_heights: Vec<u64>,
    pub blocks_fetched: usize,
}

impl ExtractionReport {
    pub fn lowest_failed(&self) -> Option<u64> {
        self.failed_heights.first().copied()
    }
}

/// Fans a height range out over a bounded pool of fetch tasks.
pub struct ExtractionCoordinator {
    fetcher: Arc<BlockFetcher>,
}

impl ExtractionCoordinator {
    pub fn new(fetcher: Arc<BlockFetcher>) -> Self {
        Self { fetcher }
    }

    pub fn fetcher(&self) -> &Arc<BlockFetcher> {
        &self.fetcher
    }

    /// Records for every height in `[start, end]`. Failed heights contribute
    /// nothing; no retry happens here.
    pub async fn extract(&self, start: u64, end: u64, workers: usize) -> Vec<RawTransactionRecord> {
        self.extract_report(start, end, workers).await.records
    }

    pub async fn extract_report(&self, start: u64, end: u64, workers: usize) -> ExtractionReport {
        if start > end {
            return ExtractionReport::default();
        }
        let started = Instant::now();
        info!("Extracting blocks {start} to {end}");

        let report = if start == end {
            self.extract_single(start).await
        } else {
            self.extract_parallel(start, end, workers.max(1)).await
        };

        let elapsed = started.elapsed();
        let rate = report.records.len() as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        info!(
            "Extracted {} transactions from {} blocks in {:.2?} ({rate:.1} tx/sec)",
            report.records.len(),
            report.blocks_fetched,
            elapsed
        );
        if !report.failed_heights.is_empty() {
            warn!("Failed heights: {:?}", report.failed_heights);
        }
        report
    }

    async fn extract_single(&self, height: u64) -> ExtractionReport {
        match self.fetcher.try_fetch_block(height).await {
            Ok(block) => ExtractionReport {
                records: block.records.clone(),
                failed_heights: Vec::new(),
                blocks_fetched: 1,
            },
            Err(e) => {
                error!(height, "Error fetching block: {e}");
                ExtractionReport {
                    failed_heights: vec![height],
                    ..Default::default()
                }
            }
        }
    }

    async fn extract_parallel(&self, start: u64, end: u64, workers: usize) -> ExtractionReport {
        let permits = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        for height in start..=end {
            let fetcher = self.fetcher.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await.ok();
                (height, fetcher.try_fetch_block(height).await)
            });
        }

        let mut report = ExtractionReport::default();
        let mut outstanding: BTreeSet<u64> = (start..=end).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((height, Ok(block))) => {
                    outstanding.remove(&height);
                    report.blocks_fetched += 1;
                    report.records.extend(block.records.iter().cloned());
                }
                Ok((height, Err(e))) => {
                    error!(height, "Error fetching block: {e}");
                }
                Err(e) => error!("Extraction task failed: {e}"),
            }
        }
        // Heights never reported back (failed or panicked) count as failed.
        report.failed_heights = outstanding.into_iter().collect();
        report
    }
}
