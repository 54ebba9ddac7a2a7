use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::cursor::PipelineCursor;
use super::normalize::{normalize, validate};
use super::{NormalizedRecord, ScoredRecord};
use crate::config::BatchConfig;
use crate::db::TransactionStore;
use crate::error::{PipelineError, Result};
use crate::extract::coordinator::DEFAULT_WORKERS;
use crate::extract::{BlockFetcher, ExtractionCoordinator};
use crate::scoring::FraudScorer;

/// Result of one `process_range` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub start: u64,
    pub end: u64,
    /// Height the cursor was advanced to, if any.
    pub committed: Option<u64>,
    pub transactions_loaded: usize,
    pub transactions_scored: usize,
    pub failed_heights: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EtlSummary {
    pub blocks_processed: u64,
    pub transactions_loaded: usize,
    pub transactions_scored: usize,
    pub failed_heights: Vec<u64>,
    pub last_block: u64,
}

/// Totals of a `run_scheduled` loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScheduleSummary {
    pub runs: u64,
    pub failed_runs: u64,
    pub blocks_processed: u64,
    pub transactions_loaded: usize,
    pub last_block: u64,
}

/// Batch ETL: extract a height range, normalize, optionally score, store,
/// and only then move the cursor.
pub struct EtlPipeline {
    coordinator: ExtractionCoordinator,
    store: Arc<dyn TransactionStore>,
    cursor: PipelineCursor,
    scorer: Option<Arc<FraudScorer>>,
    workers: usize,
    batch: BatchConfig,
}

impl EtlPipeline {
    pub fn new(fetcher: Arc<BlockFetcher>, store: Arc<dyn TransactionStore>, cursor: PipelineCursor) -> Self {
        Self {
            coordinator: ExtractionCoordinator::new(fetcher),
            store,
            cursor,
            scorer: None,
            workers: DEFAULT_WORKERS,
            batch: BatchConfig::default(),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<FraudScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn with_options(mut self, workers: usize, batch: BatchConfig) -> Self {
        self.workers = workers;
        self.cursor = self.cursor.with_start_block(batch.start_block);
        self.batch = batch;
        self
    }

    pub fn cursor(&self) -> &PipelineCursor {
        &self.cursor
    }

    /// Process `[start, end]` and advance the cursor to the highest height
    /// below the first failed one. Any normalization, validation or storage
    /// failure propagates and leaves the cursor untouched.
    pub async fn process_range(&self, start: u64, end: u64) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome {
            start,
            end,
            ..Default::default()
        };
        if start > end {
            return Ok(outcome);
        }
        info!("Processing blocks {start} to {end}");

        let report = self.coordinator.extract_report(start, end, self.workers).await;
        let lowest_failed = report.lowest_failed();
        let mut records = normalize(report.records)?;
        records.sort_by_key(NormalizedRecord::position);
        validate(&records)?;

        let scored = match &self.scorer {
            Some(scorer) => self.score(scorer, &records)?,
            None => Vec::new(),
        };

        outcome.transactions_loaded = self.store.upsert_transactions(&records)?;
        if !scored.is_empty() {
            outcome.transactions_scored = self.store.upsert_scores(&scored)?;
        }

        let commit = match lowest_failed {
            Some(failed) => failed.checked_sub(1).filter(|&h| h >= start),
            None => Some(end),
        };
        if let Some(height) = commit {
            self.cursor.set_last(height)?;
        }
        if !report.failed_heights.is_empty() {
            warn!(
                "Blocks {:?} failed, cursor held at {}",
                report.failed_heights,
                self.cursor.get_last()
            );
        }
        outcome.committed = commit;
        outcome.failed_heights = report.failed_heights;
        info!(
            "Loaded {} transactions for blocks {start}-{end} ({} scored)",
            outcome.transactions_loaded, outcome.transactions_scored
        );
        Ok(outcome)
    }

    /// Process everything between the cursor and the confirmed head (or
    /// `end`, if lower) in batches. Stops at the first batch with failures.
    pub async fn run_once(&self, end: Option<u64>) -> Result<EtlSummary> {
        let head = self.coordinator.fetcher().current_height().await?;
        let confirmed = head.saturating_sub(self.batch.confirmations);
        let end = end.map_or(confirmed, |e| e.min(confirmed));
        let start = self.cursor.next_start();

        let mut summary = EtlSummary {
            last_block: self.cursor.get_last(),
            ..Default::default()
        };
        if start > end {
            info!("No new blocks to process (cursor {}, head {head})", summary.last_block);
            return Ok(summary);
        }
        info!("Processing blocks {start} to {end} ({} blocks)", end - start + 1);

        let step = self.batch.blocks_per_batch.max(1);
        let mut batch_start = start;
        while batch_start <= end {
            let batch_end = batch_start.saturating_add(step - 1).min(end);
            let outcome = self.process_range(batch_start, batch_end).await?;
            summary.transactions_loaded += outcome.transactions_loaded;
            summary.transactions_scored += outcome.transactions_scored;
            if let Some(committed) = outcome.committed {
                summary.blocks_processed += committed - batch_start + 1;
            }
            if !outcome.failed_heights.is_empty() {
                summary.failed_heights = outcome.failed_heights;
                break;
            }
            batch_start = batch_end + 1;
        }
        summary.last_block = self.cursor.get_last();
        info!(
            "ETL run complete: {} blocks, {} transactions, cursor at {}",
            summary.blocks_processed, summary.transactions_loaded, summary.last_block
        );
        Ok(summary)
    }

    /// Call [`run_once`](Self::run_once) right away and then every `every`
    /// until `shutdown` resolves. A failed run is logged and retried on the
    /// next tick. A run still in progress at shutdown is abandoned before its
    /// cursor commit, so its blocks are picked up again next time.
    pub async fn run_scheduled(&self, every: Duration, shutdown: impl Future<Output = ()>) -> ScheduleSummary {
        let mut summary = ScheduleSummary::default();
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!("ETL scheduled every {every:?}");

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }
            summary.runs += 1;
            info!("Starting scheduled ETL run {}", summary.runs);
            let result = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                result = self.run_once(None) => result,
            };
            match result {
                Ok(run) => {
                    summary.blocks_processed += run.blocks_processed;
                    summary.transactions_loaded += run.transactions_loaded;
                }
                Err(e) => {
                    summary.failed_runs += 1;
                    error!("Scheduled ETL run {} failed: {e}", summary.runs);
                }
            }
        }

        summary.last_block = self.cursor.get_last();
        info!(
            "Scheduler stopped after {} runs ({} failed), cursor at {}",
            summary.runs, summary.failed_runs, summary.last_block
        );
        summary
    }

    /// Score against the batch plus stored same-sender history. A missing
    /// model passes the batch through unscored.
    fn score(&self, scorer: &FraudScorer, records: &[NormalizedRecord]) -> Result<Vec<ScoredRecord>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        if !scorer.is_ready() {
            info!("No fraud model loaded, storing batch unscored");
            return Ok(Vec::new());
        }
        let history = self.history_for(records, scorer.config().history_window_secs)?;
        match scorer.score(records, Some(&history)) {
            Ok(scored) => Ok(scored),
            Err(PipelineError::ModelUnavailable(reason)) => {
                info!("Storing batch unscored: {reason}");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    fn history_for(&self, records: &[NormalizedRecord], window_secs: i64) -> Result<Vec<NormalizedRecord>> {
        let senders: Vec<String> = records
            .iter()
            .map(|r| r.from_addr.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let first = records.iter().map(|r| r.block_timestamp).min().unwrap_or(0);
        let last = records.iter().map(|r| r.block_timestamp).max().unwrap_or(0);

        let in_batch: HashSet<&str> = records.iter().map(|r| r.tx_hash.as_str()).collect();
        let mut history: Vec<NormalizedRecord> = self
            .store
            .sender_history(&senders, first - window_secs, last)?
            .into_iter()
            .filter(|h| !in_batch.contains(h.tx_hash.as_str()))
            .collect();
        history.extend_from_slice(records);
        Ok(history)
    }
}
