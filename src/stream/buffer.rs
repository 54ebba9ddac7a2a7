use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::core::BlockAggregate;
use crate::core::normalize::normalize;
use crate::db::TransactionStore;
use crate::error::{PipelineError, Result};
use crate::stream::StreamState;

/// Buffered batches kept while the sink keeps failing.
pub const DEFAULT_MAX_BUFFERED_BATCHES: usize = 10;

/// Destination of flushed block aggregates.
pub trait BlockSink: Send + Sync {
    fn flush(&self, blocks: &[BlockAggregate]) -> Result<()>;
}

/// Normalizes the aggregates' transactions and upserts them.
pub struct StorageSink {
    store: Arc<dyn TransactionStore>,
}

impl StorageSink {
    pub fn new(store: Arc<dyn TransactionStore>) -> Self {
        Self { store }
    }
}

impl BlockSink for StorageSink {
    fn flush(&self, blocks: &[BlockAggregate]) -> Result<()> {
        let raw = blocks.iter().flat_map(|b| b.transactions.iter().cloned()).collect();
        let records = normalize(raw)?;
        let written = self.store.upsert_transactions(&records)?;
        info!("Flushed {} blocks ({written} transactions) to storage", blocks.len());
        Ok(())
    }
}

#[derive(Default)]
struct Pending {
    items: VecDeque<BlockAggregate>,
    /// Pushes since the last failed flush; `None` while the sink is healthy.
    since_failure: Option<usize>,
    dropped: u64,
    closed: bool,
}

/// Ordered block aggregates awaiting a flush. Append and flush happen under
/// the same lock so a flush never loses a concurrent append.
///
/// The buffer holds at most `capacity` aggregates. While the sink fails, the
/// oldest aggregates are dropped past that bound and automatic flushes are
/// retried only once per `batch_size` further pushes.
pub struct StreamBuffer {
    batch_size: usize,
    capacity: usize,
    pending: Mutex<Pending>,
}

impl StreamBuffer {
    pub fn new(batch_size: usize) -> Self {
        Self::with_capacity(batch_size, batch_size.saturating_mul(DEFAULT_MAX_BUFFERED_BATCHES))
    }

    pub fn with_capacity(batch_size: usize, capacity: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            capacity: capacity.max(batch_size),
            pending: Mutex::new(Pending::default()),
        }
    }

    /// Append `block`, flushing to `sink` once the batch size is reached.
    /// Returns the number of flushed blocks. A failed flush keeps everything
    /// buffered for a later attempt. A closed buffer rejects the block with
    /// `InvalidState`.
    pub fn push(&self, block: BlockAggregate, sink: &dyn BlockSink) -> Result<Option<usize>> {
        let mut pending = self.pending.lock();
        if pending.closed {
            return Err(PipelineError::InvalidState {
                action: "buffer block",
                state: StreamState::Stopped,
            });
        }
        if pending.items.len() >= self.capacity {
            if let Some(oldest) = pending.items.pop_front() {
                pending.dropped += 1;
                warn!(
                    "Stream buffer full ({} blocks), dropping block {}",
                    self.capacity, oldest.block_number
                );
            }
        }
        pending.items.push_back(block);

        if let Some(since) = pending.since_failure.as_mut() {
            *since += 1;
            if *since < self.batch_size {
                return Ok(None);
            }
        }
        if pending.items.len() < self.batch_size {
            return Ok(None);
        }
        Self::flush_pending(&mut pending, sink).map(Some)
    }

    /// Flush whatever is buffered, regardless of the batch size.
    pub fn flush(&self, sink: &dyn BlockSink) -> Result<usize> {
        Self::flush_pending(&mut self.pending.lock(), sink)
    }

    /// Refuse further pushes, then flush what is left.
    pub fn close_and_flush(&self, sink: &dyn BlockSink) -> Result<usize> {
        let mut pending = self.pending.lock();
        pending.closed = true;
        Self::flush_pending(&mut pending, sink)
    }

    fn flush_pending(pending: &mut Pending, sink: &dyn BlockSink) -> Result<usize> {
        if pending.items.is_empty() {
            return Ok(0);
        }
        if let Err(e) = sink.flush(pending.items.make_contiguous()) {
            pending.since_failure = Some(0);
            return Err(e);
        }
        let flushed = pending.items.len();
        pending.items.clear();
        pending.since_failure = None;
        Ok(flushed)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().items.is_empty()
    }

    /// Aggregates discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.pending.lock().dropped
    }
}
