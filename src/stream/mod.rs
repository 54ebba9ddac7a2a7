pub mod buffer;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::StreamConfig;
use crate::core::BlockAggregate;
use crate::error::{PipelineError, Result};
use crate::extract::BlockFetcher;

pub use buffer::{BlockSink, StorageSink, StreamBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamState {
    Disconnected,
    Connected,
    Running,
    Stopped,
}

pub type BlockCallback = Arc<dyn Fn(&BlockAggregate) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub batch_size: usize,
    /// Most aggregates held while flushes keep failing.
    pub buffer_capacity: usize,
    pub poll_interval: Duration,
    pub retry_delay: Duration,
    pub join_timeout: Duration,
}

impl From<&StreamConfig> for StreamOptions {
    fn from(config: &StreamConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            buffer_capacity: config.buffer_capacity(),
            poll_interval: config.poll_interval(),
            retry_delay: config.retry_delay(),
            join_timeout: config.join_timeout(),
        }
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub state: StreamState,
    pub blocks_streamed: u64,
    pub transactions_streamed: u64,
    pub errors: u64,
    pub flushes: u64,
    pub buffer_size: usize,
    pub dropped_blocks: u64,
    pub stream_cursor: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub uptime_secs: i64,
}

#[derive(Default)]
struct Counters {
    blocks_streamed: u64,
    transactions_streamed: u64,
    errors: u64,
    flushes: u64,
    started_at: Option<DateTime<Utc>>,
    last_update: Option<DateTime<Utc>>,
}

/// State shared between the manager and its polling task.
struct Shared {
    state: Mutex<StreamState>,
    /// Last height pushed into the buffer. Independent of the batch cursor.
    stream_cursor: AtomicU64,
    buffer: StreamBuffer,
    counters: Mutex<Counters>,
    stop: AtomicBool,
    wake: Notify,
}

impl Shared {
    fn count_error(&self) {
        self.counters.lock().errors += 1;
    }
}

/// Polls the chain head on a fixed interval and buffers every new block.
///
/// Lifecycle: `Disconnected -> connect() -> Connected -> start() -> Running
/// -> stop() -> Stopped`.
pub struct StreamManager {
    fetcher: Arc<BlockFetcher>,
    sink: Arc<dyn BlockSink>,
    options: StreamOptions,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    on_block: Option<BlockCallback>,
}

impl StreamManager {
    pub fn new(fetcher: Arc<BlockFetcher>, sink: Arc<dyn BlockSink>, options: StreamOptions) -> Self {
        Self {
            fetcher,
            sink,
            shared: Arc::new(Shared {
                state: Mutex::new(StreamState::Disconnected),
                stream_cursor: AtomicU64::new(0),
                buffer: StreamBuffer::with_capacity(options.batch_size, options.buffer_capacity),
                counters: Mutex::new(Counters::default()),
                stop: AtomicBool::new(false),
                wake: Notify::new(),
            }),
            options,
            task: Mutex::new(None),
            on_block: None,
        }
    }

    /// Invoke `callback` for every processed block.
    pub fn on_block(mut self, callback: impl Fn(&BlockAggregate) + Send + Sync + 'static) -> Self {
        self.on_block = Some(Arc::new(callback));
        self
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.lock()
    }

    pub fn stream_cursor(&self) -> u64 {
        self.shared.stream_cursor.load(Ordering::SeqCst)
    }

    /// Record the current chain head as the starting point. Blocks at or
    /// below it are never streamed.
    pub async fn connect(&self) -> Result<u64> {
        let state = self.state();
        if state != StreamState::Disconnected {
            return Err(PipelineError::InvalidState { action: "connect", state });
        }
        let head = match self.fetcher.current_height().await {
            Ok(head) => head,
            Err(e) => {
                self.shared.count_error();
                error!("Failed to connect to RPC endpoint: {e}");
                return Err(e);
            }
        };
        self.shared.stream_cursor.store(head, Ordering::SeqCst);
        *self.shared.state.lock() = StreamState::Connected;
        info!("Connected to chain, current block: {head}");
        Ok(head)
    }

    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if *state != StreamState::Connected {
                return Err(PipelineError::InvalidState {
                    action: "start",
                    state: *state,
                });
            }
            *state = StreamState::Running;
        }
        self.shared.counters.lock().started_at = Some(Utc::now());

        let worker = StreamWorker {
            shared: self.shared.clone(),
            fetcher: self.fetcher.clone(),
            sink: self.sink.clone(),
            options: self.options,
            on_block: self.on_block.clone(),
        };
        *self.task.lock() = Some(tokio::spawn(worker.run()));
        info!("Streaming started, polling every {:?}", self.options.poll_interval);
        Ok(())
    }

    /// Stop polling and flush whatever is buffered. Calling it again is a
    /// no-op.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if *state == StreamState::Stopped {
                return Ok(());
            }
            *state = StreamState::Stopped;
        }
        info!("Stopping stream...");
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();

        let task = self.task.lock().take();
        if let Some(handle) = task {
            match tokio::time::timeout(self.options.join_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Streaming task failed: {e}"),
                Err(_) => warn!(
                    "Streaming task did not exit within {:?}, detaching it",
                    self.options.join_timeout
                ),
            }
        }

        // A detached worker may still finish its fetch; closing the buffer
        // keeps it from appending after this flush.
        match self.shared.buffer.close_and_flush(self.sink.as_ref()) {
            Ok(flushed) => {
                if flushed > 0 {
                    self.shared.counters.lock().flushes += 1;
                }
                info!("Stream stopped, final flush wrote {flushed} blocks");
                Ok(())
            }
            Err(e) => {
                self.shared.count_error();
                error!("Final flush failed: {e}");
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> StreamStats {
        let counters = self.shared.counters.lock();
        let now = Utc::now();
        StreamStats {
            state: self.state(),
            blocks_streamed: counters.blocks_streamed,
            transactions_streamed: counters.transactions_streamed,
            errors: counters.errors,
            flushes: counters.flushes,
            buffer_size: self.shared.buffer.len(),
            dropped_blocks: self.shared.buffer.dropped(),
            stream_cursor: self.stream_cursor(),
            started_at: counters.started_at,
            last_update: counters.last_update,
            uptime_secs: counters.started_at.map_or(0, |t| (now - t).num_seconds()),
        }
    }
}

struct StreamWorker {
    shared: Arc<Shared>,
    fetcher: Arc<BlockFetcher>,
    sink: Arc<dyn BlockSink>,
    options: StreamOptions,
    on_block: Option<BlockCallback>,
}

impl StreamWorker {
    async fn run(self) {
        while !self.shared.stop.load(Ordering::SeqCst) {
            let delay = match self.tick().await {
                Ok(_) => self.options.poll_interval,
                Err(e) => {
                    self.shared.count_error();
                    error!("Streaming error: {e}");
                    self.options.retry_delay
                }
            };
            if self.shared.stop.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shared.wake.notified() => {}
            }
        }
        info!("Streaming loop exited");
    }

    /// Process every height in `(stream_cursor, head]` in order. The first
    /// failed height ends the tick; the cursor stays just below it.
    async fn tick(&self) -> Result<u64> {
        let head = self.fetcher.current_height().await?;
        let from = self.shared.stream_cursor.load(Ordering::SeqCst) + 1;
        let mut processed = 0;

        for height in from..=head {
            if self.shared.stop.load(Ordering::SeqCst) {
                break;
            }
            let block = self.fetcher.try_fetch_block(height).await?;
            if self.shared.stop.load(Ordering::SeqCst) {
                break;
            }
            let aggregate = block.aggregate();
            let transactions = aggregate.transaction_count;
            let value = aggregate.total_value_ether;
            if let Some(callback) = &self.on_block {
                callback(&aggregate);
            }

            match self.shared.buffer.push(aggregate, self.sink.as_ref()) {
                Ok(Some(flushed)) => {
                    self.shared.counters.lock().flushes += 1;
                    info!("Flushed {flushed} buffered blocks");
                }
                Ok(None) => {}
                Err(PipelineError::InvalidState { .. }) => break,
                Err(e) => {
                    self.shared.count_error();
                    warn!("Buffer flush failed, keeping {} blocks buffered: {e}", self.shared.buffer.len());
                }
            }
            {
                let mut counters = self.shared.counters.lock();
                counters.blocks_streamed += 1;
                counters.transactions_streamed += transactions as u64;
                counters.last_update = Some(Utc::now());
            }
            info!("Block {height}: {transactions} txs, {value:.4} ETH");
            self.shared.stream_cursor.store(height, Ordering::SeqCst);
            processed += 1;
        }
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::buffer::tests::CountingSink;
    use super::*;
    use crate::rpc::mock::ScriptedRpc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn fast_options(batch_size: usize) -> StreamOptions {
        StreamOptions {
            batch_size,
            buffer_capacity: batch_size * 10,
            poll_interval: Duration::from_millis(20),
            retry_delay: Duration::from_millis(20),
            join_timeout: Duration::from_secs(2),
        }
    }

    fn manager(rpc: Arc<ScriptedRpc>, sink: Arc<CountingSink>, options: StreamOptions) -> StreamManager {
        StreamManager::new(Arc::new(BlockFetcher::new(rpc)), sink, options)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn lifecycle_streams_new_blocks_and_flushes_on_stop() {
        let rpc = Arc::new(ScriptedRpc::new().with_block(100, 3));
        let sink = Arc::new(CountingSink::default());
        let stream = manager(rpc.clone(), sink.clone(), fast_options(10));
        assert_eq!(stream.state(), StreamState::Disconnected);

        assert_eq!(stream.connect().await.unwrap(), 100);
        assert_eq!(stream.state(), StreamState::Connected);
        stream.start().unwrap();
        assert_eq!(stream.state(), StreamState::Running);

        rpc.add_block(101, 3);
        rpc.add_block(102, 2);
        wait_until(|| stream.stats().blocks_streamed == 2).await;

        let stats = stream.stats();
        assert_eq!(stats.transactions_streamed, 5);
        assert_eq!(stats.stream_cursor, 102);
        assert_eq!(stats.buffer_size, 2);
        assert!(stats.started_at.is_some());
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 0);

        stream.stop().await.unwrap();
        assert_eq!(stream.state(), StreamState::Stopped);
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(sink.blocks.load(Ordering::SeqCst), 2);
        assert_eq!(stream.stats().buffer_size, 0);

        stream.stop().await.unwrap();
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn buffer_flushes_at_batch_size() {
        let rpc = Arc::new(ScriptedRpc::new().with_block(0, 0));
        let sink = Arc::new(CountingSink::default());
        let stream = manager(rpc.clone(), sink.clone(), fast_options(3));
        stream.connect().await.unwrap();
        for h in 1..=4 {
            rpc.add_block(h, 1);
        }
        stream.start().unwrap();

        wait_until(|| stream.stats().blocks_streamed == 4).await;
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(stream.stats().buffer_size, 1);
        stream.stop().await.unwrap();
        assert_eq!(sink.blocks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn failed_height_is_retried_without_skipping() {
        let rpc = Arc::new(ScriptedRpc::new().with_block(100, 1));
        let sink = Arc::new(CountingSink::default());
        let stream = manager(rpc.clone(), sink, fast_options(10));
        stream.connect().await.unwrap();

        rpc.add_block(101, 1);
        rpc.add_block(102, 1);
        rpc.fail_block(101);
        stream.start().unwrap();

        wait_until(|| stream.stats().errors >= 2).await;
        assert_eq!(stream.stream_cursor(), 100);
        assert_eq!(stream.stats().blocks_streamed, 0);
        assert_eq!(stream.state(), StreamState::Running);

        rpc.heal_block(101);
        wait_until(|| stream.stream_cursor() == 102).await;
        stream.stop().await.unwrap();
    }

    #[tokio::test]
    async fn connect_fails_when_unreachable() {
        let rpc = Arc::new(ScriptedRpc::new());
        rpc.set_unreachable(true);
        let stream = manager(rpc, Arc::new(CountingSink::default()), fast_options(10));

        assert!(stream.connect().await.is_err());
        assert_eq!(stream.state(), StreamState::Disconnected);
        assert_eq!(stream.stats().errors, 1);
    }

    #[tokio::test]
    async fn invalid_transitions_are_rejected() {
        let rpc = Arc::new(ScriptedRpc::new().with_block(1, 0));
        let stream = manager(rpc, Arc::new(CountingSink::default()), fast_options(10));

        let err = stream.start().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState { action: "start", state: StreamState::Disconnected }));

        stream.connect().await.unwrap();
        assert!(stream.connect().await.is_err());
        stream.stop().await.unwrap();
        assert!(stream.start().is_err());
    }

    #[tokio::test]
    async fn stop_wakes_sleeping_loop() {
        let rpc = Arc::new(ScriptedRpc::new().with_block(1, 0));
        let options = StreamOptions {
            poll_interval: Duration::from_secs(60),
            ..fast_options(10)
        };
        let stream = manager(rpc.clone(), Arc::new(CountingSink::default()), options);
        stream.connect().await.unwrap();
        stream.start().unwrap();
        wait_until(|| rpc.head_calls.load(Ordering::SeqCst) >= 2).await;

        let started = Instant::now();
        stream.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn block_fetched_after_stop_timeout_is_not_buffered() {
        let rpc = Arc::new(ScriptedRpc::new().with_block(100, 1));
        let sink = Arc::new(CountingSink::default());
        let options = StreamOptions {
            join_timeout: Duration::from_millis(50),
            ..fast_options(10)
        };
        let stream = manager(rpc.clone(), sink.clone(), options);
        stream.connect().await.unwrap();
        rpc.delay_block(101, Duration::from_millis(300));
        rpc.add_block(101, 1);
        stream.start().unwrap();
        wait_until(|| rpc.block_calls.load(Ordering::SeqCst) >= 1).await;

        stream.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let stats = stream.stats();
        assert_eq!(stats.state, StreamState::Stopped);
        assert_eq!(stats.stream_cursor, 100);
        assert_eq!(stats.buffer_size, 0);
        assert_eq!(stats.blocks_streamed, 0);
        assert_eq!(sink.blocks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_sink_drops_oldest_beyond_capacity() {
        let rpc = Arc::new(ScriptedRpc::new().with_block(0, 0));
        let sink = Arc::new(CountingSink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let options = StreamOptions {
            buffer_capacity: 4,
            ..fast_options(2)
        };
        let stream = manager(rpc.clone(), sink.clone(), options);
        stream.connect().await.unwrap();
        for h in 1..=10 {
            rpc.add_block(h, 0);
        }
        stream.start().unwrap();

        wait_until(|| stream.stream_cursor() == 10).await;
        let stats = stream.stats();
        assert_eq!(stats.buffer_size, 4);
        assert_eq!(stats.dropped_blocks, 6);
        assert!(stats.errors >= 1);

        sink.fail.store(false, Ordering::SeqCst);
        stream.stop().await.unwrap();
        assert_eq!(sink.blocks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn on_block_sees_every_block() {
        let rpc = Arc::new(ScriptedRpc::new().with_block(10, 0));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let stream = manager(rpc.clone(), Arc::new(CountingSink::default()), fast_options(10)).on_block(move |block| {
            counter.fetch_add(block.transaction_count, Ordering::SeqCst);
        });
        stream.connect().await.unwrap();
        rpc.add_block(11, 2);
        rpc.add_block(12, 4);
        stream.start().unwrap();

        wait_until(|| stream.stream_cursor() == 12).await;
        stream.stop().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }
}
