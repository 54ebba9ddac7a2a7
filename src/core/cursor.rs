use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::db::CursorStore;
use crate::error::Result;

/// Persisted high-water mark of committed block heights for the batch ETL.
///
/// The in-memory value mirrors the store and only moves after the store
/// accepted the new height, so a failed write leaves both untouched.
pub struct PipelineCursor {
    store: Arc<dyn CursorStore>,
    last: Mutex<u64>,
    start_block: Option<u64>,
}

impl PipelineCursor {
    pub fn load(store: Arc<dyn CursorStore>) -> Result<Self> {
        let last = store.load_cursor()?;
        info!("Last processed block: {last}");
        Ok(Self {
            store,
            last: Mutex::new(last),
            start_block: None,
        })
    }

    /// First height to extract when the cursor has never been set.
    pub fn with_start_block(mut self, start_block: Option<u64>) -> Self {
        self.start_block = start_block;
        self
    }

    /// Highest committed height, 0 if nothing was ever committed.
    pub fn get_last(&self) -> u64 {
        *self.last.lock()
    }

    pub fn next_start(&self) -> u64 {
        match (self.get_last(), self.start_block) {
            (0, Some(start)) => start,
            (last, _) => last + 1,
        }
    }

    /// Record `height` as committed. Call only after the batch ending at
    /// `height` is durably stored. Returns whether the cursor moved; a height
    /// at or below the current one is ignored.
    pub fn set_last(&self, height: u64) -> Result<bool> {
        let mut last = self.last.lock();
        if height <= *last {
            debug!(current = *last, requested = height, "Cursor not moved backwards");
            return Ok(false);
        }
        self.store.save_cursor(height)?;
        *last = height;
        info!("Updated pipeline cursor: last_block = {height}");
        Ok(true)
    }
}
