use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::FetchedBlock;

pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Height-keyed block cache with FIFO eviction: once full, inserting a new
/// height drops the height that was inserted first, regardless of reads.
pub struct BlockCache {
    capacity: usize,
    entries: HashMap<u64, Arc<FetchedBlock>>,
    order: VecDeque<u64>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn get(&self, height: u64) -> Option<Arc<FetchedBlock>> {
        self.entries.get(&height).cloned()
    }

    /// Returns the evicted height, if any.
    pub fn insert(&mut self, block: Arc<FetchedBlock>) -> Option<u64> {
        if self.capacity == 0 {
            return None;
        }
        let height = block.height;
        if self.entries.insert(height, block).is_some() {
            return None;
        }
        self.order.push_back(height);

        if self.order.len() > self.capacity {
            let oldest = self.order.pop_front()?;
            self.entries.remove(&oldest);
            return Some(oldest);
        }
        None
    }

    pub fn contains(&self, height: u64) -> bool {
        self.entries.contains_key(&height)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(height: u64) -> Arc<FetchedBlock> {
        Arc::new(FetchedBlock {
            height,
            hash: Some(format!("0xblock{height}")),
            timestamp: 0,
            declared_tx_count: 0,
            records: Vec::new(),
            dropped: false,
        })
    }

    #[test]
    fn evicts_oldest_first() {
        let mut cache = BlockCache::new(3);
        for h in 1..=3 {
            assert_eq!(cache.insert(block(h)), None);
        }
        // reads do not refresh insertion order
        assert!(cache.get(1).is_some());
        assert_eq!(cache.insert(block(4)), Some(1));
        assert!(!cache.contains(1));
        assert!(cache.contains(2) && cache.contains(4));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn reinsert_does_not_grow() {
        let mut cache = BlockCache::new(2);
        cache.insert(block(1));
        cache.insert(block(1));
        cache.insert(block(2));
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(1));
    }

    #[test]
    fn zero_capacity_caches_nothing() {
        let mut cache = BlockCache::new(0);
        cache.insert(block(1));
        assert!(cache.is_empty());
    }
}
