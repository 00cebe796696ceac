//! Module implement a small LRU cache of decoded blocks.

use std::{collections::HashMap, sync::Arc};

use crate::block::Block;

/// Default number of decoded blocks held per table.
pub const CACHE_BLOCKS: usize = 64;

// Size-bounded LRU keyed by block offset, shared across cloned readers
// behind a mutex. Correctness never depends on hits; eviction is
// least-recently-used.
pub(crate) struct BlockCache {
    max_count: usize,
    tick: u64,
    map: HashMap<u64, (u64, Arc<Block>)>,
}

impl BlockCache {
    pub(crate) fn new(max_count: usize) -> BlockCache {
        BlockCache {
            max_count,
            tick: 0,
            map: HashMap::with_capacity(max_count),
        }
    }

    pub(crate) fn get(&mut self, off: u64) -> Option<Arc<Block>> {
        self.tick += 1;
        let tick = self.tick;
        self.map.get_mut(&off).map(|(access, block)| {
            *access = tick;
            Arc::clone(block)
        })
    }

    pub(crate) fn set(&mut self, off: u64, block: Arc<Block>) {
        if self.max_count == 0 {
            return;
        }

        self.tick += 1;
        self.map.insert(off, (self.tick, block));
        while self.map.len() > self.max_count {
            let oldest = self
                .map
                .iter()
                .min_by_key(|(_, (access, _))| *access)
                .map(|(off, _)| *off);
            match oldest {
                Some(off) => self.map.remove(&off),
                None => break,
            };
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
#[path = "cache_test.rs"]
mod cache_test;
