use std::sync::Arc;

use super::*;
use crate::block::{Block, BlockBuilder, BLOCK_REF, RESTART_INTERVAL};

fn decoded_block(fill: u8) -> Arc<Block> {
    let mut builder = BlockBuilder::new(BLOCK_REF, 4096, RESTART_INTERVAL);
    let key = format!("refs/heads/{}", fill).into_bytes();
    builder.append(&key, 0, &[0]).unwrap();
    Arc::new(Block::decode(&builder.finish(false).unwrap()).unwrap())
}

#[test]
fn test_cache_lru() {
    let mut cache = BlockCache::new(4);
    for off in 0..4_u64 {
        cache.set(off * 100, decoded_block(off as u8));
    }
    assert_eq!(cache.len(), 4);
    for off in 0..4_u64 {
        assert!(cache.get(off * 100).is_some());
    }

    // touch 0, insert a fifth, the least recently used leaves.
    cache.get(0).unwrap();
    cache.set(400, decoded_block(4));
    assert_eq!(cache.len(), 4);
    assert!(cache.get(0).is_some());
    assert!(cache.get(100).is_none());
    assert!(cache.get(400).is_some());

    assert!(cache.get(999).is_none());
}

#[test]
fn test_cache_disabled() {
    let mut cache = BlockCache::new(0);
    cache.set(0, decoded_block(1));
    assert_eq!(cache.len(), 0);
    assert!(cache.get(0).is_none());
}
