use std::sync::Arc;

use quick_cache::sync::Cache as QCache;
use quick_cache::{Equivalent, Weighter};

use crate::sstable::block::Block;

// (SSTable ID, block index within the table)
#[derive(Eq, std::hash::Hash, PartialEq)]
pub(crate) struct CacheKey {
	table_id: u64,
	block_idx: u32,
}

impl From<(u64, u32)> for CacheKey {
	fn from(value: (u64, u32)) -> Self {
		Self {
			table_id: value.0,
			block_idx: value.1,
		}
	}
}

impl Equivalent<CacheKey> for (u64, u32) {
	fn equivalent(&self, key: &CacheKey) -> bool {
		self.0 == key.table_id && self.1 == key.block_idx
	}
}

#[derive(Clone)]
struct BlockWeighter;

impl Weighter<CacheKey, Arc<Block>> for BlockWeighter {
	fn weight(&self, _: &CacheKey, block: &Arc<Block>) -> u64 {
		// Cost is the decoded size, so the capacity bound tracks memory.
		block.size() as u64
	}
}

/// Process-wide cache of decoded data blocks. The host instantiates one
/// and injects it through `Options`; every open table shares it. Entries
/// are immutable once published.
pub struct BlockCache {
	data: QCache<CacheKey, Arc<Block>, BlockWeighter>,
}

impl BlockCache {
	pub fn with_capacity_bytes(bytes: u64) -> Self {
		Self {
			data: QCache::with_weighter(10_000, bytes, BlockWeighter),
		}
	}

	pub(crate) fn insert(&self, table_id: u64, block_idx: u32, block: Arc<Block>) {
		self.data.insert((table_id, block_idx).into(), block);
	}

	pub(crate) fn get(&self, table_id: u64, block_idx: u32) -> Option<Arc<Block>> {
		self.data.get(&(table_id, block_idx))
	}

	/// Drops every cached block of a table. Called when the table's
	/// refcount reaches zero so its file may be unlinked.
	pub(crate) fn evict_table(&self, table_id: u64, num_blocks: u32) {
		for idx in 0..num_blocks {
			self.data.remove(&(table_id, idx));
		}
	}
}

impl Default for BlockCache {
	fn default() -> Self {
		// 64 MiB unless the host sizes it explicitly.
		Self::with_capacity_bytes(64 << 20)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;
	use test_log::test;

	fn block(data: &'static [u8]) -> Arc<Block> {
		Arc::new(Block::from_parts(Bytes::from_static(data), Bytes::new()))
	}

	#[test]
	fn test_insert_get() {
		let cache = BlockCache::with_capacity_bytes(1 << 20);
		cache.insert(1, 0, block(b"abc"));
		assert!(cache.get(1, 0).is_some());
		assert!(cache.get(1, 1).is_none());
		assert!(cache.get(2, 0).is_none());
	}

	#[test]
	fn test_evict_table() {
		let cache = BlockCache::with_capacity_bytes(1 << 20);
		cache.insert(7, 0, block(b"abc"));
		cache.insert(7, 1, block(b"def"));
		cache.insert(8, 0, block(b"ghi"));
		cache.evict_table(7, 2);
		assert!(cache.get(7, 0).is_none());
		assert!(cache.get(7, 1).is_none());
		assert!(cache.get(8, 0).is_some());
	}
}
