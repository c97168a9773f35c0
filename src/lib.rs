mod cache;
mod compression;
mod error;
mod iter;
mod key;
mod snapshot;
mod sstable;
mod surf;
mod vfs;

use std::sync::Arc;

pub use cache::BlockCache;
pub use compression::CompressionType;
pub use error::{Error, Result};
pub use iter::{next_all_versions, seek_to_version, BoundedIterator, Iterator, MergeIterator};
pub use key::{
	Key,
	KeyRef,
	ValueStruct,
	META_DELETE,
	META_DISCARD_EARLIER_VERSIONS,
	META_EXPIRED,
	META_VALUE_POINTER,
};
pub use snapshot::{
	Item,
	IteratorOptions,
	SnapshotIterator,
	ValueFetcher,
	INTERNAL_KEY_PREFIX,
};
pub use sstable::builder::TableBuilder;
pub use sstable::iterator::{ConcatIterator, TableIterator};
pub use sstable::table::{new_filename, PointGetResult, Table};
pub use surf::SurfOptions;
pub use vfs::File;

/// Table-level configuration, shared by builders and open tables. The
/// block cache is process-scoped: the host creates one and injects it
/// here, so every table opened with these options shares it.
#[derive(Clone)]
pub struct Options {
	/// Target size of one data block before compression.
	pub block_size: usize,
	/// Compression codec per LSM level; levels past the end reuse the
	/// last entry, an empty list means no compression anywhere.
	pub compression_per_level: Vec<CompressionType>,
	/// Fill factor of the point-lookup hash index. Zero disables it.
	pub hash_util_ratio: f32,
	/// Range-filter construction knobs. `None` disables the filter.
	pub surf: Option<SurfOptions>,
	pub block_cache: Arc<BlockCache>,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			block_size: 4 * 1024,
			compression_per_level: vec![CompressionType::None],
			hash_util_ratio: 0.75,
			surf: None,
			block_cache: Arc::new(BlockCache::default()),
		}
	}
}
