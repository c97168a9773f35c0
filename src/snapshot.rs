use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::iter::{Iterator as LsmIterator, MergeIterator};
use crate::key::{
	KeyRef,
	META_DELETE,
	META_DISCARD_EARLIER_VERSIONS,
	META_EXPIRED,
	META_VALUE_POINTER,
};

/// Keys under this prefix belong to the store itself and stay hidden
/// unless `internal_access` is set.
pub const INTERNAL_KEY_PREFIX: &[u8] = b"!marten!";

/// How many relocated-entry indirections a value read will chase before
/// giving up.
const MAX_VALUE_INDIRECTIONS: usize = 3;

const NUM_PREFETCH_WORKERS: usize = 2;

/// Resolves value-log pointers. Supplied by the host; a fetch may
/// return `Error::Retry` when the entry has been relocated, in which
/// case the read path retries against the move key a bounded number of
/// times.
pub trait ValueFetcher: Send + Sync + 'static {
	fn fetch(&self, key: &[u8], version: u64, vptr: &[u8]) -> Result<Bytes>;
}

#[derive(Clone, Debug)]
pub struct IteratorOptions {
	/// Resolve values in the background while the iterator advances.
	pub prefetch_values: bool,
	/// How many items may be parsed ahead of the caller.
	pub prefetch_size: usize,
	/// False is forward, true is backward.
	pub reverse: bool,
	/// Yield every version of a key instead of the newest visible one.
	/// Tombstones are yielded too, so callers can tell deletes apart.
	pub all_versions: bool,
	/// Expose keys under the reserved internal prefix.
	pub internal_access: bool,
}

impl Default for IteratorOptions {
	fn default() -> Self {
		Self {
			prefetch_values: true,
			prefetch_size: 100,
			reverse: false,
			all_versions: false,
			internal_access: false,
		}
	}
}

/// One-shot completion slot a prefetch worker fills; the consumer
/// blocks on it only when it actually dereferences the value.
struct FetchCell {
	slot: Mutex<Option<Result<Bytes>>>,
	done: Condvar,
}

impl FetchCell {
	fn new() -> Arc<FetchCell> {
		Arc::new(FetchCell {
			slot: Mutex::new(None),
			done: Condvar::new(),
		})
	}

	fn fill(&self, result: Result<Bytes>) {
		let mut slot = self.slot.lock();
		*slot = Some(result);
		self.done.notify_all();
	}

	fn wait(&self) -> Result<Bytes> {
		let mut slot = self.slot.lock();
		while slot.is_none() {
			self.done.wait(&mut slot);
		}
		slot.as_ref().unwrap().clone()
	}
}

fn resolve_value(
	fetcher: Option<&Arc<dyn ValueFetcher>>,
	key: &[u8],
	version: u64,
	meta: u8,
	vptr: &Bytes,
) -> Result<Bytes> {
	if meta & META_VALUE_POINTER == 0 {
		return Ok(vptr.clone());
	}
	let Some(fetcher) = fetcher else {
		return Err(Error::ValueLogGone("no value fetcher configured".to_string()));
	};
	let mut attempts = 0;
	loop {
		match fetcher.fetch(key, version, vptr) {
			Err(Error::Retry) if attempts < MAX_VALUE_INDIRECTIONS => {
				attempts += 1;
			}
			other => return other,
		}
	}
}

struct PrefetchJob {
	key: Vec<u8>,
	version: u64,
	meta: u8,
	vptr: Bytes,
	cell: Arc<FetchCell>,
}

/// Fixed worker pool resolving values ahead of the consumer. The
/// bounded channel keeps at most `prefetch_size` fetches in flight.
struct PrefetchPool {
	tx: Option<crossbeam_channel::Sender<PrefetchJob>>,
	workers: Vec<JoinHandle<()>>,
}

impl PrefetchPool {
	fn new(fetcher: Arc<dyn ValueFetcher>, queue_size: usize) -> PrefetchPool {
		let (tx, rx) = crossbeam_channel::bounded::<PrefetchJob>(queue_size.max(2));
		let mut workers = Vec::with_capacity(NUM_PREFETCH_WORKERS);
		for _ in 0..NUM_PREFETCH_WORKERS {
			let rx = rx.clone();
			let fetcher = Arc::clone(&fetcher);
			workers.push(std::thread::spawn(move || {
				for job in rx.iter() {
					let result = resolve_value(
						Some(&fetcher),
						&job.key,
						job.version,
						job.meta,
						&job.vptr,
					);
					job.cell.fill(result);
				}
			}));
		}
		PrefetchPool {
			tx: Some(tx),
			workers,
		}
	}

	fn submit(&self, job: PrefetchJob) -> Result<()> {
		let tx = self.tx.as_ref().expect("pool already shut down");
		tx.send(job).map_err(|e| Error::Send(e.to_string()))
	}

	fn shutdown(&mut self) {
		self.tx.take();
		for handle in self.workers.drain(..) {
			let _ = handle.join();
		}
	}
}

impl Drop for PrefetchPool {
	fn drop(&mut self) {
		self.shutdown();
	}
}

/// One key-value pair handed out by the snapshot iterator. The key and
/// value are only good until the next advance; items are recycled.
pub struct Item {
	key: Vec<u8>,
	version: u64,
	meta: u8,
	user_meta: Bytes,
	vptr: Bytes,
	fetch: Option<Arc<FetchCell>>,
	fetcher: Option<Arc<dyn ValueFetcher>>,
}

impl Item {
	fn empty(fetcher: Option<Arc<dyn ValueFetcher>>) -> Box<Item> {
		Box::new(Item {
			key: Vec::new(),
			version: 0,
			meta: 0,
			user_meta: Bytes::new(),
			vptr: Bytes::new(),
			fetch: None,
			fetcher,
		})
	}

	pub fn key(&self) -> &[u8] {
		&self.key
	}

	pub fn key_copy(&self) -> Vec<u8> {
		self.key.clone()
	}

	/// The commit timestamp of this entry.
	pub fn version(&self) -> u64 {
		self.version
	}

	pub fn user_meta(&self) -> &[u8] {
		&self.user_meta
	}

	pub fn meta(&self) -> u8 {
		self.meta
	}

	/// True when this entry is a tombstone or has expired. Only visible
	/// with `all_versions`; live reads never yield deleted items.
	pub fn is_deleted(&self) -> bool {
		self.meta & (META_DELETE | META_EXPIRED) != 0
	}

	pub fn discard_earlier_versions(&self) -> bool {
		self.meta & META_DISCARD_EARLIER_VERSIONS != 0
	}

	/// The value, waiting on an in-flight prefetch or resolving the
	/// value-log pointer on the spot.
	pub fn value(&self) -> Result<Bytes> {
		if let Some(cell) = &self.fetch {
			return cell.wait();
		}
		resolve_value(self.fetcher.as_ref(), &self.key, self.version, self.meta, &self.vptr)
	}

	pub fn value_copy(&self) -> Result<Vec<u8>> {
		self.value().map(|v| v.to_vec())
	}

	/// Approximate on-disk footprint, without dereferencing the value
	/// log.
	pub fn estimated_size(&self) -> usize {
		self.key.len() + self.vptr.len()
	}
}

/// The ordered, snapshot-consistent view a transaction reads through.
/// Composes the caller's sources (pending writes, memtables, table
/// iterators) behind one merge, then applies the read timestamp,
/// tombstone suppression and per-key version selection.
pub struct SnapshotIterator {
	inner: Box<dyn LsmIterator>,
	read_ts: u64,
	opts: IteratorOptions,
	item: Option<Box<Item>>,
	data: VecDeque<Box<Item>>,
	waste: VecDeque<Box<Item>>,
	last_key: Vec<u8>,
	fetcher: Option<Arc<dyn ValueFetcher>>,
	pool: Option<PrefetchPool>,
	closed: bool,
}

impl SnapshotIterator {
	/// `sources` are merged newest-first: the first iterator wins over
	/// later ones when both hold the same (key, version).
	pub fn new(
		sources: Vec<Box<dyn LsmIterator>>,
		read_ts: u64,
		opts: IteratorOptions,
		fetcher: Option<Arc<dyn ValueFetcher>>,
	) -> SnapshotIterator {
		let inner = MergeIterator::from_iters(sources, opts.reverse);
		let pool = match (&fetcher, opts.prefetch_values) {
			(Some(f), true) => Some(PrefetchPool::new(Arc::clone(f), opts.prefetch_size)),
			_ => None,
		};
		SnapshotIterator {
			inner,
			read_ts,
			opts,
			item: None,
			data: VecDeque::new(),
			waste: VecDeque::new(),
			last_key: Vec::new(),
			fetcher,
			pool,
			closed: false,
		}
	}

	pub fn valid(&self) -> bool {
		self.item.is_some()
	}

	pub fn valid_for_prefix(&self, prefix: &[u8]) -> bool {
		self.item.as_ref().is_some_and(|item| item.key.starts_with(prefix))
	}

	/// The current pair. Only valid until the next advance; use the
	/// copy accessors to keep anything longer.
	pub fn item(&self) -> &Item {
		self.item.as_deref().expect("invalid iterator")
	}

	pub fn error(&self) -> Option<Error> {
		self.inner.error()
	}

	fn new_item(&mut self) -> Box<Item> {
		match self.waste.pop_front() {
			Some(item) => item,
			None => Item::empty(self.fetcher.clone()),
		}
	}

	/// Waits out any in-flight fetch, then parks the item for reuse.
	fn recycle(&mut self, mut item: Box<Item>) {
		if let Some(cell) = item.fetch.take() {
			let _ = cell.wait();
		}
		self.waste.push_back(item);
	}

	fn set_item(&mut self, item: Box<Item>) {
		if self.item.is_none() {
			self.item = Some(item);
		} else {
			self.data.push_back(item);
		}
	}

	/// Fills an item from the merge cursor and, when prefetching, hands
	/// its value to the worker pool.
	fn fill(&mut self, item: &mut Item) {
		let vs = self.inner.value();
		let key = self.inner.key();
		item.meta = vs.meta;
		item.user_meta = vs.user_meta;
		item.version = key.version;
		item.key.clear();
		item.key.extend_from_slice(key.user_key);
		item.vptr = vs.value;
		item.fetch = None;

		if let Some(pool) = &self.pool {
			let cell = FetchCell::new();
			let job = PrefetchJob {
				key: item.key.clone(),
				version: item.version,
				meta: item.meta,
				vptr: item.vptr.clone(),
				cell: Arc::clone(&cell),
			};
			if pool.submit(job).is_ok() {
				item.fetch = Some(cell);
			}
		}
	}

	/// Inspects the merge cursor and either produces the next item or
	/// skips the entry. Always advances the underlying merge at least
	/// once; reverse mode looks one tuple ahead to pick the newest
	/// visible version of each key.
	fn parse_item(&mut self) -> bool {
		let key = self.inner.key();

		// Skip keys the store keeps for itself.
		if !self.opts.internal_access && key.user_key.starts_with(INTERNAL_KEY_PREFIX) {
			self.inner.next();
			return false;
		}

		// Skip versions this snapshot cannot see.
		if key.version > self.read_ts {
			self.inner.next();
			return false;
		}

		if self.opts.all_versions {
			// Deleted and expired entries are surfaced too, so the
			// caller can tell a delete from a never-written key.
			let mut item = self.new_item();
			self.fill(&mut item);
			self.set_item(item);
			self.inner.next();
			return true;
		}

		if !self.opts.reverse {
			// Forward: versions arrive newest first, so one key memo
			// suffices. It must be taken even for tombstones: with
			// keys a@5, b@7(del), b@5, forgetting b at the tombstone
			// would wrongly resurrect b@5.
			if self.last_key == key.user_key {
				self.inner.next();
				return false;
			}
			self.last_key.clear();
			self.last_key.extend_from_slice(key.user_key);
		}

		loop {
			// A tombstone at the visible version hides the key.
			if self.inner.value().is_deleted() {
				self.inner.next();
				return false;
			}

			let mut item = self.new_item();
			self.fill(&mut item);

			self.inner.next();
			if !self.opts.reverse || !self.inner.valid() {
				self.set_item(item);
				return true;
			}

			// Reverse yields a key's versions oldest first; as long as
			// the next tuple is a newer visible version of this same
			// key it supersedes the one just filled.
			let next_key = self.inner.key();
			if next_key.version > self.read_ts || next_key.user_key != item.key {
				self.set_item(item);
				return true;
			}
			self.recycle(item);
		}
	}

	/// Parses ahead so up to `prefetch_size` values resolve while the
	/// caller consumes.
	fn prefetch(&mut self) {
		let mut budget = 2;
		if self.opts.prefetch_values && self.opts.prefetch_size > 1 {
			budget = self.opts.prefetch_size;
		}

		self.item = None;
		let mut count = 0;
		while self.inner.valid() {
			if !self.parse_item() {
				continue;
			}
			count += 1;
			if count == budget {
				break;
			}
		}
	}

	/// Advances to the next visible entry, keeping the parsed-ahead
	/// window full. Check `valid()` afterwards.
	pub fn next(&mut self) {
		if let Some(item) = self.item.take() {
			self.recycle(item);
		}
		self.item = self.data.pop_front();

		while self.inner.valid() {
			if self.parse_item() {
				break;
			}
		}
	}

	/// Repositions at `key` (the smallest visible key `>=` it forward,
	/// the largest `<=` it reversed). An empty key rewinds.
	pub fn seek(&mut self, key: &[u8]) {
		while let Some(item) = self.data.pop_front() {
			self.recycle(item);
		}
		if let Some(item) = self.item.take() {
			self.recycle(item);
		}
		self.last_key.clear();

		if key.is_empty() {
			self.inner.rewind();
			self.prefetch();
			return;
		}

		let version = if self.opts.reverse {
			0
		} else {
			self.read_ts
		};
		self.inner.seek(KeyRef::new(key, version));
		self.prefetch();
	}

	/// Back to the start of the view: smallest key forward, largest
	/// reversed.
	pub fn rewind(&mut self) {
		while let Some(item) = self.data.pop_front() {
			self.recycle(item);
		}
		if let Some(item) = self.item.take() {
			self.recycle(item);
		}
		self.last_key.clear();

		self.inner.rewind();
		self.prefetch();
	}

	/// Waits for every outstanding prefetch, tears the pool down and
	/// closes the sources. Must be called; calling twice is an error
	/// but harmless.
	pub fn close(&mut self) -> Result<()> {
		if self.closed {
			return Err(Error::IteratorClosed);
		}
		self.closed = true;

		if let Some(item) = self.item.take() {
			self.recycle(item);
		}
		while let Some(item) = self.data.pop_front() {
			self.recycle(item);
		}
		self.waste.clear();
		if let Some(mut pool) = self.pool.take() {
			pool.shutdown();
		}
		self.inner.close()
	}
}

impl Drop for SnapshotIterator {
	fn drop(&mut self) {
		if !self.closed {
			let _ = self.close();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::iter::test_util::VecIterator;
	use crate::key::{Key, ValueStruct};
	use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
	use test_log::test;

	fn src(pairs: &[(&[u8], u64, &[u8])], reverse: bool) -> Box<dyn LsmIterator> {
		Box::new(VecIterator::from_pairs(pairs, reverse))
	}

	fn src_with_meta(
		entries: &[(&[u8], u64, &[u8], u8)],
		reverse: bool,
	) -> Box<dyn LsmIterator> {
		let items = entries
			.iter()
			.map(|(k, v, val, meta)| {
				(Key::new(k.to_vec(), *v), ValueStruct {
					meta: *meta,
					user_meta: Bytes::new(),
					value: Bytes::copy_from_slice(val),
					version: *v,
				})
			})
			.collect();
		Box::new(VecIterator::new(items, reverse))
	}

	fn collect_keys(it: &mut SnapshotIterator) -> Vec<(Vec<u8>, u64)> {
		let mut out = Vec::new();
		it.rewind();
		while it.valid() {
			out.push((it.item().key_copy(), it.item().version()));
			it.next();
		}
		out
	}

	fn no_prefetch() -> IteratorOptions {
		IteratorOptions {
			prefetch_values: false,
			..Default::default()
		}
	}

	#[test]
	fn test_newest_version_per_key() {
		let sources = vec![src(
			&[(b"a", 5, b"a5"), (b"b", 7, b"b7"), (b"b", 5, b"b5"), (b"c", 3, b"c3")],
			false,
		)];
		let mut it = SnapshotIterator::new(sources, 10, no_prefetch(), None);
		assert_eq!(
			collect_keys(&mut it),
			vec![(b"a".to_vec(), 5), (b"b".to_vec(), 7), (b"c".to_vec(), 3)]
		);
		it.close().unwrap();
	}

	#[test]
	fn test_read_ts_filters_versions() {
		let sources = vec![src(
			&[(b"a", 5, b"a5"), (b"b", 7, b"b7"), (b"b", 5, b"b5"), (b"c", 3, b"c3")],
			false,
		)];
		let mut it = SnapshotIterator::new(sources, 6, no_prefetch(), None);
		// b@7 is beyond the snapshot; b@5 is the visible version.
		assert_eq!(
			collect_keys(&mut it),
			vec![(b"a".to_vec(), 5), (b"b".to_vec(), 5), (b"c".to_vec(), 3)]
		);
		it.close().unwrap();
	}

	#[test]
	fn test_tombstone_suppresses_key() {
		let sources = vec![src_with_meta(
			&[
				(b"a", 5, b"a5", 0),
				(b"b", 7, b"", META_DELETE),
				(b"b", 5, b"b5", 0),
				(b"c", 3, b"c3", 0),
			],
			false,
		)];
		let mut it = SnapshotIterator::new(sources, 10, no_prefetch(), None);
		// b is deleted at the newest visible version; the older live
		// version must not resurface.
		assert_eq!(collect_keys(&mut it), vec![(b"a".to_vec(), 5), (b"c".to_vec(), 3)]);
		it.close().unwrap();
	}

	#[test]
	fn test_all_versions_includes_tombstones() {
		let sources = vec![src_with_meta(
			&[(b"b", 7, b"", META_DELETE), (b"b", 5, b"b5", 0)],
			false,
		)];
		let opts = IteratorOptions {
			all_versions: true,
			..no_prefetch()
		};
		let mut it = SnapshotIterator::new(sources, 10, opts, None);
		it.rewind();
		assert!(it.valid());
		assert_eq!(it.item().version(), 7);
		assert!(it.item().is_deleted());
		it.next();
		assert!(it.valid());
		assert_eq!(it.item().version(), 5);
		it.next();
		assert!(!it.valid());
		it.close().unwrap();
	}

	#[test]
	fn test_reverse_emits_newest_version() {
		let sources = vec![src(
			&[(b"a", 1, b"a1"), (b"b", 9, b"b9"), (b"b", 5, b"b5")],
			true,
		)];
		let opts = IteratorOptions {
			reverse: true,
			..no_prefetch()
		};
		let mut it = SnapshotIterator::new(sources, 10, opts, None);
		assert_eq!(collect_keys(&mut it), vec![(b"b".to_vec(), 9), (b"a".to_vec(), 1)]);
		it.close().unwrap();
	}

	#[test]
	fn test_reverse_respects_read_ts() {
		let sources = vec![src(
			&[(b"a", 1, b"a1"), (b"b", 9, b"b9"), (b"b", 5, b"b5")],
			true,
		)];
		let opts = IteratorOptions {
			reverse: true,
			..no_prefetch()
		};
		let mut it = SnapshotIterator::new(sources, 6, opts, None);
		assert_eq!(collect_keys(&mut it), vec![(b"b".to_vec(), 5), (b"a".to_vec(), 1)]);
		it.close().unwrap();
	}

	#[test]
	fn test_pending_writes_shadow_tables() {
		// The first source models the transaction's own writes and must
		// win over the table layer at the same version.
		let pending = src(&[(b"k", 5, b"mine")], false);
		let tables = src(&[(b"k", 5, b"theirs"), (b"l", 1, b"l1")], false);
		let mut it = SnapshotIterator::new(vec![pending, tables], 10, no_prefetch(), None);
		it.rewind();
		assert_eq!(it.item().value().unwrap(), Bytes::from_static(b"mine"));
		it.next();
		assert_eq!(it.item().key(), b"l");
		it.close().unwrap();
	}

	#[test]
	fn test_internal_keys_hidden() {
		let sources = vec![src(
			&[(b"!marten!move", 1, b"x"), (b"user", 1, b"u")],
			false,
		)];
		let mut it = SnapshotIterator::new(sources, 10, no_prefetch(), None);
		assert_eq!(collect_keys(&mut it), vec![(b"user".to_vec(), 1)]);
		it.close().unwrap();

		let sources = vec![src(
			&[(b"!marten!move", 1, b"x"), (b"user", 1, b"u")],
			false,
		)];
		let opts = IteratorOptions {
			internal_access: true,
			..no_prefetch()
		};
		let mut it = SnapshotIterator::new(sources, 10, opts, None);
		assert_eq!(collect_keys(&mut it).len(), 2);
		it.close().unwrap();
	}

	#[test]
	fn test_seek_and_prefix() {
		let sources = vec![src(
			&[(b"aa", 1, b"1"), (b"ab", 1, b"2"), (b"b", 1, b"3")],
			false,
		)];
		let mut it = SnapshotIterator::new(sources, 10, no_prefetch(), None);
		it.seek(b"ab");
		assert!(it.valid_for_prefix(b"a"));
		assert_eq!(it.item().key(), b"ab");
		it.next();
		assert!(!it.valid_for_prefix(b"a"));
		assert!(it.valid());
		it.seek(b"");
		assert_eq!(it.item().key(), b"aa");
		it.close().unwrap();
	}

	struct CountingFetcher {
		calls: AtomicUsize,
		retries_left: AtomicUsize,
	}

	impl ValueFetcher for CountingFetcher {
		fn fetch(&self, _key: &[u8], _version: u64, vptr: &[u8]) -> Result<Bytes> {
			self.calls.fetch_add(1, AtomicOrdering::SeqCst);
			if self.retries_left.fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
				n.checked_sub(1)
			})
			.is_ok()
			{
				return Err(Error::Retry);
			}
			let mut out = b"log:".to_vec();
			out.extend_from_slice(vptr);
			Ok(Bytes::from(out))
		}
	}

	#[test]
	fn test_prefetch_resolves_value_pointers() {
		let fetcher = Arc::new(CountingFetcher {
			calls: AtomicUsize::new(0),
			retries_left: AtomicUsize::new(0),
		});
		let sources = vec![src_with_meta(
			&[(b"a", 1, b"p1", META_VALUE_POINTER), (b"b", 1, b"inline", 0)],
			false,
		)];
		let opts = IteratorOptions {
			prefetch_values: true,
			prefetch_size: 10,
			..Default::default()
		};
		let mut it =
			SnapshotIterator::new(sources, 10, opts, Some(fetcher.clone() as Arc<dyn ValueFetcher>));
		it.rewind();
		assert_eq!(it.item().value().unwrap(), Bytes::from_static(b"log:p1"));
		it.next();
		assert_eq!(it.item().value().unwrap(), Bytes::from_static(b"inline"));
		it.next();
		assert!(!it.valid());
		it.close().unwrap();
		assert!(fetcher.calls.load(AtomicOrdering::SeqCst) >= 1);
	}

	#[test]
	fn test_value_retry_is_bounded() {
		let fetcher = Arc::new(CountingFetcher {
			calls: AtomicUsize::new(0),
			retries_left: AtomicUsize::new(2),
		});
		let sources = vec![src_with_meta(&[(b"a", 1, b"p1", META_VALUE_POINTER)], false)];
		let mut it = SnapshotIterator::new(
			sources,
			10,
			no_prefetch(),
			Some(fetcher.clone() as Arc<dyn ValueFetcher>),
		);
		it.rewind();
		// Two relocations then success, all inside one value() call.
		assert_eq!(it.item().value().unwrap(), Bytes::from_static(b"log:p1"));
		assert_eq!(fetcher.calls.load(AtomicOrdering::SeqCst), 3);
		it.close().unwrap();
	}

	#[test]
	fn test_close_waits_for_prefetch() {
		let fetcher = Arc::new(CountingFetcher {
			calls: AtomicUsize::new(0),
			retries_left: AtomicUsize::new(0),
		});
		let entries: Vec<(Vec<u8>, u64)> =
			(0..50u64).map(|i| (format!("key{i:03}").into_bytes(), 1)).collect();
		let items: Vec<(Key, ValueStruct)> = entries
			.iter()
			.map(|(k, v)| {
				(Key::new(k.clone(), *v), ValueStruct {
					meta: META_VALUE_POINTER,
					user_meta: Bytes::new(),
					value: Bytes::from_static(b"ptr"),
					version: *v,
				})
			})
			.collect();
		let sources: Vec<Box<dyn LsmIterator>> =
			vec![Box::new(VecIterator::new(items, false))];
		let opts = IteratorOptions {
			prefetch_values: true,
			prefetch_size: 16,
			..Default::default()
		};
		let mut it = SnapshotIterator::new(sources, 10, opts, Some(fetcher as Arc<dyn ValueFetcher>));
		it.rewind();
		// Walk a few entries and close with fetches still in flight.
		for _ in 0..5 {
			it.next();
		}
		it.close().unwrap();
		assert!(matches!(it.close(), Err(Error::IteratorClosed)));
	}
}
