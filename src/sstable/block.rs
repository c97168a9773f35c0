use std::cmp::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use crate::key::{KeyRef, ValueStruct};

/// A decoded data block plus the full base key the block index stores
/// for it. Immutable once published to the cache; cursors share it.
#[derive(Clone)]
pub(crate) struct Block {
	pub(crate) data: Bytes,
	pub(crate) base_key: Bytes,
}

impl Block {
	pub(crate) fn from_parts(data: Bytes, base_key: Bytes) -> Block {
		Block {
			data,
			base_key,
		}
	}

	pub(crate) fn size(&self) -> usize {
		self.data.len() + self.base_key.len()
	}
}

pub(crate) fn read_u32_at(data: &[u8], off: usize) -> u32 {
	u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

pub(crate) fn read_u64_at(data: &[u8], off: usize) -> u64 {
	u64::from_le_bytes(data[off..off + 8].try_into().unwrap())
}

fn read_u16_at(data: &[u8], off: usize) -> u16 {
	u16::from_le_bytes(data[off..off + 2].try_into().unwrap())
}

/// Lexicographic compare of `prefix || suffix` against `b` without
/// materializing the concatenation.
fn cmp_concat(prefix: &[u8], suffix: &[u8], b: &[u8]) -> Ordering {
	let split = prefix.len().min(b.len());
	match prefix.cmp(&b[..split]) {
		Ordering::Equal => suffix.cmp(&b[split..]),
		ord => ord,
	}
}

/// Cursor over the older versions of one key. The newest version lives
/// inline in the block; the rest sit in the table's old-block region at
/// `old_offset`, newest first.
#[derive(Default)]
pub(crate) struct SingleKeyCursor {
	pub(crate) old_block: Bytes,
	has_old: bool,
	num_old: usize,
	/// offset of the sidecar's end-offset array within the region
	ends_start: usize,
	/// offset of the sidecar's entry data within the region
	data_start: usize,
	latest_version: u64,
	latest_val: Bytes,
	/// 0 is the inline newest version; 1..=num_old are the sidecar's.
	pub(crate) idx: usize,
}

impl SingleKeyCursor {
	pub(crate) fn reset(&mut self) {
		self.has_old = false;
		self.num_old = 0;
		self.idx = 0;
	}

	pub(crate) fn set(&mut self, old_offset: u32, latest_version: u64, latest_val: Bytes) {
		let off = old_offset as usize;
		let num = read_u32_at(&self.old_block, off) as usize;
		self.has_old = true;
		self.num_old = num;
		self.ends_start = off + 4;
		self.data_start = self.ends_start + 4 * num;
		self.latest_version = latest_version;
		self.latest_val = latest_val;
		self.idx = 0;
	}

	pub(crate) fn has_old(&self) -> bool {
		self.has_old
	}

	pub(crate) fn length(&self) -> usize {
		self.num_old + 1
	}

	fn old_entry(&self, i: usize) -> (u64, Bytes) {
		let start = if i == 0 {
			0
		} else {
			read_u32_at(&self.old_block, self.ends_start + 4 * (i - 1)) as usize
		};
		let end = read_u32_at(&self.old_block, self.ends_start + 4 * i) as usize;
		let entry = self.old_block.slice(self.data_start + start..self.data_start + end);
		let version = read_u64_at(&entry, 0);
		(version, entry.slice(8..))
	}

	pub(crate) fn version_and_val(&self) -> (u64, Bytes) {
		if self.idx == 0 {
			(self.latest_version, self.latest_val.clone())
		} else {
			self.old_entry(self.idx - 1)
		}
	}

	/// Positions at the newest version `<=` the target, leaving the
	/// cursor past the end when every version is newer.
	pub(crate) fn seek_version(&mut self, target: u64) -> (u64, Bytes) {
		let mut out = (self.latest_version, self.latest_val.clone());
		self.idx = 0;
		while self.idx < self.length() {
			out = self.version_and_val();
			if target >= out.0 {
				return out;
			}
			self.idx += 1;
		}
		out
	}
}

/// Cursor inside one block. Entry boundaries come from the end-offset
/// array in the trailer; keys are rebuilt as `base_key[..base_len] ||
/// diff`.
#[derive(Default)]
pub(crate) struct BlockCursor {
	block: Option<Arc<Block>>,
	num_entries: usize,
	/// byte length of the entry region (== start of the offset array)
	entries_len: usize,
	base_len: usize,
	/// `Some(ts)` when the table assigns one version to every entry.
	global_version: Option<u64>,
	pub(crate) user_key: Vec<u8>,
	pub(crate) version: u64,
	pub(crate) val: Bytes,
	pub(crate) idx: usize,
	eof: bool,
	pub(crate) ski: SingleKeyCursor,
}

impl BlockCursor {
	pub(crate) fn new(old_block: Bytes, global_version: Option<u64>) -> Self {
		BlockCursor {
			ski: SingleKeyCursor {
				old_block,
				..Default::default()
			},
			global_version,
			..Default::default()
		}
	}

	pub(crate) fn is_set(&self) -> bool {
		self.block.is_some()
	}

	pub(crate) fn unset(&mut self) {
		self.block = None;
		self.num_entries = 0;
		self.eof = true;
	}

	pub(crate) fn set_block(&mut self, block: Arc<Block>) {
		let data = &block.data;
		let len = data.len();
		self.base_len = read_u16_at(data, len - 2) as usize;
		self.num_entries = read_u32_at(data, len - 6) as usize;
		self.entries_len = len - 6 - 4 * self.num_entries;
		self.user_key.clear();
		self.user_key.extend_from_slice(&block.base_key[..self.base_len]);
		self.val = Bytes::new();
		self.idx = 0;
		self.eof = false;
		self.ski.reset();
		self.block = Some(block);
	}

	pub(crate) fn valid(&self) -> bool {
		self.block.is_some() && !self.eof
	}

	pub(crate) fn num_entries(&self) -> usize {
		self.num_entries
	}

	pub(crate) fn key(&self) -> KeyRef<'_> {
		KeyRef::new(&self.user_key, self.version)
	}

	pub(crate) fn value(&self) -> ValueStruct {
		ValueStruct::decode(&self.val)
	}

	fn entry_bounds(&self, i: usize) -> (usize, usize) {
		let data = &self.block.as_ref().unwrap().data;
		let start = if i == 0 {
			0
		} else {
			read_u32_at(data, self.entries_len + 4 * (i - 1)) as usize
		};
		let end = read_u32_at(data, self.entries_len + 4 * i) as usize;
		(start, end)
	}

	/// Rebuilds the user key of entry `i` piecewise for comparisons, so
	/// binary search probes do not disturb the cursor.
	fn cmp_entry_user_key(&self, i: usize, target: &[u8]) -> Ordering {
		let block = self.block.as_ref().unwrap();
		let (start, end) = self.entry_bounds(i);
		let entry = &block.data[start..end];
		let diff_len = read_u16_at(entry, 0) as usize;
		cmp_concat(&block.base_key[..self.base_len], &entry[2..2 + diff_len], target)
	}

	/// Positions at entry `i`, decoding key, version and value. Past the
	/// last entry the cursor goes EOF.
	pub(crate) fn set_idx(&mut self, i: usize) {
		self.idx = i;
		if i >= self.num_entries {
			self.eof = true;
			return;
		}
		self.eof = false;

		let block = self.block.as_ref().unwrap().clone();
		let (start, end) = self.entry_bounds(i);
		let entry = block.data.slice(start..end);

		let diff_len = read_u16_at(&entry, 0) as usize;
		let mut off = 2;
		self.user_key.truncate(self.base_len);
		self.user_key.extend_from_slice(&entry[off..off + diff_len]);
		off += diff_len;

		let has_old = entry[off] != 0;
		off += 1;
		let mut old_offset = 0u32;
		if has_old {
			old_offset = read_u32_at(&entry, off);
			off += 4;
		}

		match self.global_version {
			Some(ts) => self.version = ts,
			None => {
				self.version = read_u64_at(&entry, off);
				off += 8;
			}
		}
		self.val = entry.slice(off..);

		self.ski.reset();
		if has_old {
			self.ski.set(old_offset, self.version, self.val.clone());
		}
	}

	pub(crate) fn seek_to_first(&mut self) {
		self.set_idx(0);
	}

	pub(crate) fn seek_to_last(&mut self) {
		if self.num_entries == 0 {
			self.eof = true;
			return;
		}
		self.set_idx(self.num_entries - 1);
		self.seek_to_last_version();
	}

	/// First position whose key is `>=` the target in the (user asc,
	/// version desc) order, descending into the sidecar when an older
	/// version of the same user key is wanted.
	pub(crate) fn seek(&mut self, target: KeyRef<'_>) {
		let (mut lo, mut hi) = (0, self.num_entries);
		while lo < hi {
			let mid = (lo + hi) / 2;
			if self.cmp_entry_user_key(mid, target.user_key) == Ordering::Less {
				lo = mid + 1;
			} else {
				hi = mid;
			}
		}
		let found = lo;
		self.set_idx(found);
		if self.eof {
			return;
		}
		if self.version > target.version && self.user_key == target.user_key {
			if self.ski.has_old() {
				let (ver, val) = self.ski.seek_version(target.version);
				self.version = ver;
				self.val = val;
			}
			if self.version > target.version {
				self.set_idx(found + 1);
			}
		}
	}

	pub(crate) fn has_old_version(&self) -> bool {
		self.ski.has_old()
	}

	/// Steps to the next (user key, version) tuple: first through the
	/// sidecar of the current key, then to the next entry.
	pub(crate) fn next(&mut self) {
		if self.eof {
			return;
		}
		if self.ski.has_old() && self.ski.idx + 1 < self.ski.length() {
			self.ski.idx += 1;
			let (ver, val) = self.ski.version_and_val();
			self.version = ver;
			self.val = val;
			return;
		}
		self.set_idx(self.idx + 1);
	}

	/// Steps to the previous tuple, entering the previous entry at its
	/// oldest version.
	pub(crate) fn prev(&mut self) {
		if self.eof {
			// Past the end (a seek overshot the block): step back onto
			// the last entry. Before the start the cursor stays put.
			if self.idx >= self.num_entries && self.num_entries > 0 {
				self.set_idx(self.num_entries - 1);
				self.seek_to_last_version();
			}
			return;
		}
		if self.prev_version() {
			return;
		}
		if self.idx == 0 {
			self.eof = true;
			return;
		}
		self.set_idx(self.idx - 1);
		self.seek_to_last_version();
	}

	/// Moves one version newer within the current key, if any.
	pub(crate) fn prev_version(&mut self) -> bool {
		if self.ski.has_old() && self.ski.idx > 0 {
			self.ski.idx -= 1;
			let (ver, val) = self.ski.version_and_val();
			self.version = ver;
			self.val = val;
			return true;
		}
		false
	}

	/// Moves one version older within the current key, if any.
	pub(crate) fn next_version(&mut self) -> bool {
		if self.ski.has_old() && self.ski.idx + 1 < self.ski.length() {
			self.ski.idx += 1;
			let (ver, val) = self.ski.version_and_val();
			self.version = ver;
			self.val = val;
			return true;
		}
		false
	}

	pub(crate) fn seek_to_last_version(&mut self) {
		if self.ski.has_old() {
			self.ski.idx = self.ski.length() - 1;
			let (ver, val) = self.ski.version_and_val();
			self.version = ver;
			self.val = val;
		}
	}
}
