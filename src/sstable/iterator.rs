use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::iter::Iterator as LsmIterator;
use crate::key::{KeyRef, ValueStruct};
use crate::sstable::block::{read_u32_at, BlockCursor};
use crate::sstable::table::Table;

/// Two-level cursor over one table: the block index picks a block, the
/// block cursor walks entries and their version sidecars. Bidirectional
/// internally; `reversed` picks which direction the `Iterator` contract
/// maps to.
pub struct TableIterator {
	table: Arc<Table>,
	bpos: usize,
	cursor: BlockCursor,
	err: Option<Error>,
	eof: bool,
	reversed: bool,
	closed: bool,
}

impl TableIterator {
	pub fn new(table: &Arc<Table>, reversed: bool) -> TableIterator {
		table.incr_ref();
		TableIterator {
			cursor: table.new_block_cursor(),
			table: Arc::clone(table),
			bpos: 0,
			err: None,
			eof: false,
			reversed,
			closed: false,
		}
	}

	fn reset(&mut self) {
		self.bpos = 0;
		self.eof = false;
		self.cursor.unset();
	}

	fn load_block(&mut self, bpos: usize) -> bool {
		match self.table.block(bpos) {
			Ok(block) => {
				self.cursor.set_block(block);
				true
			}
			Err(e) => {
				log::error!("[TABLE_ITER] failed to load block {bpos}: {e}");
				self.err = Some(e);
				false
			}
		}
	}

	fn seek_to_first(&mut self) {
		self.reset();
		if self.table.index.num_blocks() == 0 {
			self.eof = true;
			return;
		}
		self.bpos = 0;
		if !self.load_block(0) {
			return;
		}
		self.cursor.seek_to_first();
		self.eof = !self.cursor.valid();
	}

	fn seek_to_last(&mut self) {
		self.reset();
		let num_blocks = self.table.index.num_blocks();
		if num_blocks == 0 {
			self.eof = true;
			return;
		}
		self.bpos = num_blocks - 1;
		if !self.load_block(self.bpos) {
			return;
		}
		self.cursor.seek_to_last();
		self.eof = !self.cursor.valid();
	}

	fn seek_in_block(&mut self, block_idx: usize, key: KeyRef<'_>) {
		self.bpos = block_idx;
		if !self.load_block(block_idx) {
			return;
		}
		self.cursor.seek(key);
		self.eof = !self.cursor.valid();
	}

	fn seek_from_offset(&mut self, block_idx: usize, offset: usize, key: KeyRef<'_>) {
		self.bpos = block_idx;
		if !self.load_block(block_idx) {
			return;
		}
		self.cursor.set_idx(offset);
		if self.cursor.valid() && self.cursor.key().cmp_key(key) != Ordering::Less {
			self.eof = false;
			return;
		}
		self.cursor.seek(key);
		self.eof = !self.cursor.valid();
	}

	/// First block whose base key is strictly greater than the target
	/// user key.
	fn seek_block(&self, user_key: &[u8]) -> usize {
		let n = self.table.index.num_blocks();
		let (mut lo, mut hi) = (0, n);
		while lo < hi {
			let mid = (lo + hi) / 2;
			if self.table.index.base_key(mid) <= user_key {
				lo = mid + 1;
			} else {
				hi = mid;
			}
		}
		lo
	}

	/// Positions at the first key `>=` the target, walking the block
	/// index without the range filter.
	fn seek_from(&mut self, key: KeyRef<'_>) {
		self.reset();
		if self.table.index.num_blocks() == 0 {
			self.eof = true;
			return;
		}

		let idx = self.seek_block(key.user_key);
		if idx == 0 {
			// Even the first block's base key is past the target.
			self.seek_in_block(0, key);
			return;
		}

		// block[idx].base > target >= block[idx-1].base: the answer is
		// in block idx-1, or it is the first entry of block idx.
		self.seek_in_block(idx - 1, key);
		if self.eof && self.err.is_none() {
			if idx == self.table.index.num_blocks() {
				// Greater than every key in the table.
				return;
			}
			self.seek_from_offset(idx, 0, key);
		}
	}

	/// Seek accelerated by the range filter: a hit hands back the exact
	/// entry position to jump to.
	fn seek_internal(&mut self, key: KeyRef<'_>) {
		let table = Arc::clone(&self.table);
		let Some(surf) = &table.surf else {
			self.seek_from(key);
			return;
		};

		let Some(sit) = surf.seek(key.user_key) else {
			self.reset();
			self.eof = true;
			return;
		};
		let pos = sit.value();
		let block_idx = read_u32_at(pos, 0) as usize;
		let entry_idx = read_u32_at(pos, 4) as usize;
		self.reset();
		self.seek_from_offset(block_idx, entry_idx, key);
		if self.eof && self.err.is_none() {
			// The version walk ran off the block; resolve the slow way.
			self.seek_from(key);
		}
	}

	/// Positions at the largest key `<=` the target.
	// TODO: seek directly instead of overshooting and stepping back.
	pub(crate) fn seek_for_prev(&mut self, key: KeyRef<'_>) {
		self.seek_from(key);
		if self.err.is_some() {
			return;
		}
		if !self.valid_inner() || self.cursor.key().cmp_key(key) != Ordering::Equal {
			self.prev_inner();
		}
	}

	fn next_inner(&mut self) {
		if self.err.is_some() {
			return;
		}
		loop {
			if self.bpos >= self.table.index.num_blocks() {
				self.eof = true;
				return;
			}
			if !self.cursor.is_set() {
				if !self.load_block(self.bpos) {
					return;
				}
				self.cursor.seek_to_first();
			} else {
				self.cursor.next();
			}
			if self.cursor.valid() {
				self.eof = false;
				return;
			}
			self.bpos += 1;
			self.cursor.unset();
		}
	}

	fn prev_inner(&mut self) {
		if self.err.is_some() {
			return;
		}
		loop {
			if !self.cursor.is_set() {
				if !self.load_block(self.bpos) {
					return;
				}
				self.cursor.seek_to_last();
			} else {
				self.cursor.prev();
			}
			if self.cursor.valid() {
				self.eof = false;
				return;
			}
			if self.bpos == 0 {
				self.eof = true;
				return;
			}
			self.bpos -= 1;
			self.cursor.unset();
		}
	}

	fn valid_inner(&self) -> bool {
		self.err.is_none() && !self.eof && self.cursor.valid()
	}
}

impl LsmIterator for TableIterator {
	fn rewind(&mut self) {
		if self.err.is_some() {
			return;
		}
		if !self.reversed {
			self.seek_to_first();
		} else {
			self.seek_to_last();
		}
	}

	fn seek(&mut self, key: KeyRef<'_>) {
		if self.err.is_some() {
			return;
		}
		if !self.reversed {
			self.seek_internal(key);
		} else {
			self.seek_for_prev(key);
		}
	}

	fn next(&mut self) {
		if !self.reversed {
			self.next_inner();
		} else {
			self.prev_inner();
		}
	}

	fn next_version(&mut self) -> bool {
		if !self.valid_inner() {
			return false;
		}
		self.cursor.next_version()
	}

	fn valid(&self) -> bool {
		self.valid_inner()
	}

	fn key(&self) -> KeyRef<'_> {
		self.cursor.key()
	}

	fn value(&self) -> ValueStruct {
		self.cursor.value()
	}

	fn fill_value(&self, vs: &mut ValueStruct) {
		vs.decode_into(&self.cursor.val);
	}

	fn error(&self) -> Option<Error> {
		self.err.clone()
	}

	fn close(&mut self) -> Result<()> {
		if self.closed {
			return Err(Error::IteratorClosed);
		}
		self.closed = true;
		self.table.decr_ref()
	}
}

impl Drop for TableIterator {
	fn drop(&mut self) {
		if !self.closed {
			self.closed = true;
			let _ = self.table.decr_ref();
		}
	}
}

/// Chains the iterators of non-overlapping tables, held in ascending
/// key order. Per-table iterators are created on first use.
pub struct ConcatIterator {
	idx: Option<usize>,
	iters: Vec<Option<TableIterator>>,
	tables: Vec<Arc<Table>>,
	reversed: bool,
	closed: bool,
}

impl ConcatIterator {
	pub fn new(tables: Vec<Arc<Table>>, reversed: bool) -> ConcatIterator {
		ConcatIterator {
			idx: None,
			iters: (0..tables.len()).map(|_| None).collect(),
			tables,
			reversed,
			closed: false,
		}
	}

	fn set_idx(&mut self, idx: isize) {
		if idx < 0 || idx as usize >= self.tables.len() {
			self.idx = None;
			return;
		}
		let idx = idx as usize;
		if self.iters[idx].is_none() {
			self.iters[idx] = Some(TableIterator::new(&self.tables[idx], self.reversed));
		}
		self.idx = Some(idx);
	}

	fn cur(&self) -> Option<&TableIterator> {
		self.idx.and_then(|i| self.iters[i].as_ref())
	}

	fn cur_mut(&mut self) -> Option<&mut TableIterator> {
		let i = self.idx?;
		self.iters[i].as_mut()
	}
}

impl LsmIterator for ConcatIterator {
	fn rewind(&mut self) {
		if self.tables.is_empty() {
			self.idx = None;
			return;
		}
		let start = if !self.reversed {
			0
		} else {
			self.tables.len() as isize - 1
		};
		self.set_idx(start as isize);
		if let Some(it) = self.cur_mut() {
			it.rewind();
		}
		// Walk over empty tables.
		while self.cur().is_some_and(|it| !it.valid() && it.error().is_none()) {
			let next = if !self.reversed {
				self.idx.unwrap() as isize + 1
			} else {
				self.idx.unwrap() as isize - 1
			};
			self.set_idx(next);
			if let Some(it) = self.cur_mut() {
				it.rewind();
			}
		}
	}

	fn seek(&mut self, key: KeyRef<'_>) {
		let n = self.tables.len();
		let idx = if !self.reversed {
			// First table that may still hold a key >= target.
			search(n, |i| self.tables[i].biggest().as_ref().cmp_key(key) != Ordering::Less)
				as isize
		} else {
			// Last table that may still hold a key <= target.
			let from_back = search(n, |i| {
				self.tables[n - 1 - i].smallest().as_ref().cmp_key(key) != Ordering::Greater
			});
			n as isize - 1 - from_back as isize
		};
		if idx < 0 || idx as usize >= n {
			self.idx = None;
			return;
		}
		self.set_idx(idx);
		if let Some(it) = self.cur_mut() {
			it.seek(key);
		}
	}

	fn next(&mut self) {
		let Some(it) = self.cur_mut() else {
			return;
		};
		it.next();
		if it.valid() {
			return;
		}
		loop {
			// Current table exhausted; rewind the next non-empty one.
			let next = if !self.reversed {
				self.idx.unwrap() as isize + 1
			} else {
				self.idx.unwrap() as isize - 1
			};
			self.set_idx(next);
			let Some(it) = self.cur_mut() else {
				return;
			};
			it.rewind();
			if it.valid() {
				return;
			}
		}
	}

	fn next_version(&mut self) -> bool {
		// Versions of a user key never span tables.
		self.cur_mut().map(|it| it.next_version()).unwrap_or(false)
	}

	fn valid(&self) -> bool {
		self.cur().is_some_and(|it| it.valid())
	}

	fn key(&self) -> KeyRef<'_> {
		self.cur().expect("invalid iterator").key()
	}

	fn value(&self) -> ValueStruct {
		self.cur().expect("invalid iterator").value()
	}

	fn fill_value(&self, vs: &mut ValueStruct) {
		if let Some(it) = self.cur() {
			it.fill_value(vs);
		}
	}

	fn error(&self) -> Option<Error> {
		self.iters.iter().flatten().find_map(|it| it.error())
	}

	fn close(&mut self) -> Result<()> {
		if self.closed {
			return Err(Error::IteratorClosed);
		}
		self.closed = true;
		let mut result = Ok(());
		for it in self.iters.iter_mut().flatten() {
			if let Err(e) = it.close() {
				result = Err(e);
			}
		}
		result
	}
}

/// Smallest `i` in `[0, n)` for which `pred(i)` holds, or `n`.
fn search(n: usize, pred: impl Fn(usize) -> bool) -> usize {
	let (mut lo, mut hi) = (0, n);
	while lo < hi {
		let mid = (lo + hi) / 2;
		if pred(mid) {
			hi = mid;
		} else {
			lo = mid + 1;
		}
	}
	lo
}
