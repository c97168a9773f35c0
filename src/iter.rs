use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::key::{KeyRef, ValueStruct};

/// The contract every key stream in the store speaks: tables, concat
/// and merge compositions, memtables and pending transaction writes.
///
/// The stream is ordered by (user key asc, version desc); a reversed
/// instance yields (user key desc, version asc). Errors are sticky:
/// once `error()` is set, `valid()` stays false and every operation
/// except `close` is a no-op.
pub trait Iterator {
	/// Back to the first position: smallest key forward, largest
	/// reversed.
	fn rewind(&mut self);
	/// Smallest key `>=` target (forward) or largest `<=` (reversed).
	fn seek(&mut self, key: KeyRef<'_>);
	/// Advances to the next distinct (user key, version) tuple.
	fn next(&mut self);
	/// Steps to the next older version of the current user key. Returns
	/// false, staying put, when none exists.
	fn next_version(&mut self) -> bool;
	fn valid(&self) -> bool;
	fn key(&self) -> KeyRef<'_>;
	fn value(&self) -> ValueStruct;
	fn fill_value(&self, vs: &mut ValueStruct);
	fn error(&self) -> Option<Error>;
	/// Must be called exactly once; a second close is an error.
	fn close(&mut self) -> Result<()>;
}

/// Walks a valid iterator's versions down to the newest one `<=` the
/// given version. False when every version is newer.
pub fn seek_to_version(it: &mut dyn Iterator, version: u64) -> bool {
	if version >= it.key().version {
		return true;
	}
	while it.next_version() {
		if version >= it.key().version {
			return true;
		}
	}
	false
}

/// Advances through every version before moving to the next user key.
pub fn next_all_versions(it: &mut dyn Iterator) {
	if !it.next_version() {
		it.next();
	}
}

/// Clamps an inner iterator to `[start, end)` on user keys (reversed:
/// `[start, end]` approached from the top).
pub struct BoundedIterator {
	inner: Box<dyn Iterator>,
	reverse: bool,
	start: Vec<u8>,
	end: Vec<u8>,
}

impl BoundedIterator {
	pub fn new(inner: Box<dyn Iterator>, start: Vec<u8>, end: Vec<u8>, reverse: bool) -> Self {
		Self {
			inner,
			reverse,
			start,
			end,
		}
	}
}

impl Iterator for BoundedIterator {
	fn rewind(&mut self) {
		if self.reverse {
			self.inner.seek(KeyRef::new(&self.end, 0));
		} else {
			self.inner.seek(KeyRef::new(&self.start, u64::MAX));
		}
	}

	fn seek(&mut self, key: KeyRef<'_>) {
		if self.reverse {
			if self.end.as_slice() < key.user_key {
				self.inner.seek(KeyRef::new(&self.end, key.version));
				return;
			}
		} else if key.user_key < self.start.as_slice() {
			self.inner.seek(KeyRef::new(&self.start, key.version));
			return;
		}
		self.inner.seek(key);
	}

	fn next(&mut self) {
		self.inner.next();
	}

	fn next_version(&mut self) -> bool {
		self.inner.next_version()
	}

	fn valid(&self) -> bool {
		if !self.inner.valid() {
			return false;
		}
		let key = self.inner.key();
		if self.reverse {
			self.start.as_slice() <= key.user_key
		} else {
			key.user_key < self.end.as_slice()
		}
	}

	fn key(&self) -> KeyRef<'_> {
		self.inner.key()
	}

	fn value(&self) -> ValueStruct {
		self.inner.value()
	}

	fn fill_value(&self, vs: &mut ValueStruct) {
		self.inner.fill_value(vs)
	}

	fn error(&self) -> Option<Error> {
		self.inner.error()
	}

	fn close(&mut self) -> Result<()> {
		self.inner.close()
	}
}

/// Yields nothing; the zero-arity base of a merge tree.
struct EmptyIterator;

impl Iterator for EmptyIterator {
	fn rewind(&mut self) {}
	fn seek(&mut self, _key: KeyRef<'_>) {}
	fn next(&mut self) {}
	fn next_version(&mut self) -> bool {
		false
	}
	fn valid(&self) -> bool {
		false
	}
	fn key(&self) -> KeyRef<'_> {
		KeyRef::new(&[], 0)
	}
	fn value(&self) -> ValueStruct {
		ValueStruct::default()
	}
	fn fill_value(&self, _vs: &mut ValueStruct) {}
	fn error(&self) -> Option<Error> {
		None
	}
	fn close(&mut self) -> Result<()> {
		Ok(())
	}
}

struct MergeChild {
	iter: Box<dyn Iterator>,
	valid: bool,
}

impl MergeChild {
	fn reload(&mut self) {
		self.valid = self.iter.valid();
	}
}

/// Two-way merge of ordered sources, composed pairwise into a balanced
/// tree for k inputs. The left child is the newer source: when both sit
/// on the same (user key, version) tuple the right one is advanced
/// past it, so duplicates across sources collapse to the newest copy.
/// Advancing never allocates.
pub struct MergeIterator {
	left: MergeChild,
	right: MergeChild,
	small_is_left: bool,
	reverse: bool,
	closed: bool,
}

impl MergeIterator {
	/// Builds a merge tree over the given sources, listed newest first.
	/// Zero and one sources short-circuit.
	pub fn from_iters(mut iters: Vec<Box<dyn Iterator>>, reverse: bool) -> Box<dyn Iterator> {
		match iters.len() {
			0 => Box::new(EmptyIterator),
			1 => iters.pop().unwrap(),
			n => {
				let tail = iters.split_off(n / 2);
				Box::new(MergeIterator {
					left: MergeChild {
						iter: Self::from_iters(iters, reverse),
						valid: false,
					},
					right: MergeChild {
						iter: Self::from_iters(tail, reverse),
						valid: false,
					},
					small_is_left: true,
					reverse,
					closed: false,
				})
			}
		}
	}

	fn small(&self) -> &MergeChild {
		if self.small_is_left {
			&self.left
		} else {
			&self.right
		}
	}

	fn small_mut(&mut self) -> &mut MergeChild {
		if self.small_is_left {
			&mut self.left
		} else {
			&mut self.right
		}
	}

	fn bigger(&self) -> &MergeChild {
		if self.small_is_left {
			&self.right
		} else {
			&self.left
		}
	}

	fn swap_small(&mut self) {
		self.small_is_left = !self.small_is_left;
	}

	fn cmp(&self, a: KeyRef<'_>, b: KeyRef<'_>) -> Ordering {
		if self.reverse {
			b.cmp_key(a)
		} else {
			a.cmp_key(b)
		}
	}

	/// Restores the invariant that `small` holds the least current
	/// tuple, eliding tuples both children share.
	fn fix(&mut self) {
		loop {
			if !self.bigger().valid {
				return;
			}
			if !self.small().valid {
				self.swap_small();
				return;
			}
			let ord = self.cmp(self.small().iter.key(), self.bigger().iter.key());
			match ord {
				Ordering::Less => return,
				Ordering::Greater => {
					self.swap_small();
					return;
				}
				Ordering::Equal => {
					// Same tuple in both sources: the older (right)
					// copy is dropped.
					self.right.iter.next();
					self.right.reload();
				}
			}
		}
	}
}

impl Iterator for MergeIterator {
	fn rewind(&mut self) {
		self.left.iter.rewind();
		self.left.reload();
		self.right.iter.rewind();
		self.right.reload();
		self.small_is_left = true;
		self.fix();
	}

	fn seek(&mut self, key: KeyRef<'_>) {
		self.left.iter.seek(key);
		self.left.reload();
		self.right.iter.seek(key);
		self.right.reload();
		self.small_is_left = true;
		self.fix();
	}

	fn next(&mut self) {
		if !self.valid() {
			return;
		}
		self.small_mut().iter.next();
		self.small_mut().reload();
		self.fix();
	}

	fn next_version(&mut self) -> bool {
		if !self.valid() {
			return false;
		}
		if self.small_mut().iter.next_version() {
			self.small_mut().reload();
			self.fix();
			return true;
		}
		if !self.bigger().valid {
			return false;
		}
		if !self.small().iter.key().same_user_key(self.bigger().iter.key()) {
			return false;
		}
		// The other source continues this key's version chain. The
		// current source has nothing older, so its next tuple is a
		// different user key and ordering repairs itself.
		self.small_mut().iter.next();
		self.small_mut().reload();
		self.fix();
		true
	}

	fn valid(&self) -> bool {
		self.small().valid
	}

	fn key(&self) -> KeyRef<'_> {
		self.small().iter.key()
	}

	fn value(&self) -> ValueStruct {
		self.small().iter.value()
	}

	fn fill_value(&self, vs: &mut ValueStruct) {
		self.small().iter.fill_value(vs)
	}

	fn error(&self) -> Option<Error> {
		self.left.iter.error().or_else(|| self.right.iter.error())
	}

	fn close(&mut self) -> Result<()> {
		if self.closed {
			return Err(Error::IteratorClosed);
		}
		self.closed = true;
		let first = self.left.iter.close();
		let second = self.right.iter.close();
		first.and(second)
	}
}


#[cfg(test)]
mod tests {
	use super::test_util::VecIterator;
	use super::*;
	use proptest::prelude::*;
	use test_log::test;

	fn drain(it: &mut dyn Iterator) -> Vec<(Vec<u8>, u64, Vec<u8>)> {
		let mut out = Vec::new();
		it.rewind();
		while it.valid() {
			out.push((it.key().user_key.to_vec(), it.key().version, it.value().value.to_vec()));
			it.next();
		}
		out
	}

	#[test]
	fn test_merge_two_sources_elides_duplicates() {
		// Scenario: same keys in both tables; the newer source wins.
		let a = VecIterator::from_pairs(&[(b"k1", 1, b"a1"), (b"k2", 1, b"a2")], false);
		let b = VecIterator::from_pairs(&[(b"k1", 1, b"b1"), (b"k2", 1, b"b2")], false);
		let mut mi = MergeIterator::from_iters(vec![Box::new(a), Box::new(b)], false);

		let got = drain(&mut *mi);
		assert_eq!(
			got,
			vec![
				(b"k1".to_vec(), 1, b"a1".to_vec()),
				(b"k2".to_vec(), 1, b"a2".to_vec()),
			]
		);
		mi.close().unwrap();
	}

	#[test]
	fn test_merge_interleaves_versions() {
		let a = VecIterator::from_pairs(&[(b"k", 9, b"v9"), (b"k", 5, b"v5")], false);
		let b = VecIterator::from_pairs(&[(b"k", 7, b"v7"), (b"z", 1, b"z1")], false);
		let mut mi = MergeIterator::from_iters(vec![Box::new(a), Box::new(b)], false);

		let got = drain(&mut *mi);
		assert_eq!(
			got,
			vec![
				(b"k".to_vec(), 9, b"v9".to_vec()),
				(b"k".to_vec(), 7, b"v7".to_vec()),
				(b"k".to_vec(), 5, b"v5".to_vec()),
				(b"z".to_vec(), 1, b"z1".to_vec()),
			]
		);
		mi.close().unwrap();
	}

	#[test]
	fn test_merge_next_version_across_sources() {
		let a = VecIterator::from_pairs(&[(b"k", 9, b"v9"), (b"k", 5, b"v5")], false);
		let b = VecIterator::from_pairs(&[(b"k", 7, b"v7")], false);
		let mut mi = MergeIterator::from_iters(vec![Box::new(a), Box::new(b)], false);

		mi.rewind();
		assert_eq!(mi.key().version, 9);
		assert!(mi.next_version());
		assert_eq!(mi.key().version, 7);
		assert!(mi.next_version());
		assert_eq!(mi.key().version, 5);
		assert!(!mi.next_version());
		assert_eq!((mi.key().user_key, mi.key().version), (&b"k"[..], 5));
		mi.close().unwrap();
	}

	#[test]
	fn test_merge_next_version_stops_at_user_key() {
		let a = VecIterator::from_pairs(&[(b"a", 3, b"x"), (b"b", 2, b"y")], false);
		let b = VecIterator::from_pairs(&[(b"c", 1, b"z")], false);
		let mut mi = MergeIterator::from_iters(vec![Box::new(a), Box::new(b)], false);

		mi.rewind();
		assert_eq!(mi.key().user_key, b"a");
		assert!(!mi.next_version());
		assert_eq!(mi.key().user_key, b"a");
		mi.next();
		assert_eq!(mi.key().user_key, b"b");
		mi.close().unwrap();
	}

	#[test]
	fn test_merge_reverse() {
		let a = VecIterator::from_pairs(&[(b"k1", 1, b"a1"), (b"k3", 1, b"a3")], true);
		let b = VecIterator::from_pairs(&[(b"k2", 1, b"b2")], true);
		let mut mi = MergeIterator::from_iters(vec![Box::new(a), Box::new(b)], true);

		let got = drain(&mut *mi);
		let keys: Vec<&[u8]> = got.iter().map(|(k, _, _)| k.as_slice()).collect();
		assert_eq!(keys, vec![&b"k3"[..], b"k2", b"k1"]);
		mi.close().unwrap();
	}

	#[test]
	fn test_merge_seek() {
		let a = VecIterator::from_pairs(&[(b"b", 1, b"1"), (b"d", 1, b"2")], false);
		let b = VecIterator::from_pairs(&[(b"c", 1, b"3"), (b"e", 1, b"4")], false);
		let mut mi = MergeIterator::from_iters(vec![Box::new(a), Box::new(b)], false);

		mi.seek(KeyRef::new(b"c", u64::MAX));
		assert!(mi.valid());
		assert_eq!(mi.key().user_key, b"c");
		mi.next();
		assert_eq!(mi.key().user_key, b"d");

		mi.seek(KeyRef::new(b"z", u64::MAX));
		assert!(!mi.valid());
		mi.close().unwrap();
	}

	#[test]
	fn test_merge_many_sources() {
		let mut iters: Vec<Box<dyn Iterator>> = Vec::new();
		for src in 0..5u64 {
			let keys: Vec<(Vec<u8>, u64)> =
				(0..20u64).map(|i| (format!("key{:03}", i * 5 + src).into_bytes(), 1)).collect();
			let items: Vec<_> = keys
				.into_iter()
				.map(|(k, v)| {
					(crate::key::Key::new(k, v), ValueStruct::new(format!("{src}").into_bytes(), 0))
				})
				.collect();
			iters.push(Box::new(VecIterator::new(items, false)));
		}
		let mut mi = MergeIterator::from_iters(iters, false);
		let got = drain(&mut *mi);
		assert_eq!(got.len(), 100);
		for w in got.windows(2) {
			assert!(w[0].0 < w[1].0, "merge output out of order");
		}
		mi.close().unwrap();
	}

	#[test]
	fn test_bounded_iterator() {
		let inner = VecIterator::from_pairs(
			&[(b"a", 1, b"1"), (b"c", 1, b"2"), (b"e", 1, b"3"), (b"g", 1, b"4")],
			false,
		);
		let mut it =
			BoundedIterator::new(Box::new(inner), b"b".to_vec(), b"f".to_vec(), false);
		let got = drain(&mut it);
		let keys: Vec<&[u8]> = got.iter().map(|(k, _, _)| k.as_slice()).collect();
		assert_eq!(keys, vec![&b"c"[..], b"e"]);
		it.close().unwrap();
	}

	#[test]
	fn test_seek_to_version_helper() {
		let mut it =
			VecIterator::from_pairs(&[(b"k", 9, b"v9"), (b"k", 5, b"v5"), (b"k", 2, b"v2")], false);
		it.rewind();
		assert!(seek_to_version(&mut it, 6));
		assert_eq!(it.key().version, 5);

		it.rewind();
		assert!(!seek_to_version(&mut it, 1));
	}

	#[test]
	fn test_double_close() {
		let a = VecIterator::from_pairs(&[(b"k", 1, b"v")], false);
		let b = VecIterator::from_pairs(&[(b"l", 1, b"v")], false);
		let mut mi = MergeIterator::from_iters(vec![Box::new(a), Box::new(b)], false);
		mi.close().unwrap();
		assert!(matches!(mi.close(), Err(Error::IteratorClosed)));
	}

	proptest! {
		/// Merging arbitrary disjoint-or-overlapping sources yields the
		/// ordered union, with exact duplicates collapsed to one entry.
		#[test]
		fn prop_merge_matches_model(
			sources in prop::collection::vec(
				prop::collection::btree_set((0u8..20, 1u64..6), 0..30),
				1..5,
			),
		) {
			use std::collections::BTreeSet;

			let mut model: BTreeSet<(Vec<u8>, std::cmp::Reverse<u64>)> = BTreeSet::new();
			let mut iters: Vec<Box<dyn Iterator>> = Vec::new();
			for set in &sources {
				let mut items: Vec<(crate::key::Key, ValueStruct)> = set
					.iter()
					.map(|(k, v)| {
						(crate::key::Key::new(vec![*k], *v), ValueStruct::new(vec![*k], 0))
					})
					.collect();
				items.sort_by(|a, b| a.0.cmp(&b.0));
				for (key, _) in &items {
					model.insert((key.user_key.to_vec(), std::cmp::Reverse(key.version)));
				}
				iters.push(Box::new(VecIterator::new(items, false)));
			}

			let mut mi = MergeIterator::from_iters(iters, false);
			let got = drain(&mut *mi);
			let want: Vec<(Vec<u8>, u64)> =
				model.into_iter().map(|(k, std::cmp::Reverse(v))| (k, v)).collect();
			let got_kv: Vec<(Vec<u8>, u64)> =
				got.into_iter().map(|(k, v, _)| (k, v)).collect();
			prop_assert_eq!(got_kv, want);
			mi.close().unwrap();
		}
	}
}
