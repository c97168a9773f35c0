//! Succinct range filter over the user keys of a table. A LOUDS-encoded
//! trie stores every key's distinguishing prefix; leaves carry the entry
//! position so a positive lookup jumps straight into the right block.
//! The upper levels are bitmap-encoded (dense), the lower levels list
//! their labels (sparse); rank/select makes both navigable in place.

pub(crate) mod bits;
pub(crate) mod builder;
pub(crate) mod iterator;

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

use bits::{LabelVector, RankVector, SelectVector, SuffixVector, ValueVector, LABEL_TERMINATOR};
pub use builder::SurfOptions;
pub(crate) use builder::SurfBuilder;
pub(crate) use iterator::SurfIterator;

/// Bitmap-encoded trie levels. Each node owns a 256-bit label bitmap, a
/// matching has-child bitmap, and one prefix-key bit.
pub(crate) struct LoudsDense {
	pub(crate) height: u32,
	pub(crate) labels: RankVector,
	pub(crate) has_child: RankVector,
	pub(crate) is_prefix: RankVector,
	pub(crate) suffixes: SuffixVector,
	pub(crate) values: ValueVector,
}

impl LoudsDense {
	pub(crate) fn child_node_id(&self, pos: u32) -> u32 {
		self.has_child.rank(pos)
	}

	/// First set label position in `node` at or past `from`, if any.
	pub(crate) fn next_label_in_node(&self, node: u32, from: u32) -> Option<u32> {
		if from > 255 {
			return None;
		}
		let start = node * 256 + from;
		let node_end = (node + 1) * 256;
		if self.labels.is_set(start) {
			return Some(start);
		}
		let d = self.labels.bv.distance_to_next_set_bit(start);
		let pos = start + d;
		if d > 0 && pos < node_end && pos < self.labels.num_bits() && self.labels.is_set(pos) {
			Some(pos)
		} else {
			None
		}
	}

	pub(crate) fn value_pos(&self, pos: u32, node: u32) -> u32 {
		self.labels.rank(pos) - self.has_child.rank(pos) + self.is_prefix.rank(node) - 1
	}

	pub(crate) fn prefix_value_pos(&self, node: u32) -> u32 {
		self.labels.rank_excl(node * 256) - self.has_child.rank_excl(node * 256)
			+ self.is_prefix.rank(node)
			- 1
	}
}

/// Label-list trie levels below the dense cutoff. `louds` marks the
/// first label of every node; select on it finds node extents.
pub(crate) struct LoudsSparse {
	pub(crate) start_level: u32,
	pub(crate) height: u32,
	/// Number of nodes encoded dense; sparse node ids follow them.
	pub(crate) node_count_dense: u32,
	/// Number of child edges in the dense levels; sparse child ranks
	/// continue from there.
	pub(crate) child_count_dense: u32,
	pub(crate) labels: LabelVector,
	pub(crate) has_child: RankVector,
	pub(crate) louds: SelectVector,
	pub(crate) suffixes: SuffixVector,
	pub(crate) values: ValueVector,
}

impl LoudsSparse {
	pub(crate) fn first_label_pos(&self, node: u32) -> u32 {
		self.louds.select(node + 1 - self.node_count_dense)
	}

	pub(crate) fn node_size(&self, pos: u32) -> u32 {
		let d = self.louds.distance_to_next_set_bit(pos);
		if d == 0 {
			self.labels.len() - pos
		} else {
			d
		}
	}

	pub(crate) fn child_node_id(&self, pos: u32) -> u32 {
		self.has_child.rank(pos) + self.child_count_dense
	}

	pub(crate) fn value_pos(&self, pos: u32) -> u32 {
		pos - self.has_child.rank(pos)
	}
}

/// An immutable, serialized-trie filter over a table's user keys.
pub(crate) struct Surf {
	pub(crate) height: u32,
	pub(crate) sparse_start_level: u32,
	pub(crate) value_size: u32,
	pub(crate) dense: LoudsDense,
	pub(crate) sparse: LoudsSparse,
}

enum DenseGet {
	Found(u32),
	NotFound,
	Sparse(u32),
}

impl Surf {
	/// Exact lookup. `Some(value)` means the key is present up to the
	/// suffix's false-positive bound; `None` is a definite absence.
	pub(crate) fn get(&self, key: &[u8]) -> Option<&[u8]> {
		if self.dense.height == 0 {
			return self.get_sparse(key, 0, 0);
		}
		match self.get_dense(key) {
			DenseGet::Found(value_pos) => Some(self.dense.values.get(value_pos)),
			DenseGet::NotFound => None,
			DenseGet::Sparse(node) => {
				self.get_sparse(key, self.dense.height as usize, node)
			}
		}
	}

	fn get_dense(&self, key: &[u8]) -> DenseGet {
		let ld = &self.dense;
		let mut node = 0u32;
		for level in 0..ld.height as usize {
			if level >= key.len() {
				if ld.is_prefix.num_bits() > node && ld.is_prefix.is_set(node) {
					let vpos = ld.prefix_value_pos(node);
					if ld.suffixes.check_equality(vpos, key, level + 1) {
						return DenseGet::Found(vpos);
					}
				}
				return DenseGet::NotFound;
			}
			let pos = node * 256 + key[level] as u32;
			if !ld.labels.is_set(pos) {
				return DenseGet::NotFound;
			}
			if !ld.has_child.is_set(pos) {
				let vpos = ld.value_pos(pos, node);
				if ld.suffixes.check_equality(vpos, key, level + 1) {
					return DenseGet::Found(vpos);
				}
				return DenseGet::NotFound;
			}
			node = ld.child_node_id(pos);
		}
		DenseGet::Sparse(node)
	}

	fn get_sparse(&self, key: &[u8], start_level: usize, node: u32) -> Option<&[u8]> {
		let ls = &self.sparse;
		let mut node = node;
		let mut pos = ls.first_label_pos(node);
		for level in start_level.. {
			if level >= key.len() {
				// Only a terminator leaf can match an exhausted key.
				if ls.labels.get(pos) == LABEL_TERMINATOR && !ls.has_child.is_set(pos) {
					let vpos = ls.value_pos(pos);
					if ls.suffixes.check_equality(vpos, key, level + 1) {
						return Some(ls.values.get(vpos));
					}
				}
				return None;
			}
			let size = ls.node_size(pos);
			let (p, found) = ls.labels.search(key[level], pos, size);
			if !found {
				return None;
			}
			if !ls.has_child.is_set(p) {
				let vpos = ls.value_pos(p);
				if ls.suffixes.check_equality(vpos, key, level + 1) {
					return Some(ls.values.get(vpos));
				}
				return None;
			}
			node = ls.child_node_id(p);
			pos = ls.first_label_pos(node);
		}
		None
	}

	/// Positions an iterator on the smallest stored key whose trie path
	/// is `>=` the query, compensating for suffix truncation so it never
	/// lands past a present key. Returns `None` when the query is past
	/// every key in the filter.
	pub(crate) fn seek(&self, key: &[u8]) -> Option<SurfIterator<'_>> {
		let mut it = SurfIterator::new(self);
		if it.seek(key) {
			Some(it)
		} else {
			None
		}
	}

	pub(crate) fn iter(&self) -> SurfIterator<'_> {
		SurfIterator::new(self)
	}

	pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
		buf.put_u32_le(self.height);
		buf.put_u32_le(self.sparse_start_level);
		buf.put_u32_le(self.sparse.node_count_dense);
		buf.put_u32_le(self.sparse.child_count_dense);
		buf.put_u32_le(self.value_size);
		buf.put_u32_le(0);

		self.dense.labels.write_to(buf);
		self.dense.has_child.write_to(buf);
		self.dense.is_prefix.write_to(buf);
		self.dense.suffixes.write_to(buf);
		self.dense.values.write_to(buf);

		self.sparse.labels.write_to(buf);
		self.sparse.has_child.write_to(buf);
		self.sparse.louds.write_to(buf);
		self.sparse.suffixes.write_to(buf);
		self.sparse.values.write_to(buf);
	}

	pub(crate) fn read_from(mut src: &[u8]) -> Result<Self> {
		if src.len() < 24 {
			return Err(Error::Corruption("surf region truncated".into()));
		}
		let height = src.get_u32_le();
		let sparse_start_level = src.get_u32_le();
		let node_count_dense = src.get_u32_le();
		let child_count_dense = src.get_u32_le();
		let value_size = src.get_u32_le();
		let _pad = src.get_u32_le();

		let dense = LoudsDense {
			height: sparse_start_level,
			labels: RankVector::read_from(&mut src)?,
			has_child: RankVector::read_from(&mut src)?,
			is_prefix: RankVector::read_from(&mut src)?,
			suffixes: SuffixVector::read_from(&mut src)?,
			values: ValueVector::read_from(&mut src)?,
		};
		let sparse = LoudsSparse {
			start_level: sparse_start_level,
			height,
			node_count_dense,
			child_count_dense,
			labels: LabelVector::read_from(&mut src)?,
			has_child: RankVector::read_from(&mut src)?,
			louds: SelectVector::read_from(&mut src)?,
			suffixes: SuffixVector::read_from(&mut src)?,
			values: ValueVector::read_from(&mut src)?,
		};

		Ok(Surf {
			height,
			sparse_start_level,
			value_size,
			dense,
			sparse,
		})
	}
}
