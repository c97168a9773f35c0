use super::bits::LABEL_TERMINATOR;
use super::{LoudsDense, LoudsSparse, Surf};

/// Cursor over the dense levels. Frames hold one label-bitmap position
/// per level along the current path.
struct DenseIter<'a> {
	ld: &'a LoudsDense,
	valid: bool,
	/// Landed on a leaf (labeled or prefix-key) inside the dense levels.
	complete: bool,
	/// Positioned on a bottom-level edge whose subtree continues in the
	/// sparse levels; holds the global child node id.
	send_out: Option<u32>,
	at_prefix_key: bool,
	prefix_node: u32,
	key: Vec<u8>,
	frames: Vec<u32>,
}

impl<'a> DenseIter<'a> {
	fn new(ld: &'a LoudsDense) -> Self {
		Self {
			ld,
			valid: false,
			complete: false,
			send_out: None,
			at_prefix_key: false,
			prefix_node: 0,
			key: Vec::new(),
			frames: Vec::new(),
		}
	}

	fn reset(&mut self) {
		self.valid = false;
		self.complete = false;
		self.send_out = None;
		self.at_prefix_key = false;
		self.key.clear();
		self.frames.clear();
	}

	fn push(&mut self, pos: u32) {
		self.frames.push(pos);
		self.key.push((pos % 256) as u8);
	}

	fn pop(&mut self) {
		self.frames.pop();
		self.key.pop();
	}

	fn set_leaf(&mut self) {
		self.valid = true;
		self.complete = true;
		self.send_out = None;
	}

	/// Walks to the smallest leaf under `node`, which sits at the level
	/// equal to the current frame depth.
	fn descend_leftmost(&mut self, mut node: u32) -> bool {
		loop {
			if self.frames.len() >= self.ld.height as usize {
				self.valid = true;
				self.complete = false;
				self.send_out = Some(node);
				return true;
			}
			if self.ld.is_prefix.num_bits() > node && self.ld.is_prefix.is_set(node) {
				self.at_prefix_key = true;
				self.prefix_node = node;
				self.set_leaf();
				return true;
			}
			match self.ld.next_label_in_node(node, 0) {
				Some(pos) => {
					self.push(pos);
					if self.ld.has_child.is_set(pos) {
						node = self.ld.child_node_id(pos);
					} else {
						self.set_leaf();
						return true;
					}
				}
				None => {
					self.valid = false;
					return false;
				}
			}
		}
	}

	fn seek_to_first(&mut self) -> bool {
		self.reset();
		if self.ld.height == 0 {
			return false;
		}
		self.descend_leftmost(0)
	}

	/// Steps into the edge at `pos`: leaf, handoff or further descent.
	fn step_into(&mut self, pos: u32) -> bool {
		self.push(pos);
		if self.ld.has_child.is_set(pos) {
			let child = self.ld.child_node_id(pos);
			self.descend_leftmost(child)
		} else {
			self.set_leaf();
			true
		}
	}

	/// Advances past the current position to the next leaf or handoff.
	fn next(&mut self) -> bool {
		self.complete = false;
		self.send_out = None;
		if self.at_prefix_key {
			// The node's labeled leaves follow its prefix key.
			self.at_prefix_key = false;
			let node = self.prefix_node;
			if let Some(pos) = self.ld.next_label_in_node(node, 0) {
				return self.step_into(pos);
			}
		}
		self.advance_frames()
	}

	/// Pops exhausted frames and advances the deepest one that still
	/// has a greater sibling label.
	fn advance_frames(&mut self) -> bool {
		loop {
			let Some(&pos) = self.frames.last() else {
				self.valid = false;
				return false;
			};
			let node = pos / 256;
			let label = pos % 256;
			self.pop();
			if let Some(p) = self.ld.next_label_in_node(node, label + 1) {
				return self.step_into(p);
			}
		}
	}

	/// Descends along `key`. Returns true when every consumed byte
	/// matched exactly (the landing may still differ past the stored
	/// path).
	fn seek(&mut self, key: &[u8]) -> bool {
		self.reset();
		let mut node = 0u32;
		for level in 0..self.ld.height as usize {
			if level >= key.len() {
				if self.ld.is_prefix.num_bits() > node && self.ld.is_prefix.is_set(node) {
					self.at_prefix_key = true;
					self.prefix_node = node;
					self.set_leaf();
					return true;
				}
				self.descend_leftmost(node);
				return false;
			}
			let c = key[level] as u32;
			let pos = node * 256 + c;
			if self.ld.labels.is_set(pos) {
				self.push(pos);
				if !self.ld.has_child.is_set(pos) {
					self.set_leaf();
					return true;
				}
				node = self.ld.child_node_id(pos);
				continue;
			}
			// Smallest greater label in this node, else backtrack.
			if let Some(p) = self.ld.next_label_in_node(node, c + 1) {
				self.step_into(p);
			} else {
				self.advance_frames();
			}
			return false;
		}
		self.valid = true;
		self.complete = false;
		self.send_out = Some(node);
		true
	}

	/// (value position, suffix level) of the current leaf. The suffix
	/// of a leaf labeled at level `l` was cut at `l + 1`; a prefix-key
	/// node at level `l` carries its terminator one level deeper.
	fn leaf(&self) -> (u32, usize) {
		debug_assert!(self.valid && self.complete);
		if self.at_prefix_key {
			(self.ld.prefix_value_pos(self.prefix_node), self.frames.len() + 1)
		} else {
			let pos = *self.frames.last().unwrap();
			(self.ld.value_pos(pos, pos / 256), self.frames.len())
		}
	}
}

/// Cursor over the sparse levels, rooted at the node a dense handoff
/// (or the trie root) points at.
struct SparseIter<'a> {
	ls: &'a LoudsSparse,
	valid: bool,
	key: Vec<u8>,
	frames: Vec<u32>,
}

impl<'a> SparseIter<'a> {
	fn new(ls: &'a LoudsSparse) -> Self {
		Self {
			ls,
			valid: false,
			key: Vec::new(),
			frames: Vec::new(),
		}
	}

	fn reset(&mut self) {
		self.valid = false;
		self.key.clear();
		self.frames.clear();
	}

	fn push(&mut self, pos: u32) {
		self.frames.push(pos);
		self.key.push(self.ls.labels.get(pos));
	}

	fn pop(&mut self) {
		self.frames.pop();
		self.key.pop();
	}

	fn descend_leftmost(&mut self, mut node: u32) -> bool {
		loop {
			let pos = self.ls.first_label_pos(node);
			self.push(pos);
			// A terminator is always first in its node and never has a
			// child, so the leftmost leaf check falls out naturally.
			if !self.ls.has_child.is_set(pos) {
				self.valid = true;
				return true;
			}
			node = self.ls.child_node_id(pos);
		}
	}

	fn step_into(&mut self, pos: u32) -> bool {
		self.push(pos);
		if self.ls.has_child.is_set(pos) {
			let child = self.ls.child_node_id(pos);
			self.descend_leftmost(child)
		} else {
			self.valid = true;
			true
		}
	}

	/// Advances to the next leaf inside the subtree this cursor was
	/// rooted in; invalid once the subtree is exhausted.
	fn next(&mut self) -> bool {
		loop {
			let Some(&pos) = self.frames.last() else {
				self.valid = false;
				return false;
			};
			let npos = pos + 1;
			if npos >= self.ls.labels.len() || self.ls.louds.is_set(npos) {
				// End of this node; resume at the parent.
				self.pop();
				continue;
			}
			self.pop();
			return self.step_into(npos);
		}
	}

	/// Descends along `key` from `node` at `start_level`. Returns true
	/// on an exact-path landing.
	fn seek(&mut self, key: &[u8], mut node: u32, start_level: usize) -> bool {
		self.reset();
		let mut level = start_level;
		loop {
			let pos = self.ls.first_label_pos(node);
			if level >= key.len() {
				self.descend_leftmost(node);
				let leaf = *self.frames.last().unwrap();
				return self.ls.labels.get(leaf) == LABEL_TERMINATOR;
			}
			let size = self.ls.node_size(pos);
			let (p, found) = self.ls.labels.search(key[level], pos, size);
			if found {
				self.push(p);
				if !self.ls.has_child.is_set(p) {
					self.valid = true;
					return true;
				}
				node = self.ls.child_node_id(p);
				level += 1;
				continue;
			}
			let (p2, found2) = self.ls.labels.search_greater_than(key[level], pos, size);
			if found2 {
				self.step_into(p2);
			} else {
				self.next();
			}
			return false;
		}
	}

	/// (value position, suffix level) of the current leaf.
	fn leaf(&self) -> (u32, usize) {
		debug_assert!(self.valid);
		let pos = *self.frames.last().unwrap();
		let leaf_level = self.ls.start_level as usize + self.frames.len() - 1;
		(self.ls.value_pos(pos), leaf_level + 1)
	}
}

/// Iterator over the whole filter: the dense cursor owns the upper
/// levels and hands subtrees over to the sparse cursor.
pub(crate) struct SurfIterator<'a> {
	surf: &'a Surf,
	dense: DenseIter<'a>,
	sparse: SparseIter<'a>,
}

impl<'a> SurfIterator<'a> {
	pub(crate) fn new(surf: &'a Surf) -> Self {
		Self {
			surf,
			dense: DenseIter::new(&surf.dense),
			sparse: SparseIter::new(&surf.sparse),
		}
	}

	pub(crate) fn valid(&self) -> bool {
		if self.surf.dense.height == 0 {
			return self.sparse.valid;
		}
		if !self.dense.valid {
			return false;
		}
		if self.dense.complete {
			return true;
		}
		self.dense.send_out.is_some() && self.sparse.valid
	}

	pub(crate) fn seek_to_first(&mut self) -> bool {
		if self.surf.dense.height == 0 {
			self.sparse.reset();
			if self.surf.sparse.labels.len() == 0 {
				return false;
			}
			return self.sparse.descend_leftmost(0);
		}
		if !self.dense.seek_to_first() {
			return false;
		}
		self.settle();
		self.valid()
	}

	pub(crate) fn next(&mut self) -> bool {
		if self.surf.dense.height == 0 {
			return self.sparse.next();
		}
		if self.dense.send_out.is_some() {
			if self.sparse.next() {
				return true;
			}
			// Sparse subtree exhausted; move the dense cursor on.
			self.dense.next();
			self.settle();
			return self.valid();
		}
		self.dense.next();
		self.settle();
		self.valid()
	}

	/// After the dense cursor moves, enter any sparse subtree it points
	/// at.
	fn settle(&mut self) {
		self.sparse.reset();
		if let Some(node) = self.dense.send_out {
			if self.dense.valid {
				self.sparse.descend_leftmost(node);
			}
		}
	}

	/// Positions on the smallest stored key `>=` the query, up to suffix
	/// truncation; never lands past a key actually present. Returns
	/// validity.
	pub(crate) fn seek(&mut self, key: &[u8]) -> bool {
		let exact = if self.surf.dense.height == 0 {
			self.sparse.reset();
			if self.surf.sparse.labels.len() == 0 {
				return false;
			}
			self.sparse.seek(key, 0, 0)
		} else {
			let exact_dense = self.dense.seek(key);
			match self.dense.send_out {
				Some(node) if self.dense.valid => {
					if exact_dense {
						let exact_sparse =
							self.sparse.seek(key, node, self.surf.dense.height as usize);
						if !self.sparse.valid {
							// Nothing >= key under this subtree.
							self.dense.next();
							self.settle();
							false
						} else {
							exact_sparse
						}
					} else {
						self.settle();
						false
					}
				}
				_ => exact_dense,
			}
		};

		if !self.valid() {
			return false;
		}

		// On an exact-path landing the stored suffix may still prove the
		// leaf's key smaller than the query; only a strict comparison
		// may advance, so truncation never skips the true answer.
		if exact {
			let (region_sparse, vpos, suffix_level) = self.current_leaf();
			let suffixes = if region_sparse {
				&self.surf.sparse.suffixes
			} else {
				&self.surf.dense.suffixes
			};
			if suffixes.compare_real(vpos, key, suffix_level) == Some(std::cmp::Ordering::Less) {
				return self.next();
			}
		}
		true
	}

	/// (in sparse region, value position, suffix level)
	fn current_leaf(&self) -> (bool, u32, usize) {
		if self.surf.dense.height == 0 || self.dense.send_out.is_some() {
			let (vpos, level) = self.sparse.leaf();
			(true, vpos, level)
		} else {
			let (vpos, level) = self.dense.leaf();
			(false, vpos, level)
		}
	}

	/// The stored payload of the current leaf.
	pub(crate) fn value(&self) -> &[u8] {
		debug_assert!(self.valid());
		let (sparse, vpos, _) = self.current_leaf();
		if sparse {
			self.surf.sparse.values.get(vpos)
		} else {
			self.surf.dense.values.get(vpos)
		}
	}

	/// The trie path of the current leaf: a prefix of (or the whole of)
	/// the original key, without the stored suffix.
	pub(crate) fn path(&self) -> Vec<u8> {
		let mut out = self.dense.key.clone();
		out.extend_from_slice(&self.sparse.key);
		if out.last() == Some(&LABEL_TERMINATOR) && self.ends_at_terminator() {
			out.pop();
		}
		out
	}

	fn ends_at_terminator(&self) -> bool {
		if self.sparse.valid {
			let pos = *self.sparse.frames.last().unwrap();
			return self.surf.sparse.labels.get(pos) == LABEL_TERMINATOR;
		}
		false
	}
}
