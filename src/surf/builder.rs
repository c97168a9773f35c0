use super::bits::{
	read_bit,
	set_bit,
	LabelVector,
	RankVector,
	SelectVector,
	SuffixVector,
	ValueVector,
	LABEL_TERMINATOR,
	RANK_DENSE_BLOCK_SIZE,
	RANK_SPARSE_BLOCK_SIZE,
	WORD_SIZE,
};
use super::{LoudsDense, LoudsSparse, Surf};

/// Tuning knobs for the range filter.
#[derive(Debug, Clone)]
pub struct SurfOptions {
	/// Tables at levels below this skip the filter entirely.
	pub start_level: usize,
	/// Bytes of the key fingerprint stored per leaf. Zero disables.
	pub hash_suffix_len: u32,
	/// Bytes of the key tail stored per leaf. Zero disables.
	pub real_suffix_len: u32,
	/// A trie level is encoded dense while dense size times this ratio
	/// stays under the sparse size.
	pub sparse_dense_ratio: usize,
}

impl Default for SurfOptions {
	fn default() -> Self {
		Self {
			start_level: 0,
			hash_suffix_len: 0,
			real_suffix_len: 8,
			sparse_dense_ratio: 16,
		}
	}
}

/// Builds the trie level by level from sorted distinct user keys. Each
/// key is inserted along the existing path until one byte distinguishes
/// it from its successor; the rest of the key becomes its suffix.
pub(crate) struct SurfBuilder {
	hash_suffix_len: u32,
	real_suffix_len: u32,
	sparse_dense_ratio: usize,
	value_size: u32,

	labels: Vec<Vec<u8>>,
	has_child: Vec<Vec<u64>>,
	louds: Vec<Vec<u64>>,
	suffixes: Vec<Vec<u8>>,
	values: Vec<Vec<u8>>,
	node_counts: Vec<u32>,
	is_last_item_terminator: Vec<bool>,
}

impl SurfBuilder {
	pub(crate) fn new(opts: &SurfOptions, value_size: u32) -> Self {
		Self {
			hash_suffix_len: opts.hash_suffix_len,
			real_suffix_len: opts.real_suffix_len,
			sparse_dense_ratio: opts.sparse_dense_ratio,
			value_size,
			labels: Vec::new(),
			has_child: Vec::new(),
			louds: Vec::new(),
			suffixes: Vec::new(),
			values: Vec::new(),
			node_counts: Vec::new(),
			is_last_item_terminator: Vec::new(),
		}
	}

	/// Keys must be sorted, distinct and non-empty; `values[i]` is the
	/// fixed-width payload stored at the leaf of `keys[i]`.
	pub(crate) fn build(mut self, keys: &[Vec<u8>], values: &[Vec<u8>]) -> Surf {
		debug_assert_eq!(keys.len(), values.len());
		for i in 0..keys.len() {
			let level = self.skip_common_prefix(&keys[i]);
			let next = keys.get(i + 1).map(|k| k.as_slice());
			let level = self.insert_key_bytes_until_unique(&keys[i], next, level);
			self.insert_suffix(&keys[i], level);
			self.insert_value(&values[i], level);
		}
		self.finish()
	}

	fn height(&self) -> usize {
		self.labels.len()
	}

	fn num_items(&self, level: usize) -> u32 {
		self.labels[level].len() as u32
	}

	fn is_level_empty(&self, level: usize) -> bool {
		level >= self.height() || self.labels[level].is_empty()
	}

	fn add_level(&mut self) {
		self.labels.push(Vec::new());
		self.has_child.push(Vec::new());
		self.louds.push(Vec::new());
		self.suffixes.push(Vec::new());
		self.values.push(Vec::new());
		self.node_counts.push(0);
		self.is_last_item_terminator.push(false);
	}

	fn is_char_common_prefix(&self, c: u8, level: usize) -> bool {
		level < self.height()
			&& !self.is_last_item_terminator[level]
			&& self.labels[level].last() == Some(&c)
	}

	/// Walks down the levels shared with the previously inserted key,
	/// marking those edges as internal.
	fn skip_common_prefix(&mut self, key: &[u8]) -> usize {
		let mut level = 0;
		while level < key.len() && self.is_char_common_prefix(key[level], level) {
			let last = self.num_items(level) - 1;
			set_bit(&mut self.has_child[level], last);
			level += 1;
		}
		level
	}

	fn insert_key_byte(&mut self, c: u8, level: usize, is_start_of_node: bool, is_term: bool) {
		while self.height() <= level {
			self.add_level();
		}

		// The parent of this item gains a child.
		if level > 0 {
			let last = self.num_items(level - 1) - 1;
			set_bit(&mut self.has_child[level - 1], last);
		}

		if self.num_items(level) % WORD_SIZE == 0 {
			self.has_child[level].push(0);
			self.louds[level].push(0);
		}
		self.labels[level].push(c);
		if is_start_of_node {
			let pos = self.num_items(level) - 1;
			set_bit(&mut self.louds[level], pos);
			self.node_counts[level] += 1;
		}
		self.is_last_item_terminator[level] = is_term;
	}

	/// Inserts key bytes from `start_level` until the path distinguishes
	/// `key` from `next`. A key that is a proper prefix of its successor
	/// gets the reserved terminator label instead of a real byte.
	fn insert_key_bytes_until_unique(
		&mut self,
		key: &[u8],
		next: Option<&[u8]>,
		start_level: usize,
	) -> usize {
		let mut level = start_level;
		let is_start_of_node = self.is_level_empty(level);

		debug_assert!(level < key.len());
		self.insert_key_byte(key[level], level, is_start_of_node, false);
		level += 1;

		let next = match next {
			Some(n) if level <= n.len() && key[..level] == n[..level] => n,
			_ => return level,
		};

		// Shared bytes below this point each start a fresh node.
		while level < key.len() && level < next.len() && key[level] == next[level] {
			self.insert_key_byte(key[level], level, true, false);
			level += 1;
		}

		if level < key.len() {
			self.insert_key_byte(key[level], level, true, false);
		} else {
			self.insert_key_byte(LABEL_TERMINATOR, level, true, true);
		}
		level + 1
	}

	fn insert_suffix(&mut self, key: &[u8], level: usize) {
		let leaf_level = level - 1;
		let (hash_len, real_len) = (self.hash_suffix_len, self.real_suffix_len);
		let mut rec = Vec::with_capacity(SuffixVector::record_size(hash_len, real_len));
		SuffixVector::make_record(hash_len, real_len, key, level, &mut rec);
		self.suffixes[leaf_level].extend_from_slice(&rec);
	}

	fn insert_value(&mut self, value: &[u8], level: usize) {
		debug_assert_eq!(value.len(), self.value_size as usize);
		self.values[level - 1].extend_from_slice(value);
	}

	fn is_start_of_node(&self, level: usize, pos: u32) -> bool {
		read_bit(&self.louds[level], pos)
	}

	fn is_terminator(&self, level: usize, pos: u32) -> bool {
		self.labels[level][pos as usize] == LABEL_TERMINATOR
			&& !read_bit(&self.has_child[level], pos)
	}

	fn dense_mem(&self, cutoff: usize) -> usize {
		let mut mem = 0;
		for level in 0..cutoff {
			// Two 256-bit bitmaps plus one prefix bit per node.
			mem += self.node_counts[level] as usize * (2 * 256 / 8) + self.node_counts[level] as usize / 8;
		}
		mem
	}

	fn sparse_mem(&self, cutoff: usize) -> usize {
		let mut mem = 0;
		for level in cutoff..self.height() {
			let items = self.labels[level].len();
			// One label byte plus two indicator bits per item.
			mem += items + items / 4;
		}
		mem
	}

	fn determine_cutoff_level(&self) -> usize {
		let mut cutoff = 0;
		while cutoff < self.height()
			&& self.dense_mem(cutoff).saturating_mul(self.sparse_dense_ratio)
				< self.sparse_mem(cutoff)
		{
			cutoff += 1;
		}
		cutoff
	}

	fn finish(self) -> Surf {
		let height = self.height();
		let cutoff = self.determine_cutoff_level();

		let node_count_dense: u32 = self.node_counts[..cutoff].iter().sum();
		let mut child_count_dense = 0u32;
		for level in 0..cutoff {
			child_count_dense += popcount_prefix(&self.has_child[level], self.num_items(level));
		}

		// Dense levels re-encode each node as full 256-bit bitmaps.
		let mut dense_labels: Vec<Vec<u64>> = Vec::with_capacity(cutoff);
		let mut dense_has_child: Vec<Vec<u64>> = Vec::with_capacity(cutoff);
		let mut dense_is_prefix: Vec<Vec<u64>> = Vec::with_capacity(cutoff);
		for level in 0..cutoff {
			let nodes = self.node_counts[level] as usize;
			let mut labels = vec![0u64; nodes * 4];
			let mut has_child = vec![0u64; nodes * 4];
			let mut is_prefix = vec![0u64; nodes.div_ceil(WORD_SIZE as usize).max(1)];

			let mut node = 0u32;
			for pos in 0..self.num_items(level) {
				if pos > 0 && self.is_start_of_node(level, pos) {
					node += 1;
				}
				if self.is_start_of_node(level, pos) || pos == 0 {
					if self.is_terminator(level, pos) {
						set_bit(&mut is_prefix, node);
						continue;
					}
				}
				let label = self.labels[level][pos as usize];
				let bitmap_pos = node * 256 + label as u32;
				set_bit(&mut labels, bitmap_pos);
				if read_bit(&self.has_child[level], pos) {
					set_bit(&mut has_child, bitmap_pos);
				}
			}

			dense_labels.push(labels);
			dense_has_child.push(has_child);
			dense_is_prefix.push(is_prefix);
		}

		let dense_label_bits: Vec<u32> =
			(0..cutoff).map(|l| self.node_counts[l] * 256).collect();
		let dense_prefix_bits: Vec<u32> = (0..cutoff).map(|l| self.node_counts[l]).collect();

		let dense = LoudsDense {
			height: cutoff as u32,
			labels: RankVector::init(
				RANK_DENSE_BLOCK_SIZE,
				&as_refs(&dense_labels),
				&dense_label_bits,
			),
			has_child: RankVector::init(
				RANK_DENSE_BLOCK_SIZE,
				&as_refs(&dense_has_child),
				&dense_label_bits,
			),
			is_prefix: RankVector::init(
				RANK_DENSE_BLOCK_SIZE,
				&as_refs(&dense_is_prefix),
				&dense_prefix_bits,
			),
			suffixes: SuffixVector::init(
				self.hash_suffix_len,
				self.real_suffix_len,
				&as_byte_refs(&self.suffixes[..cutoff]),
			),
			values: ValueVector::init(&as_byte_refs(&self.values[..cutoff]), self.value_size),
		};

		let sparse_label_bits: Vec<u32> =
			(cutoff..height).map(|l| self.num_items(l)).collect();
		let sparse = LoudsSparse {
			start_level: cutoff as u32,
			height: height as u32,
			node_count_dense,
			child_count_dense,
			labels: LabelVector::init(&as_byte_refs(&self.labels[cutoff..])),
			has_child: RankVector::init(
				RANK_SPARSE_BLOCK_SIZE,
				&as_refs(&self.has_child[cutoff..]),
				&sparse_label_bits,
			),
			louds: SelectVector::init(&as_refs(&self.louds[cutoff..]), &sparse_label_bits),
			suffixes: SuffixVector::init(
				self.hash_suffix_len,
				self.real_suffix_len,
				&as_byte_refs(&self.suffixes[cutoff..]),
			),
			values: ValueVector::init(&as_byte_refs(&self.values[cutoff..]), self.value_size),
		};

		Surf {
			height: height as u32,
			sparse_start_level: cutoff as u32,
			value_size: self.value_size,
			dense,
			sparse,
		}
	}
}

fn popcount_prefix(bits: &[u64], num_bits: u32) -> u32 {
	if num_bits == 0 {
		return 0;
	}
	super::bits::popcount_block(bits, 0, num_bits)
}

fn as_refs(v: &[Vec<u64>]) -> Vec<&[u64]> {
	v.iter().map(|x| x.as_slice()).collect()
}

fn as_byte_refs(v: &[Vec<u8>]) -> Vec<&[u8]> {
	v.iter().map(|x| x.as_slice()).collect()
}
