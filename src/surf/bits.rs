use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

pub(crate) const WORD_SIZE: u32 = 64;
pub(crate) const LABEL_TERMINATOR: u8 = 0xff;

const SELECT_SAMPLE_INTERVAL: u32 = 64;
pub(crate) const RANK_DENSE_BLOCK_SIZE: u32 = 64;
pub(crate) const RANK_SPARSE_BLOCK_SIZE: u32 = 512;

pub(crate) fn align8(n: usize) -> usize {
	(n + 7) & !7
}

pub(crate) fn read_bit(bits: &[u64], pos: u32) -> bool {
	let word = (pos / WORD_SIZE) as usize;
	let off = pos % WORD_SIZE;
	bits[word] & (1u64 << off) != 0
}

pub(crate) fn set_bit(bits: &mut [u64], pos: u32) {
	let word = (pos / WORD_SIZE) as usize;
	let off = pos % WORD_SIZE;
	bits[word] |= 1u64 << off;
}

/// Position of the rank-th set bit inside a single word. `rank` is
/// one-based and must not exceed the popcount of `word`.
pub(crate) fn select64(mut word: u64, mut rank: u32) -> u32 {
	debug_assert!(rank >= 1 && rank <= word.count_ones());
	let mut pos = 0;
	loop {
		let tz = word.trailing_zeros();
		pos += tz;
		rank -= 1;
		if rank == 0 {
			return pos;
		}
		word >>= tz + 1;
		pos += 1;
	}
}

/// Counts set bits in the first `num_bits` positions starting at
/// `word_off` words into `bits`.
pub(crate) fn popcount_block(bits: &[u64], word_off: u32, num_bits: u32) -> u32 {
	if num_bits == 0 {
		return 0;
	}
	let last_word = (num_bits - 1) / WORD_SIZE;
	let mut count = 0;
	for i in 0..last_word {
		count += bits[(word_off + i) as usize].count_ones();
	}
	let tail_bits = num_bits - last_word * WORD_SIZE;
	let last = bits[(word_off + last_word) as usize] << (WORD_SIZE - tail_bits);
	count + last.count_ones()
}

/// Plain bit vector assembled from per-level bit runs. All succinct
/// vectors below embed one.
#[derive(Clone, Debug, Default)]
pub(crate) struct BitVector {
	pub(crate) num_bits: u32,
	pub(crate) bits: Vec<u64>,
}

impl BitVector {
	pub(crate) fn num_words(&self) -> u32 {
		let mut words = self.num_bits / WORD_SIZE;
		if self.num_bits % WORD_SIZE != 0 {
			words += 1;
		}
		words
	}

	pub(crate) fn bits_size(&self) -> usize {
		self.num_words() as usize * 8
	}

	pub(crate) fn init(bits_per_level: &[&[u64]], num_bits_per_level: &[u32]) -> Self {
		let mut v = BitVector::default();
		for &n in num_bits_per_level {
			v.num_bits += n;
		}
		v.bits = vec![0u64; v.num_words() as usize];

		let mut word_id = 0usize;
		let mut bit_shift = 0u32;
		for (level, bits) in bits_per_level.iter().enumerate() {
			let n = num_bits_per_level[level];
			if n == 0 {
				continue;
			}

			let complete_words = (n / WORD_SIZE) as usize;
			for word in bits.iter().take(complete_words) {
				v.bits[word_id] |= word << bit_shift;
				word_id += 1;
				if bit_shift > 0 {
					v.bits[word_id] |= word >> (WORD_SIZE - bit_shift);
				}
			}

			let remain = n % WORD_SIZE;
			if remain > 0 {
				let last_word = bits[complete_words];
				v.bits[word_id] |= last_word << bit_shift;
				if bit_shift + remain <= WORD_SIZE {
					bit_shift = (bit_shift + remain) % WORD_SIZE;
					if bit_shift == 0 {
						word_id += 1;
					}
				} else {
					word_id += 1;
					v.bits[word_id] |= last_word >> (WORD_SIZE - bit_shift);
					bit_shift = bit_shift + remain - WORD_SIZE;
				}
			}
		}
		v
	}

	pub(crate) fn is_set(&self, pos: u32) -> bool {
		read_bit(&self.bits, pos)
	}

	/// Distance from `pos` to the next set bit after it. Returns
	/// `num_bits - pos` when no further bit is set.
	pub(crate) fn distance_to_next_set_bit(&self, pos: u32) -> u32 {
		let mut distance = 1u32;
		let mut word_off = ((pos + 1) / WORD_SIZE) as usize;
		let bits_off = (pos + 1) % WORD_SIZE;

		if word_off >= self.bits.len() {
			return 0;
		}

		let test_bits = self.bits[word_off] >> bits_off;
		if test_bits > 0 {
			return distance + test_bits.trailing_zeros();
		}

		let num_words = self.num_words() as usize;
		if word_off == num_words - 1 {
			return self.num_bits - pos;
		}
		distance += WORD_SIZE - bits_off;

		while word_off < num_words - 1 {
			word_off += 1;
			let test_bits = self.bits[word_off];
			if test_bits > 0 {
				return distance + test_bits.trailing_zeros();
			}
			distance += WORD_SIZE;
		}

		if self.num_bits % WORD_SIZE != 0 {
			distance -= WORD_SIZE - self.num_bits % WORD_SIZE;
		}
		distance
	}

	/// Distance from `pos` back to the previous set bit.
	pub(crate) fn distance_to_prev_set_bit(&self, pos: u32) -> u32 {
		if pos == 0 {
			return 1;
		}
		let mut distance = 1u32;
		let mut word_off = ((pos - 1) / WORD_SIZE) as usize;
		let bits_off = (pos - 1) % WORD_SIZE;

		let test_bits = self.bits[word_off] << (WORD_SIZE - 1 - bits_off);
		if test_bits > 0 {
			return distance + test_bits.leading_zeros();
		}
		distance += bits_off + 1;

		while word_off > 0 {
			word_off -= 1;
			let test_bits = self.bits[word_off];
			if test_bits > 0 {
				return distance + test_bits.leading_zeros();
			}
			distance += WORD_SIZE;
		}
		distance
	}

	fn write_words(&self, buf: &mut Vec<u8>) {
		for w in &self.bits {
			buf.put_u64_le(*w);
		}
	}

	fn read_words(src: &mut &[u8], num_bits: u32) -> Result<Vec<u64>> {
		let words = {
			let mut w = num_bits / WORD_SIZE;
			if num_bits % WORD_SIZE != 0 {
				w += 1;
			}
			w as usize
		};
		if src.len() < words * 8 {
			return Err(Error::Corruption("bit vector truncated".into()));
		}
		let mut bits = Vec::with_capacity(words);
		for _ in 0..words {
			bits.push(src.get_u64_le());
		}
		Ok(bits)
	}
}

/// Rank support: a cumulative popcount per block plus a residual
/// popcount of the block holding `pos`. Dense variant uses 64-bit
/// blocks, sparse 512-bit blocks.
#[derive(Clone, Debug, Default)]
pub(crate) struct RankVector {
	pub(crate) bv: BitVector,
	block_size: u32,
	rank_lut: Vec<u32>,
}

impl RankVector {
	pub(crate) fn init(
		block_size: u32,
		bits_per_level: &[&[u64]],
		num_bits_per_level: &[u32],
	) -> Self {
		let bv = BitVector::init(bits_per_level, num_bits_per_level);
		let words_per_block = block_size / WORD_SIZE;
		let num_blocks = bv.num_bits / block_size + 1;
		let mut rank_lut = vec![0u32; num_blocks as usize];

		let mut total_rank = 0u32;
		for i in 0..num_blocks - 1 {
			rank_lut[i as usize] = total_rank;
			total_rank += popcount_block(&bv.bits, i * words_per_block, block_size);
		}
		rank_lut[(num_blocks - 1) as usize] = total_rank;

		Self {
			bv,
			block_size,
			rank_lut,
		}
	}

	pub(crate) fn num_bits(&self) -> u32 {
		self.bv.num_bits
	}

	pub(crate) fn is_set(&self, pos: u32) -> bool {
		self.bv.is_set(pos)
	}

	/// Number of set bits in `[0, pos]`.
	pub(crate) fn rank(&self, pos: u32) -> u32 {
		let words_per_block = self.block_size / WORD_SIZE;
		let block_off = pos / self.block_size;
		let bits_off = pos % self.block_size;
		self.rank_lut[block_off as usize]
			+ popcount_block(&self.bv.bits, block_off * words_per_block, bits_off + 1)
	}

	/// Number of set bits strictly before `pos`.
	pub(crate) fn rank_excl(&self, pos: u32) -> u32 {
		if pos == 0 {
			0
		} else {
			self.rank(pos - 1)
		}
	}

	pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
		let start = buf.len();
		buf.put_u32_le(self.bv.num_bits);
		buf.put_u32_le(self.block_size);
		self.bv.write_words(buf);
		for r in &self.rank_lut {
			buf.put_u32_le(*r);
		}
		pad_to_8(buf, start);
	}

	pub(crate) fn read_from(src: &mut &[u8]) -> Result<Self> {
		let full = *src;
		if src.len() < 8 {
			return Err(Error::Corruption("rank vector truncated".into()));
		}
		let num_bits = src.get_u32_le();
		let block_size = src.get_u32_le();
		if block_size == 0 || block_size % WORD_SIZE != 0 {
			return Err(Error::Corruption("bad rank block size".into()));
		}
		let bits = BitVector::read_words(src, num_bits)?;
		let lut_len = (num_bits / block_size + 1) as usize;
		if src.len() < lut_len * 4 {
			return Err(Error::Corruption("rank LUT truncated".into()));
		}
		let mut rank_lut = Vec::with_capacity(lut_len);
		for _ in 0..lut_len {
			rank_lut.push(src.get_u32_le());
		}
		skip_padding(src, full);
		Ok(Self {
			bv: BitVector {
				num_bits,
				bits,
			},
			block_size,
			rank_lut,
		})
	}
}

/// Select support: the position of every 64th set bit is sampled, the
/// lookup jumps to the sample and scans forward word by word, finishing
/// with an in-word select.
#[derive(Clone, Debug, Default)]
pub(crate) struct SelectVector {
	pub(crate) bv: BitVector,
	num_ones: u32,
	select_lut: Vec<u32>,
}

impl SelectVector {
	pub(crate) fn init(bits_per_level: &[&[u64]], num_bits_per_level: &[u32]) -> Self {
		let bv = BitVector::init(bits_per_level, num_bits_per_level);
		let mut lut = vec![0u32];
		let mut sampled_ones = SELECT_SAMPLE_INTERVAL as usize;
		let mut ones_upto_word = 0usize;
		for (i, w) in bv.bits.iter().enumerate() {
			let ones = w.count_ones() as usize;
			while sampled_ones <= ones_upto_word + ones {
				let diff = (sampled_ones - ones_upto_word) as u32;
				let target = i as u32 * WORD_SIZE + select64(*w, diff);
				lut.push(target);
				sampled_ones += SELECT_SAMPLE_INTERVAL as usize;
			}
			ones_upto_word += ones;
		}

		Self {
			bv,
			num_ones: ones_upto_word as u32,
			select_lut: lut,
		}
	}

	pub(crate) fn num_ones(&self) -> u32 {
		self.num_ones
	}

	pub(crate) fn is_set(&self, pos: u32) -> bool {
		self.bv.is_set(pos)
	}

	pub(crate) fn distance_to_next_set_bit(&self, pos: u32) -> u32 {
		self.bv.distance_to_next_set_bit(pos)
	}

	/// Position of the rank-th set bit. Position is zero-based, rank is
	/// one-based: for 100101000, select(3) = 5.
	pub(crate) fn select(&self, rank: u32) -> u32 {
		debug_assert!(rank >= 1 && rank <= self.num_ones);
		let lut_idx = rank / SELECT_SAMPLE_INTERVAL;
		let mut rank_left = rank % SELECT_SAMPLE_INTERVAL;
		if lut_idx == 0 {
			rank_left -= 1;
		}

		let pos = self.select_lut[lut_idx as usize];
		if rank_left == 0 {
			return pos;
		}

		let mut word_off = pos / WORD_SIZE;
		let mut bits_off = pos % WORD_SIZE;
		if bits_off == WORD_SIZE - 1 {
			word_off += 1;
			bits_off = 0;
		} else {
			bits_off += 1;
		}

		let mut w = self.bv.bits[word_off as usize] >> bits_off << bits_off;
		let mut ones = w.count_ones();
		while ones < rank_left {
			word_off += 1;
			w = self.bv.bits[word_off as usize];
			rank_left -= ones;
			ones = w.count_ones();
		}

		word_off * WORD_SIZE + select64(w, rank_left)
	}

	pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
		let start = buf.len();
		buf.put_u32_le(self.bv.num_bits);
		buf.put_u32_le(self.num_ones);
		self.bv.write_words(buf);
		for s in &self.select_lut {
			buf.put_u32_le(*s);
		}
		pad_to_8(buf, start);
	}

	pub(crate) fn read_from(src: &mut &[u8]) -> Result<Self> {
		let full = *src;
		if src.len() < 8 {
			return Err(Error::Corruption("select vector truncated".into()));
		}
		let num_bits = src.get_u32_le();
		let num_ones = src.get_u32_le();
		let bits = BitVector::read_words(src, num_bits)?;
		let lut_len = (num_ones / SELECT_SAMPLE_INTERVAL + 1) as usize;
		if src.len() < lut_len * 4 {
			return Err(Error::Corruption("select LUT truncated".into()));
		}
		let mut select_lut = Vec::with_capacity(lut_len);
		for _ in 0..lut_len {
			select_lut.push(src.get_u32_le());
		}
		skip_padding(src, full);
		Ok(Self {
			bv: BitVector {
				num_bits,
				bits,
			},
			num_ones,
			select_lut,
		})
	}
}

/// Outgoing edge labels of the sparse levels, one byte per edge.
#[derive(Clone, Debug, Default)]
pub(crate) struct LabelVector {
	labels: Vec<u8>,
}

impl LabelVector {
	pub(crate) fn init(labels_per_level: &[&[u8]]) -> Self {
		let mut labels = Vec::new();
		for level in labels_per_level {
			labels.extend_from_slice(level);
		}
		Self {
			labels,
		}
	}

	pub(crate) fn len(&self) -> u32 {
		self.labels.len() as u32
	}

	pub(crate) fn get(&self, pos: u32) -> u8 {
		self.labels[pos as usize]
	}

	/// Finds `k` within a node's label window. The terminator, when
	/// present, occupies the first slot and is skipped.
	pub(crate) fn search(&self, k: u8, mut start: u32, mut size: u32) -> (u32, bool) {
		if size > 1 && self.labels[start as usize] == LABEL_TERMINATOR {
			start += 1;
			size -= 1;
		}

		let end = (start + size).min(self.labels.len() as u32);
		match self.labels[start as usize..end as usize].iter().position(|&l| l == k) {
			Some(i) => (start + i as u32, true),
			None => (start, false),
		}
	}

	/// First label strictly greater than `label` in the window.
	pub(crate) fn search_greater_than(&self, label: u8, mut pos: u32, mut size: u32) -> (u32, bool) {
		if size > 1 && self.labels[pos as usize] == LABEL_TERMINATOR {
			pos += 1;
			size -= 1;
		}

		let window = &self.labels[pos as usize..(pos + size) as usize];
		let result = window.partition_point(|&l| l <= label) as u32;
		if result == size {
			(pos + result - 1, false)
		} else {
			(pos + result, true)
		}
	}

	pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
		let start = buf.len();
		buf.put_u32_le(self.labels.len() as u32);
		buf.extend_from_slice(&self.labels);
		pad_to_8(buf, start);
	}

	pub(crate) fn read_from(src: &mut &[u8]) -> Result<Self> {
		let full = *src;
		if src.len() < 4 {
			return Err(Error::Corruption("label vector truncated".into()));
		}
		let len = src.get_u32_le() as usize;
		if src.len() < len {
			return Err(Error::Corruption("label vector truncated".into()));
		}
		let labels = src[..len].to_vec();
		src.advance(len);
		skip_padding(src, full);
		Ok(Self {
			labels,
		})
	}
}

/// Fixed-width payload per leaf, in leaf order.
#[derive(Clone, Debug, Default)]
pub(crate) struct ValueVector {
	bytes: Vec<u8>,
	value_size: u32,
}

impl ValueVector {
	pub(crate) fn init(values_per_level: &[&[u8]], value_size: u32) -> Self {
		let mut bytes = Vec::new();
		for level in values_per_level {
			bytes.extend_from_slice(level);
		}
		Self {
			bytes,
			value_size,
		}
	}

	pub(crate) fn get(&self, pos: u32) -> &[u8] {
		let off = (pos * self.value_size) as usize;
		&self.bytes[off..off + self.value_size as usize]
	}

	pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
		let start = buf.len();
		buf.put_u32_le(self.bytes.len() as u32);
		buf.put_u32_le(self.value_size);
		buf.extend_from_slice(&self.bytes);
		pad_to_8(buf, start);
	}

	pub(crate) fn read_from(src: &mut &[u8]) -> Result<Self> {
		let full = *src;
		if src.len() < 8 {
			return Err(Error::Corruption("value vector truncated".into()));
		}
		let len = src.get_u32_le() as usize;
		let value_size = src.get_u32_le();
		if src.len() < len {
			return Err(Error::Corruption("value vector truncated".into()));
		}
		let bytes = src[..len].to_vec();
		src.advance(len);
		skip_padding(src, full);
		Ok(Self {
			bytes,
			value_size,
		})
	}
}

/// Per-leaf suffixes cutting down false positives: a truncated hash of
/// the whole key, a truncated tail of the key past the trie path, or
/// both. Records are `hash_len + real_len` bytes, in leaf order.
#[derive(Clone, Debug, Default)]
pub(crate) struct SuffixVector {
	hash_len: u32,
	real_len: u32,
	bytes: Vec<u8>,
}

impl SuffixVector {
	pub(crate) fn init(hash_len: u32, real_len: u32, suffixes_per_level: &[&[u8]]) -> Self {
		let mut bytes = Vec::new();
		for level in suffixes_per_level {
			bytes.extend_from_slice(level);
		}
		Self {
			hash_len,
			real_len,
			bytes,
		}
	}

	pub(crate) fn record_size(hash_len: u32, real_len: u32) -> usize {
		(hash_len + real_len) as usize
	}

	pub(crate) fn make_record(hash_len: u32, real_len: u32, key: &[u8], level: usize, out: &mut Vec<u8>) {
		if hash_len > 0 {
			let h = farmhash::fingerprint64(key).to_le_bytes();
			out.extend_from_slice(&h[..hash_len as usize]);
		}
		if real_len > 0 {
			let tail = if level <= key.len() {
				&key[level..]
			} else {
				&[]
			};
			let n = (real_len as usize).min(tail.len());
			out.extend_from_slice(&tail[..n]);
			out.resize(out.len() + real_len as usize - n, 0);
		}
	}

	fn record(&self, pos: u32) -> &[u8] {
		let size = (self.hash_len + self.real_len) as usize;
		let off = pos as usize * size;
		&self.bytes[off..off + size]
	}

	/// True when the stored suffix cannot rule the key out. With hash
	/// suffixes a mismatch is a definite absence; a match only means
	/// "probably present".
	pub(crate) fn check_equality(&self, pos: u32, key: &[u8], level: usize) -> bool {
		if self.hash_len == 0 && self.real_len == 0 {
			return true;
		}
		let rec = self.record(pos);
		if self.hash_len > 0 {
			let h = farmhash::fingerprint64(key).to_le_bytes();
			if rec[..self.hash_len as usize] != h[..self.hash_len as usize] {
				return false;
			}
		}
		if self.real_len > 0 {
			let mut expected = Vec::with_capacity(self.real_len as usize);
			Self::make_record(0, self.real_len, key, level, &mut expected);
			if rec[self.hash_len as usize..] != expected[..] {
				return false;
			}
		}
		true
	}

	/// Orders the stored real suffix against the query tail. `None` when
	/// only hash suffixes are stored, or the comparison is ambiguous
	/// because of truncation.
	pub(crate) fn compare_real(
		&self,
		pos: u32,
		key: &[u8],
		level: usize,
	) -> Option<std::cmp::Ordering> {
		if self.real_len == 0 {
			return None;
		}
		let stored = &self.record(pos)[self.hash_len as usize..];
		let mut expected = Vec::with_capacity(self.real_len as usize);
		Self::make_record(0, self.real_len, key, level, &mut expected);
		match stored.cmp(&expected[..]) {
			std::cmp::Ordering::Equal => None,
			ord => Some(ord),
		}
	}

	pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
		let start = buf.len();
		buf.put_u32_le(self.hash_len);
		buf.put_u32_le(self.real_len);
		buf.put_u32_le(self.bytes.len() as u32);
		buf.extend_from_slice(&self.bytes);
		pad_to_8(buf, start);
	}

	pub(crate) fn read_from(src: &mut &[u8]) -> Result<Self> {
		let full = *src;
		if src.len() < 12 {
			return Err(Error::Corruption("suffix vector truncated".into()));
		}
		let hash_len = src.get_u32_le();
		let real_len = src.get_u32_le();
		let len = src.get_u32_le() as usize;
		if src.len() < len {
			return Err(Error::Corruption("suffix vector truncated".into()));
		}
		let bytes = src[..len].to_vec();
		src.advance(len);
		skip_padding(src, full);
		Ok(Self {
			hash_len,
			real_len,
			bytes,
		})
	}
}

fn pad_to_8(buf: &mut Vec<u8>, start: usize) {
	let written = buf.len() - start;
	buf.resize(start + align8(written), 0);
}

fn skip_padding(src: &mut &[u8], full: &[u8]) {
	let consumed = full.len() - src.len();
	let skip = align8(consumed) - consumed;
	src.advance(skip.min(src.len()));
}
