use std::io::Write;
use std::sync::Arc;

use bytes::BufMut;

use crate::compression::{compress_block, CompressionSelector, CompressionType};
use crate::error::{Error, Result};
use crate::key::{Key, KeyRef, ValueStruct};
use crate::sstable::table::{mask, Footer, Region, HASH_SLOT_EMPTY, HASH_SLOT_COLLISION, HASH_SLOT_UNIQUE};
use crate::surf::SurfBuilder;
use crate::Options;

/// One entry buffered for the current block. Entries are serialized at
/// block close, once the block-wide shared prefix length is known.
struct PendingEntry {
	user_key: Vec<u8>,
	version: u64,
	has_old: bool,
	old_offset: u32,
	value: Vec<u8>,
}

struct HashEntry {
	hash: u64,
	block_idx: u32,
	entry_idx: u32,
}

/// Streams an immutable sorted table out to `writer`: data blocks, the
/// old-version region, the block index, the optional hash index and
/// range filter, and the footer. Keys must arrive in (user key asc,
/// version desc) order; repeated user keys fold into the newest entry's
/// old-version sidecar.
pub struct TableBuilder<W: Write> {
	writer: W,
	opts: Arc<Options>,
	compression: CompressionType,
	offset: usize,

	pending: Vec<PendingEntry>,
	cur_block_size: usize,

	old_region: Vec<u8>,
	old_pending: Vec<(u64, Vec<u8>)>,

	block_end_offsets: Vec<u32>,
	base_keys: Vec<u8>,
	base_key_ends: Vec<u32>,

	hash_entries: Vec<HashEntry>,
	surf_enabled: bool,
	surf_keys: Vec<Vec<u8>>,
	surf_values: Vec<Vec<u8>>,

	last_user_key: Vec<u8>,
	last_version: u64,
	smallest: Option<Key>,
	biggest: Option<Key>,
	num_entries: u64,

	per_entry_versions: bool,
}

impl<W: Write> TableBuilder<W> {
	pub fn new(writer: W, opts: Arc<Options>, level: usize) -> Self {
		let compression =
			CompressionSelector::new(opts.compression_per_level.clone()).select(level);
		let surf_enabled =
			opts.surf.as_ref().is_some_and(|s| level >= s.start_level);
		Self::with_mode(writer, opts, compression, surf_enabled, true)
	}

	/// Builder for externally ingested tables: entries carry no version
	/// of their own and inherit the table's global timestamp, assigned
	/// after the fact with `Table::set_global_ts`.
	pub fn new_external(writer: W, opts: Arc<Options>, level: usize) -> Self {
		let compression =
			CompressionSelector::new(opts.compression_per_level.clone()).select(level);
		let surf_enabled =
			opts.surf.as_ref().is_some_and(|s| level >= s.start_level);
		Self::with_mode(writer, opts, compression, surf_enabled, false)
	}

	fn with_mode(
		writer: W,
		opts: Arc<Options>,
		compression: CompressionType,
		surf_enabled: bool,
		per_entry_versions: bool,
	) -> Self {
		Self {
			writer,
			opts,
			compression,
			offset: 0,
			pending: Vec::new(),
			cur_block_size: 0,
			old_region: Vec::new(),
			old_pending: Vec::new(),
			block_end_offsets: Vec::new(),
			base_keys: Vec::new(),
			base_key_ends: Vec::new(),
			hash_entries: Vec::new(),
			surf_enabled,
			surf_keys: Vec::new(),
			surf_values: Vec::new(),
			last_user_key: Vec::new(),
			last_version: 0,
			smallest: None,
			biggest: None,
			num_entries: 0,
			per_entry_versions,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.num_entries == 0
	}

	pub fn add(&mut self, key: KeyRef<'_>, value: &ValueStruct) -> Result<()> {
		if key.user_key.is_empty() {
			return Err(Error::EmptyKey);
		}
		debug_assert!(key.user_key.len() <= u16::MAX as usize);

		let same_user_key = self.last_user_key == key.user_key;
		if !self.last_user_key.is_empty() {
			let in_order = match self.last_user_key.as_slice().cmp(key.user_key) {
				std::cmp::Ordering::Less => true,
				std::cmp::Ordering::Equal => key.version < self.last_version,
				std::cmp::Ordering::Greater => false,
			};
			if !in_order {
				return Err(Error::KeysOutOfOrder);
			}
		}

		let mut vs = value.clone();
		vs.version = key.version;
		let encoded = vs.encode();

		self.num_entries += 1;
		if self.smallest.is_none() {
			self.smallest = Some(key.to_key());
		}
		self.biggest = Some(key.to_key());
		self.last_version = key.version;

		if same_user_key {
			// An older version of the entry we just wrote inline.
			self.old_pending.push((key.version, encoded));
			return Ok(());
		}

		self.flush_old_pending();

		let version_len = if self.per_entry_versions {
			8
		} else {
			0
		};
		let entry_size = 2 + key.user_key.len() + 1 + version_len + encoded.len() + 4;
		if !self.pending.is_empty() && self.cur_block_size + entry_size > self.opts.block_size {
			self.finish_block()?;
		}

		let block_idx = self.block_end_offsets.len() as u32;
		let entry_idx = self.pending.len() as u32;
		self.pending.push(PendingEntry {
			user_key: key.user_key.to_vec(),
			version: key.version,
			has_old: false,
			old_offset: 0,
			value: encoded,
		});
		self.cur_block_size += entry_size;

		if self.opts.hash_util_ratio > 0.0 {
			self.hash_entries.push(HashEntry {
				hash: farmhash::fingerprint64(key.user_key),
				block_idx,
				entry_idx,
			});
		}
		if self.surf_enabled {
			self.surf_keys.push(key.user_key.to_vec());
			let mut pos = Vec::with_capacity(8);
			pos.put_u32_le(block_idx);
			pos.put_u32_le(entry_idx);
			self.surf_values.push(pos);
		}

		self.last_user_key.clear();
		self.last_user_key.extend_from_slice(key.user_key);
		Ok(())
	}

	/// Serializes the buffered old versions of the previous key into
	/// the old-block region and points its inline entry at them.
	fn flush_old_pending(&mut self) {
		if self.old_pending.is_empty() {
			return;
		}
		let old_offset = self.old_region.len() as u32;
		let olds = std::mem::take(&mut self.old_pending);

		self.old_region.put_u32_le(olds.len() as u32);
		let mut end = 0u32;
		for (_, val) in &olds {
			end += 8 + val.len() as u32;
			self.old_region.put_u32_le(end);
		}
		for (version, val) in &olds {
			self.old_region.put_u64_le(*version);
			self.old_region.extend_from_slice(val);
		}

		let entry = self.pending.last_mut().expect("old versions precede their inline entry");
		entry.has_old = true;
		entry.old_offset = old_offset;
		self.cur_block_size += 4;
	}

	fn finish_block(&mut self) -> Result<()> {
		debug_assert!(!self.pending.is_empty());
		let base_key = self.pending[0].user_key.clone();
		// Keys are sorted, so the last key carries the smallest shared
		// prefix; cutting every diff there keeps one length per block.
		let base_len = shared_prefix_len(&base_key, &self.pending.last().unwrap().user_key);

		let mut buf = Vec::with_capacity(self.cur_block_size + 16);
		let mut end_offsets = Vec::with_capacity(self.pending.len());
		for e in &self.pending {
			let diff = &e.user_key[base_len..];
			buf.put_u16_le(diff.len() as u16);
			buf.extend_from_slice(diff);
			buf.put_u8(e.has_old as u8);
			if e.has_old {
				buf.put_u32_le(e.old_offset);
			}
			if self.per_entry_versions {
				buf.put_u64_le(e.version);
			}
			buf.extend_from_slice(&e.value);
			end_offsets.push(buf.len() as u32);
		}
		for end in &end_offsets {
			buf.put_u32_le(*end);
		}
		buf.put_u32_le(end_offsets.len() as u32);
		buf.put_u16_le(base_len as u16);

		let compressed = compress_block(buf, self.compression)?;
		let cksum = mask(crc32fast::hash(&compressed));
		self.writer.write_all(&compressed)?;
		self.writer.write_all(&cksum.to_le_bytes())?;
		self.offset += compressed.len() + 4;

		self.block_end_offsets.push(self.offset as u32);
		self.base_keys.extend_from_slice(&base_key);
		self.base_key_ends.push(self.base_keys.len() as u32);

		self.pending.clear();
		self.cur_block_size = 0;
		Ok(())
	}

	fn write_region(&mut self, mut payload: Vec<u8>) -> Result<Region> {
		let cksum = mask(crc32fast::hash(&payload));
		payload.extend_from_slice(&cksum.to_le_bytes());
		let region = Region {
			offset: self.offset as u64,
			len: payload.len() as u64,
		};
		self.writer.write_all(&payload)?;
		self.offset += payload.len();
		self.pad_to_8()?;
		Ok(region)
	}

	fn pad_to_8(&mut self) -> Result<()> {
		let rem = self.offset % 8;
		if rem != 0 {
			let zeros = [0u8; 8];
			self.writer.write_all(&zeros[..8 - rem])?;
			self.offset += 8 - rem;
		}
		Ok(())
	}

	fn build_index(&self) -> Vec<u8> {
		let mut buf = Vec::new();
		buf.put_u32_le(self.block_end_offsets.len() as u32);
		for off in &self.block_end_offsets {
			buf.put_u32_le(*off);
		}
		for end in &self.base_key_ends {
			buf.put_u32_le(*end);
		}
		buf.extend_from_slice(&self.base_keys);

		let smallest = self.smallest.as_ref().map(|k| k.encode()).unwrap_or_default();
		let biggest = self.biggest.as_ref().map(|k| k.encode()).unwrap_or_default();
		buf.put_u16_le(smallest.len() as u16);
		buf.extend_from_slice(&smallest);
		buf.put_u16_le(biggest.len() as u16);
		buf.extend_from_slice(&biggest);
		buf
	}

	fn build_hash_index(&self) -> Vec<u8> {
		let num_slots =
			((self.hash_entries.len() as f32 / self.opts.hash_util_ratio) as u32).max(1);
		let mut slots = vec![0u8; num_slots as usize * 6];
		for e in &self.hash_entries {
			let idx = (e.hash % num_slots as u64) as usize * 6;
			let slot = &mut slots[idx..idx + 6];
			match slot[5] {
				HASH_SLOT_EMPTY => {
					// The one-byte in-block offset tops out at 255;
					// deeper entries fall back to the seek path.
					if e.entry_idx > u8::MAX as u32 {
						slot[5] = HASH_SLOT_COLLISION;
					} else {
						slot[..4].copy_from_slice(&e.block_idx.to_le_bytes());
						slot[4] = e.entry_idx as u8;
						slot[5] = HASH_SLOT_UNIQUE;
					}
				}
				HASH_SLOT_UNIQUE => slot[5] = HASH_SLOT_COLLISION,
				_ => {}
			}
		}

		let mut buf = Vec::with_capacity(4 + slots.len());
		buf.put_u32_le(num_slots);
		buf.extend_from_slice(&slots);
		buf
	}

	/// Writes every outstanding region and the footer; returns the
	/// final file size.
	pub fn finish(mut self) -> Result<usize> {
		self.flush_old_pending();
		if !self.pending.is_empty() {
			self.finish_block()?;
		}
		self.pad_to_8()?;

		let old = if self.old_region.is_empty() {
			Region::default()
		} else {
			let old_region = std::mem::take(&mut self.old_region);
				self.write_region(old_region)?
		};

		let index = self.write_region(self.build_index())?;

		let hash = if self.opts.hash_util_ratio > 0.0 && !self.hash_entries.is_empty() {
			self.write_region(self.build_hash_index())?
		} else {
			Region::default()
		};

		let surf = if self.surf_enabled && !self.surf_keys.is_empty() {
			let surf_opts = self.opts.surf.clone().unwrap_or_default();
			let keys = std::mem::take(&mut self.surf_keys);
			let values = std::mem::take(&mut self.surf_values);
			let built = SurfBuilder::new(&surf_opts, 8).build(&keys, &values);
			let mut payload = Vec::new();
			built.write_to(&mut payload);
			self.write_region(payload)?
		} else {
			Region::default()
		};

		let footer = Footer {
			index,
			hash,
			surf,
			old,
			global_ts: 0,
			hash_util_ratio: self.opts.hash_util_ratio,
			compression: self.compression,
			per_entry_versions: self.per_entry_versions,
		};
		let buf = footer.encode();
		self.writer.write_all(&buf)?;
		self.offset += buf.len();
		self.writer.flush()?;
		Ok(self.offset)
	}
}

pub(crate) fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
	a.iter().zip(b.iter()).take_while(|&(x, y)| x == y).count()
}
