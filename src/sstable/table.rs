use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::{Buf, Bytes};

use crate::compression::{decompress_block, CompressionType};
use crate::error::{Error, Result};
use crate::key::{Key, KeyRef, ValueStruct};
use crate::sstable::block::{read_u32_at, Block, BlockCursor};
use crate::surf::Surf;
use crate::vfs::{self, File};
use crate::Options;

pub(crate) const FOOTER_LEN: usize = 96;
const TABLE_MAGIC: [u8; 8] = [0x73, 0x9a, 0x41, 0xc8, 0x6f, 0x35, 0x52, 0x01];

pub(crate) const HASH_SLOT_EMPTY: u8 = 0;
pub(crate) const HASH_SLOT_UNIQUE: u8 = 1;
pub(crate) const HASH_SLOT_COLLISION: u8 = 2;
const HASH_SLOT_LEN: usize = 6;
const HASH_SLOT_OFFSET_WIDTH: u8 = 1;

const MASK_DELTA: u32 = 0xa282_ead8;

pub(crate) fn mask(crc: u32) -> u32 {
	crc.rotate_right(15).wrapping_add(MASK_DELTA)
}

/// Return the crc whose masked representation is `masked`.
pub(crate) fn unmask(masked: u32) -> u32 {
	masked.wrapping_sub(MASK_DELTA).rotate_left(15)
}

/// Byte span of one region inside the file. A zero length means the
/// region is absent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Region {
	pub(crate) offset: u64,
	pub(crate) len: u64,
}

/// Fixed-size trailer at the end of every table file, locating each
/// region and carrying the table-wide knobs.
#[derive(Clone, Debug)]
pub(crate) struct Footer {
	pub(crate) index: Region,
	pub(crate) hash: Region,
	pub(crate) surf: Region,
	pub(crate) old: Region,
	pub(crate) global_ts: u64,
	pub(crate) hash_util_ratio: f32,
	pub(crate) compression: CompressionType,
	/// False for externally built tables whose entries inherit
	/// `global_ts` instead of carrying a version each.
	pub(crate) per_entry_versions: bool,
}

impl Footer {
	pub(crate) fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(FOOTER_LEN);
		for region in [&self.index, &self.hash, &self.surf, &self.old] {
			buf.extend_from_slice(&region.offset.to_le_bytes());
			buf.extend_from_slice(&region.len.to_le_bytes());
		}
		buf.extend_from_slice(&self.global_ts.to_le_bytes());
		buf.extend_from_slice(&self.hash_util_ratio.to_le_bytes());
		buf.push(self.compression as u8);
		buf.push(self.per_entry_versions as u8);
		buf.push(HASH_SLOT_OFFSET_WIDTH);
		buf.push(0);
		buf.extend_from_slice(&[0u8; 4]);
		let cksum = mask(crc32fast::hash(&buf));
		buf.extend_from_slice(&cksum.to_le_bytes());
		buf.extend_from_slice(&TABLE_MAGIC);
		debug_assert_eq!(buf.len(), FOOTER_LEN);
		buf
	}

	pub(crate) fn decode(buf: &[u8]) -> Result<Footer> {
		if buf.len() != FOOTER_LEN {
			return Err(Error::Corruption("footer truncated".into()));
		}
		if buf[FOOTER_LEN - 8..] != TABLE_MAGIC {
			return Err(Error::BadMagicNumber);
		}
		let stored = u32::from_le_bytes(buf[84..88].try_into().unwrap());
		if unmask(stored) != crc32fast::hash(&buf[..84]) {
			return Err(Error::ChecksumMismatch {
				offset: 84,
			});
		}

		let mut src = &buf[..];
		let mut regions = [Region::default(); 4];
		for region in regions.iter_mut() {
			region.offset = src.get_u64_le();
			region.len = src.get_u64_le();
		}
		let global_ts = src.get_u64_le();
		let hash_util_ratio = f32::from_le_bytes(buf[72..76].try_into().unwrap());
		let compression = CompressionType::try_from(buf[76])?;
		let per_entry_versions = match buf[77] {
			0 => false,
			1 => true,
			_ => return Err(Error::InvalidTableFormat),
		};
		if buf[78] != HASH_SLOT_OFFSET_WIDTH {
			return Err(Error::InvalidTableFormat);
		}

		Ok(Footer {
			index: regions[0],
			hash: regions[1],
			surf: regions[2],
			old: regions[3],
			global_ts,
			hash_util_ratio,
			compression,
			per_entry_versions,
		})
	}
}

/// The parsed block index: packed base keys plus the end offset of
/// every stored block, and the table's key bounds.
pub(crate) struct TableIndex {
	block_end_offsets: Vec<u32>,
	base_key_ends: Vec<u32>,
	base_keys: Bytes,
	smallest: Key,
	biggest: Key,
}

impl TableIndex {
	fn parse(payload: Bytes) -> Result<TableIndex> {
		if payload.len() < 4 {
			return Err(Error::Corruption("block index truncated".into()));
		}
		let num_blocks = read_u32_at(&payload, 0) as usize;
		let mut off = 4;
		let need = 4 + num_blocks * 8;
		if payload.len() < need {
			return Err(Error::Corruption("block index truncated".into()));
		}
		let mut block_end_offsets = Vec::with_capacity(num_blocks);
		for _ in 0..num_blocks {
			block_end_offsets.push(read_u32_at(&payload, off));
			off += 4;
		}
		let mut base_key_ends = Vec::with_capacity(num_blocks);
		for _ in 0..num_blocks {
			base_key_ends.push(read_u32_at(&payload, off));
			off += 4;
		}
		let packed_len = base_key_ends.last().copied().unwrap_or(0) as usize;
		if payload.len() < off + packed_len + 4 {
			return Err(Error::Corruption("block index truncated".into()));
		}
		let base_keys = payload.slice(off..off + packed_len);
		off += packed_len;

		let smallest_len =
			u16::from_le_bytes(payload[off..off + 2].try_into().unwrap()) as usize;
		off += 2;
		let smallest = if smallest_len == 0 {
			Key::default()
		} else {
			Key::decode(&payload[off..off + smallest_len])
		};
		off += smallest_len;
		let biggest_len = u16::from_le_bytes(payload[off..off + 2].try_into().unwrap()) as usize;
		off += 2;
		let biggest = if biggest_len == 0 {
			Key::default()
		} else {
			Key::decode(&payload[off..off + biggest_len])
		};

		Ok(TableIndex {
			block_end_offsets,
			base_key_ends,
			base_keys,
			smallest,
			biggest,
		})
	}

	pub(crate) fn num_blocks(&self) -> usize {
		self.block_end_offsets.len()
	}

	pub(crate) fn base_key(&self, i: usize) -> &[u8] {
		let start = if i == 0 {
			0
		} else {
			self.base_key_ends[i - 1] as usize
		};
		&self.base_keys[start..self.base_key_ends[i] as usize]
	}

	fn base_key_bytes(&self, i: usize) -> Bytes {
		let start = if i == 0 {
			0
		} else {
			self.base_key_ends[i - 1] as usize
		};
		self.base_keys.slice(start..self.base_key_ends[i] as usize)
	}

	fn block_span(&self, i: usize) -> (usize, usize) {
		let start = if i == 0 {
			0
		} else {
			self.block_end_offsets[i - 1] as usize
		};
		(start, self.block_end_offsets[i] as usize)
	}
}

/// Direct-addressed point-lookup index keyed by the 64-bit farm
/// fingerprint of the user key.
struct HashIndex {
	num_slots: u32,
	slots: Bytes,
}

impl HashIndex {
	fn parse(payload: Bytes) -> Result<HashIndex> {
		if payload.len() < 4 {
			return Err(Error::Corruption("hash index truncated".into()));
		}
		let num_slots = read_u32_at(&payload, 0);
		if payload.len() < 4 + num_slots as usize * HASH_SLOT_LEN {
			return Err(Error::Corruption("hash index truncated".into()));
		}
		Ok(HashIndex {
			num_slots,
			slots: payload.slice(4..),
		})
	}

	/// (block_idx, entry_idx, status)
	fn slot(&self, hash: u64) -> (u32, u8, u8) {
		let idx = (hash % self.num_slots as u64) as usize * HASH_SLOT_LEN;
		let slot = &self.slots[idx..idx + HASH_SLOT_LEN];
		(read_u32_at(slot, 0), slot[4], slot[5])
	}
}

/// Outcome of a hash-index point lookup.
pub enum PointGetResult {
	/// The key (at the newest version visible to the query) is here.
	Found(Key, ValueStruct),
	/// Definitively not in this table.
	Absent,
	/// The index cannot answer; the caller must fall back to a seek.
	Fallback,
}

/// An open, immutable sorted table. All readers share one file handle
/// and the injected block cache; the table itself is wholly read-only
/// apart from its reference count.
pub struct Table {
	pub(crate) id: u64,
	file: Arc<dyn File>,
	file_size: u64,
	pub(crate) opts: Arc<Options>,
	footer: Footer,
	pub(crate) index: TableIndex,
	hash_index: Option<HashIndex>,
	pub(crate) surf: Option<Surf>,
	pub(crate) old_block: Bytes,
	path: Option<PathBuf>,
	refs: AtomicI32,
	delete_on_zero: AtomicBool,
}

/// Conventional on-disk name for a table id.
pub fn new_filename(id: u64, dir: &Path) -> PathBuf {
	dir.join(format!("{id:06}.sst"))
}

impl Table {
	pub fn open(id: u64, path: &Path, opts: Arc<Options>) -> Result<Arc<Table>> {
		let file = Arc::new(vfs::open_read_write(path)?);
		Self::open_with_file(id, file, opts, Some(path.to_path_buf()))
	}

	pub fn open_with_file(
		id: u64,
		file: Arc<dyn File>,
		opts: Arc<Options>,
		path: Option<PathBuf>,
	) -> Result<Arc<Table>> {
		let file_size = file.len()?;
		if (file_size as usize) < FOOTER_LEN {
			return Err(Error::Corruption(format!("file too small: {file_size} bytes")));
		}

		let mut buf = vec![0u8; FOOTER_LEN];
		file.read_at(file_size - FOOTER_LEN as u64, &mut buf)?;
		let footer = Footer::decode(&buf)?;

		let index_payload = read_region(&*file, &footer.index)?;
		let index = TableIndex::parse(index_payload)?;

		let hash_index = if footer.hash.len > 0 {
			Some(HashIndex::parse(read_region(&*file, &footer.hash)?)?)
		} else {
			None
		};

		let surf = if footer.surf.len > 0 {
			let payload = read_region(&*file, &footer.surf)?;
			Some(Surf::read_from(&payload)?)
		} else {
			None
		};

		let old_block = if footer.old.len > 0 {
			read_region(&*file, &footer.old)?
		} else {
			Bytes::new()
		};

		Ok(Arc::new(Table {
			id,
			file,
			file_size,
			opts,
			footer,
			index,
			hash_index,
			surf,
			old_block,
			path,
			refs: AtomicI32::new(1),
			delete_on_zero: AtomicBool::new(false),
		}))
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn size(&self) -> u64 {
		self.file_size
	}

	pub fn smallest(&self) -> &Key {
		&self.index.smallest
	}

	pub fn biggest(&self) -> &Key {
		&self.index.biggest
	}

	/// True when `[start, end]` intersects this table's key range.
	pub fn has_overlap(&self, start: KeyRef<'_>, end: KeyRef<'_>) -> bool {
		start.cmp_key(self.biggest().as_ref()) != std::cmp::Ordering::Greater
			&& end.cmp_key(self.smallest().as_ref()) != std::cmp::Ordering::Less
	}

	pub(crate) fn global_version(&self) -> Option<u64> {
		if self.footer.per_entry_versions {
			None
		} else {
			Some(self.footer.global_ts)
		}
	}

	pub(crate) fn new_block_cursor(&self) -> BlockCursor {
		BlockCursor::new(self.old_block.clone(), self.global_version())
	}

	/// Fetches and decodes block `i`, through the shared cache.
	pub(crate) fn block(&self, i: usize) -> Result<Arc<Block>> {
		if i >= self.index.num_blocks() {
			return Err(Error::Corruption(format!("block {i} out of range")));
		}
		if let Some(block) = self.opts.block_cache.get(self.id, i as u32) {
			return Ok(block);
		}

		let (start, end) = self.index.block_span(i);
		if end <= start + 4 || end > self.file_size as usize {
			return Err(Error::Corruption(format!("block {i} has impossible bounds")));
		}
		let mut raw = vec![0u8; end - start];
		self.file.read_at(start as u64, &mut raw)?;

		let payload_len = raw.len() - 4;
		let stored = u32::from_le_bytes(raw[payload_len..].try_into().unwrap());
		if unmask(stored) != crc32fast::hash(&raw[..payload_len]) {
			return Err(Error::ChecksumMismatch {
				offset: start as u64,
			});
		}
		raw.truncate(payload_len);

		let decoded = decompress_block(&raw, self.footer.compression)?;
		let block = Arc::new(Block::from_parts(
			Bytes::from(decoded),
			self.index.base_key_bytes(i),
		));
		self.opts.block_cache.insert(self.id, i as u32, Arc::clone(&block));
		Ok(block)
	}

	/// O(1) point lookup through the hash index. `key_hash` is the farm
	/// fingerprint of the user key, computed once by the caller. Unique
	/// slots never produce a false negative; anything the index cannot
	/// prove turns into `Fallback`.
	pub fn point_get(&self, key: KeyRef<'_>, key_hash: u64) -> Result<PointGetResult> {
		let Some(hash_index) = &self.hash_index else {
			return Ok(PointGetResult::Fallback);
		};

		let (block_idx, entry_idx, status) = hash_index.slot(key_hash);
		match status {
			HASH_SLOT_EMPTY => Ok(PointGetResult::Absent),
			HASH_SLOT_COLLISION => Ok(PointGetResult::Fallback),
			HASH_SLOT_UNIQUE => {
				let block = self.block(block_idx as usize)?;
				let mut cursor = self.new_block_cursor();
				cursor.set_block(block);
				cursor.set_idx(entry_idx as usize);
				if !cursor.valid() || cursor.user_key != key.user_key {
					return Ok(PointGetResult::Absent);
				}
				if cursor.version > key.version {
					if cursor.has_old_version() {
						let (ver, val) = cursor.ski.seek_version(key.version);
						cursor.version = ver;
						cursor.val = val;
					}
					if cursor.version > key.version {
						// Every stored version is newer than asked for.
						return Ok(PointGetResult::Absent);
					}
				}
				Ok(PointGetResult::Found(cursor.key().to_key(), cursor.value()))
			}
			other => Err(Error::Corruption(format!("bad hash slot status {other}"))),
		}
	}

	/// Rewrites the footer with a table-wide version for every entry.
	/// Only meaningful for externally built tables; takes effect on the
	/// next open.
	pub fn set_global_ts(&self, ts: u64) -> Result<()> {
		if self.footer.per_entry_versions {
			return Err(Error::InvalidTableFormat);
		}
		let mut footer = self.footer.clone();
		footer.global_ts = ts;
		let buf = footer.encode();
		self.file.write_at(self.file_size - FOOTER_LEN as u64, &buf)?;
		self.file.sync_all()?;
		Ok(())
	}

	pub fn incr_ref(&self) {
		self.refs.fetch_add(1, AtomicOrdering::SeqCst);
	}

	/// Drops one reference. At zero the cached blocks are evicted and,
	/// if the table was marked for deletion, the file is unlinked.
	pub fn decr_ref(&self) -> Result<()> {
		let prev = self.refs.fetch_sub(1, AtomicOrdering::SeqCst);
		debug_assert!(prev > 0);
		if prev == 1 {
			self.opts.block_cache.evict_table(self.id, self.index.num_blocks() as u32);
			if self.delete_on_zero.load(AtomicOrdering::SeqCst) {
				if let Some(path) = &self.path {
					std::fs::remove_file(path)?;
				}
			}
		}
		Ok(())
	}

	/// Marks the backing file for removal once the last reference is
	/// gone.
	pub fn mark_delete(&self) {
		self.delete_on_zero.store(true, AtomicOrdering::SeqCst);
	}

	pub fn close(&self) -> Result<()> {
		self.decr_ref()
	}
}

fn read_region(file: &dyn File, region: &Region) -> Result<Bytes> {
	if region.len < 4 {
		return Err(Error::Corruption("region too small".into()));
	}
	let mut buf = vec![0u8; region.len as usize];
	file.read_at(region.offset, &mut buf)?;

	let payload_len = buf.len() - 4;
	let stored = u32::from_le_bytes(buf[payload_len..].try_into().unwrap());
	if unmask(stored) != crc32fast::hash(&buf[..payload_len]) {
		return Err(Error::ChecksumMismatch {
			offset: region.offset,
		});
	}
	buf.truncate(payload_len);
	Ok(Bytes::from(buf))
}
