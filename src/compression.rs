use crate::error::{Error, Result};

/// Block compression codec, chosen per table and recorded in the footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
	None = 0,
	Snappy = 1,
	Zstd = 2,
}

impl TryFrom<u8> for CompressionType {
	type Error = Error;

	fn try_from(val: u8) -> Result<Self> {
		match val {
			0 => Ok(CompressionType::None),
			1 => Ok(CompressionType::Snappy),
			2 => Ok(CompressionType::Zstd),
			_ => Err(Error::Corruption(format!("unknown compression type {val}"))),
		}
	}
}

/// Picks the codec for a table headed to a given level. Levels past the
/// end of the configured list reuse the last entry.
#[derive(Debug, Clone)]
pub struct CompressionSelector {
	per_level: Vec<CompressionType>,
}

impl CompressionSelector {
	pub fn new(per_level: Vec<CompressionType>) -> Self {
		Self {
			per_level,
		}
	}

	pub fn select(&self, level: usize) -> CompressionType {
		if self.per_level.is_empty() {
			return CompressionType::None;
		}
		if level < self.per_level.len() {
			self.per_level[level]
		} else {
			*self.per_level.last().unwrap_or(&CompressionType::None)
		}
	}
}

pub(crate) fn compress_block(raw: Vec<u8>, compression: CompressionType) -> Result<Vec<u8>> {
	match compression {
		CompressionType::None => Ok(raw),
		CompressionType::Snappy => {
			let mut enc = snap::raw::Encoder::new();
			let mut buffer = vec![0; snap::raw::max_compress_len(raw.len())];
			match enc.compress(&raw, buffer.as_mut_slice()) {
				Ok(size) => buffer.truncate(size),
				Err(e) => return Err(Error::Compression(e.to_string())),
			}
			Ok(buffer)
		}
		CompressionType::Zstd => {
			zstd::encode_all(&raw[..], 0).map_err(|e| Error::Compression(e.to_string()))
		}
	}
}

pub(crate) fn decompress_block(compressed: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
	match compression {
		CompressionType::None => Ok(Vec::from(compressed)),
		CompressionType::Snappy => {
			let mut dec = snap::raw::Decoder::new();
			dec.decompress_vec(compressed).map_err(|e| Error::Decompression(e.to_string()))
		}
		CompressionType::Zstd => {
			zstd::decode_all(compressed).map_err(|e| Error::Decompression(e.to_string()))
		}
	}
}
