use std::{fmt, io, sync::Arc};

/// Result returning Error
pub type Result<T> = std::result::Result<T, Error>;

/// `Error` covers everything that can go wrong while building, opening or
/// reading a table. Iterator errors are sticky, so the type stays `Clone`.
#[derive(Clone, Debug)]
pub enum Error {
	Io(Arc<io::Error>),
	/// Impossible offsets, truncated regions, malformed entries.
	Corruption(String),
	Compression(String),
	Decompression(String),
	InvalidTableFormat,
	BadMagicNumber,
	ChecksumMismatch {
		offset: u64,
	},
	KeysOutOfOrder,
	EmptyKey,
	/// The value-log pointer refers to a relocated entry; the read path
	/// re-resolves it a bounded number of times before giving up.
	Retry,
	ValueLogGone(String),
	IteratorClosed,
	Send(String),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Io(err) => write!(f, "IO error: {err}"),
			Error::Corruption(err) => write!(f, "Data corruption detected: {err}"),
			Error::Compression(err) => write!(f, "Compression error: {err}"),
			Error::Decompression(err) => write!(f, "Decompression error: {err}"),
			Error::InvalidTableFormat => write!(f, "Invalid table format"),
			Error::BadMagicNumber => write!(f, "Bad magic number in table footer"),
			Error::ChecksumMismatch {
				offset,
			} => write!(f, "Checksum mismatch at offset {offset}"),
			Error::KeysOutOfOrder => write!(f, "Keys are not in order"),
			Error::EmptyKey => write!(f, "Empty key"),
			Error::Retry => write!(f, "Value log entry relocated, retry with move key"),
			Error::ValueLogGone(err) => write!(f, "Value log unavailable: {err}"),
			Error::IteratorClosed => write!(f, "Iterator already closed"),
			Error::Send(err) => write!(f, "Send error: {err}"),
		}
	}
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::Io(Arc::new(e))
	}
}
