use std::cmp::Ordering;

use bytes::{Buf, BufMut, Bytes};

/// Meta bit marking a deletion tombstone.
pub const META_DELETE: u8 = 1 << 0;
/// Meta bit marking that the value bytes are a pointer into the value log.
pub const META_VALUE_POINTER: u8 = 1 << 1;
/// Meta bit asking compaction to drop all older versions of this key.
pub const META_DISCARD_EARLIER_VERSIONS: u8 = 1 << 2;
/// Meta bit marking an entry whose TTL has elapsed.
pub const META_EXPIRED: u8 = 1 << 3;

/// A key is a user key plus a commit version. Versions sort descending
/// within a user key, so the newest version of a key is seen first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Key {
	pub user_key: Bytes,
	pub version: u64,
}

impl Key {
	pub fn new(user_key: impl Into<Bytes>, version: u64) -> Self {
		Key {
			user_key: user_key.into(),
			version,
		}
	}

	/// The wire form is `user_key || be(u64::MAX - version)` so a plain
	/// memcmp on encoded keys yields the (user asc, version desc) order.
	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(self.user_key.len() + 8);
		buf.extend_from_slice(&self.user_key);
		buf.extend_from_slice(&(u64::MAX - self.version).to_be_bytes());
		buf
	}

	pub fn decode(encoded: &[u8]) -> Self {
		let kr = KeyRef::decode(encoded);
		kr.to_key()
	}

	pub fn as_ref(&self) -> KeyRef<'_> {
		KeyRef {
			user_key: &self.user_key,
			version: self.version,
		}
	}

	pub fn same_user_key(&self, other: &Key) -> bool {
		self.user_key == other.user_key
	}

	pub fn is_empty(&self) -> bool {
		self.user_key.is_empty()
	}
}

impl Ord for Key {
	fn cmp(&self, other: &Self) -> Ordering {
		self.as_ref().cmp_key(other.as_ref())
	}
}

impl PartialOrd for Key {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

/// Borrowed view of a key, used by iterators so `key()` never allocates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyRef<'a> {
	pub user_key: &'a [u8],
	pub version: u64,
}

impl<'a> KeyRef<'a> {
	pub fn new(user_key: &'a [u8], version: u64) -> Self {
		KeyRef {
			user_key,
			version,
		}
	}

	/// Splits an encoded key back into `(user_key, version)`. Exactly the
	/// trailing 8 bytes carry the inverted version.
	pub fn decode(encoded: &'a [u8]) -> Self {
		debug_assert!(encoded.len() >= 8);
		let n = encoded.len() - 8;
		let inv = u64::from_be_bytes(encoded[n..].try_into().unwrap());
		KeyRef {
			user_key: &encoded[..n],
			version: u64::MAX - inv,
		}
	}

	pub fn to_key(self) -> Key {
		Key {
			user_key: Bytes::copy_from_slice(self.user_key),
			version: self.version,
		}
	}

	pub fn cmp_key(self, other: KeyRef<'_>) -> Ordering {
		match self.user_key.cmp(other.user_key) {
			Ordering::Equal => other.version.cmp(&self.version),
			ord => ord,
		}
	}

	pub fn same_user_key(self, other: KeyRef<'_>) -> bool {
		self.user_key == other.user_key
	}
}

/// The value record stored against a key. `user_meta` is an opaque byte
/// string the host interprets; `meta` carries the bits above.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValueStruct {
	pub meta: u8,
	pub user_meta: Bytes,
	pub value: Bytes,
	pub version: u64,
}

impl ValueStruct {
	pub fn new(value: impl Into<Bytes>, meta: u8) -> Self {
		ValueStruct {
			meta,
			user_meta: Bytes::new(),
			value: value.into(),
			version: 0,
		}
	}

	pub fn tombstone() -> Self {
		ValueStruct {
			meta: META_DELETE,
			user_meta: Bytes::new(),
			value: Bytes::new(),
			version: 0,
		}
	}

	pub fn encoded_size(&self) -> usize {
		8 + 2 + self.user_meta.len() + self.value.len()
	}

	/// Wire form: `version:u64 | meta:u8 | user_meta_len:u8 | user_meta |
	/// value`, with the value running to the end of the enclosing record.
	pub fn encode_to(&self, buf: &mut Vec<u8>) {
		debug_assert!(self.user_meta.len() <= u8::MAX as usize);
		buf.put_u64_le(self.version);
		buf.put_u8(self.meta);
		buf.put_u8(self.user_meta.len() as u8);
		buf.extend_from_slice(&self.user_meta);
		buf.extend_from_slice(&self.value);
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(self.encoded_size());
		self.encode_to(&mut buf);
		buf
	}

	/// The record carries no length of its own; the caller hands us the
	/// exact framed slice.
	pub fn decode(data: &Bytes) -> ValueStruct {
		let mut buf = &data[..];
		let version = buf.get_u64_le();
		let meta = buf.get_u8();
		let user_meta_len = buf.get_u8() as usize;
		let off = data.len() - buf.len();
		ValueStruct {
			version,
			meta,
			user_meta: data.slice(off..off + user_meta_len),
			value: data.slice(off + user_meta_len..),
		}
	}

	pub fn decode_into(&mut self, data: &Bytes) {
		*self = ValueStruct::decode(data);
	}

	pub fn is_deleted(&self) -> bool {
		self.meta & (META_DELETE | META_EXPIRED) != 0
	}

	pub fn is_value_pointer(&self) -> bool {
		self.meta & META_VALUE_POINTER != 0
	}

	pub fn discard_earlier_versions(&self) -> bool {
		self.meta & META_DISCARD_EARLIER_VERSIONS != 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_log::test;

	#[test]
	fn test_key_roundtrip() {
		let k = Key::new(&b"apple"[..], 42);
		let enc = k.encode();
		assert_eq!(enc.len(), 5 + 8);
		let back = Key::decode(&enc);
		assert_eq!(back, k);
	}

	#[test]
	fn test_key_order_matches_encoded_order() {
		let keys = vec![
			Key::new(&b"a"[..], 9),
			Key::new(&b"a"[..], 3),
			Key::new(&b"ab"[..], u64::MAX),
			Key::new(&b"b"[..], 0),
		];
		for w in keys.windows(2) {
			assert_eq!(w[0].cmp(&w[1]), Ordering::Less);
			assert!(w[0].encode() < w[1].encode());
		}
	}

	#[test]
	fn test_value_struct_roundtrip() {
		let vs = ValueStruct {
			meta: META_VALUE_POINTER,
			user_meta: Bytes::from_static(b"um"),
			value: Bytes::from_static(b"hello world"),
			version: 7,
		};
		let enc = Bytes::from(vs.encode());
		let back = ValueStruct::decode(&enc);
		assert_eq!(back, vs);
		assert!(back.is_value_pointer());
		assert!(!back.is_deleted());
	}

	#[test]
	fn test_value_struct_empty_user_meta() {
		let vs = ValueStruct::new(&b"v"[..], 0);
		let back = ValueStruct::decode(&Bytes::from(vs.encode()));
		assert!(back.user_meta.is_empty());
		assert_eq!(back.value.as_ref(), b"v");
	}

	#[test]
	fn test_tombstone() {
		let vs = ValueStruct::tombstone();
		assert!(vs.is_deleted());
	}
}
