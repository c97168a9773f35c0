pub(crate) mod block;
pub mod builder;
pub mod iterator;
pub mod table;

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use bytes::Bytes;
	use test_log::test;

	use crate::compression::CompressionType;
	use crate::iter::Iterator as LsmIterator;
	use crate::key::{Key, KeyRef, ValueStruct};
	use crate::sstable::builder::TableBuilder;
	use crate::sstable::iterator::{ConcatIterator, TableIterator};
	use crate::sstable::table::{new_filename, PointGetResult, Table};
	use crate::surf::SurfOptions;
	use crate::Options;

	fn key(prefix: &str, i: usize) -> Vec<u8> {
		format!("{prefix}{i:04}").into_bytes()
	}

	fn default_opts() -> Arc<Options> {
		let mut opts = Options::default();
		opts.compression_per_level = vec![CompressionType::Zstd];
		Arc::new(opts)
	}

	fn build_table(
		opts: &Arc<Options>,
		kvs: &[(Vec<u8>, u64, ValueStruct)],
	) -> (Arc<Table>, tempfile::TempDir) {
		let dir = tempfile::tempdir().unwrap();
		let id = rand::random::<u32>() as u64;
		let path = new_filename(id, dir.path());
		let file = std::fs::File::create(&path).unwrap();
		let mut b = TableBuilder::new(file, Arc::clone(opts), 0);
		for (k, version, vs) in kvs {
			b.add(KeyRef::new(k, *version), vs).unwrap();
		}
		b.finish().unwrap();

		let table = Table::open(id, &path, Arc::clone(opts)).unwrap();
		(table, dir)
	}

	fn build_test_table(
		prefix: &str,
		n: usize,
		opts: &Arc<Options>,
	) -> (Arc<Table>, tempfile::TempDir) {
		let kvs: Vec<_> = (0..n)
			.map(|i| {
				(key(prefix, i), 0, ValueStruct::new(format!("{i}").into_bytes(), b'A'))
			})
			.collect();
		build_table(opts, &kvs)
	}

	#[test]
	fn test_footer_roundtrip() {
		use crate::sstable::table::{Footer, Region};
		let f = Footer {
			index: Region {
				offset: 44,
				len: 4,
			},
			hash: Region {
				offset: 55,
				len: 5,
			},
			surf: Region::default(),
			old: Region {
				offset: 66,
				len: 6,
			},
			global_ts: 7,
			hash_util_ratio: 0.75,
			compression: CompressionType::Snappy,
			per_entry_versions: true,
		};
		let buf = f.encode();
		let f2 = Footer::decode(&buf).unwrap();
		assert_eq!(f2.index, f.index);
		assert_eq!(f2.hash, f.hash);
		assert_eq!(f2.old, f.old);
		assert_eq!(f2.global_ts, 7);
		assert_eq!(f2.compression, CompressionType::Snappy);
		assert!(f2.per_entry_versions);
	}

	#[test]
	fn test_footer_rejects_corruption() {
		use crate::sstable::table::Footer;
		let f = Footer {
			index: Default::default(),
			hash: Default::default(),
			surf: Default::default(),
			old: Default::default(),
			global_ts: 0,
			hash_util_ratio: 0.0,
			compression: CompressionType::None,
			per_entry_versions: true,
		};
		let mut buf = f.encode();
		buf[3] ^= 0xff;
		assert!(Footer::decode(&buf).is_err());

		let mut buf = f.encode();
		let n = buf.len();
		buf[n - 1] ^= 0xff;
		assert!(matches!(Footer::decode(&buf), Err(crate::Error::BadMagicNumber)));
	}

	#[test]
	fn test_table_iterator() {
		for n in [99, 100, 101, 1000] {
			let opts = default_opts();
			let (table, _dir) = build_test_table("key", n, &opts);
			let mut it = TableIterator::new(&table, false);
			let mut count = 0;
			it.rewind();
			while it.valid() {
				let k = it.key();
				assert_eq!(k.user_key, key("key", count));
				assert_eq!(k.version, 0);
				assert_eq!(it.value().value, Bytes::from(format!("{count}")));
				count += 1;
				it.next();
			}
			assert_eq!(count, n);
			it.close().unwrap();
		}
	}

	#[test]
	fn test_seek_to_first_and_last() {
		for n in [99, 100, 101, 199, 200, 250, 9999] {
			let opts = default_opts();
			let (table, _dir) = build_test_table("key", n, &opts);

			let mut it = TableIterator::new(&table, false);
			it.rewind();
			assert!(it.valid());
			let v = it.value();
			assert_eq!(v.value, Bytes::from_static(b"0"));
			assert_eq!(v.meta, b'A');
			it.close().unwrap();

			let mut it = TableIterator::new(&table, true);
			it.rewind();
			assert!(it.valid());
			assert_eq!(it.value().value, Bytes::from(format!("{}", n - 1)));
			it.next();
			assert!(it.valid());
			assert_eq!(it.value().value, Bytes::from(format!("{}", n - 2)));
			it.close().unwrap();
		}
	}

	#[test]
	fn test_seek() {
		let opts = default_opts();
		let (table, _dir) = build_test_table("k", 10000, &opts);
		let mut it = TableIterator::new(&table, false);

		let cases: &[(&[u8], Option<&[u8]>)] = &[
			(b"abc", Some(b"k0000")),
			(b"k0100", Some(b"k0100")),
			(b"k0100b", Some(b"k0101")),
			(b"k1234", Some(b"k1234")),
			(b"k1234b", Some(b"k1235")),
			(b"k9999", Some(b"k9999")),
			(b"z", None),
		];
		for (target, want) in cases {
			it.seek(KeyRef::new(target, u64::MAX));
			match want {
				Some(w) => {
					assert!(it.valid(), "seek {:?}", String::from_utf8_lossy(target));
					assert_eq!(it.key().user_key, *w);
				}
				None => assert!(!it.valid()),
			}
		}
		it.close().unwrap();
	}

	#[test]
	fn test_seek_for_prev() {
		let opts = default_opts();
		let (table, _dir) = build_test_table("k", 10000, &opts);
		let mut it = TableIterator::new(&table, true);

		// Landing on the largest key <= target.
		it.seek(KeyRef::new(b"k0100b", 0));
		assert!(it.valid());
		assert_eq!(it.key().user_key, b"k0100");

		it.seek(KeyRef::new(b"k0100", 0));
		assert!(it.valid());
		assert_eq!(it.key().user_key, b"k0100");

		it.seek(KeyRef::new(b"zzzz", 0));
		assert!(it.valid());
		assert_eq!(it.key().user_key, b"k9999");

		it.seek(KeyRef::new(b"a", 0));
		assert!(!it.valid());
		it.close().unwrap();
	}

	#[test]
	fn test_iterate_back_and_forth() {
		let opts = default_opts();
		let (table, _dir) = build_test_table("key", 1000, &opts);
		let mut it = TableIterator::new(&table, false);

		it.seek(KeyRef::new(&key("key", 500), u64::MAX));
		assert!(it.valid());
		assert_eq!(it.key().user_key, key("key", 500));

		// The cursor is bidirectional under the hood.
		it.seek_for_prev(KeyRef::new(&key("key", 499), u64::MAX));
		assert!(it.valid());
		it.close().unwrap();
	}

	#[test]
	fn test_multi_version_layout() {
		// One user key, five versions: the newest stays inline, the rest
		// go to the old-version sidecar.
		let opts = default_opts();
		let versions = [9u64, 7, 5, 3, 1];
		let kvs: Vec<_> = versions
			.iter()
			.map(|&v| {
				(b"key".to_vec(), v, ValueStruct::new(format!("v{v}").into_bytes(), b'A'))
			})
			.collect();
		let (table, _dir) = build_table(&opts, &kvs);

		let mut it = TableIterator::new(&table, false);
		it.rewind();
		let mut seen = Vec::new();
		while it.valid() {
			seen.push(it.key().version);
			it.next();
		}
		assert_eq!(seen, versions);
		it.close().unwrap();

		// Version-aware seek positions on the newest version <= target.
		let mut it = TableIterator::new(&table, false);
		it.seek(KeyRef::new(b"key", 6));
		assert!(it.valid());
		assert_eq!(it.key().version, 5);
		assert_eq!(it.value().value, Bytes::from_static(b"v5"));

		it.seek(KeyRef::new(b"key", 100));
		assert!(it.valid());
		assert_eq!(it.key().version, 9);

		it.seek(KeyRef::new(b"key", 0));
		assert!(!it.valid());
		it.close().unwrap();
	}

	#[test]
	fn test_next_version() {
		let opts = default_opts();
		let kvs: Vec<_> = [9u64, 7, 5]
			.iter()
			.map(|&v| (b"key".to_vec(), v, ValueStruct::new(format!("v{v}").into_bytes(), 0)))
			.collect();
		let (table, _dir) = build_table(&opts, &kvs);

		let mut it = TableIterator::new(&table, false);
		it.rewind();
		assert_eq!(it.key().version, 9);
		assert!(it.next_version());
		assert_eq!(it.key().version, 7);
		assert!(it.next_version());
		assert_eq!(it.key().version, 5);
		assert!(!it.next_version());
		assert_eq!(it.key().version, 5);
		it.close().unwrap();
	}

	#[test]
	fn test_point_get_versions() {
		let opts = default_opts();
		let versions = [9u64, 7, 5, 3, 1];
		let kvs: Vec<_> = versions
			.iter()
			.map(|&v| {
				(b"key".to_vec(), v, ValueStruct::new(format!("v{v}").into_bytes(), b'A'))
			})
			.collect();
		let (table, _dir) = build_table(&opts, &kvs);
		let hash = farmhash::fingerprint64(b"key");

		for (target, want) in [(10u64, 9u64), (9, 9), (6, 5), (2, 1)] {
			match table.point_get(KeyRef::new(b"key", target), hash).unwrap() {
				PointGetResult::Found(k, vs) => {
					assert_eq!(k, Key::new(&b"key"[..], want), "target {target}");
					assert_eq!(vs.value, Bytes::from(format!("v{want}")));
				}
				_ => panic!("expected hit for target {target}"),
			}
		}

		// Older than every stored version.
		assert!(matches!(
			table.point_get(KeyRef::new(b"key", 0), hash).unwrap(),
			PointGetResult::Absent
		));
	}

	#[test]
	fn test_point_get_absent_and_fallback() {
		let opts = default_opts();
		let (table, _dir) = build_test_table("key", 8000, &opts);

		for i in 0..8000 {
			let k = key("key", i);
			let hash = farmhash::fingerprint64(&k);
			match table.point_get(KeyRef::new(&k, u64::MAX), hash).unwrap() {
				PointGetResult::Found(found, _) => assert_eq!(found.user_key, k),
				PointGetResult::Fallback => {} // collision, seek path takes over
				PointGetResult::Absent => panic!("false negative for {i}"),
			}
		}

		let mut absent_definitive = 0;
		for i in 8000..10000 {
			let k = key("key", i);
			let hash = farmhash::fingerprint64(&k);
			match table.point_get(KeyRef::new(&k, u64::MAX), hash).unwrap() {
				PointGetResult::Found(found, _) => {
					panic!("claimed to find {:?} as {:?}", k, found.user_key)
				}
				PointGetResult::Absent => absent_definitive += 1,
				PointGetResult::Fallback => {}
			}
		}
		// The index answers definitively for a decent share of misses.
		assert!(absent_definitive > 0);
	}

	#[test]
	fn test_surf_accelerated_seek() {
		let mut opts = Options::default();
		opts.compression_per_level = vec![CompressionType::Snappy];
		opts.surf = Some(SurfOptions {
			real_suffix_len: 10,
			..Default::default()
		});
		let opts = Arc::new(opts);
		let (table, _dir) = build_test_table("key", 5000, &opts);
		assert!(table.surf.is_some());

		let mut it = TableIterator::new(&table, false);
		for (target, want) in [
			(&b"abc"[..], Some(key("key", 0))),
			(b"key0050b", Some(key("key", 51))),
			(b"key2500", Some(key("key", 2500))),
			(b"z", None),
		] {
			it.seek(KeyRef::new(target, u64::MAX));
			match want {
				Some(w) => {
					assert!(it.valid(), "seek {:?}", String::from_utf8_lossy(target));
					assert_eq!(it.key().user_key, w);
				}
				None => assert!(!it.valid()),
			}
		}
		it.close().unwrap();
	}

	#[test]
	fn test_global_ts_table() {
		let opts = default_opts();
		let dir = tempfile::tempdir().unwrap();
		let path = new_filename(42, dir.path());
		let file = std::fs::File::create(&path).unwrap();

		let mut b = TableBuilder::new_external(file, Arc::clone(&opts), 0);
		for i in 0..200 {
			b.add(
				KeyRef::new(&key("key", i), 0),
				&ValueStruct::new(format!("{i}").into_bytes(), b'A'),
			)
			.unwrap();
		}
		b.finish().unwrap();

		let table = Table::open(42, &path, Arc::clone(&opts)).unwrap();
		table.set_global_ts(10).unwrap();
		table.close().unwrap();

		// The timestamp is only visible after reopening.
		let table = Table::open(42, &path, Arc::clone(&opts)).unwrap();
		let mut it = TableIterator::new(&table, false);
		let mut count = 0;
		it.rewind();
		while it.valid() {
			assert_eq!(it.key().user_key, key("key", count));
			assert_eq!(it.key().version, 10);
			assert_eq!(it.value().value, Bytes::from(format!("{count}")));
			count += 1;
			it.next();
		}
		assert_eq!(count, 200);
		it.close().unwrap();
	}

	#[test]
	fn test_smallest_biggest() {
		let opts = default_opts();
		let (table, _dir) = build_test_table("key", 100, &opts);
		assert_eq!(table.smallest().user_key, key("key", 0));
		assert_eq!(table.biggest().user_key, key("key", 99));
		assert!(table.has_overlap(
			KeyRef::new(b"key0050", u64::MAX),
			KeyRef::new(b"key0060", 0)
		));
		assert!(!table.has_overlap(KeyRef::new(b"z", u64::MAX), KeyRef::new(b"zz", 0)));
	}

	#[test]
	fn test_concat_iterator() {
		let opts = default_opts();
		let (t1, _d1) = build_test_table("keya", 10000, &opts);
		let (t2, _d2) = build_test_table("keyb", 10000, &opts);
		let (t3, _d3) = build_test_table("keyc", 10000, &opts);

		let mut it = ConcatIterator::new(vec![t1.clone(), t2.clone(), t3.clone()], false);
		it.rewind();
		let mut count = 0;
		while it.valid() {
			count += 1;
			it.next();
		}
		assert_eq!(count, 30000);

		it.seek(KeyRef::new(b"a", u64::MAX));
		assert_eq!(it.key().user_key, b"keya0000");

		it.seek(KeyRef::new(b"keyb", u64::MAX));
		assert_eq!(it.key().user_key, b"keyb0000");

		it.seek(KeyRef::new(b"keyb9999b", u64::MAX));
		assert_eq!(it.key().user_key, b"keyc0000");

		it.seek(KeyRef::new(b"keyd", u64::MAX));
		assert!(!it.valid());
		it.close().unwrap();

		let mut it = ConcatIterator::new(vec![t1, t2, t3], true);
		it.seek(KeyRef::new(b"keyd", 0));
		assert_eq!(it.key().user_key, b"keyc9999");

		it.seek(KeyRef::new(b"keyb9999b", 0));
		assert_eq!(it.key().user_key, b"keyb9999");

		it.seek(KeyRef::new(b"a", 0));
		assert!(!it.valid());
		it.close().unwrap();
	}

	#[test]
	fn test_block_cache_shared_across_iterators() {
		let opts = default_opts();
		let (table, _dir) = build_test_table("key", 2000, &opts);
		let mut a = TableIterator::new(&table, false);
		let mut b = TableIterator::new(&table, false);
		a.rewind();
		b.rewind();
		while a.valid() && b.valid() {
			assert_eq!(a.key().user_key, b.key().user_key);
			a.next();
			b.next();
		}
		assert!(!a.valid() && !b.valid());
		a.close().unwrap();
		b.close().unwrap();
	}

	#[test]
	fn test_double_close_is_error() {
		let opts = default_opts();
		let (table, _dir) = build_test_table("key", 10, &opts);
		let mut it = TableIterator::new(&table, false);
		it.rewind();
		it.close().unwrap();
		assert!(matches!(it.close(), Err(crate::Error::IteratorClosed)));
	}

	#[test]
	fn test_delete_on_zero_refs() {
		let opts = default_opts();
		let dir = tempfile::tempdir().unwrap();
		let path = new_filename(7, dir.path());
		let file = std::fs::File::create(&path).unwrap();
		let mut b = TableBuilder::new(file, Arc::clone(&opts), 0);
		b.add(KeyRef::new(b"k", 1), &ValueStruct::new(&b"v"[..], 0)).unwrap();
		b.finish().unwrap();

		let table = Table::open(7, &path, Arc::clone(&opts)).unwrap();
		table.mark_delete();

		let mut it = TableIterator::new(&table, false);
		it.rewind();
		assert!(it.valid());
		it.close().unwrap();
		assert!(path.exists());

		table.close().unwrap();
		assert!(!path.exists());
	}
}
