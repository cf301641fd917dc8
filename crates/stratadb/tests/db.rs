use std::collections::BTreeMap;
use std::sync::Arc;

use oorandom::Rand32;

use stratadb::{
    Database, MemFs, Options, ReadOptions, WriteBatch, WriteOptions,
};


fn mem_options(fs: &MemFs) -> Options {
    let mut opts = Options::default();
    opts.create_if_missing = true;
    opts.fs = Arc::new(fs.clone());
    opts
}

/// Small buffers so tests exercise flushes and compactions without
/// megabytes of writes.
fn small_buffer_options(fs: &MemFs) -> Options {
    let mut opts = mem_options(fs);
    opts.write_buffer_size = 64 << 10;
    opts.max_file_size = 32 << 10;
    opts
}

#[test]
fn put_get_delete() {
    let fs = MemFs::new();
    let db = Database::open("db", mem_options(&fs)).unwrap();
    let read = ReadOptions::default();
    let write = WriteOptions::default();

    assert_eq!(db.get(&read, b"missing").unwrap(), None);

    db.put(&write, b"alpha", b"one").unwrap();
    db.put(&write, b"beta", b"two").unwrap();
    assert_eq!(db.get(&read, b"alpha").unwrap(), Some(b"one".to_vec()));
    assert_eq!(db.get(&read, b"beta").unwrap(), Some(b"two".to_vec()));

    db.put(&write, b"alpha", b"uno").unwrap();
    assert_eq!(db.get(&read, b"alpha").unwrap(), Some(b"uno".to_vec()));

    db.delete(&write, b"alpha").unwrap();
    assert_eq!(db.get(&read, b"alpha").unwrap(), None);
    assert_eq!(db.get(&read, b"beta").unwrap(), Some(b"two".to_vec()));
}

#[test]
fn empty_keys_and_values() {
    let fs = MemFs::new();
    let db = Database::open("db", mem_options(&fs)).unwrap();
    let read = ReadOptions::default();
    let write = WriteOptions::default();

    db.put(&write, b"", b"empty-key").unwrap();
    db.put(&write, b"empty-value", b"").unwrap();
    assert_eq!(db.get(&read, b"").unwrap(), Some(b"empty-key".to_vec()));
    assert_eq!(db.get(&read, b"empty-value").unwrap(), Some(Vec::new()));
}

#[test]
fn batch_is_atomic_and_ordered() {
    let fs = MemFs::new();
    let db = Database::open("db", mem_options(&fs)).unwrap();
    let read = ReadOptions::default();

    let mut batch = WriteBatch::new();
    batch.put(b"foo", b"bar");
    batch.delete(b"box");
    batch.put(b"baz", b"boo");
    db.write(&WriteOptions::default(), batch).unwrap();

    assert_eq!(db.get(&read, b"foo").unwrap(), Some(b"bar".to_vec()));
    assert_eq!(db.get(&read, b"baz").unwrap(), Some(b"boo".to_vec()));
    assert_eq!(db.get(&read, b"box").unwrap(), None);

    // Within one batch, later operations win over earlier ones.
    let mut batch = WriteBatch::new();
    batch.put(b"k", b"first");
    batch.put(b"k", b"second");
    batch.delete(b"k");
    batch.put(b"k", b"third");
    db.write(&WriteOptions::default(), batch).unwrap();
    assert_eq!(db.get(&read, b"k").unwrap(), Some(b"third".to_vec()));
}

#[test]
fn snapshots_pin_their_view() {
    let fs = MemFs::new();
    let db = Database::open("db", small_buffer_options(&fs)).unwrap();
    let write = WriteOptions::default();

    db.put(&write, b"key", b"v1").unwrap();
    let snapshot = db.get_snapshot();

    db.put(&write, b"key", b"v2").unwrap();
    db.delete(&write, b"other").unwrap();

    let snapshot_read = ReadOptions { snapshot: Some(snapshot.clone()) };
    assert_eq!(db.get(&snapshot_read, b"key").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(db.get(&ReadOptions::default(), b"key").unwrap(), Some(b"v2".to_vec()));

    // Compaction must not disturb a held snapshot.
    for n in 0..5000_u32 {
        db.put(&write, format!("fill{n:05}").as_bytes(), &[0_u8; 64]).unwrap();
    }
    db.compact_range(None, None).unwrap();
    assert_eq!(db.get(&snapshot_read, b"key").unwrap(), Some(b"v1".to_vec()));

    db.release_snapshot(snapshot);
}

#[test]
fn iterator_walks_sorted_and_respects_tombstones() {
    let fs = MemFs::new();
    let db = Database::open("db", mem_options(&fs)).unwrap();
    let write = WriteOptions::default();

    for (key, value) in [("b", "2"), ("d", "4"), ("a", "1"), ("c", "3")] {
        db.put(&write, key.as_bytes(), value.as_bytes()).unwrap();
    }
    db.delete(&write, b"c").unwrap();

    let mut iter = db.iter(&ReadOptions::default()).unwrap();
    iter.seek_to_first();
    let mut seen = Vec::new();
    while iter.valid() {
        seen.push((iter.key().to_vec(), iter.value().to_vec()));
        iter.next();
    }
    iter.status().unwrap();
    assert_eq!(seen, vec![
        (b"a".to_vec(), b"1".to_vec()),
        (b"b".to_vec(), b"2".to_vec()),
        (b"d".to_vec(), b"4".to_vec()),
    ]);

    // Backwards.
    iter.seek_to_last();
    let mut reversed = Vec::new();
    while iter.valid() {
        reversed.push(iter.key().to_vec());
        iter.prev();
    }
    assert_eq!(reversed, vec![b"d".to_vec(), b"b".to_vec(), b"a".to_vec()]);

    // Seek semantics: first user key >= target.
    iter.seek(b"bb");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"d");
    iter.seek(b"a");
    assert_eq!(iter.key(), b"a");
    iter.seek(b"zzz");
    assert!(!iter.valid());
}

#[test]
fn iterator_view_is_stable_under_writes() {
    let fs = MemFs::new();
    let db = Database::open("db", mem_options(&fs)).unwrap();
    let write = WriteOptions::default();

    db.put(&write, b"one", b"1").unwrap();
    let mut iter = db.iter(&ReadOptions::default()).unwrap();

    db.put(&write, b"two", b"2").unwrap();
    db.delete(&write, b"one").unwrap();

    iter.seek_to_first();
    assert!(iter.valid());
    assert_eq!(iter.key(), b"one");
    iter.next();
    assert!(!iter.valid());
}

/// Write a few hundred thousand random entries with default-ish options,
/// reopen, and verify everything by point reads and a full ordered scan.
#[test]
fn recover_after_close() {
    let fs = MemFs::new();
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut prng = Rand32::new(0xc0ffee);

    {
        let mut opts = mem_options(&fs);
        // A modest buffer so the run covers flushes and compactions too.
        opts.write_buffer_size = 256 << 10;
        let db = Database::open("db", opts).unwrap();
        let write = WriteOptions::default();

        for n in 0..100_000_u32 {
            let mut key = [0_u8; 16];
            key[..4].copy_from_slice(&prng.rand_u32().to_be_bytes());
            key[4..8].copy_from_slice(&prng.rand_u32().to_be_bytes());
            key[8..12].copy_from_slice(&n.to_be_bytes());
            let mut value = vec![0_u8; 100];
            value[..4].copy_from_slice(&prng.rand_u32().to_le_bytes());

            db.put(&write, &key, &value).unwrap();
            model.insert(key.to_vec(), value);
        }
    }

    let reopened = Database::open("db", mem_options(&fs)).unwrap();
    let read = ReadOptions::default();

    for (key, value) in &model {
        assert_eq!(reopened.get(&read, key).unwrap().as_ref(), Some(value));
    }

    let mut iter = reopened.iter(&read).unwrap();
    iter.seek_to_first();
    for (key, value) in &model {
        assert!(iter.valid(), "iterator ended before the model did");
        assert_eq!(iter.key(), key.as_slice());
        assert_eq!(iter.value(), value.as_slice());
        iter.next();
    }
    assert!(!iter.valid());

    // The restored sequence must cover every write.
    let mut probe = WriteBatch::new();
    probe.put(b"probe", b"probe");
    reopened.write(&WriteOptions::default(), probe).unwrap();
    let final_snapshot = reopened.get_snapshot();
    drop(final_snapshot);
}

#[test]
fn reopen_after_deletes_and_compaction() {
    let fs = MemFs::new();
    let write = WriteOptions::default();

    {
        let db = Database::open("db", small_buffer_options(&fs)).unwrap();
        for n in 0..3000_u32 {
            db.put(&write, format!("key{n:05}").as_bytes(), &vec![n as u8; 50]).unwrap();
        }
        for n in (0..3000_u32).step_by(2) {
            db.delete(&write, format!("key{n:05}").as_bytes()).unwrap();
        }
        db.compact_range(None, None).unwrap();
    }

    let db = Database::open("db", small_buffer_options(&fs)).unwrap();
    let read = ReadOptions::default();
    for n in 0..3000_u32 {
        let key = format!("key{n:05}");
        let found = db.get(&read, key.as_bytes()).unwrap();
        if n % 2 == 0 {
            assert_eq!(found, None, "deleted key {key} came back");
        } else {
            assert_eq!(found, Some(vec![n as u8; 50]), "key {key} lost");
        }
    }
}

#[test]
fn sync_writes_survive() {
    let fs = MemFs::new();
    {
        let db = Database::open("db", mem_options(&fs)).unwrap();
        db.put(&WriteOptions { sync: true }, b"durable", b"yes").unwrap();
    }
    let db = Database::open("db", mem_options(&fs)).unwrap();
    assert_eq!(
        db.get(&ReadOptions::default(), b"durable").unwrap(),
        Some(b"yes".to_vec()),
    );
}

#[test]
fn properties_respond() {
    let fs = MemFs::new();
    let db = Database::open("db", small_buffer_options(&fs)).unwrap();
    let write = WriteOptions::default();

    for n in 0..2000_u32 {
        db.put(&write, format!("key{n:05}").as_bytes(), &[7_u8; 100]).unwrap();
    }
    db.compact_until_quiet().unwrap();

    assert!(db.get_property("stratadb.stats").is_some());
    assert!(db.get_property("stratadb.sstables").is_some());
    let level0: usize = db
        .get_property("stratadb.num-files-at-level0")
        .unwrap()
        .parse()
        .unwrap();
    assert!(level0 < 100);
    let usage: usize = db
        .get_property("stratadb.approximate-memory-usage")
        .unwrap()
        .parse()
        .unwrap();
    assert!(usage > 0);

    assert_eq!(db.get_property("stratadb.no-such-property"), None);
    assert_eq!(db.get_property("unprefixed"), None);
}

#[test]
fn approximate_sizes_grow_with_data() {
    let fs = MemFs::new();
    let db = Database::open("db", small_buffer_options(&fs)).unwrap();
    let write = WriteOptions::default();

    for n in 0..4000_u32 {
        db.put(&write, format!("key{n:05}").as_bytes(), &[1_u8; 120]).unwrap();
    }
    db.compact_until_quiet().unwrap();

    let sizes = db.approximate_sizes(&[
        (&b"key00000"[..], &b"key02000"[..]),
        (&b"key00000"[..], &b"key03999"[..]),
        (&b"zz"[..], &b"zzz"[..]),
    ]);
    assert!(sizes[0] > 0);
    assert!(sizes[1] > sizes[0]);
    assert_eq!(sizes[2], 0);
}

#[test]
fn open_missing_without_create_fails() {
    let fs = MemFs::new();
    let mut opts = mem_options(&fs);
    opts.create_if_missing = false;
    assert!(Database::open("db", opts).is_err());
}

#[test]
fn error_if_exists_is_honored() {
    let fs = MemFs::new();
    drop(Database::open("db", mem_options(&fs)).unwrap());

    let mut opts = mem_options(&fs);
    opts.error_if_exists = true;
    assert!(Database::open("db", opts).is_err());
}

#[test]
fn second_open_is_locked_out() {
    let fs = MemFs::new();
    let _db = Database::open("db", mem_options(&fs)).unwrap();
    assert!(Database::open("db", mem_options(&fs)).is_err());
}

#[test]
fn destroy_removes_database_files() {
    let fs = MemFs::new();
    {
        let db = Database::open("db", mem_options(&fs)).unwrap();
        db.put(&WriteOptions::default(), b"k", b"v").unwrap();
    }
    Database::destroy("db", &mem_options(&fs)).unwrap();

    use strata_vfs::FileSystem as _;
    use std::path::Path;
    assert!(!fs.exists(Path::new("db/CURRENT")).unwrap());
    // And a fresh open starts empty.
    let db = Database::open("db", mem_options(&fs)).unwrap();
    assert_eq!(db.get(&ReadOptions::default(), b"k").unwrap(), None);
}

#[test]
fn repair_rebuilds_without_manifest() {
    let fs = MemFs::new();
    {
        let db = Database::open("db", small_buffer_options(&fs)).unwrap();
        let write = WriteOptions::default();
        for n in 0..2000_u32 {
            db.put(&write, format!("key{n:05}").as_bytes(), format!("value{n}").as_bytes())
                .unwrap();
        }
    }

    // Lose the metadata: no CURRENT, no manifests.
    {
        use strata_vfs::FileSystem as _;
        use std::path::Path;
        fs.remove_file(Path::new("db/CURRENT")).unwrap();
        for child in fs.children(Path::new("db")).unwrap() {
            if child.to_string_lossy().starts_with("MANIFEST-") {
                fs.remove_file(&Path::new("db").join(child)).unwrap();
            }
        }
        let mut no_create = mem_options(&fs);
        no_create.create_if_missing = false;
        assert!(Database::open("db", no_create).is_err());
    }

    Database::repair("db", &mem_options(&fs)).unwrap();

    let db = Database::open("db", mem_options(&fs)).unwrap();
    let read = ReadOptions::default();
    for n in 0..2000_u32 {
        assert_eq!(
            db.get(&read, format!("key{n:05}").as_bytes()).unwrap(),
            Some(format!("value{n}").into_bytes()),
            "key{n:05} missing after repair",
        );
    }
}

#[test]
fn reuse_logs_keeps_appending() {
    let fs = MemFs::new();
    let mut opts = mem_options(&fs);
    opts.reuse_logs = true;

    {
        let db = Database::open("db", opts.clone()).unwrap();
        db.put(&WriteOptions::default(), b"first", b"1").unwrap();
    }
    {
        let db = Database::open("db", opts.clone()).unwrap();
        assert_eq!(
            db.get(&ReadOptions::default(), b"first").unwrap(),
            Some(b"1".to_vec()),
        );
        db.put(&WriteOptions::default(), b"second", b"2").unwrap();
    }

    let db = Database::open("db", opts).unwrap();
    let read = ReadOptions::default();
    assert_eq!(db.get(&read, b"first").unwrap(), Some(b"1".to_vec()));
    assert_eq!(db.get(&read, b"second").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn concurrent_writers_all_land() {
    let fs = MemFs::new();
    let db = Arc::new(Database::open("db", mem_options(&fs)).unwrap());

    let threads: Vec<_> = (0..4_u32)
        .map(|thread_id| {
            let db = Arc::clone(&db);
            std::thread::spawn(move || {
                let write = WriteOptions::default();
                for n in 0..500_u32 {
                    let key = format!("t{thread_id}-{n:04}");
                    db.put(&write, key.as_bytes(), key.as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let read = ReadOptions::default();
    for thread_id in 0..4_u32 {
        for n in 0..500_u32 {
            let key = format!("t{thread_id}-{n:04}");
            assert_eq!(
                db.get(&read, key.as_bytes()).unwrap(),
                Some(key.clone().into_bytes()),
            );
        }
    }
}
