use std::path::Path;
use std::sync::Arc;

use strata_sstable::{
    BloomFilterPolicy, BlockCache, BytewiseComparator, Compression, ReadTableOptions,
    SeekableIterator as _, Table, TableBuilder, WriteTableOptions,
};
use strata_vfs::{FileSystem as _, MemFs};


fn write_opts() -> WriteTableOptions {
    WriteTableOptions {
        comparator:       Arc::new(BytewiseComparator),
        filter_policy:    Some(Arc::new(BloomFilterPolicy::default())),
        block_size:       1024,
        restart_interval: 16,
        compression:      Compression::Snappy,
    }
}

fn read_opts() -> ReadTableOptions {
    ReadTableOptions {
        comparator:       Arc::new(BytewiseComparator),
        filter_policy:    Some(Arc::new(BloomFilterPolicy::default())),
        block_cache:      Some(Arc::new(BlockCache::new(1 << 20))),
        cache_id:         1,
        verify_checksums: true,
    }
}

/// 1000 sorted keys with values large enough to span many data blocks.
fn entries() -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..1000_u32)
        .map(|n| {
            let key = format!("key{n:06}").into_bytes();
            let value = format!("value-{n}-{}", "x".repeat(n as usize % 50)).into_bytes();
            (key, value)
        })
        .collect()
}

fn build_table(fs: &MemFs, path: &Path) -> u64 {
    let file = fs.create(path).unwrap();
    let mut builder = TableBuilder::new(file, write_opts());
    for (key, value) in entries() {
        builder.add(&key, &value).unwrap();
    }
    builder.finish(true).unwrap()
}

#[test]
fn build_then_open_and_get() {
    let fs = MemFs::new();
    let path = Path::new("000123.ldb");
    let file_size = build_table(&fs, path);
    assert_eq!(fs.size_of(path).unwrap(), file_size);

    let table = Table::open(fs.open_random_access(path).unwrap(), file_size, read_opts()).unwrap();

    for (key, value) in entries() {
        let (found_key, found_value) = table.get(&key).unwrap().expect("key must be found");
        assert_eq!(found_key, key);
        assert_eq!(found_value, value);
    }

    // A missing key seeks to the following entry or nothing; never errors.
    let miss = table.get(b"key0005000").unwrap();
    if let Some((found_key, _)) = miss {
        assert_ne!(found_key, b"key0005000".to_vec());
    }
    assert!(table.get(b"zzz").unwrap().is_none());
}

#[test]
fn iterate_forward_and_backward() {
    let fs = MemFs::new();
    let path = Path::new("000124.ldb");
    let file_size = build_table(&fs, path);

    let table = Table::open(fs.open_random_access(path).unwrap(), file_size, read_opts()).unwrap();
    let expected = entries();

    let mut iter = table.iter();
    iter.seek_to_first();
    let mut count = 0;
    while iter.valid() {
        assert_eq!(iter.key(), expected[count].0.as_slice());
        assert_eq!(iter.value(), expected[count].1.as_slice());
        count += 1;
        iter.next();
    }
    assert_eq!(count, expected.len());
    iter.status().unwrap();

    iter.seek_to_last();
    let mut backward = 0;
    while iter.valid() {
        backward += 1;
        assert_eq!(iter.key(), expected[expected.len() - backward].0.as_slice());
        iter.prev();
    }
    assert_eq!(backward, expected.len());
}

#[test]
fn seek_lands_on_smallest_geq() {
    let fs = MemFs::new();
    let path = Path::new("000125.ldb");
    let file_size = build_table(&fs, path);

    let table = Table::open(fs.open_random_access(path).unwrap(), file_size, read_opts()).unwrap();
    let mut iter = table.iter();

    iter.seek(b"key000500");
    assert_eq!(iter.key(), b"key000500");

    iter.seek(b"key0005001");
    assert_eq!(iter.key(), b"key000501");

    iter.seek(b"a");
    assert_eq!(iter.key(), b"key000000");

    iter.seek(b"zzz");
    assert!(!iter.valid());
}

#[test]
fn open_without_filter_policy_still_reads() {
    let fs = MemFs::new();
    let path = Path::new("000126.ldb");
    let file_size = build_table(&fs, path);

    let mut opts = read_opts();
    opts.filter_policy = None;
    opts.block_cache = None;
    let table = Table::open(fs.open_random_access(path).unwrap(), file_size, opts).unwrap();

    let (_, value) = table.get(b"key000042").unwrap().unwrap();
    assert_eq!(value, format!("value-42-{}", "x".repeat(42)).into_bytes());
}

#[test]
fn corrupt_footer_fails_open() {
    let fs = MemFs::new();
    let path = Path::new("000127.ldb");
    let file_size = build_table(&fs, path);

    // Stomp the magic number.
    let mut contents = Vec::new();
    {
        use std::io::Read as _;
        fs.open_sequential(path).unwrap().read_to_end(&mut contents).unwrap();
    }
    let last = contents.len() - 1;
    contents[last] ^= 0xff;
    {
        use std::io::Write as _;
        fs.create(path).unwrap().write_all(&contents).unwrap();
    }

    assert!(Table::open(fs.open_random_access(path).unwrap(), file_size, read_opts()).is_err());
}

#[test]
fn flipped_block_bit_is_detected() {
    let fs = MemFs::new();
    let path = Path::new("000128.ldb");
    let file_size = build_table(&fs, path);

    let mut contents = Vec::new();
    {
        use std::io::Read as _;
        fs.open_sequential(path).unwrap().read_to_end(&mut contents).unwrap();
    }
    // Flip one bit early in the first data block.
    contents[10] ^= 0x01;
    {
        use std::io::Write as _;
        fs.create(path).unwrap().write_all(&contents).unwrap();
    }

    let table = Table::open(fs.open_random_access(path).unwrap(), file_size, read_opts()).unwrap();
    // The damaged block must surface as corruption, not wrong data.
    let mut saw_error = false;
    for (key, value) in entries().into_iter().take(50) {
        match table.get(&key) {
            Ok(Some((_, found_value))) => assert_eq!(found_value, value),
            Ok(None) | Err(_) => {
                saw_error = true;
                break;
            }
        }
    }
    assert!(saw_error, "bit flip in a data block went unnoticed");
}

#[test]
fn approximate_offsets_increase() {
    let fs = MemFs::new();
    let path = Path::new("000129.ldb");
    let file_size = build_table(&fs, path);

    let table = Table::open(fs.open_random_access(path).unwrap(), file_size, read_opts()).unwrap();

    let early = table.approximate_offset_of(b"key000001");
    let middle = table.approximate_offset_of(b"key000500");
    let late = table.approximate_offset_of(b"zzz");
    assert!(early <= middle);
    assert!(middle < late);
    assert!(late <= file_size);
}
