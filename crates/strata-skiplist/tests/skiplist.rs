use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::thread;

use oorandom::Rand32;

use strata_skiplist::{BytewiseComparator, SkipList};


#[test]
fn empty_list() {
    let list = SkipList::new(BytewiseComparator);

    assert!(!list.contains(&[]));
    assert!(!list.contains(&[0]));
    assert!(!list.contains(&[255]));
    assert_eq!(list.allocated_bytes(), 0);

    let mut iter = list.iter();
    assert!(!iter.valid());
    assert!(iter.current().is_none());
    assert!(iter.next().is_none());
    assert!(iter.prev().is_none());

    iter.seek_to_first();
    assert!(!iter.valid());
    iter.seek_to_last();
    assert!(!iter.valid());
    iter.seek(b"anything");
    assert!(!iter.valid());
}

#[test]
fn insert_and_contains() {
    let list = SkipList::new(BytewiseComparator);

    assert!(list.insert_copy(b"bravo"));
    assert!(list.insert_copy(b"alpha"));
    assert!(list.insert_copy(b"charlie"));
    // Duplicate inserts are rejected.
    assert!(!list.insert_copy(b"bravo"));

    assert!(list.contains(b"alpha"));
    assert!(list.contains(b"bravo"));
    assert!(list.contains(b"charlie"));
    assert!(!list.contains(b"delta"));
    assert!(list.allocated_bytes() > 0);
}

#[test]
fn insert_with_builds_in_place() {
    let list = SkipList::new(BytewiseComparator);

    assert!(list.insert_with(5, |buf| buf.copy_from_slice(b"hello")));
    assert!(list.contains(b"hello"));
}

#[test]
fn iteration_is_sorted() {
    let list = SkipList::new(BytewiseComparator);
    let mut model = BTreeSet::new();
    let mut prng = Rand32::new(0x5eed);

    for _ in 0..2000 {
        let key = prng.rand_u32().to_be_bytes();
        model.insert(key.to_vec());
        list.insert_copy(&key);
    }

    let mut iter = list.iter();
    iter.seek_to_first();
    for expected in &model {
        assert_eq!(iter.current().unwrap(), expected.as_slice());
        iter.next();
    }
    assert!(!iter.valid());
}

#[test]
fn seek_and_prev() {
    let list = SkipList::new(BytewiseComparator);
    for key in [&b"100"[..], b"200", b"300", b"400"] {
        list.insert_copy(key);
    }

    let mut iter = list.iter();

    iter.seek(b"250");
    assert_eq!(iter.current().unwrap(), b"300");
    assert_eq!(iter.prev().unwrap(), b"200");
    assert_eq!(iter.prev().unwrap(), b"100");
    assert!(iter.prev().is_none());
    assert!(!iter.valid());

    iter.seek(b"400");
    assert_eq!(iter.current().unwrap(), b"400");
    assert!(iter.next().is_none());

    iter.seek(b"401");
    assert!(!iter.valid());

    iter.seek_to_last();
    assert_eq!(iter.current().unwrap(), b"400");
}

#[test]
fn owned_iter_outlives_handle() {
    let list = SkipList::new(BytewiseComparator);
    list.insert_copy(b"k1");
    list.insert_copy(b"k2");

    let mut iter = list.owned_iter();
    drop(list);

    iter.seek_to_first();
    assert_eq!(iter.current().unwrap(), b"k1");
    assert_eq!(iter.next().unwrap(), b"k2");
    assert!(iter.next().is_none());
}

#[test]
fn concurrent_readers_observe_sorted_prefix() {
    let list = SkipList::new(BytewiseComparator);
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let list = list.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(AtomicOrdering::Relaxed) {
                    let mut iter = list.iter();
                    iter.seek_to_first();
                    let mut previous: Option<Vec<u8>> = None;
                    while let Some(entry) = iter.current() {
                        if let Some(previous) = &previous {
                            assert!(previous.as_slice() < entry);
                        }
                        previous = Some(entry.to_vec());
                        iter.next();
                    }
                }
            })
        })
        .collect();

    for key in 0_u32..5000 {
        list.insert_copy(&key.to_be_bytes());
    }
    stop.store(true, AtomicOrdering::Relaxed);

    for reader in readers {
        reader.join().unwrap();
    }

    assert!(list.contains(&0_u32.to_be_bytes()));
    assert!(list.contains(&4999_u32.to_be_bytes()));
}
