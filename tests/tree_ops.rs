//! Tree operation coverage: round trips, replacement, splits, overflow
//! values, and removal down to the empty tree.

use std::sync::Arc;

use sectordb::{
    BlockCache, Config, Counter, Error, Key, MemDevice, RawData, Store, MAX_INLINE_VALUE,
};

fn mem_store(sectors: u64) -> Store {
    let config = Config::default();
    let cache = BlockCache::new(config.cache_entries);
    Store::format(cache, Arc::new(MemDevice::new(sectors)), &config).unwrap()
}

fn put(store: &Store, key: Key, bytes: &[u8]) {
    let mut payload = bytes.to_vec();
    let mut txn = store.begin().unwrap();
    txn.insert(key, &RawData::new(&mut payload)).unwrap();
    txn.commit().unwrap();
}

fn get(store: &Store, key: Key) -> sectordb::Result<Vec<u8>> {
    let mut buf = vec![0u8; 4096];
    let mut dest = RawData::new(&mut buf);
    let mut txn = store.begin().unwrap();
    let size = txn.get(key, &mut dest)?;
    assert_eq!(size, dest.len());
    Ok(dest.bytes().to_vec())
}

fn del(store: &Store, key: Key) -> sectordb::Result<()> {
    let mut txn = store.begin().unwrap();
    txn.remove(key)?;
    txn.commit()
}

#[test]
fn empty_tree_lookup_is_key_not_found() {
    let store = mem_store(64);
    assert!(matches!(get(&store, Key::new(0, 1, 0)), Err(Error::KeyNotFound)));
}

#[test]
fn single_key_round_trip() {
    let store = mem_store(64);
    let key = Key::new(7, 123, 456);

    put(&store, key, b"the quick brown fox");
    assert_eq!(get(&store, key).unwrap(), b"the quick brown fox");
}

#[test]
fn insert_replaces_existing_value() {
    let store = mem_store(128);
    let key = Key::new(0, 9, 0);

    put(&store, key, b"first");
    put(&store, key, b"a considerably longer second value");
    assert_eq!(
        get(&store, key).unwrap(),
        b"a considerably longer second value"
    );
}

#[test]
fn transaction_reads_its_own_writes() {
    let store = mem_store(64);
    let key = Key::new(1, 1, 1);

    let mut payload = b"visible before commit".to_vec();
    let mut txn = store.begin().unwrap();
    txn.insert(key, &RawData::new(&mut payload)).unwrap();

    let mut buf = [0u8; 64];
    let mut dest = RawData::new(&mut buf);
    let size = txn.get(key, &mut dest).unwrap();
    assert_eq!(&buf[..size as usize], b"visible before commit");
    txn.commit().unwrap();
}

#[test]
fn keys_are_ordered_by_kind_major_minor() {
    let store = mem_store(256);

    // Same major, different kinds and minors must stay distinct.
    put(&store, Key::new(0, 5, 0), b"k0");
    put(&store, Key::new(1, 5, 0), b"k1");
    put(&store, Key::new(0, 5, 9), b"m9");

    assert_eq!(get(&store, Key::new(0, 5, 0)).unwrap(), b"k0");
    assert_eq!(get(&store, Key::new(1, 5, 0)).unwrap(), b"k1");
    assert_eq!(get(&store, Key::new(0, 5, 9)).unwrap(), b"m9");
}

#[test]
fn thousand_keys_split_and_survive() {
    let store = mem_store(16 * 1024);

    let value_for = |i: u64| {
        let len = 1 + (i % 41) as usize;
        vec![(128u64.wrapping_sub(i) % 256) as u8; len]
    };

    for i in 0..1000u64 {
        put(&store, Key::new(0, i, 0), &value_for(i));
    }
    // Trees of this size have split several times; every key and every
    // value length must still be exact.
    for i in 0..1000u64 {
        assert_eq!(get(&store, Key::new(0, i, 0)).unwrap(), value_for(i), "key {i}");
    }
    assert!(matches!(
        get(&store, Key::new(0, 1000, 0)),
        Err(Error::KeyNotFound)
    ));
}

#[test]
fn thousand_minor_keys_removed_in_descending_order() {
    let store = mem_store(32 * 1024);
    let key = |i: u64| Key::new(0, 1, i);
    let value = |i: u64| [128u8.wrapping_sub(i as u8)];

    for i in 0..1000u64 {
        put(&store, key(i), &value(i));
    }
    for i in 0..1000u64 {
        assert_eq!(get(&store, key(i)).unwrap(), value(i), "minor {i}");
    }

    // Peel from the top. After each removal the removed key is gone and its
    // lower neighbor is untouched.
    for i in (0..1000u64).rev() {
        del(&store, key(i)).unwrap();
        assert!(matches!(get(&store, key(i)), Err(Error::KeyNotFound)), "minor {i}");
        if i > 0 {
            assert_eq!(get(&store, key(i - 1)).unwrap(), value(i - 1), "minor {}", i - 1);
        }
    }
    assert!(matches!(get(&store, key(0)), Err(Error::KeyNotFound)));
}

#[test]
fn descending_insert_then_ascending_read() {
    let store = mem_store(8 * 1024);

    for i in (0..400u64).rev() {
        put(&store, Key::new(0, i, 0), &i.to_le_bytes());
    }
    for i in 0..400u64 {
        assert_eq!(get(&store, Key::new(0, i, 0)).unwrap(), i.to_le_bytes());
    }
}

#[test]
fn reverse_removal_empties_the_tree() {
    let store = mem_store(16 * 1024);
    let n = 300u64;

    for i in 0..n {
        put(&store, Key::new(0, i, 0), &i.to_le_bytes());
    }
    for i in (0..n).rev() {
        del(&store, Key::new(0, i, 0)).unwrap();
        assert!(matches!(
            get(&store, Key::new(0, i, 0)),
            Err(Error::KeyNotFound)
        ));
        if i > 0 {
            // The rest of the tree stays intact after each removal.
            assert_eq!(get(&store, Key::new(0, i - 1, 0)).unwrap(), (i - 1).to_le_bytes());
        }
    }

    // Emptied tree is still a usable tree.
    put(&store, Key::new(0, 42, 0), b"reborn");
    assert_eq!(get(&store, Key::new(0, 42, 0)).unwrap(), b"reborn");
}

#[test]
fn remove_interleaved_keys() {
    let store = mem_store(8 * 1024);

    for i in 0..200u64 {
        put(&store, Key::new(0, i, 0), &[i as u8]);
    }
    for i in (0..200u64).step_by(2) {
        del(&store, Key::new(0, i, 0)).unwrap();
    }
    for i in 0..200u64 {
        let result = get(&store, Key::new(0, i, 0));
        if i % 2 == 0 {
            assert!(matches!(result, Err(Error::KeyNotFound)), "key {i}");
        } else {
            assert_eq!(result.unwrap(), [i as u8], "key {i}");
        }
    }
}

#[test]
fn remove_missing_key_allocates_nothing() {
    let store = mem_store(64);
    put(&store, Key::new(0, 1, 0), b"present");

    let before = store.sectors_allocated();
    let err = del(&store, Key::new(0, 2, 0)).unwrap_err();
    assert!(matches!(err, Error::KeyNotFound));
    assert_eq!(store.sectors_allocated(), before);
}

#[test]
fn largest_inline_value_stays_inline() {
    let store = mem_store(256);
    let key = Key::new(0, 1, 0);
    let value = vec![0x3C; MAX_INLINE_VALUE];

    let before = store.sectors_allocated();
    put(&store, key, &value);
    // Root rebuild only: one fresh leaf, no overflow sector.
    assert_eq!(store.sectors_allocated(), before + 1);
    assert_eq!(get(&store, key).unwrap(), value);
}

#[test]
fn two_large_inline_values_split_into_siblings() {
    let store = mem_store(256);
    let small = Key::new(0, 1, 0);
    let large = Key::new(0, 2, 0);

    // Together these exceed one sector, so the second insert replays the
    // leaf into two siblings rather than packing both payloads.
    put(&store, small, &vec![0xAA; 2000]);
    put(&store, large, &vec![0xBB; MAX_INLINE_VALUE]);

    assert_eq!(get(&store, small).unwrap(), vec![0xAA; 2000]);
    assert_eq!(get(&store, large).unwrap(), vec![0xBB; MAX_INLINE_VALUE]);
}

#[test]
fn value_past_inline_limit_goes_to_overflow() {
    let store = mem_store(256);
    let key = Key::new(0, 1, 0);
    let value: Vec<u8> = (0..MAX_INLINE_VALUE + 1).map(|i| i as u8).collect();

    let before = store.sectors_allocated();
    put(&store, key, &value);
    // One overflow sector plus the rebuilt leaf.
    assert_eq!(store.sectors_allocated(), before + 2);
    assert_eq!(get(&store, key).unwrap(), value);
}

#[test]
fn near_sector_sized_value_round_trips() {
    let store = mem_store(256);
    let key = Key::new(0, 2, 0);
    let value = vec![0xA5; 4095];

    put(&store, key, &value);
    assert_eq!(get(&store, key).unwrap(), value);
}

#[test]
fn sector_sized_value_is_rejected() {
    let store = mem_store(256);
    let mut payload = vec![0u8; 4096];
    let mut txn = store.begin().unwrap();
    let err = txn
        .insert(Key::new(0, 1, 0), &RawData::new(&mut payload))
        .unwrap_err();
    assert!(matches!(err, Error::DataTooBig { .. }));
}

#[test]
fn overflow_value_replaced_by_inline_value() {
    let store = mem_store(256);
    let key = Key::new(0, 3, 0);

    put(&store, key, &vec![1u8; MAX_INLINE_VALUE + 100]);
    put(&store, key, b"tiny now");
    assert_eq!(get(&store, key).unwrap(), b"tiny now");
}

#[test]
fn undersized_destination_is_data_too_big() {
    let store = mem_store(64);
    let key = Key::new(0, 1, 0);
    put(&store, key, b"twelve bytes");

    let mut small = [0u8; 4];
    let mut dest = RawData::new(&mut small);
    let mut txn = store.begin().unwrap();
    let err = txn.get(key, &mut dest).unwrap_err();
    assert!(matches!(
        err,
        Error::DataTooBig {
            actual: 12,
            capacity: 4
        }
    ));
}

#[test]
fn exact_size_destination_is_enforced() {
    let store = mem_store(64);
    let key = Key::new(0, 1, 0);
    // Five bytes fit a Counter's capacity but are not its exact size.
    put(&store, key, b"five!");

    let mut counter = Counter::default();
    let mut txn = store.begin().unwrap();
    let err = txn.get(key, &mut counter).unwrap_err();
    assert!(matches!(err, Error::SizeNotAcceptable { actual: 5 }));

    put(&store, key, &42u64.to_le_bytes());
    let mut txn = store.begin().unwrap();
    txn.get(key, &mut counter).unwrap();
    assert_eq!(counter, Counter(42));
}

#[test]
fn device_exhaustion_surfaces_as_out_of_space() {
    // Two sectors: format takes one, the first insert takes the other,
    // the next insert has nowhere to go.
    let store = mem_store(2);
    put(&store, Key::new(0, 1, 0), b"fits");

    let mut payload = b"does not".to_vec();
    let mut txn = store.begin().unwrap();
    let err = txn
        .insert(Key::new(0, 2, 0), &RawData::new(&mut payload))
        .unwrap_err();
    assert!(matches!(err, Error::OutOfSpace));
}
