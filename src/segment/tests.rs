// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::writer::{write_segment, WriterOptions};
use super::Segment;
use crate::{
    cache::BlockCache,
    entry::{Entry, Value},
    order::KeyOrder,
    time::Time,
    CompressionType, Direction, Slice,
};
use std::ops::Bound;
use std::sync::Arc;
use test_log::test;

fn cache() -> Arc<BlockCache> {
    BlockCache::new(10 * 1_024 * 1_024, std::time::Duration::from_secs(60))
}

fn put(key: &[u8], value: &[u8], time: u64) -> Entry {
    Entry::Point {
        key: Slice::from(key),
        value: Value::Put {
            value: Some(Slice::from(value)),
            deadline: None,
            time: Time::from(time),
        },
    }
}

fn many_puts(n: u32) -> Vec<Entry> {
    (0..n)
        .map(|i| put(format!("key-{i:06}").as_bytes(), &i.to_be_bytes(), 1))
        .collect()
}

fn write_and_open(entries: &[Entry], opts: &WriterOptions) -> crate::Result<(tempfile::TempDir, Segment)> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("0.seg");

    write_segment(&path, entries, &KeyOrder::default(), opts)?;

    let segment = Segment::open(&path, cache(), KeyOrder::default(), crate::MmapPolicy::Disabled)?;
    Ok((dir, segment))
}

#[test]
fn segment_round_trip() -> crate::Result<()> {
    let entries = many_puts(500);
    let (_dir, segment) = write_and_open(&entries, &WriterOptions::default())?;

    assert_eq!(500, segment.point_count());
    assert_eq!(0, segment.range_count());
    assert_eq!(entries, segment.entries()?);
    Ok(())
}

#[test]
fn segment_round_trip_compressed() -> crate::Result<()> {
    let entries = many_puts(500);

    let opts = WriterOptions {
        compression: CompressionType::Lz4,
        ..Default::default()
    };
    let (_dir, segment) = write_and_open(&entries, &opts)?;

    // payloads decompress to bitwise identical entries
    assert_eq!(entries, segment.entries()?);
    Ok(())
}

#[test]
fn segment_round_trip_uncompressed() -> crate::Result<()> {
    let entries = many_puts(100);

    let opts = WriterOptions {
        compression: CompressionType::None,
        ..Default::default()
    };
    let (_dir, segment) = write_and_open(&entries, &opts)?;

    assert_eq!(entries, segment.entries()?);
    Ok(())
}

#[test]
fn segment_footer_key_range_is_authoritative() -> crate::Result<()> {
    let entries = many_puts(250);
    let (_dir, segment) = write_and_open(&entries, &WriterOptions::default())?;

    assert_eq!(b"key-000000", &segment.key_range().min()[..]);
    assert_eq!(b"key-000249", &segment.key_range().max()[..]);
    Ok(())
}

#[test]
fn segment_fetch_exact() -> crate::Result<()> {
    let entries = many_puts(300);
    let (_dir, segment) = write_and_open(&entries, &WriterOptions::default())?;

    for i in [0u32, 1, 17, 100, 255, 299] {
        let key = format!("key-{i:06}");
        let Some(Value::Put {
            value: Some(value), ..
        }) = segment.fetch(key.as_bytes())?
        else {
            panic!("{key} should be found");
        };
        assert_eq!(&i.to_be_bytes()[..], &value[..]);
    }

    assert_eq!(None, segment.fetch(b"key-000300")?);
    assert_eq!(None, segment.fetch(b"aaa")?);
    assert_eq!(None, segment.fetch(b"zzz")?);
    assert_eq!(None, segment.fetch(b"key-0001")?);
    Ok(())
}

#[test]
fn segment_fetch_without_optional_indexes() -> crate::Result<()> {
    let entries = many_puts(100);

    let opts = WriterOptions {
        use_binary_index: false,
        hash_index_ratio: None,
        bloom_fp_rate: None,
        ..Default::default()
    };
    let (_dir, segment) = write_and_open(&entries, &opts)?;

    for i in [0u32, 55, 99] {
        let key = format!("key-{i:06}");
        assert!(segment.fetch(key.as_bytes())?.is_some(), "{key} should be found");
    }
    assert_eq!(None, segment.fetch(b"key-000100")?);
    Ok(())
}

#[test]
fn segment_fetch_covering_range() -> crate::Result<()> {
    let entries = vec![
        put(b"a", b"1", 1),
        Entry::Range {
            from_key: Slice::from(b"b"),
            to_key: Slice::from(b"f"),
            from_value: Some(Value::Put {
                value: Some(Slice::from(b"edge")),
                deadline: None,
                time: Time::from(2),
            }),
            range_value: Value::Remove {
                deadline: None,
                time: Time::from(2),
            },
        },
        put(b"m", b"3", 1),
    ];

    let (_dir, segment) = write_and_open(&entries, &WriterOptions::default())?;
    assert_eq!(1, segment.range_count());

    // exact point
    assert!(matches!(segment.fetch(b"a")?, Some(Value::Put { .. })));

    // range start resolves to the edge payload
    let Some(Value::Put {
        value: Some(edge), ..
    }) = segment.fetch(b"b")?
    else {
        panic!("range start should resolve to its edge value");
    };
    assert_eq!(b"edge", &edge[..]);

    // covered keys resolve to the range payload
    assert!(matches!(segment.fetch(b"c")?, Some(Value::Remove { .. })));
    assert!(matches!(segment.fetch(b"e")?, Some(Value::Remove { .. })));

    // the interval end is exclusive
    assert_eq!(None, segment.fetch(b"f")?);
    assert!(matches!(segment.fetch(b"m")?, Some(Value::Put { .. })));
    Ok(())
}

#[test]
fn segment_with_ranges_has_no_bloom_filter() -> crate::Result<()> {
    let entries = vec![
        put(b"a", b"1", 1),
        Entry::Range {
            from_key: Slice::from(b"b"),
            to_key: Slice::from(b"f"),
            from_value: None,
            range_value: Value::Remove {
                deadline: None,
                time: Time::from(2),
            },
        },
    ];

    let (_dir, segment) = write_and_open(&entries, &WriterOptions::default())?;
    assert!(segment.footer.bloom_filter.is_none());

    let points_only = many_puts(10);
    let (_dir2, segment) = write_and_open(&points_only, &WriterOptions::default())?;
    assert!(segment.footer.bloom_filter.is_some());
    Ok(())
}

#[test]
fn segment_floor_and_ceiling() -> crate::Result<()> {
    let entries = vec![
        put(b"b", b"1", 1),
        put(b"d", b"2", 1),
        put(b"f", b"3", 1),
    ];
    let (_dir, segment) = write_and_open(&entries, &WriterOptions::default())?;

    assert_eq!(
        b"b",
        &segment.floor_entry(b"c")?.expect("some").start_key()[..]
    );
    assert_eq!(
        b"d",
        &segment.floor_entry(b"d")?.expect("some").start_key()[..]
    );
    assert_eq!(None, segment.floor_entry(b"a")?);

    assert_eq!(
        b"d",
        &segment.ceiling_entry(b"c")?.expect("some").start_key()[..]
    );
    assert_eq!(
        b"b",
        &segment.ceiling_entry(b"a")?.expect("some").start_key()[..]
    );
    assert_eq!(None, segment.ceiling_entry(b"g")?);
    Ok(())
}

#[test]
fn segment_iter_forward() -> crate::Result<()> {
    let entries = many_puts(100);
    let (_dir, segment) = write_and_open(&entries, &WriterOptions::default())?;

    let collected: Vec<Entry> = segment
        .iter((Bound::Unbounded, Bound::Unbounded), Direction::Forward)?
        .collect::<crate::Result<_>>()?;

    assert_eq!(entries, collected);
    Ok(())
}

#[test]
fn segment_iter_backward() -> crate::Result<()> {
    let entries = many_puts(100);
    let (_dir, segment) = write_and_open(&entries, &WriterOptions::default())?;

    let collected: Vec<Entry> = segment
        .iter((Bound::Unbounded, Bound::Unbounded), Direction::Backward)?
        .collect::<crate::Result<_>>()?;

    let mut reversed = entries;
    reversed.reverse();
    assert_eq!(reversed, collected);
    Ok(())
}

#[test]
fn segment_iter_bounded() -> crate::Result<()> {
    let entries = many_puts(100);
    let (_dir, segment) = write_and_open(&entries, &WriterOptions::default())?;

    let collected: Vec<Entry> = segment
        .iter(
            (
                Bound::Included(Slice::from(b"key-000010")),
                Bound::Excluded(Slice::from(b"key-000020")),
            ),
            Direction::Forward,
        )?
        .collect::<crate::Result<_>>()?;

    assert_eq!(10, collected.len());
    assert_eq!(b"key-000010", &collected[0].start_key()[..]);
    assert_eq!(b"key-000019", &collected[9].start_key()[..]);
    Ok(())
}

#[test]
fn segment_reopen() -> crate::Result<()> {
    let entries = many_puts(50);

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("7.seg");
    write_segment(&path, &entries, &KeyOrder::default(), &WriterOptions::default())?;

    for _ in 0..2 {
        let segment = Segment::open(
            &path,
            cache(),
            KeyOrder::default(),
            crate::MmapPolicy::Disabled,
        )?;
        assert_eq!(7, segment.id());
        assert_eq!(entries, segment.entries()?);
    }
    Ok(())
}

#[test]
fn segment_open_with_mmap() -> crate::Result<()> {
    let entries = many_puts(50);

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("3.seg");
    write_segment(&path, &entries, &KeyOrder::default(), &WriterOptions::default())?;

    let segment = Segment::open(
        &path,
        cache(),
        KeyOrder::default(),
        crate::MmapPolicy::ReadOnly,
    )?;
    assert_eq!(entries, segment.entries()?);
    assert!(segment.fetch(b"key-000010")?.is_some());
    Ok(())
}

#[test]
fn segment_corrupt_footer_is_rejected() -> crate::Result<()> {
    let entries = many_puts(50);

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("0.seg");
    write_segment(&path, &entries, &KeyOrder::default(), &WriterOptions::default())?;

    // flip a byte inside the footer block
    let mut raw = std::fs::read(&path)?;
    let len = raw.len();
    raw[len - 20] ^= 0xFF;
    std::fs::write(&path, raw)?;

    assert!(Segment::open(
        &path,
        cache(),
        KeyOrder::default(),
        crate::MmapPolicy::Disabled,
    )
    .is_err());
    Ok(())
}

#[test]
fn segment_bad_magic_is_rejected() -> crate::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("0.seg");
    std::fs::write(&path, b"NOPEnope-no-segment-here-at-all!")?;

    assert!(matches!(
        Segment::open(
            &path,
            cache(),
            KeyOrder::default(),
            crate::MmapPolicy::Disabled,
        ),
        Err(crate::Error::CorruptedBlock(_))
    ));
    Ok(())
}

#[test]
fn segment_concurrent_reads_with_tiny_cache() -> crate::Result<()> {
    let entries = many_puts(200);

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("0.seg");
    write_segment(&path, &entries, &KeyOrder::default(), &WriterOptions::default())?;

    // 1-byte budget: every read degrades to a direct, uncached load
    let tiny_cache = BlockCache::new(1, std::time::Duration::from_millis(200));
    let segment = Arc::new(Segment::open(
        &path,
        tiny_cache.clone(),
        KeyOrder::default(),
        crate::MmapPolicy::Disabled,
    )?);

    let threads: Vec<_> = (0..16u32)
        .map(|t| {
            let segment = segment.clone();
            std::thread::spawn(move || -> crate::Result<()> {
                for i in 0..50u32 {
                    let i = (i * 7 + t) % 200;
                    let key = format!("key-{i:06}");
                    assert!(segment.fetch(key.as_bytes())?.is_some());
                }
                Ok(())
            })
        })
        .collect();

    for thread in threads {
        thread.join().expect("should join")?;
    }

    std::thread::sleep(std::time::Duration::from_secs(1));
    assert!(tiny_cache.is_empty());
    Ok(())
}
