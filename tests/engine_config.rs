use lsm_engine::{
    CommitterMode, Config, Direction, KeyOrder, LevelConfig, MmapPolicy, OptimiseWrites,
};
use test_log::test;

fn small_levels() -> Vec<LevelConfig> {
    vec![
        LevelConfig {
            target_segment_size: 16 * 1_024,
            threshold_bytes: 32 * 1_024,
            ..Default::default()
        },
        LevelConfig {
            target_segment_size: 16 * 1_024,
            threshold_bytes: 256 * 1_024,
            ..Default::default()
        },
    ]
}

#[test]
fn current_thread_committer_flushes_and_compacts() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder)
        .levels(small_levels())
        .committer_mode(CommitterMode::CurrentThread)
        .open()?;

    for i in 0..1_000u32 {
        db.put(format!("key-{i:05}"), [3u8; 64])?;
    }
    db.flush()?;
    db.compact()?;

    for i in (0..1_000u32).step_by(111) {
        let key = format!("key-{i:05}");
        assert!(db.get(key.as_bytes())?.is_some());
    }
    Ok(())
}

#[test]
fn sequential_order_write_path_round_trips() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder)
        .levels(small_levels())
        .optimise_writes(OptimiseWrites::SequentialOrder {
            atomic: false,
            initial_skip_list_length: 128,
        })
        .open()?;

    // strictly ascending keys ride the fast path
    for i in 0..500u32 {
        db.put(i.to_be_bytes(), format!("{i}"))?;
    }

    // a backwards write forces migration, nothing is lost
    db.put(42u32.to_be_bytes(), "rewritten")?;

    assert_eq!(
        Some("rewritten".into()),
        db.get(&42u32.to_be_bytes())?.expect("should exist").value
    );
    assert_eq!(
        Some("499".into()),
        db.get(&499u32.to_be_bytes())?.expect("should exist").value
    );

    db.flush()?;
    assert!(db.get(&123u32.to_be_bytes())?.is_some());
    Ok(())
}

#[test]
fn reverse_key_order_sorts_iteration_descending() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder)
        .levels(small_levels())
        .key_order(KeyOrder::Reverse)
        .open()?;

    db.put("a", "1")?;
    db.put("m", "2")?;
    db.put("z", "3")?;
    db.flush()?;

    let keys: Vec<String> = db
        .iter(Direction::Forward)?
        .map(|item| item.map(|(key, _)| String::from_utf8_lossy(&key).into_owned()))
        .collect::<lsm_engine::Result<_>>()?;

    // "forward" follows the configured order
    assert_eq!(vec!["z", "m", "a"], keys);

    assert!(db.get(b"m")?.is_some());
    Ok(())
}

#[test]
fn mmap_policies_read_identically() -> lsm_engine::Result<()> {
    for policy in [
        MmapPolicy::Disabled,
        MmapPolicy::ReadOnly,
        MmapPolicy::WriteAndRead,
    ] {
        let folder = tempfile::tempdir()?;

        {
            let db = Config::new(&folder)
                .levels(small_levels())
                .mmap_policy(policy)
                .open()?;

            for i in 0..200u32 {
                db.put(format!("key-{i:05}"), format!("value-{i}"))?;
            }
            db.close()?;
        }

        let db = Config::new(&folder)
            .levels(small_levels())
            .mmap_policy(policy)
            .open()?;

        for i in (0..200u32).step_by(17) {
            let key = format!("key-{i:05}");
            let item = db.get(key.as_bytes())?.expect("should exist");
            assert_eq!(Some(format!("value-{i}").into()), item.value);
        }
    }
    Ok(())
}

#[test]
fn uncompressed_blocks_round_trip() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;

    let levels = vec![LevelConfig {
        target_segment_size: 16 * 1_024,
        threshold_bytes: 32 * 1_024,
        writer: lsm_engine::WriterOptions {
            compression: lsm_engine::CompressionType::None,
            ..Default::default()
        },
    }];

    let db = Config::new(&folder).levels(levels).open()?;

    for i in 0..300u32 {
        db.put(format!("key-{i:05}"), format!("value-{i}"))?;
    }
    db.flush()?;

    for i in (0..300u32).step_by(23) {
        let key = format!("key-{i:05}");
        assert!(db.get(key.as_bytes())?.is_some());
    }
    Ok(())
}

#[test]
fn tiny_block_cache_degrades_gracefully() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Config::new(&folder)
        .levels(small_levels())
        .block_cache(1, std::time::Duration::from_millis(100))
        .open()?;

    for i in 0..300u32 {
        db.put(format!("key-{i:05}"), format!("value-{i}"))?;
    }
    db.flush()?;

    // every read degrades to a direct, uncached block load
    for i in (0..300u32).step_by(7) {
        let key = format!("key-{i:05}");
        assert!(db.get(key.as_bytes())?.is_some());
    }
    Ok(())
}
