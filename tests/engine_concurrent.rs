use lsm_engine::{Config, LevelConfig, OptimiseWrites};
use std::sync::{
    atomic::{AtomicBool, Ordering::Relaxed},
    Arc,
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
fn concurrent_readers_during_writes_and_flushes() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Arc::new(
        Config::new(&folder)
            .levels(small_levels())
            .memtable_threshold(8 * 1_024)
            .compaction_throttle(std::time::Duration::from_millis(5))
            .open()?,
    );

    // a prefix of keys that is always present
    for i in 0..100u32 {
        db.put(format!("stable-{i:04}"), "v")?;
    }

    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..8u32)
        .map(|t| {
            let db = db.clone();
            let stop = stop.clone();
            std::thread::spawn(move || -> lsm_engine::Result<()> {
                let mut i = 0u32;
                while !stop.load(Relaxed) {
                    let key = format!("stable-{:04}", (i * 13 + t) % 100);
                    assert!(db.get(key.as_bytes())?.is_some(), "{key} went missing");
                    i += 1;
                }
                Ok(())
            })
        })
        .collect();

    // writer churns fresh keys, forcing rotations and background flushes
    for i in 0..2_000u32 {
        db.put(format!("churn-{i:06}"), [0u8; 64])?;
    }

    stop.store(true, Relaxed);
    for reader in readers {
        reader.join().expect("should join")?;
    }

    db.flush()?;
    db.compact()?;

    for i in 0..100u32 {
        let key = format!("stable-{i:04}");
        assert!(db.get(key.as_bytes())?.is_some());
    }
    Ok(())
}

#[test]
fn atomic_batches_are_observed_all_or_nothing() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Arc::new(
        Config::new(&folder)
            .optimise_writes(OptimiseWrites::RandomOrder { atomic: true })
            .open()?,
    );

    let stop = Arc::new(AtomicBool::new(false));

    let reader = {
        let db = db.clone();
        let stop = stop.clone();
        std::thread::spawn(move || -> lsm_engine::Result<()> {
            while !stop.load(Relaxed) {
                // the batch writes "first" before "second"; because
                // batches publish atomically, observing "first" implies
                // "second" is (and stays) observable
                if db.get(b"first")?.is_some() {
                    assert!(
                        db.get(b"second")?.is_some(),
                        "observed a torn batch"
                    );
                }
            }
            Ok(())
        })
    };

    for i in 0..500u32 {
        db.write(vec![
            lsm_engine::WriteOp::Put {
                key: "first".into(),
                value: Some(i.to_be_bytes().into()),
                deadline: None,
            },
            lsm_engine::WriteOp::Put {
                key: "second".into(),
                value: Some(i.to_be_bytes().into()),
                deadline: None,
            },
        ])?;
    }

    stop.store(true, Relaxed);
    reader.join().expect("should join")?;
    Ok(())
}

#[test]
fn concurrent_writers_on_disjoint_keys() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Arc::new(Config::new(&folder).levels(small_levels()).open()?);

    let writers: Vec<_> = (0..4u32)
        .map(|t| {
            let db = db.clone();
            std::thread::spawn(move || -> lsm_engine::Result<()> {
                for i in 0..250u32 {
                    db.put(format!("w{t}-{i:05}"), format!("{t}:{i}"))?;
                }
                Ok(())
            })
        })
        .collect();

    for writer in writers {
        writer.join().expect("should join")?;
    }

    for t in 0..4u32 {
        for i in (0..250u32).step_by(25) {
            let key = format!("w{t}-{i:05}");
            let item = db.get(key.as_bytes())?.expect("should exist");
            assert_eq!(Some(format!("{t}:{i}").into()), item.value);
        }
    }
    Ok(())
}
