use lsm_engine::{Config, Error, LevelConfig, UserValue};
use test_log::test;

fn counter_config(path: &std::path::Path) -> Config {
    Config::new(path)
        .levels(vec![LevelConfig {
            target_segment_size: 16 * 1_024,
            threshold_bytes: 32 * 1_024,
            ..Default::default()
        }])
        .register_function("increment", |value, deadline| {
            let next = value.map_or(0u64, |v| {
                let bytes: [u8; 8] = v.as_ref().try_into().unwrap_or_default();
                u64::from_be_bytes(bytes) + 1
            });
            (Some(UserValue::from(next.to_be_bytes())), deadline)
        })
        .register_function("shout", |value, deadline| {
            let shouted = value.map(|v| {
                let mut out = v.to_vec();
                out.push(b'!');
                UserValue::from(out)
            });
            (shouted, deadline)
        })
}

fn read_counter(db: &lsm_engine::Core, key: &[u8]) -> lsm_engine::Result<Option<u64>> {
    Ok(db.get(key)?.and_then(|item| item.value).map(|v| {
        let bytes: [u8; 8] = v.as_ref().try_into().unwrap_or_default();
        u64::from_be_bytes(bytes)
    }))
}

#[test]
fn function_applies_to_existing_put() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = counter_config(folder.path()).open()?;

    db.put("n", 0u64.to_be_bytes())?;
    db.apply_function("n", "increment")?;
    db.apply_function("n", "increment")?;

    assert_eq!(Some(2), read_counter(&db, b"n")?);
    Ok(())
}

#[test]
fn function_without_put_resolves_to_absence() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = counter_config(folder.path()).open()?;

    db.apply_function("ghost", "increment")?;
    assert!(db.get(b"ghost")?.is_none());
    Ok(())
}

#[test]
fn function_survives_flush_and_compaction() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = counter_config(folder.path()).open()?;

    db.put("n", 0u64.to_be_bytes())?;
    db.flush()?;

    db.apply_function("n", "increment")?;
    db.apply_function("n", "increment")?;
    db.flush()?;
    db.compact()?;

    assert_eq!(Some(2), read_counter(&db, b"n")?);
    Ok(())
}

#[test]
fn function_chain_is_applied_in_write_order() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = counter_config(folder.path()).open()?;

    db.put("word", "hey")?;
    db.apply_function("word", "shout")?;
    db.apply_function("word", "shout")?;

    assert_eq!(
        Some("hey!!".into()),
        db.get(b"word")?.expect("should exist").value
    );
    Ok(())
}

#[test]
fn function_range_applies_to_covered_puts() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = counter_config(folder.path()).open()?;

    db.put("a", "ha")?;
    db.put("b", "ho")?;
    db.put("z", "he")?;

    db.apply_function_range("a", "c", "shout")?;

    assert_eq!(
        Some("ha!".into()),
        db.get(b"a")?.expect("should exist").value
    );
    assert_eq!(
        Some("ho!".into()),
        db.get(b"b")?.expect("should exist").value
    );
    assert_eq!(
        Some("he".into()),
        db.get(b"z")?.expect("should exist").value
    );
    Ok(())
}

#[test]
fn unregistered_function_is_rejected_at_the_boundary() -> lsm_engine::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = counter_config(folder.path()).open()?;

    db.put("n", "x")?;

    assert!(matches!(
        db.apply_function("n", "no-such-function"),
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        db.apply_function("n", ""),
        Err(Error::InvalidInput(_))
    ));
    Ok(())
}
