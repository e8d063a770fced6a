// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Collapses pairs of same-key payloads under time dominance.
//!
//! These functions are pure and total over all payload kind pairs; they are
//! the semantic core of both point reads and compaction.

pub mod stream;

pub use stream::{merge_streams, normalize_stream};

use crate::{entry::Value, functions::FunctionStore};

/// Merges the payloads of two entries sharing a key.
///
/// `new` is the entry found in the shallower (more recently written) source.
/// Time dominance decides the outcome regardless of physical arrival order;
/// ties favor `new`.
pub fn merge_values(new: Value, old: Value, functions: &FunctionStore) -> crate::Result<Value> {
    let new = normalize(new);
    let old = normalize(old);

    if new.time() >= old.time() {
        merge_dominant(new, old, functions)
    } else {
        merge_dominant(old, new, functions)
    }
}

// An expired put is indistinguishable from absence
fn normalize(value: Value) -> Value {
    match value {
        Value::Put {
            deadline: Some(deadline),
            time,
            ..
        } if deadline.is_expired() => Value::Remove {
            deadline: None,
            time,
        },
        other => other,
    }
}

/// Merges `dom` (the time-dominant payload) against `sub`.
#[allow(clippy::too_many_lines)]
fn merge_dominant(dom: Value, sub: Value, functions: &FunctionStore) -> crate::Result<Value> {
    use Value::{Function, PendingApply, Put, Remove, Update};

    Ok(match (dom, sub) {
        // A dominant put shadows everything beneath it
        (dom @ Put { .. }, _) => dom,

        // An update rewrites the put's value slot, keeping it a put
        (
            Update {
                value,
                deadline,
                time,
            },
            Put {
                deadline: put_deadline,
                ..
            },
        ) => Put {
            value,
            deadline: deadline.or(put_deadline),
            time,
        },

        // The newer update wins entirely
        (dom @ Update { .. }, Update { .. }) => dom,

        // Updating an unconditionally removed key stays removed
        (Update { time, .. }, Remove { deadline: None, .. }) => Remove {
            deadline: None,
            time,
        },

        // An unconditional tombstone annihilates the pair
        (Remove { deadline: None, time }, _) => Remove {
            deadline: None,
            time,
        },

        // A scheduled removal over a put becomes a put that expires
        (
            Remove {
                deadline: Some(deadline),
                time,
            },
            Put { value, .. },
        ) => Put {
            value,
            deadline: Some(deadline),
            time,
        },

        // Re-scheduling a removal only matters while the key still exists
        (
            Remove { deadline, time },
            Remove {
                deadline: sub_deadline,
                ..
            },
        ) => Remove {
            deadline: sub_deadline.and(deadline),
            time,
        },

        (Function { function_id, time }, Put { value, deadline, .. }) => {
            let f = functions
                .get(&function_id)
                .ok_or(crate::Error::InvalidInput("unregistered function id"))?;
            let (value, deadline) = f(value.as_ref(), deadline);
            Put {
                value,
                deadline,
                time,
            }
        }

        (Function { time, .. }, Remove { deadline: None, .. }) => Remove {
            deadline: None,
            time,
        },

        // A put beneath pending applies collapses the whole chain
        (PendingApply { applies }, sub @ Put { .. }) => {
            let mut acc = sub;
            for apply in applies {
                acc = merge_values(apply.into_value(), acc, functions)?;
            }
            acc
        }

        (dom @ PendingApply { .. }, Remove { deadline: None, .. }) => {
            let time = dom.time().clone();
            Remove {
                deadline: None,
                time,
            }
        }

        // Everything else defers until a put (or the bottom) is reached,
        // accumulating in time order
        (dom, sub) => PendingApply {
            applies: {
                let mut applies = sub.into_applies();
                applies.extend(dom.into_applies());
                applies
            },
        },
    })
}

/// Collapses a fully merged payload at the deepest level.
///
/// Nothing can be shadowed below the last level, so payloads that only make
/// sense relative to an older put (removes, updates, functions, pending
/// applies) and expired puts collapse to absence.
#[must_use]
pub fn collapse_last_level(value: Value) -> Option<Value> {
    match value {
        Value::Put {
            deadline: Some(deadline),
            ..
        } if deadline.is_expired() => None,
        put @ Value::Put { .. } => Some(put),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entry::Apply,
        time::{Deadline, Time},
        Slice, UserValue,
    };
    use rustc_hash::FxHashMap;
    use std::sync::Arc;
    use test_log::test;

    fn functions() -> FunctionStore {
        let mut map: FxHashMap<Slice, Arc<crate::functions::RegisteredFunction>> =
            FxHashMap::default();
        map.insert(
            Slice::from(b"double"),
            Arc::new(|value, deadline| {
                let doubled = value.map(|v| {
                    let mut out = v.to_vec();
                    out.extend_from_slice(v);
                    UserValue::from(out)
                });
                (doubled, deadline)
            }),
        );
        FunctionStore::from_map(map)
    }

    fn put(value: &[u8], time: u64) -> Value {
        Value::Put {
            value: Some(Slice::from(value)),
            deadline: None,
            time: Time::from(time),
        }
    }

    fn update(value: &[u8], time: u64) -> Value {
        Value::Update {
            value: Some(Slice::from(value)),
            deadline: None,
            time: Time::from(time),
        }
    }

    fn remove(time: u64) -> Value {
        Value::Remove {
            deadline: None,
            time: Time::from(time),
        }
    }

    #[test]
    fn merge_put_put_newer_wins() -> crate::Result<()> {
        let merged = merge_values(put(b"v2", 2), put(b"v1", 1), &functions())?;
        assert_eq!(put(b"v2", 2), merged);
        Ok(())
    }

    #[test]
    fn merge_put_put_stale_new_entry_is_discarded() -> crate::Result<()> {
        let merged = merge_values(put(b"v1", 1), put(b"v2", 2), &functions())?;
        assert_eq!(put(b"v2", 2), merged);
        Ok(())
    }

    #[test]
    fn merge_update_over_put() -> crate::Result<()> {
        let merged = merge_values(update(b"v2", 5), put(b"v1", 1), &functions())?;
        assert_eq!(put(b"v2", 5), merged);
        Ok(())
    }

    #[test]
    fn merge_stale_update_is_discarded() -> crate::Result<()> {
        let merged = merge_values(update(b"v0", 1), put(b"v1", 5), &functions())?;
        assert_eq!(put(b"v1", 5), merged);
        Ok(())
    }

    #[test]
    fn merge_update_keeps_put_deadline() -> crate::Result<()> {
        let deadline = Deadline::after(std::time::Duration::from_secs(3_600));

        let merged = merge_values(
            update(b"v2", 5),
            Value::Put {
                value: Some(Slice::from(b"v1")),
                deadline: Some(deadline),
                time: Time::from(1),
            },
            &functions(),
        )?;

        assert_eq!(
            Value::Put {
                value: Some(Slice::from(b"v2")),
                deadline: Some(deadline),
                time: Time::from(5),
            },
            merged,
        );
        Ok(())
    }

    #[test]
    fn merge_update_over_pending_apply_accumulates() -> crate::Result<()> {
        let pending = Value::PendingApply {
            applies: vec![
                Apply::Update {
                    value: Some(Slice::from(b"v2")),
                    deadline: None,
                    time: Time::from(3),
                },
                Apply::Function {
                    function_id: Slice::from(b"double"),
                    time: Time::from(4),
                },
            ],
        };

        let merged = merge_values(update(b"v3", 5), pending, &functions())?;

        assert_eq!(
            Value::PendingApply {
                applies: vec![
                    Apply::Update {
                        value: Some(Slice::from(b"v2")),
                        deadline: None,
                        time: Time::from(3),
                    },
                    Apply::Function {
                        function_id: Slice::from(b"double"),
                        time: Time::from(4),
                    },
                    Apply::Update {
                        value: Some(Slice::from(b"v3")),
                        deadline: None,
                        time: Time::from(5),
                    },
                ],
            },
            merged,
        );
        Ok(())
    }

    #[test]
    fn merge_remove_over_put_is_absent_at_bottom() -> crate::Result<()> {
        let merged = merge_values(remove(10), put(b"v", 5), &functions())?;
        assert_eq!(None, collapse_last_level(merged));
        Ok(())
    }

    #[test]
    fn merge_scheduled_remove_over_put_expires_it() -> crate::Result<()> {
        let deadline = Deadline::after(std::time::Duration::from_secs(3_600));

        let merged = merge_values(
            Value::Remove {
                deadline: Some(deadline),
                time: Time::from(9),
            },
            put(b"v", 2),
            &functions(),
        )?;

        assert_eq!(
            Value::Put {
                value: Some(Slice::from(b"v")),
                deadline: Some(deadline),
                time: Time::from(9),
            },
            merged,
        );
        Ok(())
    }

    #[test]
    fn merge_function_applies_to_put() -> crate::Result<()> {
        let merged = merge_values(
            Value::Function {
                function_id: Slice::from(b"double"),
                time: Time::from(7),
            },
            put(b"ab", 2),
            &functions(),
        )?;
        assert_eq!(put(b"abab", 7), merged);
        Ok(())
    }

    #[test]
    fn merge_unregistered_function_fails() {
        let result = merge_values(
            Value::Function {
                function_id: Slice::from(b"nope"),
                time: Time::from(7),
            },
            put(b"ab", 2),
            &functions(),
        );
        assert!(matches!(result, Err(crate::Error::InvalidInput(_))));
    }

    #[test]
    fn merge_function_over_function_defers() -> crate::Result<()> {
        let merged = merge_values(
            Value::Function {
                function_id: Slice::from(b"double"),
                time: Time::from(4),
            },
            Value::Function {
                function_id: Slice::from(b"double"),
                time: Time::from(3),
            },
            &functions(),
        )?;

        let Value::PendingApply { applies } = merged else {
            panic!("should defer");
        };
        assert_eq!(2, applies.len());
        assert_eq!(&Time::from(3), applies[0].time());
        assert_eq!(&Time::from(4), applies[1].time());
        Ok(())
    }

    #[test]
    fn merge_pending_apply_collapses_against_put() -> crate::Result<()> {
        let pending = Value::PendingApply {
            applies: vec![
                Apply::Update {
                    value: Some(Slice::from(b"ab")),
                    deadline: None,
                    time: Time::from(3),
                },
                Apply::Function {
                    function_id: Slice::from(b"double"),
                    time: Time::from(4),
                },
            ],
        };

        let merged = merge_values(pending, put(b"zz", 1), &functions())?;
        assert_eq!(put(b"abab", 4), merged);
        Ok(())
    }

    #[test]
    fn merge_expired_put_behaves_as_absent() -> crate::Result<()> {
        let expired = Value::Put {
            value: Some(Slice::from(b"gone")),
            deadline: Some(Deadline::from_unix_millis(1)),
            time: Time::from(1),
        };

        let merged = merge_values(update(b"v", 5), expired, &functions())?;
        assert_eq!(None, collapse_last_level(merged));
        Ok(())
    }

    #[test]
    fn merge_is_associative_for_ordered_times() -> crate::Result<()> {
        let store = functions();

        let a = put(b"a", 1);
        let b = update(b"b", 2);
        let c = Value::Function {
            function_id: Slice::from(b"double"),
            time: Time::from(3),
        };

        // fold newest-to-oldest either way
        let left = merge_values(merge_values(c.clone(), b.clone(), &store)?, a.clone(), &store)?;
        let right = merge_values(c, merge_values(b, a, &store)?, &store)?;

        assert_eq!(left, right);
        assert_eq!(put(b"bb", 3), left);
        Ok(())
    }

    #[test]
    fn collapse_drops_non_puts() {
        assert_eq!(None, collapse_last_level(remove(1)));
        assert_eq!(None, collapse_last_level(update(b"v", 1)));
        assert_eq!(
            None,
            collapse_last_level(Value::Function {
                function_id: Slice::from(b"f"),
                time: Time::from(1),
            })
        );
        assert!(collapse_last_level(put(b"v", 1)).is_some());
    }
}
