// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Merges two key-ordered entry streams into one, splitting ranges on
//! overlap, as performed by flushes and compactions.

use super::{collapse_last_level, merge_values};
use crate::{entry::Entry, functions::FunctionStore, order::KeyOrder};
use std::collections::VecDeque;

/// Splits ranges so that no point entry lies strictly inside a range span.
///
/// Streams produced by the memtable may interleave resolved points with the
/// ranges that cover them; the merge algorithm requires the split form, where
/// such points are carried as the `from_value` of a range tail.
pub fn normalize_stream(entries: Vec<Entry>, order: &KeyOrder) -> Vec<Entry> {
    let mut out = Vec::with_capacity(entries.len());
    let mut active: Option<Entry> = None;

    for entry in entries {
        match entry {
            range @ Entry::Range { .. } => {
                if let Some(prev) = active.take() {
                    out.push(prev);
                }
                active = Some(range);
            }
            Entry::Point { key, value } => {
                let Some(Entry::Range {
                    from_key,
                    to_key,
                    from_value,
                    range_value,
                }) = active.take()
                else {
                    out.push(Entry::Point { key, value });
                    continue;
                };

                if order.lt(&key, &to_key) {
                    // Carve the point out as the from_value of the tail
                    if order.lt(&from_key, &key) {
                        out.push(Entry::Range {
                            from_key,
                            to_key: key.clone(),
                            from_value,
                            range_value: range_value.clone(),
                        });
                    }
                    active = Some(Entry::Range {
                        from_key: key,
                        to_key,
                        from_value: Some(value),
                        range_value,
                    });
                } else {
                    out.push(Entry::Range {
                        from_key,
                        to_key,
                        from_value,
                        range_value,
                    });
                    out.push(Entry::Point { key, value });
                }
            }
        }
    }

    if let Some(prev) = active {
        out.push(prev);
    }

    out
}

fn emit(out: &mut Vec<Entry>, entry: Entry, is_last_level: bool) {
    if !is_last_level {
        out.push(entry);
        return;
    }

    // Nothing exists beneath the last level, so ranges have no remaining
    // effect; only their resolved edge keys survive
    match entry {
        Entry::Point { key, value } => {
            if let Some(value) = collapse_last_level(value) {
                out.push(Entry::Point { key, value });
            }
        }
        Entry::Range {
            from_key,
            from_value: Some(from_value),
            ..
        } => {
            if let Some(value) = collapse_last_level(from_value) {
                out.push(Entry::Point {
                    key: from_key,
                    value,
                });
            }
        }
        Entry::Range { .. } => {}
    }
}

/// Merges a newer entry stream against an older one.
///
/// Both inputs must be ordered by start key with non-overlapping ranges
/// within themselves. The output upholds the same invariants. With
/// `is_last_level`, purely negative payloads and ranges are dropped after
/// their effects are applied.
#[allow(clippy::too_many_lines)]
pub fn merge_streams(
    new: Vec<Entry>,
    old: Vec<Entry>,
    order: &KeyOrder,
    functions: &FunctionStore,
    is_last_level: bool,
) -> crate::Result<Vec<Entry>> {
    let mut new: VecDeque<Entry> = normalize_stream(new, order).into();
    let mut old: VecDeque<Entry> = normalize_stream(old, order).into();
    let mut out = Vec::with_capacity(new.len() + old.len());

    loop {
        let Some(n) = new.pop_front() else {
            while let Some(o) = old.pop_front() {
                emit(&mut out, o, is_last_level);
            }
            break;
        };
        let Some(o) = old.pop_front() else {
            emit(&mut out, n, is_last_level);
            while let Some(n) = new.pop_front() {
                emit(&mut out, n, is_last_level);
            }
            break;
        };

        match (n, o) {
            (
                Entry::Point { key, value },
                Entry::Point {
                    key: old_key,
                    value: old_value,
                },
            ) => match order.cmp(&key, &old_key) {
                std::cmp::Ordering::Less => {
                    emit(&mut out, Entry::Point { key, value }, is_last_level);
                    old.push_front(Entry::Point {
                        key: old_key,
                        value: old_value,
                    });
                }
                std::cmp::Ordering::Greater => {
                    emit(
                        &mut out,
                        Entry::Point {
                            key: old_key,
                            value: old_value,
                        },
                        is_last_level,
                    );
                    new.push_front(Entry::Point { key, value });
                }
                std::cmp::Ordering::Equal => {
                    let value = merge_values(value, old_value, functions)?;
                    emit(&mut out, Entry::Point { key, value }, is_last_level);
                }
            },

            (Entry::Point { key, value }, old_range @ Entry::Range { .. }) => {
                let Entry::Range {
                    from_key,
                    to_key,
                    from_value,
                    range_value,
                } = &old_range
                else {
                    unreachable!()
                };

                if order.lt(&key, from_key) {
                    emit(&mut out, Entry::Point { key, value }, is_last_level);
                    old.push_front(old_range);
                } else if order.ge(&key, to_key) {
                    // No remaining newer entry starts before the range end
                    new.push_front(Entry::Point { key, value });
                    emit(&mut out, old_range, is_last_level);
                } else {
                    let edge = if order.eq(&key, from_key) {
                        from_value.clone().unwrap_or_else(|| range_value.clone())
                    } else {
                        range_value.clone()
                    };
                    let resolved = merge_values(value, edge, functions)?;

                    if order.lt(from_key, &key) {
                        emit(
                            &mut out,
                            Entry::Range {
                                from_key: from_key.clone(),
                                to_key: key.clone(),
                                from_value: from_value.clone(),
                                range_value: range_value.clone(),
                            },
                            is_last_level,
                        );
                    }

                    old.push_front(Entry::Range {
                        from_key: key,
                        to_key: to_key.clone(),
                        from_value: Some(resolved),
                        range_value: range_value.clone(),
                    });
                }
            }

            (new_range @ Entry::Range { .. }, Entry::Point { key, value }) => {
                let Entry::Range {
                    from_key,
                    to_key,
                    from_value,
                    range_value,
                } = &new_range
                else {
                    unreachable!()
                };

                if order.lt(&key, from_key) {
                    emit(&mut out, Entry::Point { key, value }, is_last_level);
                    new.push_front(new_range);
                } else if order.ge(&key, to_key) {
                    old.push_front(Entry::Point { key, value });
                    emit(&mut out, new_range, is_last_level);
                } else {
                    let edge = if order.eq(&key, from_key) {
                        from_value.clone().unwrap_or_else(|| range_value.clone())
                    } else {
                        range_value.clone()
                    };
                    let resolved = merge_values(edge, value, functions)?;

                    if order.lt(from_key, &key) {
                        emit(
                            &mut out,
                            Entry::Range {
                                from_key: from_key.clone(),
                                to_key: key.clone(),
                                from_value: from_value.clone(),
                                range_value: range_value.clone(),
                            },
                            is_last_level,
                        );
                    }

                    new.push_front(Entry::Range {
                        from_key: key,
                        to_key: to_key.clone(),
                        from_value: Some(resolved),
                        range_value: range_value.clone(),
                    });
                }
            }

            (
                Entry::Range {
                    from_key,
                    to_key,
                    from_value,
                    range_value,
                },
                Entry::Range {
                    from_key: old_from,
                    to_key: old_to,
                    from_value: old_from_value,
                    range_value: old_range_value,
                },
            ) => {
                if order.le(&to_key, &old_from) {
                    emit(
                        &mut out,
                        Entry::Range {
                            from_key,
                            to_key,
                            from_value,
                            range_value,
                        },
                        is_last_level,
                    );
                    old.push_front(Entry::Range {
                        from_key: old_from,
                        to_key: old_to,
                        from_value: old_from_value,
                        range_value: old_range_value,
                    });
                } else if order.le(&old_to, &from_key) {
                    emit(
                        &mut out,
                        Entry::Range {
                            from_key: old_from,
                            to_key: old_to,
                            from_value: old_from_value,
                            range_value: old_range_value,
                        },
                        is_last_level,
                    );
                    new.push_front(Entry::Range {
                        from_key,
                        to_key,
                        from_value,
                        range_value,
                    });
                } else {
                    // Overlapping; split on endpoints
                    match order.cmp(&from_key, &old_from) {
                        std::cmp::Ordering::Less => {
                            emit(
                                &mut out,
                                Entry::Range {
                                    from_key,
                                    to_key: old_from.clone(),
                                    from_value,
                                    range_value: range_value.clone(),
                                },
                                is_last_level,
                            );
                            new.push_front(Entry::Range {
                                from_key: old_from.clone(),
                                to_key,
                                from_value: None,
                                range_value,
                            });
                            old.push_front(Entry::Range {
                                from_key: old_from,
                                to_key: old_to,
                                from_value: old_from_value,
                                range_value: old_range_value,
                            });
                        }
                        std::cmp::Ordering::Greater => {
                            emit(
                                &mut out,
                                Entry::Range {
                                    from_key: old_from,
                                    to_key: from_key.clone(),
                                    from_value: old_from_value,
                                    range_value: old_range_value.clone(),
                                },
                                is_last_level,
                            );
                            old.push_front(Entry::Range {
                                from_key: from_key.clone(),
                                to_key: old_to,
                                from_value: None,
                                range_value: old_range_value,
                            });
                            new.push_front(Entry::Range {
                                from_key,
                                to_key,
                                from_value,
                                range_value,
                            });
                        }
                        std::cmp::Ordering::Equal => {
                            let overlap_to = if order.le(&to_key, &old_to) {
                                to_key.clone()
                            } else {
                                old_to.clone()
                            };

                            let merged_from_value =
                                if from_value.is_none() && old_from_value.is_none() {
                                    None
                                } else {
                                    let new_edge = from_value
                                        .unwrap_or_else(|| range_value.clone());
                                    let old_edge = old_from_value
                                        .unwrap_or_else(|| old_range_value.clone());
                                    Some(merge_values(new_edge, old_edge, functions)?)
                                };

                            let merged_range_value = merge_values(
                                range_value.clone(),
                                old_range_value.clone(),
                                functions,
                            )?;

                            emit(
                                &mut out,
                                Entry::Range {
                                    from_key,
                                    to_key: overlap_to.clone(),
                                    from_value: merged_from_value,
                                    range_value: merged_range_value,
                                },
                                is_last_level,
                            );

                            if order.lt(&overlap_to, &to_key) {
                                new.push_front(Entry::Range {
                                    from_key: overlap_to.clone(),
                                    to_key,
                                    from_value: None,
                                    range_value,
                                });
                            }
                            if order.lt(&overlap_to, &old_to) {
                                old.push_front(Entry::Range {
                                    from_key: overlap_to,
                                    to_key: old_to,
                                    from_value: None,
                                    range_value: old_range_value,
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(out)
}
