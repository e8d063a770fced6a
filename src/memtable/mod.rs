// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub(crate) mod sequential;

use crate::{
    config::OptimiseWrites,
    entry::{Entry, Value},
    functions::FunctionStore,
    merge::{merge_streams, merge_values},
    order::KeyOrder,
    Slice, UserKey,
};
use crossbeam_skiplist::SkipMap;
use sequential::SequentialStore;
use std::ops::Bound;
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering::AcqRel, Ordering::Acquire},
    RwLock,
};

/// Key wrapper routing comparisons through the configured order
#[derive(Clone)]
pub(crate) struct OrderedKey {
    pub key: UserKey,
    pub order: KeyOrder,
}

impl PartialEq for OrderedKey {
    fn eq(&self, other: &Self) -> bool {
        self.order.eq(&self.key, &other.key)
    }
}

impl Eq for OrderedKey {}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.order.cmp(&self.key, &other.key)
    }
}

/// What the write buffer stores per start key
#[derive(Clone, Debug)]
pub enum MemEntry {
    /// Payload of a single key
    Point(Value),

    /// A range keyed by its interval start
    Range {
        /// Exclusive interval end
        to_key: UserKey,
        /// Override payload at the interval start
        from_value: Option<Value>,
        /// Payload applied to the covered keys
        range_value: Value,
    },
}

impl MemEntry {
    pub(crate) fn from_entry(entry: Entry) -> (UserKey, Self) {
        match entry {
            Entry::Point { key, value } => (key, Self::Point(value)),
            Entry::Range {
                from_key,
                to_key,
                from_value,
                range_value,
            } => (
                from_key,
                Self::Range {
                    to_key,
                    from_value,
                    range_value,
                },
            ),
        }
    }

    pub(crate) fn into_entry(self, key: UserKey) -> Entry {
        match self {
            Self::Point(value) => Entry::Point { key, value },
            Self::Range {
                to_key,
                from_value,
                range_value,
            } => Entry::Range {
                from_key: key,
                to_key,
                from_value,
                range_value,
            },
        }
    }

    fn approximate_size(&self, key: &[u8]) -> usize {
        key.len()
            + match self {
                Self::Point(value) => value.approximate_size(),
                Self::Range {
                    to_key,
                    from_value,
                    range_value,
                } => {
                    to_key.len()
                        + from_value.as_ref().map_or(0, Value::approximate_size)
                        + range_value.approximate_size()
                }
            }
    }

    fn is_range(&self) -> bool {
        matches!(self, Self::Range { .. })
    }
}

pub(crate) type MemMap = SkipMap<OrderedKey, MemEntry>;

enum Store {
    Skip(MemMap),
    Sequential(RwLock<SequentialStore>),
}

/// The in-memory level (Level Zero)
///
/// A concurrent ordered map holding recent writes until they are flushed
/// into the first persistent level. Batches are merged on write: a new point
/// collapses against the existing entry at its key, and a new range against
/// every covered existing entry, so a single memtable never holds two
/// conflicting answers for one key.
pub struct Memtable {
    /// Logical id, used to track flushes.
    pub(crate) id: u64,

    order: KeyOrder,
    atomic: bool,
    store: Store,

    /// Held for writing during atomic batches so readers never observe an
    /// intermediate batch state.
    visibility: RwLock<()>,

    approximate_size: AtomicU64,
    range_count: AtomicUsize,
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Memtable:{}({} entries)", self.id, self.len())
    }
}

impl Memtable {
    #[must_use]
    pub(crate) fn new(id: u64, order: KeyOrder, optimise_writes: &OptimiseWrites) -> Self {
        let (atomic, store) = match optimise_writes {
            OptimiseWrites::RandomOrder { atomic } => (*atomic, Store::Skip(SkipMap::new())),
            OptimiseWrites::SequentialOrder {
                atomic,
                initial_skip_list_length,
            } => (
                *atomic,
                Store::Sequential(RwLock::new(SequentialStore::new(*initial_skip_list_length))),
            ),
        };

        Self {
            id,
            order,
            atomic,
            store,
            visibility: RwLock::new(()),
            approximate_size: AtomicU64::default(),
            range_count: AtomicUsize::default(),
        }
    }

    fn qkey(&self, key: &[u8]) -> OrderedKey {
        OrderedKey {
            key: Slice::from(key),
            order: self.order.clone(),
        }
    }

    /// Applies a batch of entries.
    ///
    /// With `atomic` configured, the whole batch becomes visible to readers
    /// as one event; otherwise readers may observe it partially.
    pub fn apply(&self, entries: Vec<Entry>, functions: &FunctionStore) -> crate::Result<()> {
        let _guard = if self.atomic {
            Some(self.visibility.write().expect("lock is poisoned"))
        } else {
            None
        };

        for entry in entries {
            match entry {
                Entry::Point { key, value } => self.apply_point(key, value, functions)?,
                range @ Entry::Range { .. } => self.apply_range(range, functions)?,
            }
        }

        Ok(())
    }

    fn apply_point(
        &self,
        key: UserKey,
        value: Value,
        functions: &FunctionStore,
    ) -> crate::Result<()> {
        let merged = match self.exact(&key) {
            Some(MemEntry::Point(existing)) => {
                MemEntry::Point(merge_values(value, existing, functions)?)
            }
            Some(MemEntry::Range {
                to_key,
                from_value,
                range_value,
            }) => {
                // The point lands exactly on a range start; it becomes the
                // range's edge value
                let edge = from_value.unwrap_or_else(|| range_value.clone());
                MemEntry::Range {
                    to_key,
                    from_value: Some(merge_values(value, edge, functions)?),
                    range_value,
                }
            }
            None => match self.nearest_covering_range(&key) {
                Some((_, edge)) => MemEntry::Point(merge_values(value, edge, functions)?),
                None => MemEntry::Point(value),
            },
        };

        self.insert(key, merged);
        Ok(())
    }

    fn apply_range(&self, range: Entry, functions: &FunctionStore) -> crate::Result<()> {
        let Entry::Range {
            from_key, to_key, ..
        } = &range
        else {
            unreachable!()
        };
        let (from_key, to_key) = (from_key.clone(), to_key.clone());

        // Collect every existing entry the interval touches, including a
        // range reaching in from before the interval start
        let mut affected: Vec<Entry> = vec![];

        if let Some((key, entry)) = self.strictly_before(&from_key) {
            if let MemEntry::Range { to_key: end, .. } = &entry {
                if self.order.gt(end, &from_key) {
                    affected.push(entry.into_entry(key));
                }
            }
        }

        for (key, entry) in self.entries_between(&from_key, &to_key) {
            affected.push(entry.into_entry(key));
        }

        let merged = merge_streams(vec![range], affected, &self.order, functions, false)?;

        // Every affected start key receives a replacement, so plain inserts
        // suffice
        for entry in merged {
            let (key, entry) = MemEntry::from_entry(entry);
            self.insert(key, entry);
        }

        Ok(())
    }

    fn insert(&self, key: UserKey, entry: MemEntry) {
        self.approximate_size
            .fetch_add(entry.approximate_size(&key) as u64, AcqRel);

        if entry.is_range() {
            self.range_count.fetch_add(1, AcqRel);
        }

        let ordered = OrderedKey {
            key,
            order: self.order.clone(),
        };

        match &self.store {
            Store::Skip(map) => {
                map.insert(ordered, entry);
            }
            Store::Sequential(lock) => {
                lock.write().expect("lock is poisoned").insert(ordered, entry);
            }
        }
    }

    fn exact(&self, key: &[u8]) -> Option<MemEntry> {
        match &self.store {
            Store::Skip(map) => map.get(&self.qkey(key)).map(|entry| entry.value().clone()),
            Store::Sequential(lock) => {
                lock.read().expect("lock is poisoned").exact(&self.qkey(key))
            }
        }
    }

    fn strictly_before(&self, key: &[u8]) -> Option<(UserKey, MemEntry)> {
        match &self.store {
            Store::Skip(map) => map
                .upper_bound(Bound::Excluded(&self.qkey(key)))
                .map(|entry| (entry.key().key.clone(), entry.value().clone())),
            Store::Sequential(lock) => {
                lock.read()
                    .expect("lock is poisoned")
                    .strictly_before(&self.qkey(key))
            }
        }
    }

    fn entries_between(&self, from: &[u8], to: &[u8]) -> Vec<(UserKey, MemEntry)> {
        match &self.store {
            Store::Skip(map) => map
                .range((
                    Bound::Included(self.qkey(from)),
                    Bound::Excluded(self.qkey(to)),
                ))
                .map(|entry| (entry.key().key.clone(), entry.value().clone()))
                .collect(),
            Store::Sequential(lock) => {
                lock.read()
                    .expect("lock is poisoned")
                    .entries_between(&self.qkey(from), &self.qkey(to))
            }
        }
    }

    /// Scans backward from `key` for the nearest range entry; returns its
    /// edge payload if it covers `key`.
    fn nearest_covering_range(&self, key: &[u8]) -> Option<(UserKey, Value)> {
        if self.range_count.load(Acquire) == 0 {
            return None;
        }

        // TODO: track active ranges in a dedicated interval structure
        // instead of skipping points one by one
        let mut probe: Option<(UserKey, MemEntry)> = self.strictly_before(key);

        while let Some((from_key, entry)) = probe {
            match entry {
                MemEntry::Range {
                    to_key,
                    from_value,
                    range_value,
                } => {
                    // Ranges never overlap within one memtable, so the
                    // nearest one decides
                    if self.order.gt(&to_key, key) {
                        let edge = if self.order.eq(&from_key, key) {
                            from_value.unwrap_or_else(|| range_value.clone())
                        } else {
                            range_value
                        };
                        return Some((from_key, edge));
                    }
                    return None;
                }
                MemEntry::Point(_) => {
                    probe = self.strictly_before(&from_key);
                }
            }
        }

        None
    }

    /// Returns the merged payload visible for `key` within this memtable.
    pub fn fetch(&self, key: &[u8]) -> Option<Value> {
        let _guard = self.read_guard();

        match self.exact(key) {
            Some(MemEntry::Point(value)) => Some(value),
            Some(MemEntry::Range {
                to_key,
                from_value,
                range_value,
            }) => {
                debug_assert!(self.order.gt(&to_key, key));
                Some(from_value.unwrap_or(range_value))
            }
            None => self.nearest_covering_range(key).map(|(_, edge)| edge),
        }
    }

    /// Returns the greatest entry at or below `key`.
    pub fn floor(&self, key: &[u8]) -> Option<(UserKey, MemEntry)> {
        let _guard = self.read_guard();

        match &self.store {
            Store::Skip(map) => map
                .upper_bound(Bound::Included(&self.qkey(key)))
                .map(|entry| (entry.key().key.clone(), entry.value().clone())),
            Store::Sequential(lock) => {
                lock.read().expect("lock is poisoned").floor(&self.qkey(key))
            }
        }
    }

    /// Returns the smallest entry at or above `key`.
    pub fn ceiling(&self, key: &[u8]) -> Option<(UserKey, MemEntry)> {
        let _guard = self.read_guard();

        match &self.store {
            Store::Skip(map) => map
                .lower_bound(Bound::Included(&self.qkey(key)))
                .map(|entry| (entry.key().key.clone(), entry.value().clone())),
            Store::Sequential(lock) => {
                lock.read()
                    .expect("lock is poisoned")
                    .ceiling(&self.qkey(key))
            }
        }
    }

    /// Returns the entries whose start keys fall within `bounds`, in the
    /// requested direction.
    pub fn range(
        &self,
        bounds: (std::ops::Bound<&[u8]>, std::ops::Bound<&[u8]>),
        direction: crate::Direction,
    ) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self
            .snapshot()
            .into_iter()
            .filter(|entry| {
                let key = entry.start_key();
                let lower_ok = match bounds.0 {
                    Bound::Included(lo) => self.order.ge(key, lo),
                    Bound::Excluded(lo) => self.order.gt(key, lo),
                    Bound::Unbounded => true,
                };
                let upper_ok = match bounds.1 {
                    Bound::Included(hi) => self.order.le(key, hi),
                    Bound::Excluded(hi) => self.order.lt(key, hi),
                    Bound::Unbounded => true,
                };
                lower_ok && upper_ok
            })
            .collect();

        if matches!(direction, crate::Direction::Backward) {
            entries.reverse();
        }

        entries
    }

    /// Materializes a consistent, ordered view of all entries.
    pub fn snapshot(&self) -> Vec<Entry> {
        let _guard = self.read_guard();

        match &self.store {
            Store::Skip(map) => map
                .iter()
                .map(|entry| entry.value().clone().into_entry(entry.key().key.clone()))
                .collect(),
            Store::Sequential(lock) => {
                lock.read()
                    .expect("lock is poisoned")
                    .snapshot()
                    .into_iter()
                    .map(|(key, entry)| entry.into_entry(key.key))
                    .collect()
            }
        }
    }

    fn read_guard(&self) -> Option<std::sync::RwLockReadGuard<'_, ()>> {
        if self.atomic {
            Some(self.visibility.read().expect("lock is poisoned"))
        } else {
            None
        }
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.store {
            Store::Skip(map) => map.len(),
            Store::Sequential(lock) => {
                lock.read().expect("lock is poisoned").len()
            }
        }
    }

    /// Returns `true` if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate size of the buffered writes in bytes.
    ///
    /// Grows monotonically; replaced entries are not subtracted.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.approximate_size.load(Acquire)
    }

    /// Returns the number of range entries ever inserted.
    #[must_use]
    pub fn range_count(&self) -> usize {
        self.range_count.load(Acquire)
    }
}
