// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{MemEntry, MemMap, OrderedKey};
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;

/// Write-optimized store for strictly ascending key inserts
///
/// Appends to a growable sorted vector as long as keys arrive in strictly
/// increasing order. The first out-of-order insert migrates everything into
/// a skip list, which then serves all further operations.
pub struct SequentialStore {
    vec: Vec<(OrderedKey, MemEntry)>,
    spill: Option<MemMap>,
}

impl SequentialStore {
    #[must_use]
    pub fn new(initial_length: usize) -> Self {
        Self {
            vec: Vec::with_capacity(initial_length),
            spill: None,
        }
    }

    /// Returns `true` if the store fell back to the skip list.
    #[must_use]
    pub fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    pub fn insert(&mut self, key: OrderedKey, entry: MemEntry) {
        if let Some(map) = &self.spill {
            map.insert(key, entry);
            return;
        }

        let in_order = match self.vec.last() {
            None => true,
            Some((last, _)) => *last < key,
        };

        if in_order {
            self.vec.push((key, entry));
            return;
        }

        log::trace!("out-of-order write, migrating sequential store to skip list");

        let map = SkipMap::new();
        for (k, v) in self.vec.drain(..) {
            map.insert(k, v);
        }
        map.insert(key, entry);
        self.spill = Some(map);
    }

    pub fn exact(&self, key: &OrderedKey) -> Option<MemEntry> {
        if let Some(map) = &self.spill {
            return map.get(key).map(|entry| entry.value().clone());
        }

        self.vec
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .and_then(|idx| self.vec.get(idx))
            .map(|(_, entry)| entry.clone())
    }

    pub fn strictly_before(&self, key: &OrderedKey) -> Option<(crate::UserKey, MemEntry)> {
        if let Some(map) = &self.spill {
            return map
                .upper_bound(Bound::Excluded(key))
                .map(|entry| (entry.key().key.clone(), entry.value().clone()));
        }

        let idx = self.vec.partition_point(|(k, _)| k < key);
        idx.checked_sub(1)
            .and_then(|idx| self.vec.get(idx))
            .map(|(k, entry)| (k.key.clone(), entry.clone()))
    }

    pub fn floor(&self, key: &OrderedKey) -> Option<(crate::UserKey, MemEntry)> {
        if let Some(map) = &self.spill {
            return map
                .upper_bound(Bound::Included(key))
                .map(|entry| (entry.key().key.clone(), entry.value().clone()));
        }

        let idx = self.vec.partition_point(|(k, _)| k <= key);
        idx.checked_sub(1)
            .and_then(|idx| self.vec.get(idx))
            .map(|(k, entry)| (k.key.clone(), entry.clone()))
    }

    pub fn ceiling(&self, key: &OrderedKey) -> Option<(crate::UserKey, MemEntry)> {
        if let Some(map) = &self.spill {
            return map
                .lower_bound(Bound::Included(key))
                .map(|entry| (entry.key().key.clone(), entry.value().clone()));
        }

        let idx = self.vec.partition_point(|(k, _)| k < key);
        self.vec
            .get(idx)
            .map(|(k, entry)| (k.key.clone(), entry.clone()))
    }

    pub fn entries_between(
        &self,
        from: &OrderedKey,
        to: &OrderedKey,
    ) -> Vec<(crate::UserKey, MemEntry)> {
        if let Some(map) = &self.spill {
            return map
                .range((Bound::Included(from.clone()), Bound::Excluded(to.clone())))
                .map(|entry| (entry.key().key.clone(), entry.value().clone()))
                .collect();
        }

        let start = self.vec.partition_point(|(k, _)| k < from);
        let end = self.vec.partition_point(|(k, _)| k < to);

        self.vec
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|(k, entry)| (k.key.clone(), entry.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<(OrderedKey, MemEntry)> {
        if let Some(map) = &self.spill {
            return map
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect();
        }

        self.vec.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.spill.as_ref().map_or(self.vec.len(), SkipMap::len)
    }
}
