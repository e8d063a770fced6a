// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    config::LevelConfig,
    entry::{Entry, Value},
    key_range::KeyRange,
    order::KeyOrder,
    segment::{Segment, SegmentIter},
    Direction, UserKey,
};
use std::collections::VecDeque;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Classifies a slice of an input stream against one target segment
///
/// A `None` target means the entries fall outside every existing segment
/// and a fresh segment will be created for them.
pub struct Assignment {
    /// Existing segment the entries overlap with
    pub target: Option<Arc<Segment>>,

    /// The assigned input entries, in key order
    pub entries: Vec<Entry>,
}

/// A persistent level: an ordered run of non-overlapping segments
///
/// Levels are numbered from 1; Level Zero is the in-memory write buffer.
pub struct Level {
    number: usize,
    dir: PathBuf,
    config: LevelConfig,
    order: KeyOrder,
    segments: RwLock<Arc<Vec<Arc<Segment>>>>,
}

impl Level {
    #[must_use]
    pub(crate) fn new(number: usize, dir: PathBuf, config: LevelConfig, order: KeyOrder) -> Self {
        Self {
            number,
            dir,
            config,
            order,
            segments: RwLock::new(Arc::new(vec![])),
        }
    }

    /// Returns the level number (1-based).
    #[must_use]
    pub fn number(&self) -> usize {
        self.number
    }

    /// Returns the directory holding this level's segment files.
    #[must_use]
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub(crate) fn config(&self) -> &LevelConfig {
        &self.config
    }

    /// Returns a snapshot of the current segment run.
    #[must_use]
    pub fn current(&self) -> Arc<Vec<Arc<Segment>>> {
        self.segments.read().expect("lock is poisoned").clone()
    }

    /// Replaces the segment run. The caller passes segments sorted by key
    /// range; ranges must be disjoint.
    pub(crate) fn install(&self, mut segments: Vec<Arc<Segment>>) {
        segments.sort_by(|a, b| self.order.cmp(a.key_range().min(), b.key_range().min()));

        debug_assert!(
            KeyRange::is_disjoint(
                &segments.iter().map(|s| s.key_range()).collect::<Vec<_>>(),
                &self.order,
            ),
            "level {} segments must not overlap",
            self.number,
        );

        let mut lock = self.segments.write().expect("lock is poisoned");
        *lock = Arc::new(segments);
    }

    /// Returns the number of segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.current().len()
    }

    /// Returns `true` if the level holds no segments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segment_count() == 0
    }

    /// Total on-disk bytes of this level.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.current().iter().map(|s| s.file_size()).sum()
    }

    /// Bytes relative to the configured threshold; compaction picks the
    /// level with the highest ratio.
    #[must_use]
    pub fn overflow_ratio(&self) -> f64 {
        (self.size_bytes() as f64) / (self.config.threshold_bytes.max(1) as f64)
    }

    fn segment_for_key(&self, key: &[u8]) -> Option<Arc<Segment>> {
        run_segment_for_key(&self.current(), key, &self.order)
    }

    /// Returns the merged payload visible for `key` within this level.
    pub fn fetch(&self, key: &[u8]) -> crate::Result<Option<Value>> {
        match self.segment_for_key(key) {
            Some(segment) => segment.fetch(key),
            None => Ok(None),
        }
    }

    /// Returns the edge payload of a range covering `key`, if any.
    ///
    /// Cheap when the responsible segment holds no ranges.
    pub fn covering_edge(&self, key: &[u8]) -> crate::Result<Option<Value>> {
        match self.segment_for_key(key) {
            Some(segment) if segment.range_count() > 0 => segment.fetch(key),
            _ => Ok(None),
        }
    }

    /// Returns the greatest entry at or below `key`, crossing segment
    /// boundaries.
    pub fn floor(&self, key: &[u8]) -> crate::Result<Option<Entry>> {
        let segments = self.current();

        // candidate: the last segment whose min is at or below the key
        let idx = segments.partition_point(|s| self.order.le(s.key_range().min(), key));

        for segment in segments.get(..idx).unwrap_or_default().iter().rev() {
            if let Some(entry) = segment.floor_entry(key)? {
                return Ok(Some(entry));
            }
        }

        Ok(None)
    }

    /// Returns the smallest entry at or above `key`, crossing segment
    /// boundaries.
    pub fn ceiling(&self, key: &[u8]) -> crate::Result<Option<Entry>> {
        let segments = self.current();

        let idx = segments.partition_point(|s| self.order.lt(s.key_range().max(), key));

        for segment in segments.get(idx..).unwrap_or_default() {
            if let Some(entry) = segment.ceiling_entry(key)? {
                return Ok(Some(entry));
            }
        }

        Ok(None)
    }

    /// Returns the segments whose key ranges overlap `[from, to)`.
    #[must_use]
    pub fn overlapping_interval(&self, from: &[u8], to: &[u8]) -> Vec<Arc<Segment>> {
        self.current()
            .iter()
            .filter(|s| s.key_range().overlaps_with_interval(from, to, &self.order))
            .cloned()
            .collect()
    }

    /// Returns the segments whose key ranges overlap `range`.
    #[must_use]
    pub fn overlapping(&self, range: &KeyRange) -> Vec<Arc<Segment>> {
        self.current()
            .iter()
            .filter(|s| s.key_range().overlaps_with(range, &self.order))
            .cloned()
            .collect()
    }

    fn entry_target(&self, entry: &Entry, segments: &[Arc<Segment>]) -> Option<Arc<Segment>> {
        segments
            .iter()
            .find(|segment| match entry {
                Entry::Point { key, .. } => segment.key_range().contains_key(key, &self.order),
                Entry::Range {
                    from_key, to_key, ..
                } => segment
                    .key_range()
                    .overlaps_with_interval(from_key, to_key, &self.order),
            })
            .cloned()
    }

    /// Classifies a key-ordered input stream against this level's segments.
    ///
    /// A range entry spanning several segments is assigned to the first one
    /// it overlaps; the compactor consumes the union of all targets, so the
    /// classification stays safe.
    #[must_use]
    pub fn assign(&self, entries: Vec<Entry>) -> Vec<Assignment> {
        let segments = self.current();
        let mut groups: Vec<Assignment> = vec![];

        for entry in entries {
            let target = self.entry_target(&entry, &segments);

            let same = groups.last().map_or(false, |group| {
                match (&group.target, &target) {
                    (None, None) => true,
                    (Some(a), Some(b)) => a.id() == b.id(),
                    _ => false,
                }
            });

            if same {
                if let Some(group) = groups.last_mut() {
                    group.entries.push(entry);
                }
            } else {
                groups.push(Assignment {
                    target,
                    entries: vec![entry],
                });
            }
        }

        groups
    }

    /// Iterates the level's entries within `bounds`.
    #[must_use]
    pub fn iter(
        &self,
        bounds: (Bound<UserKey>, Bound<UserKey>),
        direction: Direction,
    ) -> LevelIter {
        let mut segments: VecDeque<Arc<Segment>> = self.current().iter().cloned().collect();

        if matches!(direction, Direction::Backward) {
            segments = segments.into_iter().rev().collect();
        }

        LevelIter {
            segments,
            bounds,
            direction,
            current: None,
            done: false,
        }
    }
}

impl std::fmt::Debug for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Level:{}({} segments, {} B)",
            self.number,
            self.segment_count(),
            self.size_bytes(),
        )
    }
}

/// Finds the one segment of a disjoint, ordered run that may contain
/// `key`.
pub(crate) fn run_segment_for_key(
    run: &[Arc<Segment>],
    key: &[u8],
    order: &KeyOrder,
) -> Option<Arc<Segment>> {
    let idx = run.partition_point(|s| order.lt(s.key_range().max(), key));
    run.get(idx)
        .filter(|s| s.key_range().contains_key(key, order))
        .cloned()
}

/// Iterates a level by chaining its segments in key order
pub struct LevelIter {
    segments: VecDeque<Arc<Segment>>,
    bounds: (Bound<UserKey>, Bound<UserKey>),
    direction: Direction,
    current: Option<SegmentIter>,
    done: bool,
}

impl Iterator for LevelIter {
    type Item = crate::Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if let Some(iter) = &mut self.current {
                match iter.next() {
                    Some(item) => return Some(item),
                    None => self.current = None,
                }
            }

            let Some(segment) = self.segments.pop_front() else {
                self.done = true;
                return None;
            };

            match segment.iter(self.bounds.clone(), self.direction) {
                Ok(iter) => self.current = Some(iter),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
