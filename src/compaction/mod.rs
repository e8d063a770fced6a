// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Background compaction: work selection, the merge/write/commit stages
//! and the committer variants that finalize them.

pub(crate) mod committer;
pub(crate) mod worker;

use crate::{
    core::CoreInner,
    memtable::Memtable,
    segment::{Segment, SegmentId},
};
use std::sync::Arc;

/// Upper bound of source segments per compaction task
const MAX_SEGMENTS_PER_TASK: usize = 8;

/// A unit of compaction work
#[derive(Debug)]
pub(crate) enum Task {
    /// Drain a sealed memtable into the first persistent level
    Flush { memtable: Arc<Memtable> },

    /// Drain segments from one level into the next
    Compact {
        from_level: usize,
        segment_ids: Vec<SegmentId>,
        to_level: usize,
    },

    /// Rewrite a subset of the deepest level in place, dropping dead
    /// entries and defragmenting
    SelfCompact {
        level: usize,
        segment_ids: Vec<SegmentId>,
    },
}

/// Where the consumed input of a compaction came from
#[derive(Debug)]
pub(crate) enum ResultSource {
    Memtable(u64),
    Level {
        number: usize,
        segment_ids: Vec<SegmentId>,
    },
    SameLevel,
}

/// Outcome of the merge and write stages, ready to be committed
///
/// Carries a unique id; committing the same result twice is rejected.
pub(crate) struct CompactResult {
    pub id: u64,
    pub to_level: usize,
    pub new_segments: Vec<Arc<Segment>>,
    pub consumed_dest: Vec<SegmentId>,
    pub source: ResultSource,
}

/// Picks the next unit of work, preferring memtable flushes, then the
/// level with the highest overflow ratio (ties break toward the
/// shallower level).
pub(crate) fn choose_task(core: &CoreInner) -> Option<Task> {
    if let Some(memtable) = core.oldest_sealed_memtable() {
        return Some(Task::Flush { memtable });
    }

    let mut best: Option<(f64, usize)> = None;

    for level in &core.levels {
        let ratio = level.overflow_ratio();
        if ratio <= 1.0 {
            continue;
        }

        let better = best.map_or(true, |(best_ratio, _)| ratio > best_ratio);
        if better {
            best = Some((ratio, level.number()));
        }
    }

    let (_, number) = best?;
    let deepest = core.levels.len();

    if number < deepest {
        let level = core.level(number)?;
        let overflow = level.size_bytes().saturating_sub(level.config().threshold_bytes);

        let mut segment_ids = vec![];
        let mut taken = 0u64;

        for segment in level.current().iter() {
            if segment_ids.len() >= MAX_SEGMENTS_PER_TASK {
                break;
            }
            segment_ids.push(segment.id());
            taken += segment.file_size();

            if taken >= overflow.max(1) {
                break;
            }
        }

        if segment_ids.is_empty() {
            return None;
        }

        return Some(Task::Compact {
            from_level: number,
            segment_ids,
            to_level: number + 1,
        });
    }

    // The deepest level can only rewrite itself, which requires the
    // replace-subset commit shape
    if !core.supports_replace_subset() {
        return None;
    }

    let level = core.level(number)?;
    let target = level.config().target_segment_size.max(1);
    let run = level.current();

    // Rewrite the first adjacent window that would actually merge into
    // fewer segments; rewriting compact windows would loop forever
    for window in run.chunks(MAX_SEGMENTS_PER_TASK) {
        let bytes: u64 = window.iter().map(|s| s.file_size()).sum();
        let ideal = (bytes.div_ceil(target)).max(1) as usize;

        if window.len() > ideal {
            return Some(Task::SelfCompact {
                level: number,
                segment_ids: window.iter().map(|s| s.id()).collect(),
            });
        }
    }

    None
}
