// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{choose_task, committer::committer_for, CompactResult, ResultSource, Task};
use crate::{
    core::CoreInner,
    entry::Entry,
    file::fsync_directory,
    merge::merge_streams,
    segment::{
        writer::{split_for_segments, write_segment},
        Segment, SegmentId,
    },
};
use std::sync::Arc;
use std::time::Instant;

/// Intermediate state between the merge and write stages
pub(crate) struct MergePlan {
    pub to_level: usize,
    pub entries: Vec<Entry>,
    pub consumed_dest: Vec<SegmentId>,
    pub source: ResultSource,
}

/// Spawns the background compaction worker.
///
/// The worker drains sealed memtables and compacts overflowing levels
/// until the stop signal fires; it parks while idle.
pub(crate) fn spawn(core: Arc<CoreInner>) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("lsm-compaction".into())
        .spawn(move || {
            log::debug!("compaction worker started");

            while !core.stop_signal.is_stopped() {
                match process_one(&core) {
                    Ok(true) => {}
                    Ok(false) => std::thread::park_timeout(core.compaction_throttle()),
                    Err(e) => {
                        // Nothing was committed; the work is rescheduled
                        // on the next pass
                        log::error!("compaction failed: {e:?}");
                        std::thread::park_timeout(core.compaction_throttle());
                    }
                }
            }

            log::debug!("compaction worker stopped");
        })
        .expect("should spawn compaction worker")
}

/// Selects and runs one task; returns `false` if there was nothing to do.
///
/// Serialized through the task lock, so a foreground flush cannot race
/// the background worker over the same memtable or segments.
pub(crate) fn process_one(core: &Arc<CoreInner>) -> crate::Result<bool> {
    let _task_guard = core.lock_tasks();

    let Some(task) = choose_task(core) else {
        return Ok(false);
    };

    let start = Instant::now();
    log::debug!("compaction task: {task:?}");

    committer_for(core.committer_mode()).process(core, task, true)?;

    log::debug!("compaction task done in {:?}", start.elapsed());
    Ok(true)
}

/// Stage 1: runs the merger over the task's input and the overlapping
/// portion of the destination level.
pub(crate) fn stage_merge(core: &CoreInner, task: &Task) -> crate::Result<MergePlan> {
    match task {
        Task::Flush { memtable } => {
            let input = memtable.snapshot();
            merge_into_level(core, input, 1, ResultSource::Memtable(memtable.id))
        }
        Task::Compact {
            from_level,
            segment_ids,
            to_level,
        } => {
            let input = collect_segment_entries(core, *from_level, segment_ids)?;
            merge_into_level(
                core,
                input,
                *to_level,
                ResultSource::Level {
                    number: *from_level,
                    segment_ids: segment_ids.clone(),
                },
            )
        }
        Task::SelfCompact { level, segment_ids } => {
            let input = collect_segment_entries(core, *level, segment_ids)?;
            let is_last = *level == core.levels.len();

            let entries =
                merge_streams(input, vec![], core.order(), core.functions(), is_last)?;

            Ok(MergePlan {
                to_level: *level,
                entries,
                consumed_dest: segment_ids.clone(),
                source: ResultSource::SameLevel,
            })
        }
    }
}

fn collect_segment_entries(
    core: &CoreInner,
    level_number: usize,
    segment_ids: &[SegmentId],
) -> crate::Result<Vec<Entry>> {
    let level = core
        .level(level_number)
        .ok_or(crate::Error::InvalidInput("no such level"))?;

    let segments = level.current();
    let mut entries = vec![];

    for id in segment_ids {
        let segment = segments
            .iter()
            .find(|s| s.id() == *id)
            .ok_or(crate::Error::CommitRejected)?;

        // Segments within a level are ordered and disjoint, so
        // concatenation preserves key order
        entries.extend(segment.entries()?);
    }

    Ok(entries)
}

/// Total span of a key-ordered entry stream, including range end keys.
fn entry_span(entries: &[Entry], order: &crate::order::KeyOrder) -> Option<crate::KeyRange> {
    let min = entries.first()?.start_key().clone();
    let mut max = min.clone();

    for entry in entries {
        if order.gt(entry.start_key(), &max) {
            max = entry.start_key().clone();
        }
        if let Entry::Range { to_key, .. } = entry {
            if order.gt(to_key, &max) {
                max = to_key.clone();
            }
        }
    }

    Some(crate::KeyRange::new((min, max)))
}

fn merge_into_level(
    core: &CoreInner,
    input: Vec<Entry>,
    to_level: usize,
    source: ResultSource,
) -> crate::Result<MergePlan> {
    let level = core
        .level(to_level)
        .ok_or(crate::Error::InvalidInput("no such level"))?;

    // Everything the input span touches is rewritten, so the fresh
    // segments can never overlap an untouched neighbor
    let consumed = match entry_span(&input, core.order()) {
        Some(span) => level.overlapping(&span),
        None => vec![],
    };

    let mut consumed_dest: Vec<SegmentId> = vec![];
    let mut dest_entries: Vec<Entry> = vec![];

    // Segments come out in key order within the destination level
    for segment in consumed {
        consumed_dest.push(segment.id());
        dest_entries.extend(segment.entries()?);
    }

    let is_last = to_level == core.levels.len();
    let entries = merge_streams(input, dest_entries, core.order(), core.functions(), is_last)?;

    Ok(MergePlan {
        to_level,
        entries,
        consumed_dest,
        source,
    })
}

/// Stage 2: persists the merged stream as new segment files, fsyncing
/// each file and the level directory.
pub(crate) fn stage_write(core: &CoreInner, plan: MergePlan) -> crate::Result<CompactResult> {
    let level = core
        .level(plan.to_level)
        .ok_or(crate::Error::InvalidInput("no such level"))?;

    let mut new_segments = vec![];

    if !plan.entries.is_empty() {
        let chunks = split_for_segments(plan.entries, level.config().target_segment_size);

        for chunk in chunks {
            let id = core.next_segment_id();
            let path = level.dir().join(format!("{id}.{}", crate::segment::SEGMENT_EXT));

            write_segment(&path, &chunk, core.order(), &level.config().writer)?;

            new_segments.push(Arc::new(Segment::open(
                &path,
                core.block_cache(),
                core.order().clone(),
                core.mmap_policy(),
            )?));
        }

        fsync_directory(level.dir())?;
    }

    Ok(CompactResult {
        id: core.next_result_id(),
        to_level: plan.to_level,
        new_segments,
        consumed_dest: plan.consumed_dest,
        source: plan.source,
    })
}

/// Stage 3: atomically publishes a compaction result.
///
/// The appendix is persisted before the in-memory swap, so a crash in
/// between leaves only unreferenced files behind. Re-committing a result
/// id, or committing against segments that are no longer present, is
/// rejected.
pub(crate) fn stage_commit(core: &CoreInner, result: CompactResult) -> crate::Result<()> {
    core.commit(result)
}
