// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    worker::{stage_commit, stage_merge, stage_write},
    Task,
};
use crate::{config::CommitterMode, core::CoreInner};

/// Finalizes a compaction task through merge, write and commit.
///
/// With `cancellable`, the stop signal is honored between stages:
/// mid-stage work runs to completion, pending work is dropped, committed
/// work stays durable. Foreground flushes pass `false` so a closing
/// database still drains its write buffer.
pub(crate) trait Committer: Send + Sync {
    fn process(&self, core: &CoreInner, task: Task, cancellable: bool) -> crate::Result<()>;
}

pub(crate) fn committer_for(mode: CommitterMode) -> &'static dyn Committer {
    match mode {
        CommitterMode::CurrentThread => &CurrentThreadCommitter,
        CommitterMode::Parallel => &ParallelCommitter,
    }
}

fn stopping(core: &CoreInner, cancellable: bool, stage: &str) -> bool {
    if cancellable && core.stop_signal.is_stopped() {
        log::debug!("stopping before the {stage} stage, dropping pending work");
        return true;
    }
    false
}

/// Runs all three stages on the calling thread
///
/// Supports only the drain-into-next-level commit shape; anything else
/// fails loudly.
pub(crate) struct CurrentThreadCommitter;

impl Committer for CurrentThreadCommitter {
    fn process(&self, core: &CoreInner, task: Task, cancellable: bool) -> crate::Result<()> {
        if matches!(task, Task::SelfCompact { .. }) {
            return Err(crate::Error::Unsupported("replace-subset commit shape"));
        }

        let plan = stage_merge(core, &task)?;

        if stopping(core, cancellable, "write") {
            return Ok(());
        }

        let result = stage_write(core, plan)?;

        if stopping(core, cancellable, "commit") {
            // Written but unreferenced files are removed on recovery
            return Ok(());
        }

        stage_commit(core, result)
    }
}

/// Serializes the commit stage through the database's re-entry-aware
/// guard, so concurrent compactions cannot interleave their commits
///
/// Supports the drain, in-place and replace-subset commit shapes.
pub(crate) struct ParallelCommitter;

impl Committer for ParallelCommitter {
    fn process(&self, core: &CoreInner, task: Task, cancellable: bool) -> crate::Result<()> {
        let plan = stage_merge(core, &task)?;

        if stopping(core, cancellable, "write") {
            return Ok(());
        }

        let result = stage_write(core, plan)?;

        if stopping(core, cancellable, "commit") {
            return Ok(());
        }

        let guard = &core.commit_guard;
        let reentered = guard.is_held_by_current_thread();

        while !guard.try_acquire() {
            std::thread::yield_now();
        }

        let outcome = stage_commit(core, result);

        if !reentered {
            guard.release();
        }

        outcome
    }
}
