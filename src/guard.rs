// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::atomic::{
    AtomicU64,
    Ordering::{AcqRel, Acquire},
};

// 0 is reserved for "unowned"
static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, AcqRel);
}

fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// Single-slot mutual exclusion that recognizes re-entry by the owner
///
/// Commit code may call back into itself on the owning thread; re-entry
/// succeeds without blocking and without double-acquiring. The guard tracks
/// owner identity, not acquisition depth.
#[derive(Debug, Default)]
pub struct AtomicThreadLocalGuard {
    owner: AtomicU64,
}

impl AtomicThreadLocalGuard {
    /// Tries to enter the critical section.
    ///
    /// Returns `true` if the slot was free or is already held by the
    /// calling thread.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let me = current_thread_token();

        if self.owner.load(Acquire) == me {
            return true;
        }

        self.owner
            .compare_exchange(0, me, AcqRel, Acquire)
            .is_ok()
    }

    /// Leaves the critical section.
    ///
    /// Only the owning thread can release; a release by any other thread
    /// is a no-op.
    pub fn release(&self) {
        let me = current_thread_token();
        let _ = self.owner.compare_exchange(me, 0, AcqRel, Acquire);
    }

    /// Returns `true` if the calling thread holds the slot.
    #[must_use]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Acquire) == current_thread_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use test_log::test;

    #[test]
    fn guard_acquire_release() {
        let guard = AtomicThreadLocalGuard::default();

        assert!(!guard.is_held_by_current_thread());
        assert!(guard.try_acquire());
        assert!(guard.is_held_by_current_thread());

        guard.release();
        assert!(!guard.is_held_by_current_thread());
    }

    #[test]
    fn guard_reentry_does_not_block_owner() {
        let guard = AtomicThreadLocalGuard::default();

        assert!(guard.try_acquire());

        // re-entry succeeds and does not double-acquire
        assert!(guard.try_acquire());
        assert!(guard.is_held_by_current_thread());

        // a single release frees the slot (identity, not depth)
        guard.release();
        assert!(!guard.is_held_by_current_thread());
    }

    #[test]
    fn guard_excludes_other_threads() {
        let guard = Arc::new(AtomicThreadLocalGuard::default());
        assert!(guard.try_acquire());

        let contender = {
            let guard = guard.clone();
            std::thread::spawn(move || {
                let acquired = guard.try_acquire();

                // a foreign release is a no-op
                guard.release();

                acquired
            })
        };

        assert!(!contender.join().expect("should join"));
        assert!(guard.is_held_by_current_thread());

        guard.release();

        let successor = {
            let guard = guard.clone();
            std::thread::spawn(move || {
                let acquired = guard.try_acquire();
                guard.release();
                acquired
            })
        };

        assert!(successor.join().expect("should join"));
    }
}
