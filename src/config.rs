// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    functions::RegisteredFunction,
    order::KeyOrder,
    segment::writer::WriterOptions,
    Slice,
};
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// How segment files are opened for reading
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum MmapPolicy {
    /// Memory-map files for reading and writing
    WriteAndRead,

    /// Memory-map files for reading only
    ReadOnly,

    /// Use positioned file reads
    #[default]
    Disabled,
}

/// Write path of the in-memory level
#[derive(Clone, Debug)]
pub enum OptimiseWrites {
    /// Full skip list; suits arbitrary key order (the default)
    RandomOrder {
        /// Multi-key batches become visible to readers atomically
        atomic: bool,
    },

    /// Growable sorted array fast path for strictly increasing key
    /// inserts; an out-of-order arrival migrates to a skip list
    SequentialOrder {
        /// Multi-key batches become visible to readers atomically
        atomic: bool,

        /// Initial capacity of the sorted array
        initial_skip_list_length: usize,
    },
}

impl Default for OptimiseWrites {
    fn default() -> Self {
        Self::RandomOrder { atomic: false }
    }
}

/// Which committer finalizes compaction tasks
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CommitterMode {
    /// All stages run on the worker's thread; only the
    /// drain-into-next-level commit shape is supported, and the engine
    /// restricts itself to it
    CurrentThread,

    /// Commits are serialized through the database's re-entry-aware
    /// guard; supports all commit shapes (the default)
    #[default]
    Parallel,
}

/// Parameters of one persistent level
#[derive(Clone, Debug)]
pub struct LevelConfig {
    /// Target size of segments written into this level
    pub target_segment_size: u64,

    /// Total bytes above which this level wants compaction
    pub threshold_bytes: u64,

    /// Block parameters of segments written into this level
    pub writer: WriterOptions,
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self {
            target_segment_size: 8 * 1_024 * 1_024,
            threshold_bytes: 64 * 1_024 * 1_024,
            writer: WriterOptions::default(),
        }
    }
}

/// Database configuration, following a builder pattern
///
/// # Examples
///
/// ```
/// # let folder = tempfile::tempdir()?;
/// use lsm_engine::Config;
///
/// let db = Config::new(folder).open()?;
/// #
/// # Ok::<(), lsm_engine::Error>(())
/// ```
pub struct Config {
    /// Database directory
    pub(crate) path: PathBuf,

    /// Key comparison used everywhere
    pub(crate) key_order: KeyOrder,

    /// Persistent level parameters, shallowest first
    pub(crate) levels: Vec<LevelConfig>,

    /// Bytes of buffered writes above which the memtable is rotated
    pub(crate) memtable_threshold: u64,

    /// Write path of the in-memory level
    pub(crate) optimise_writes: OptimiseWrites,

    /// How segment files are opened
    pub(crate) mmap: MmapPolicy,

    /// Committer variant
    pub(crate) committer: CommitterMode,

    /// Block cache byte budget
    pub(crate) cache_capacity: u64,

    /// Block cache entry time-to-live
    pub(crate) cache_ttl: Duration,

    /// Pause between compaction checks while idle
    pub(crate) compaction_throttle: Duration,

    /// Registered functions, frozen at open time
    pub(crate) functions: FxHashMap<Slice, Arc<RegisteredFunction>>,
}

impl Config {
    /// Creates a configuration for a database under the given directory.
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let mut levels = vec![];
        let mut threshold = 64u64 * 1_024 * 1_024;

        for _ in 0..3 {
            levels.push(LevelConfig {
                threshold_bytes: threshold,
                ..Default::default()
            });
            threshold = threshold.saturating_mul(8);
        }

        Self {
            path: path.as_ref().into(),
            key_order: KeyOrder::default(),
            levels,
            memtable_threshold: 8 * 1_024 * 1_024,
            optimise_writes: OptimiseWrites::default(),
            mmap: MmapPolicy::default(),
            committer: CommitterMode::default(),
            cache_capacity: 32 * 1_024 * 1_024,
            cache_ttl: Duration::from_secs(600),
            compaction_throttle: Duration::from_millis(100),
            functions: FxHashMap::default(),
        }
    }

    /// Sets the key comparison.
    #[must_use]
    pub fn key_order(mut self, order: KeyOrder) -> Self {
        self.key_order = order;
        self
    }

    /// Replaces the persistent level parameters, shallowest first.
    #[must_use]
    pub fn levels(mut self, levels: Vec<LevelConfig>) -> Self {
        self.levels = levels;
        self
    }

    /// Sets the write buffer size that triggers a flush.
    #[must_use]
    pub fn memtable_threshold(mut self, bytes: u64) -> Self {
        self.memtable_threshold = bytes;
        self
    }

    /// Chooses the write path of the in-memory level.
    #[must_use]
    pub fn optimise_writes(mut self, optimise_writes: OptimiseWrites) -> Self {
        self.optimise_writes = optimise_writes;
        self
    }

    /// Chooses how segment files are opened.
    #[must_use]
    pub fn mmap_policy(mut self, policy: MmapPolicy) -> Self {
        self.mmap = policy;
        self
    }

    /// Chooses the committer variant.
    #[must_use]
    pub fn committer_mode(mut self, mode: CommitterMode) -> Self {
        self.committer = mode;
        self
    }

    /// Sets the block cache byte budget and entry time-to-live.
    #[must_use]
    pub fn block_cache(mut self, capacity: u64, ttl: Duration) -> Self {
        self.cache_capacity = capacity;
        self.cache_ttl = ttl;
        self
    }

    /// Sets the pause between compaction checks while idle.
    #[must_use]
    pub fn compaction_throttle(mut self, throttle: Duration) -> Self {
        self.compaction_throttle = throttle;
        self
    }

    /// Registers a transformation under an id.
    ///
    /// Functions MUST be deterministic and may not read external state;
    /// they re-run during compaction, long after the original write.
    #[must_use]
    pub fn register_function<F>(mut self, id: impl Into<Slice>, f: F) -> Self
    where
        F: Fn(Option<&crate::UserValue>, Option<crate::Deadline>) -> crate::functions::FunctionOutput
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(id.into(), Arc::new(f));
        self
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.levels.is_empty() {
            return Err(crate::Error::InvalidInput(
                "at least one persistent level is required",
            ));
        }

        for level in &self.levels {
            level.writer.validate()?;

            if level.target_segment_size == 0 {
                return Err(crate::Error::InvalidInput(
                    "target segment size must be positive",
                ));
            }
        }

        Ok(())
    }

    /// Opens (or recovers) the database.
    pub fn open(self) -> crate::Result<crate::Core> {
        crate::Core::open(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn config_defaults_are_valid() {
        let config = Config::new("/tmp/whatever");
        assert!(config.validate().is_ok());
        assert_eq!(3, config.levels.len());
    }

    #[test]
    fn config_rejects_empty_levels() {
        let config = Config::new("/tmp/whatever").levels(vec![]);
        assert!(matches!(
            config.validate(),
            Err(crate::Error::InvalidInput(_))
        ));
    }

    #[test]
    fn config_rejects_bad_writer_options() {
        let level = LevelConfig {
            writer: crate::segment::writer::WriterOptions {
                restart_interval: 7,
                ..Default::default()
            },
            ..Default::default()
        };

        let config = Config::new("/tmp/whatever").levels(vec![level]);
        assert!(matches!(
            config.validate(),
            Err(crate::Error::InvalidInput(_))
        ));
    }
}
