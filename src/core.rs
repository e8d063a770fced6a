// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cache::BlockCache,
    compaction::{
        committer::committer_for,
        worker::{self, process_one},
        CompactResult, ResultSource, Task,
    },
    config::{CommitterMode, Config, MmapPolicy},
    entry::{Entry, Value},
    functions::FunctionStore,
    guard::AtomicThreadLocalGuard,
    level::Level,
    manifest,
    memtable::Memtable,
    merge::{collapse_last_level, merge_values},
    order::KeyOrder,
    segment::{Segment, SegmentId, SEGMENT_EXT},
    stop_signal::StopSignal,
    time::{Deadline, Time, TimeCounter},
    Direction, Slice, UserKey, UserValue,
};
use rustc_hash::FxHashSet;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering::AcqRel, Ordering::Acquire, Ordering::SeqCst},
    Arc, Mutex, MutexGuard, RwLock,
};

/// The visible state of a key after merging all sources: a surviving Put
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Projection {
    /// The stored value, if the put carried one
    pub value: Option<UserValue>,

    /// The put's expiry instant, if scheduled
    pub deadline: Option<Deadline>,
}

/// One operation of a write batch
///
/// All operations of a batch are stamped with a single time token.
#[derive(Clone, Debug)]
pub enum WriteOp {
    /// Writes a value
    Put {
        /// The key
        key: UserKey,
        /// The value; `None` stores the key without data
        value: Option<UserValue>,
        /// Expiry instant
        deadline: Option<Deadline>,
    },

    /// Deletes, optionally at a scheduled instant
    Remove {
        /// The key
        key: UserKey,
        /// Expiry instant; `None` deletes immediately
        deadline: Option<Deadline>,
    },

    /// Modifies the value of an existing put
    Update {
        /// The key
        key: UserKey,
        /// The new value
        value: Option<UserValue>,
    },

    /// Applies a registered function to the current value
    ApplyFunction {
        /// The key
        key: UserKey,
        /// Id of the registered function
        function_id: Slice,
    },

    /// Deletes every key in `[from, to)`
    RemoveRange {
        /// Inclusive start
        from: UserKey,
        /// Exclusive end
        to: UserKey,
        /// Expiry instant; `None` deletes immediately
        deadline: Option<Deadline>,
    },

    /// Modifies every existing put in `[from, to)`
    UpdateRange {
        /// Inclusive start
        from: UserKey,
        /// Exclusive end
        to: UserKey,
        /// The new value
        value: Option<UserValue>,
    },

    /// Applies a registered function to every existing put in `[from, to)`
    ApplyFunctionRange {
        /// Inclusive start
        from: UserKey,
        /// Exclusive end
        to: UserKey,
        /// Id of the registered function
        function_id: Slice,
    },
}

pub(crate) struct CommitState {
    applied_results: FxHashSet<u64>,
}

/// Shared state behind a database handle
pub struct CoreInner {
    path: PathBuf,
    order: KeyOrder,
    functions: FunctionStore,

    memtable_threshold: u64,
    optimise_writes: crate::config::OptimiseWrites,
    mmap: MmapPolicy,
    committer: CommitterMode,
    compaction_throttle: std::time::Duration,

    time: TimeCounter,
    segment_ids: AtomicU64,
    memtable_ids: AtomicU64,
    result_ids: AtomicU64,

    active: RwLock<Arc<Memtable>>,
    sealed: RwLock<Vec<Arc<Memtable>>>,
    pub(crate) levels: Vec<Arc<Level>>,

    cache: Arc<BlockCache>,

    write_lock: Mutex<()>,
    task_lock: Mutex<()>,
    commit_lock: Mutex<CommitState>,
    pub(crate) commit_guard: AtomicThreadLocalGuard,

    pub(crate) stop_signal: StopSignal,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl CoreInner {
    pub(crate) fn order(&self) -> &KeyOrder {
        &self.order
    }

    pub(crate) fn functions(&self) -> &FunctionStore {
        &self.functions
    }

    pub(crate) fn block_cache(&self) -> Arc<BlockCache> {
        self.cache.clone()
    }

    pub(crate) fn mmap_policy(&self) -> MmapPolicy {
        self.mmap
    }

    pub(crate) fn committer_mode(&self) -> CommitterMode {
        self.committer
    }

    pub(crate) fn compaction_throttle(&self) -> std::time::Duration {
        self.compaction_throttle
    }

    pub(crate) fn supports_replace_subset(&self) -> bool {
        self.committer == CommitterMode::Parallel
    }

    pub(crate) fn level(&self, number: usize) -> Option<&Arc<Level>> {
        self.levels.get(number.checked_sub(1)?)
    }

    pub(crate) fn next_segment_id(&self) -> SegmentId {
        self.segment_ids.fetch_add(1, AcqRel)
    }

    pub(crate) fn next_result_id(&self) -> u64 {
        self.result_ids.fetch_add(1, AcqRel)
    }

    pub(crate) fn lock_tasks(&self) -> MutexGuard<'_, ()> {
        self.task_lock.lock().expect("lock is poisoned")
    }

    pub(crate) fn oldest_sealed_memtable(&self) -> Option<Arc<Memtable>> {
        self.sealed
            .read()
            .expect("lock is poisoned")
            .first()
            .cloned()
    }

    fn active_memtable(&self) -> Arc<Memtable> {
        self.active.read().expect("lock is poisoned").clone()
    }

    fn sealed_memtables(&self) -> Vec<Arc<Memtable>> {
        self.sealed.read().expect("lock is poisoned").clone()
    }

    fn new_memtable(&self) -> Arc<Memtable> {
        Arc::new(Memtable::new(
            self.memtable_ids.fetch_add(1, AcqRel),
            self.order.clone(),
            &self.optimise_writes,
        ))
    }

    /// Seals the active memtable if it holds anything; returns whether a
    /// rotation happened. Caller must hold the write lock.
    fn rotate_active(&self) -> bool {
        let mut active = self.active.write().expect("lock is poisoned");

        if active.is_empty() {
            return false;
        }

        let sealed = std::mem::replace(&mut *active, self.new_memtable());

        self.sealed.write().expect("lock is poisoned").push(sealed);

        log::trace!("rotated active memtable");
        true
    }

    fn unpark_worker(&self) {
        if let Some(handle) = self.worker.lock().expect("lock is poisoned").as_ref() {
            handle.thread().unpark();
        }
    }

    /// Atomically publishes a compaction result.
    pub(crate) fn commit(&self, result: CompactResult) -> crate::Result<()> {
        let mut state = self.commit_lock.lock().expect("lock is poisoned");

        if state.applied_results.contains(&result.id) {
            return Err(crate::Error::CommitRejected);
        }

        let to_level = self
            .level(result.to_level)
            .ok_or(crate::Error::InvalidInput("no such level"))?;

        // The consumed segments must still be present, otherwise this
        // result raced another commit and is stale
        let dest_run = to_level.current();
        for id in &result.consumed_dest {
            if !dest_run.iter().any(|s| s.id() == *id) {
                return Err(crate::Error::CommitRejected);
            }
        }

        if let ResultSource::Level {
            number,
            segment_ids,
        } = &result.source
        {
            let from_run = self
                .level(*number)
                .ok_or(crate::Error::InvalidInput("no such level"))?
                .current();

            for id in segment_ids {
                if !from_run.iter().any(|s| s.id() == *id) {
                    return Err(crate::Error::CommitRejected);
                }
            }
        }

        if let ResultSource::Memtable(id) = &result.source {
            let sealed = self.sealed.read().expect("lock is poisoned");
            if !sealed.iter().any(|m| m.id == *id) {
                return Err(crate::Error::CommitRejected);
            }
        }

        // Build the replacement runs
        let mut new_runs: Vec<Vec<Arc<Segment>>> = self
            .levels
            .iter()
            .map(|level| level.current().iter().cloned().collect())
            .collect();

        let mut removed: Vec<Arc<Segment>> = vec![];

        {
            let run = new_runs
                .get_mut(result.to_level - 1)
                .expect("level was validated");

            run.retain(|segment| {
                let consumed = result.consumed_dest.contains(&segment.id());
                if consumed {
                    removed.push(segment.clone());
                }
                !consumed
            });
            run.extend(result.new_segments.iter().cloned());
        }

        if let ResultSource::Level {
            number,
            segment_ids,
        } = &result.source
        {
            let run = new_runs
                .get_mut(*number - 1)
                .expect("level was validated");

            run.retain(|segment| {
                let consumed = segment_ids.contains(&segment.id());
                if consumed {
                    removed.push(segment.clone());
                }
                !consumed
            });
        }

        // Durability first: the appendix names the new segment set before
        // any in-memory state changes
        let id_lists: Vec<Vec<SegmentId>> = new_runs
            .iter()
            .map(|run| run.iter().map(|s| s.id()).collect())
            .collect();
        manifest::write(&self.path, &id_lists)?;

        // The swap is one atomic event per level; in-flight readers keep
        // their snapshots alive through reference counts
        for (level, run) in self.levels.iter().zip(new_runs) {
            level.install(run);
        }

        if let ResultSource::Memtable(id) = &result.source {
            self.sealed
                .write()
                .expect("lock is poisoned")
                .retain(|m| m.id != *id);
        }

        for segment in removed {
            segment.mark_removed();
        }

        state.applied_results.insert(result.id);

        log::debug!(
            "committed result {} into level {}: +{} segments, -{} segments",
            result.id,
            result.to_level,
            result.new_segments.len(),
            result.consumed_dest.len(),
        );

        Ok(())
    }

    fn ensure_open(&self) -> crate::Result<()> {
        if self.closed.load(Acquire) {
            Err(crate::Error::Closed)
        } else {
            Ok(())
        }
    }
}

fn fold_step(
    acc: &mut Option<Value>,
    found: Option<Value>,
    functions: &FunctionStore,
) -> crate::Result<bool> {
    let Some(found) = found else {
        return Ok(acc.as_ref().is_some_and(Value::is_definitive));
    };

    let merged = match acc.take() {
        None => found,
        Some(upper) => merge_values(upper, found, functions)?,
    };

    let definitive = merged.is_definitive();
    *acc = Some(merged);
    Ok(definitive)
}

fn project(value: Option<Value>) -> Option<Projection> {
    match collapse_last_level(value?) {
        Some(Value::Put {
            value, deadline, ..
        }) => Some(Projection { value, deadline }),
        _ => None,
    }
}

fn key_within(key: &[u8], bounds: &(Bound<Slice>, Bound<Slice>), order: &KeyOrder) -> bool {
    let lower_ok = match &bounds.0 {
        Bound::Included(lo) => order.ge(key, lo),
        Bound::Excluded(lo) => order.gt(key, lo),
        Bound::Unbounded => true,
    };
    let upper_ok = match &bounds.1 {
        Bound::Included(hi) => order.le(key, hi),
        Bound::Excluded(hi) => order.lt(key, hi),
        Bound::Unbounded => true,
    };
    lower_ok && upper_ok
}

/// An embedded, persistent, ordered key-value store
///
/// Writes enter the in-memory level and flow through the persistent
/// levels via background compaction. Reads merge all sources newest to
/// oldest under time dominance.
///
/// # Examples
///
/// ```
/// # let folder = tempfile::tempdir()?;
/// use lsm_engine::Config;
///
/// let db = Config::new(folder).open()?;
///
/// db.put("planet", "saturn")?;
/// assert!(db.get(b"planet")?.is_some());
///
/// db.remove(b"planet")?;
/// assert!(db.get(b"planet")?.is_none());
/// #
/// # Ok::<(), lsm_engine::Error>(())
/// ```
pub struct Core(Arc<CoreInner>);

impl std::ops::Deref for Core {
    type Target = CoreInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Core {
    /// Opens (or recovers) a database; called through [`Config::open`].
    pub(crate) fn open(mut config: Config) -> crate::Result<Self> {
        config.validate()?;

        let path = config.path.clone();
        std::fs::create_dir_all(&path)?;

        // One directory per level; `0` is reserved for the in-memory
        // level's on-disk artifacts
        for number in 0..=config.levels.len() {
            std::fs::create_dir_all(path.join(number.to_string()))?;
        }

        let order = config.key_order.clone();
        let functions = FunctionStore::from_map(std::mem::take(&mut config.functions));
        let cache = BlockCache::new(config.cache_capacity, config.cache_ttl);

        let levels: Vec<Arc<Level>> = config
            .levels
            .iter()
            .enumerate()
            .map(|(idx, level_config)| {
                let number = idx + 1;
                Arc::new(Level::new(
                    number,
                    path.join(number.to_string()),
                    level_config.clone(),
                    order.clone(),
                ))
            })
            .collect();

        let mut max_segment_id: SegmentId = 0;
        let mut max_time: u64 = 0;

        if manifest::exists(&path) {
            let id_lists = manifest::read(&path)?;

            if id_lists.len() > levels.len() {
                log::error!(
                    "appendix references {} levels, configured are {}",
                    id_lists.len(),
                    levels.len(),
                );
                return Err(crate::Error::Unrecoverable);
            }

            for (level, segment_ids) in levels.iter().zip(&id_lists) {
                let mut segments = vec![];

                for id in segment_ids {
                    let segment_path = level.dir().join(format!("{id}.{SEGMENT_EXT}"));

                    let segment = Segment::open(
                        &segment_path,
                        cache.clone(),
                        order.clone(),
                        config.mmap,
                    )
                    .map_err(|e| {
                        log::error!("cannot recover segment {segment_path:?}: {e:?}");
                        crate::Error::Unrecoverable
                    })?;

                    max_segment_id = max_segment_id.max(segment.id());
                    if let Some(time) = segment.max_time().as_counter() {
                        max_time = max_time.max(time);
                    }

                    segments.push(Arc::new(segment));
                }

                level.install(segments);
            }

            // Unreferenced segment files are leftovers of interrupted
            // compactions
            for (idx, level) in levels.iter().enumerate() {
                let referenced: FxHashSet<SegmentId> = id_lists
                    .get(idx)
                    .map(|ids| ids.iter().copied().collect())
                    .unwrap_or_default();

                for dir_entry in std::fs::read_dir(level.dir())? {
                    let dir_entry = dir_entry?;
                    let file_path = dir_entry.path();

                    let is_segment = file_path
                        .extension()
                        .is_some_and(|ext| ext == SEGMENT_EXT);
                    if !is_segment {
                        continue;
                    }

                    let id = file_path
                        .file_stem()
                        .and_then(|stem| stem.to_str())
                        .and_then(|stem| stem.parse::<SegmentId>().ok());

                    if id.map_or(true, |id| !referenced.contains(&id)) {
                        log::warn!("removing orphaned segment file {file_path:?}");
                        let _ = std::fs::remove_file(&file_path);
                    }
                }
            }
        } else {
            manifest::write(&path, &vec![vec![]; levels.len()])?;
        }

        let memtable_ids = AtomicU64::new(1);
        let active = Arc::new(Memtable::new(0, order.clone(), &config.optimise_writes));

        let inner = Arc::new(CoreInner {
            path,
            order,
            functions,
            memtable_threshold: config.memtable_threshold,
            optimise_writes: config.optimise_writes.clone(),
            mmap: config.mmap,
            committer: config.committer,
            compaction_throttle: config.compaction_throttle,
            time: TimeCounter::new(max_time),
            segment_ids: AtomicU64::new(max_segment_id + 1),
            memtable_ids,
            result_ids: AtomicU64::new(1),
            active: RwLock::new(active),
            sealed: RwLock::new(vec![]),
            levels,
            cache,
            write_lock: Mutex::new(()),
            task_lock: Mutex::new(()),
            commit_lock: Mutex::new(CommitState {
                applied_results: FxHashSet::default(),
            }),
            commit_guard: AtomicThreadLocalGuard::default(),
            stop_signal: StopSignal::default(),
            worker: Mutex::new(None),
            closed: AtomicBool::default(),
        });

        let handle = worker::spawn(inner.clone());

        inner
            .worker
            .lock()
            .expect("lock is poisoned")
            .replace(handle);

        log::info!("opened database at {:?}", inner.path);

        Ok(Self(inner))
    }

    fn op_to_entry(&self, op: WriteOp, time: &Time) -> crate::Result<Entry> {
        let check_key = |key: &UserKey| -> crate::Result<()> {
            if key.is_empty() {
                return Err(crate::Error::InvalidInput("key may not be empty"));
            }
            Ok(())
        };

        let check_interval = |from: &UserKey, to: &UserKey| -> crate::Result<()> {
            check_key(from)?;
            if !self.order.lt(from, to) {
                return Err(crate::Error::InvalidInput(
                    "range start must be below range end",
                ));
            }
            Ok(())
        };

        let check_function = |id: &Slice| -> crate::Result<()> {
            if id.is_empty() {
                return Err(crate::Error::InvalidInput("function id may not be empty"));
            }
            if !self.functions.contains(id) {
                return Err(crate::Error::InvalidInput("unregistered function id"));
            }
            Ok(())
        };

        Ok(match op {
            WriteOp::Put {
                key,
                value,
                deadline,
            } => {
                check_key(&key)?;
                Entry::Point {
                    key,
                    value: Value::Put {
                        value,
                        deadline,
                        time: time.clone(),
                    },
                }
            }
            WriteOp::Remove { key, deadline } => {
                check_key(&key)?;
                Entry::Point {
                    key,
                    value: Value::Remove {
                        deadline,
                        time: time.clone(),
                    },
                }
            }
            WriteOp::Update { key, value } => {
                check_key(&key)?;
                Entry::Point {
                    key,
                    value: Value::Update {
                        value,
                        deadline: None,
                        time: time.clone(),
                    },
                }
            }
            WriteOp::ApplyFunction { key, function_id } => {
                check_key(&key)?;
                check_function(&function_id)?;
                Entry::Point {
                    key,
                    value: Value::Function {
                        function_id,
                        time: time.clone(),
                    },
                }
            }
            WriteOp::RemoveRange { from, to, deadline } => {
                check_interval(&from, &to)?;
                Entry::Range {
                    from_key: from,
                    to_key: to,
                    from_value: None,
                    range_value: Value::Remove {
                        deadline,
                        time: time.clone(),
                    },
                }
            }
            WriteOp::UpdateRange { from, to, value } => {
                check_interval(&from, &to)?;
                Entry::Range {
                    from_key: from,
                    to_key: to,
                    from_value: None,
                    range_value: Value::Update {
                        value,
                        deadline: None,
                        time: time.clone(),
                    },
                }
            }
            WriteOp::ApplyFunctionRange {
                from,
                to,
                function_id,
            } => {
                check_interval(&from, &to)?;
                check_function(&function_id)?;
                Entry::Range {
                    from_key: from,
                    to_key: to,
                    from_value: None,
                    range_value: Value::Function {
                        function_id,
                        time: time.clone(),
                    },
                }
            }
        })
    }

    /// Applies a batch of operations, stamped with a single time token.
    pub fn write(&self, batch: Vec<WriteOp>) -> crate::Result<()> {
        self.ensure_open()?;

        let _write_guard = self.write_lock.lock().expect("lock is poisoned");

        let time = self.time.next();

        let mut entries = Vec::with_capacity(batch.len());
        for op in batch {
            entries.push(self.op_to_entry(op, &time)?);
        }

        let memtable = self.active_memtable();
        memtable.apply(entries, &self.functions)?;

        if memtable.size_bytes() > self.memtable_threshold {
            self.rotate_active();
            self.unpark_worker();
        }

        Ok(())
    }

    /// Writes a value.
    pub fn put(&self, key: impl Into<UserKey>, value: impl Into<UserValue>) -> crate::Result<()> {
        self.write(vec![WriteOp::Put {
            key: key.into(),
            value: Some(value.into()),
            deadline: None,
        }])
    }

    /// Deletes a key.
    pub fn remove(&self, key: impl Into<UserKey>) -> crate::Result<()> {
        self.write(vec![WriteOp::Remove {
            key: key.into(),
            deadline: None,
        }])
    }

    /// Schedules a key's removal.
    pub fn expire(&self, key: impl Into<UserKey>, deadline: Deadline) -> crate::Result<()> {
        self.write(vec![WriteOp::Remove {
            key: key.into(),
            deadline: Some(deadline),
        }])
    }

    /// Modifies the value of an existing put; a key without a put is
    /// unaffected.
    pub fn update(
        &self,
        key: impl Into<UserKey>,
        value: impl Into<UserValue>,
    ) -> crate::Result<()> {
        self.write(vec![WriteOp::Update {
            key: key.into(),
            value: Some(value.into()),
        }])
    }

    /// Applies a registered function to a key.
    pub fn apply_function(
        &self,
        key: impl Into<UserKey>,
        function_id: impl Into<Slice>,
    ) -> crate::Result<()> {
        self.write(vec![WriteOp::ApplyFunction {
            key: key.into(),
            function_id: function_id.into(),
        }])
    }

    /// Deletes every key in `[from, to)`.
    pub fn remove_range(
        &self,
        from: impl Into<UserKey>,
        to: impl Into<UserKey>,
    ) -> crate::Result<()> {
        self.write(vec![WriteOp::RemoveRange {
            from: from.into(),
            to: to.into(),
            deadline: None,
        }])
    }

    /// Modifies every existing put in `[from, to)`.
    pub fn update_range(
        &self,
        from: impl Into<UserKey>,
        to: impl Into<UserKey>,
        value: impl Into<UserValue>,
    ) -> crate::Result<()> {
        self.write(vec![WriteOp::UpdateRange {
            from: from.into(),
            to: to.into(),
            value: Some(value.into()),
        }])
    }

    /// Applies a registered function to every existing put in `[from, to)`.
    pub fn apply_function_range(
        &self,
        from: impl Into<UserKey>,
        to: impl Into<UserKey>,
        function_id: impl Into<Slice>,
    ) -> crate::Result<()> {
        self.write(vec![WriteOp::ApplyFunctionRange {
            from: from.into(),
            to: to.into(),
            function_id: function_id.into(),
        }])
    }

    /// Returns the visible state of a key.
    pub fn get(&self, key: &[u8]) -> crate::Result<Option<Projection>> {
        self.ensure_open()?;

        if key.is_empty() {
            return Err(crate::Error::InvalidInput("key may not be empty"));
        }

        let mut acc: Option<Value> = None;

        if fold_step(&mut acc, self.active_memtable().fetch(key), &self.functions)? {
            return Ok(project(acc));
        }

        for memtable in self.sealed_memtables().iter().rev() {
            if fold_step(&mut acc, memtable.fetch(key), &self.functions)? {
                return Ok(project(acc));
            }
        }

        for level in &self.levels {
            if fold_step(&mut acc, level.fetch(key)?, &self.functions)? {
                return Ok(project(acc));
            }
        }

        Ok(project(acc))
    }

    /// Returns `true` if the key is visible.
    pub fn contains(&self, key: &[u8]) -> crate::Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Iterates all visible keys.
    pub fn iter(&self, direction: Direction) -> crate::Result<DbIter> {
        self.range((Bound::Unbounded, Bound::Unbounded), direction)
    }

    /// Iterates the visible keys within `bounds`.
    pub fn range(
        &self,
        bounds: (Bound<Slice>, Bound<Slice>),
        direction: Direction,
    ) -> crate::Result<DbIter> {
        self.ensure_open()?;
        DbIter::new(&self.0, bounds, direction)
    }

    /// Flushes the in-memory level into the first persistent level.
    pub fn flush(&self) -> crate::Result<()> {
        self.ensure_open()?;

        {
            let _write_guard = self.write_lock.lock().expect("lock is poisoned");
            self.rotate_active();
        }

        let committer = committer_for(self.committer);

        loop {
            let _task_guard = self.lock_tasks();

            let Some(memtable) = self.oldest_sealed_memtable() else {
                return Ok(());
            };

            committer.process(&self.0, Task::Flush { memtable }, false)?;
        }
    }

    /// Runs pending compaction until no level overflows.
    ///
    /// Useful for tests and controlled shutdowns; the background worker
    /// does the same continuously.
    pub fn compact(&self) -> crate::Result<()> {
        self.ensure_open()?;

        while process_one(&self.0)? {}
        Ok(())
    }

    /// Stops compaction, drains the write buffer and marks the database
    /// closed. Idempotent.
    pub fn close(&self) -> crate::Result<()> {
        if self.closed.swap(true, SeqCst) {
            return Ok(());
        }

        log::info!("closing database at {:?}", self.path);

        self.stop_signal.send();
        self.unpark_worker();

        let handle = self.worker.lock().expect("lock is poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        // Without a write-ahead log, buffered writes are only durable
        // once flushed
        {
            let _write_guard = self.write_lock.lock().expect("lock is poisoned");
            self.rotate_active();
        }

        let committer = committer_for(self.committer);

        loop {
            let _task_guard = self.lock_tasks();

            let Some(memtable) = self.oldest_sealed_memtable() else {
                break;
            };

            committer.process(&self.0, Task::Flush { memtable }, false)?;
        }

        Ok(())
    }

    /// Closes the database and deletes its directory.
    pub fn delete(self) -> crate::Result<()> {
        self.close()?;
        std::fs::remove_dir_all(&self.path)?;
        Ok(())
    }

    /// Approximate bytes buffered in the in-memory level.
    #[must_use]
    pub fn write_buffer_size(&self) -> u64 {
        self.active_memtable().size_bytes()
            + self
                .sealed_memtables()
                .iter()
                .map(|m| m.size_bytes())
                .sum::<u64>()
    }

    /// Returns the number of segments per persistent level.
    #[must_use]
    pub fn segment_counts(&self) -> Vec<usize> {
        self.levels.iter().map(|l| l.segment_count()).collect()
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        if !self.closed.load(Acquire) {
            if let Err(e) = self.close() {
                log::warn!("error while closing database on drop: {e:?}");
            }
        }
    }
}

struct HeapItem {
    key: UserKey,
    src: usize,
    order: KeyOrder,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.order
            .cmp(&self.key, &other.key)
            .then(self.src.cmp(&other.src))
    }
}

enum SourceIter {
    Mem(std::vec::IntoIter<Entry>),
    Level(crate::level::LevelIter),
}

enum Resolver {
    Mem(Arc<Memtable>),
    Run(Arc<Vec<Arc<Segment>>>, KeyOrder),
}

impl Resolver {
    fn covering_edge(&self, key: &[u8]) -> crate::Result<Option<Value>> {
        match self {
            Self::Mem(memtable) => {
                if memtable.range_count() == 0 {
                    Ok(None)
                } else {
                    Ok(memtable.fetch(key))
                }
            }
            Self::Run(run, order) => {
                match crate::level::run_segment_for_key(run, key, order) {
                    Some(segment) if segment.range_count() > 0 => segment.fetch(key),
                    _ => Ok(None),
                }
            }
        }
    }
}

struct DbSource {
    iter: SourceIter,
    peeked: Option<Entry>,
}

/// Iterator over the visible keys of the database
///
/// Holds reference-counted snapshots of the memtables and level runs it
/// was created from; concurrent commits do not disturb it.
pub struct DbIter {
    sources: Vec<DbSource>,
    resolvers: Vec<Resolver>,
    heap: interval_heap::IntervalHeap<HeapItem>,
    order: KeyOrder,
    functions: FunctionStore,
    direction: Direction,
    done: bool,
}

impl DbIter {
    fn new(
        core: &Arc<CoreInner>,
        bounds: (Bound<Slice>, Bound<Slice>),
        direction: Direction,
    ) -> crate::Result<Self> {
        let order = core.order.clone();
        let functions = core.functions.clone();

        let mut memtables = vec![core.active_memtable()];
        let mut sealed = core.sealed_memtables();
        sealed.reverse();
        memtables.extend(sealed);

        let mut sources = vec![];
        let mut resolvers = vec![];

        for memtable in memtables {
            let mut entries: Vec<Entry> = memtable
                .snapshot()
                .into_iter()
                .filter(|entry| key_within(entry.start_key(), &bounds, &order))
                .collect();

            if matches!(direction, Direction::Backward) {
                entries.reverse();
            }

            sources.push(DbSource {
                iter: SourceIter::Mem(entries.into_iter()),
                peeked: None,
            });
            resolvers.push(Resolver::Mem(memtable));
        }

        for level in &core.levels {
            sources.push(DbSource {
                iter: SourceIter::Level(level.iter(bounds.clone(), direction)),
                peeked: None,
            });
            resolvers.push(Resolver::Run(level.current(), order.clone()));
        }

        let mut iter = Self {
            heap: interval_heap::IntervalHeap::with_capacity(sources.len()),
            sources,
            resolvers,
            order,
            functions,
            direction,
            done: false,
        };

        for src in 0..iter.sources.len() {
            iter.advance(src)?;
        }

        Ok(iter)
    }

    fn advance(&mut self, src: usize) -> crate::Result<()> {
        let entry = {
            let Some(source) = self.sources.get_mut(src) else {
                return Ok(());
            };

            match &mut source.iter {
                SourceIter::Mem(iter) => iter.next(),
                SourceIter::Level(iter) => iter.next().transpose()?,
            }
        };

        if let Some(entry) = entry {
            let key = entry.start_key().clone();

            if let Some(source) = self.sources.get_mut(src) {
                source.peeked = Some(entry);
            }

            self.heap.push(HeapItem {
                key,
                src,
                order: self.order.clone(),
            });
        }

        Ok(())
    }

    fn pop(&mut self) -> Option<HeapItem> {
        match self.direction {
            Direction::Forward => self.heap.pop_min(),
            Direction::Backward => self.heap.pop_max(),
        }
    }

    fn step(&mut self) -> crate::Result<Option<(UserKey, Projection)>> {
        loop {
            let Some(first) = self.pop() else {
                return Ok(None);
            };

            let candidate = first.key.clone();
            let mut contributors = vec![first.src];

            while let Some(item) = self.pop() {
                if self.order.eq(&item.key, &candidate) {
                    contributors.push(item.src);
                } else {
                    self.heap.push(item);
                    break;
                }
            }

            let mut found: Vec<(usize, Value)> = vec![];

            for src in &contributors {
                let Some(entry) = self
                    .sources
                    .get_mut(*src)
                    .and_then(|source| source.peeked.take())
                else {
                    continue;
                };

                let value = match entry {
                    Entry::Point { value, .. } => value,
                    Entry::Range {
                        from_value,
                        range_value,
                        ..
                    } => from_value.unwrap_or(range_value),
                };

                found.push((*src, value));
            }

            for src in &contributors {
                self.advance(*src)?;
            }

            // Ranges reaching in from other sources shadow or rewrite the
            // candidate as well
            for src in 0..self.resolvers.len() {
                if contributors.contains(&src) {
                    continue;
                }

                if let Some(resolver) = self.resolvers.get(src) {
                    if let Some(edge) = resolver.covering_edge(&candidate)? {
                        found.push((src, edge));
                    }
                }
            }

            // Shallower sources are newer
            found.sort_by_key(|(src, _)| *src);

            let mut acc: Option<Value> = None;
            for (_, value) in found {
                if fold_step(&mut acc, Some(value), &self.functions)? {
                    break;
                }
            }

            if let Some(projection) = project(acc) {
                return Ok(Some((candidate, projection)));
            }
        }
    }
}

impl Iterator for DbIter {
    type Item = crate::Result<(UserKey, Projection)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.step() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LevelConfig;
    use test_log::test;

    fn open_small(path: &std::path::Path) -> crate::Result<Core> {
        Config::new(path)
            .levels(vec![
                LevelConfig {
                    target_segment_size: 16 * 1_024,
                    threshold_bytes: 32 * 1_024,
                    ..Default::default()
                },
                LevelConfig {
                    target_segment_size: 16 * 1_024,
                    threshold_bytes: 256 * 1_024,
                    ..Default::default()
                },
            ])
            .open()
    }

    #[test]
    fn committing_the_same_result_twice_is_rejected() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = open_small(dir.path())?;

        for i in 0..100u32 {
            db.put(format!("key-{i:05}"), "v")?;
        }
        db.flush()?;

        let level1 = db.level(1).expect("configured").clone();
        let segment_ids: Vec<SegmentId> =
            level1.current().iter().map(|s| s.id()).collect();
        assert!(!segment_ids.is_empty());

        // drain level 1 without replacement
        let result_id = db.next_result_id();
        db.commit(CompactResult {
            id: result_id,
            to_level: 2,
            new_segments: vec![],
            consumed_dest: vec![],
            source: ResultSource::Level {
                number: 1,
                segment_ids: segment_ids.clone(),
            },
        })?;
        assert_eq!(0, level1.segment_count());

        // replaying the result id is rejected
        assert!(matches!(
            db.commit(CompactResult {
                id: result_id,
                to_level: 2,
                new_segments: vec![],
                consumed_dest: vec![],
                source: ResultSource::SameLevel,
            }),
            Err(crate::Error::CommitRejected)
        ));

        // a fresh result against the already-consumed segments is stale
        assert!(matches!(
            db.commit(CompactResult {
                id: db.next_result_id(),
                to_level: 2,
                new_segments: vec![],
                consumed_dest: vec![],
                source: ResultSource::Level {
                    number: 1,
                    segment_ids,
                },
            }),
            Err(crate::Error::CommitRejected)
        ));
        Ok(())
    }

    #[test]
    fn commit_set_arithmetic_is_exact() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = open_small(dir.path())?;

        for i in 0..300u32 {
            db.put(format!("key-{i:05}"), [1u8; 32])?;
        }
        db.flush()?;

        let before_l1: Vec<SegmentId> = db
            .level(1)
            .expect("configured")
            .current()
            .iter()
            .map(|s| s.id())
            .collect();

        for i in 0..300u32 {
            db.put(format!("key-{i:05}"), [2u8; 32])?;
        }
        db.flush()?;

        let after_l1: Vec<SegmentId> = db
            .level(1)
            .expect("configured")
            .current()
            .iter()
            .map(|s| s.id())
            .collect();

        // the old overlapping segments were consumed, the new ones are
        // all fresh ids, no duplicates
        for id in &before_l1 {
            assert!(!after_l1.contains(id));
        }

        let mut deduped = after_l1.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), after_l1.len());
        Ok(())
    }
}
