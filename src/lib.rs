// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded, persistent, ordered key-value store organized as a
//! multi-level log-structured merge tree.
//!
//! ##### About
//!
//! Writes enter an in-memory level (a concurrent skip list, optionally
//! with a sequential-write fast path) and are flushed into a chain of
//! persistent levels made of immutable segment files. Background
//! compaction merges segments toward deeper levels without stalling
//! foreground traffic.
//!
//! Entries are more than plain key-value pairs: puts, updates, removals,
//! registered functions, deferred apply chains and key ranges all carry a
//! totally ordered *time* token, and reads collapse the entry stack for a
//! key under time dominance. A later write is never masked by an earlier
//! one, regardless of where the entries physically live.
//!
//! Segments are self-describing: values, a prefix-compressed sorted
//! index with restart points, an optional binary search index, an
//! optional hash index, an optional bloom filter and a CRC-guarded
//! footer. Blocks are fetched lazily through a shared cache bounded by
//! bytes and time-to-live.
//!
//! # Example usage
//!
//! ```
//! use lsm_engine::{Config, Direction};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let db = Config::new(folder).open()?;
//!
//! db.put("my_key", "my_value")?;
//!
//! if let Some(item) = db.get(b"my_key")? {
//!     assert_eq!(Some("my_value".into()), item.value);
//! }
//!
//! // Search by range
//! for item in db.iter(Direction::Forward)? {
//!     let (_key, _value) = item?;
//! }
//!
//! // Delete a whole interval at once
//! db.remove_range("a", "z")?;
//! assert!(db.get(b"my_key")?.is_none());
//! #
//! # Ok::<(), lsm_engine::Error>(())
//! ```

#![deny(clippy::unwrap_used)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![warn(clippy::expect_used)]
#![warn(missing_docs)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::option_if_let_else)]

mod cache;
mod coding;
mod compaction;
mod compression;
mod config;
mod core;
mod entry;
mod error;
mod file;
mod functions;
mod guard;
mod key_range;

#[doc(hidden)]
pub mod level;

mod manifest;

#[doc(hidden)]
pub mod memtable;

#[doc(hidden)]
pub mod merge;

mod order;
mod retry;

#[doc(hidden)]
pub mod segment;

mod slice;
mod stop_signal;
mod time;

/// Direction of an iteration
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Ascending key order
    Forward,

    /// Descending key order
    Backward,
}

#[doc(hidden)]
pub use {
    coding::{DecodeError, EncodeError},
    stop_signal::StopSignal,
};

pub use {
    cache::BlockCache,
    compression::CompressionType,
    config::{CommitterMode, Config, LevelConfig, MmapPolicy, OptimiseWrites},
    core::{Core, DbIter, Projection, WriteOp},
    entry::{Apply, Entry, UserKey, UserValue, Value},
    error::{Error, Result},
    functions::{FunctionOutput, FunctionStore, RegisteredFunction},
    guard::AtomicThreadLocalGuard,
    key_range::KeyRange,
    memtable::Memtable,
    order::KeyOrder,
    retry::retry,
    segment::{writer::WriterOptions, Segment, SegmentId},
    slice::Slice,
    time::{Deadline, Time, TimeCounter},
};
