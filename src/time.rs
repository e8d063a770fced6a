// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Slice;
use std::sync::{
    atomic::{
        AtomicU64,
        Ordering::{AcqRel, Acquire, Release},
    },
    Arc,
};

/// Returns the current wall clock as whole milliseconds since the Unix epoch.
#[must_use]
pub fn unix_millis_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before 1970")
        .as_millis() as u64
}

/// An opaque, totally ordered token attached to every write
///
/// A later time strictly dominates an earlier one during merging.
/// Comparison is unsigned lexicographic over the token bytes, so the
/// empty time is the bottom element.
#[derive(Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Time(Slice);

impl Time {
    /// The bottom element.
    #[must_use]
    pub fn empty() -> Self {
        Self(Slice::empty())
    }

    /// Returns the raw token bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns `true` if this is the bottom element.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decodes the token as a counter value, if it has the counter layout.
    pub(crate) fn as_counter(&self) -> Option<u64> {
        let bytes: &[u8] = &self.0;
        let bytes: [u8; 8] = bytes.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }
}

impl From<Slice> for Time {
    fn from(value: Slice) -> Self {
        Self(value)
    }
}

// Big-endian layout, so byte order equals numeric order
impl From<u64> for Time {
    fn from(value: u64) -> Self {
        Self(Slice::from(value.to_be_bytes()))
    }
}

impl std::fmt::Debug for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.as_counter() {
            Some(n) => write!(f, "t{n}"),
            None => write!(f, "t{:?}", self.bytes()),
        }
    }
}

/// Thread-safe generator of monotonically increasing [`Time`] tokens
///
/// All entries of one write batch are stamped with a single token.
#[derive(Clone, Default, Debug)]
pub struct TimeCounter(Arc<AtomicU64>);

impl TimeCounter {
    /// Creates a new counter, continuing after some previous value.
    #[must_use]
    pub fn new(prev: u64) -> Self {
        Self(Arc::new(AtomicU64::new(prev)))
    }

    /// Returns the would-be-next counter value without incrementing.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Acquire)
    }

    /// Issues the next time token.
    #[must_use]
    pub fn next(&self) -> Time {
        Time::from(self.0.fetch_add(1, Release) + 1)
    }

    /// Raises the counter to at least `value`.
    pub fn fetch_max(&self, value: u64) {
        self.0.fetch_max(value, AcqRel);
    }
}

/// Absolute expiry instant, stored as whole milliseconds since the Unix epoch
///
/// An entry with an elapsed deadline behaves as if it were absent.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Deadline(u64);

impl Deadline {
    /// Creates a deadline from a Unix timestamp in milliseconds.
    #[must_use]
    pub fn from_unix_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Creates a deadline some duration from now.
    #[must_use]
    pub fn after(duration: std::time::Duration) -> Self {
        Self(unix_millis_now().saturating_add(duration.as_millis() as u64))
    }

    /// Returns the deadline as a Unix timestamp in milliseconds.
    #[must_use]
    pub fn unix_millis(self) -> u64 {
        self.0
    }

    /// Returns `true` if the deadline has elapsed.
    #[must_use]
    pub fn is_expired(self) -> bool {
        self.0 <= unix_millis_now()
    }
}
