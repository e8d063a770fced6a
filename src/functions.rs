// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{time::Deadline, Slice, UserValue};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Output of a registered transformation: the new value and deadline slot
pub type FunctionOutput = (Option<UserValue>, Option<Deadline>);

/// A registered transformation applied to the current value of a key
///
/// Functions MUST be deterministic and may not read external state:
/// they are re-executed during merges and compactions, possibly long after
/// the original write.
pub type RegisteredFunction =
    dyn Fn(Option<&UserValue>, Option<Deadline>) -> FunctionOutput + Send + Sync;

/// Immutable map from function id to registered transformation
///
/// Built once at open time; cloning is cheap.
#[derive(Clone, Default)]
pub struct FunctionStore {
    map: Arc<FxHashMap<Slice, Arc<RegisteredFunction>>>,
}

impl FunctionStore {
    pub(crate) fn from_map(map: FxHashMap<Slice, Arc<RegisteredFunction>>) -> Self {
        Self { map: Arc::new(map) }
    }

    /// Looks up a function by id.
    #[must_use]
    pub fn get(&self, id: &[u8]) -> Option<&Arc<RegisteredFunction>> {
        self.map.get(id)
    }

    /// Returns `true` if a function with the given id is registered.
    #[must_use]
    pub fn contains(&self, id: &[u8]) -> bool {
        self.map.contains_key(id)
    }

    /// Returns the number of registered functions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if no functions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl std::fmt::Debug for FunctionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FunctionStore({} functions)", self.map.len())
    }
}
