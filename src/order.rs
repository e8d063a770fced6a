// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::cmp::Ordering;
use std::sync::Arc;

/// Key comparison used throughout the engine
///
/// Keys are opaque byte sequences; every comparison the engine performs on
/// user keys goes through the configured order.
#[derive(Clone, Default)]
pub enum KeyOrder {
    /// Unsigned, byte-wise lexicographic order (the default)
    #[default]
    Lexicographic,

    /// Reversed lexicographic order
    Reverse,

    /// User-supplied comparison function
    Custom(Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>),
}

impl KeyOrder {
    /// Compares two keys.
    #[must_use]
    pub fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Self::Lexicographic => a.cmp(b),
            Self::Reverse => b.cmp(a),
            Self::Custom(f) => f(a, b),
        }
    }

    pub(crate) fn eq(&self, a: &[u8], b: &[u8]) -> bool {
        self.cmp(a, b) == Ordering::Equal
    }

    pub(crate) fn lt(&self, a: &[u8], b: &[u8]) -> bool {
        self.cmp(a, b) == Ordering::Less
    }

    pub(crate) fn le(&self, a: &[u8], b: &[u8]) -> bool {
        self.cmp(a, b) != Ordering::Greater
    }

    pub(crate) fn gt(&self, a: &[u8], b: &[u8]) -> bool {
        self.cmp(a, b) == Ordering::Greater
    }

    pub(crate) fn ge(&self, a: &[u8], b: &[u8]) -> bool {
        self.cmp(a, b) != Ordering::Less
    }
}

impl std::fmt::Debug for KeyOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lexicographic => write!(f, "KeyOrder::Lexicographic"),
            Self::Reverse => write!(f, "KeyOrder::Reverse"),
            Self::Custom(_) => write!(f, "KeyOrder::Custom"),
        }
    }
}
