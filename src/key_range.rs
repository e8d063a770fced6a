// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    order::KeyOrder,
    Slice, UserKey,
};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// A key range in the format of [min, max] (inclusive on both sides)
///
/// All containment and overlap checks go through the configured key order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange(UserKey, UserKey);

impl KeyRange {
    /// Creates a new key range.
    #[must_use]
    pub fn new((min, max): (UserKey, UserKey)) -> Self {
        Self(min, max)
    }

    /// Creates an empty key range.
    #[must_use]
    pub fn empty() -> Self {
        Self(Slice::empty(), Slice::empty())
    }

    /// Returns the lower bound.
    #[must_use]
    pub fn min(&self) -> &UserKey {
        &self.0
    }

    /// Returns the upper bound.
    #[must_use]
    pub fn max(&self) -> &UserKey {
        &self.1
    }

    /// Returns `true` if the key falls within this key range.
    #[must_use]
    pub fn contains_key(&self, key: &[u8], order: &KeyOrder) -> bool {
        order.le(&self.0, key) && order.ge(&self.1, key)
    }

    /// Returns `true` if `other` overlaps at least partially with this range.
    #[must_use]
    pub fn overlaps_with(&self, other: &Self, order: &KeyOrder) -> bool {
        order.ge(&self.1, &other.0) && order.le(&self.0, &other.1)
    }

    /// Returns `true` if the interval `[from, to)` overlaps with this range.
    #[must_use]
    pub fn overlaps_with_interval(&self, from: &[u8], to: &[u8], order: &KeyOrder) -> bool {
        order.ge(&self.1, from) && order.gt(to, &self.0[..])
    }

    /// Returns `true` if none of the given ranges overlap pairwise.
    #[must_use]
    pub fn is_disjoint(ranges: &[&Self], order: &KeyOrder) -> bool {
        for (idx, a) in ranges.iter().enumerate() {
            for b in ranges.iter().skip(idx + 1) {
                if a.overlaps_with(b, order) {
                    return false;
                }
            }
        }

        true
    }
}

impl Encode for KeyRange {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32_varint(self.0.len() as u32)?;
        writer.write_all(&self.0)?;

        writer.write_u32_varint(self.1.len() as u32)?;
        writer.write_all(&self.1)?;

        Ok(())
    }
}

impl Decode for KeyRange {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let min_len = reader.read_u32_varint()? as usize;
        let min = Slice::from_reader(reader, min_len)?;

        let max_len = reader.read_u32_varint()? as usize;
        let max = Slice::from_reader(reader, max_len)?;

        Ok(Self(min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn range(a: &str, b: &str) -> KeyRange {
        KeyRange::new((a.into(), b.into()))
    }

    #[test]
    fn key_range_contains() {
        let order = KeyOrder::default();
        let r = range("b", "d");

        assert!(r.contains_key(b"b", &order));
        assert!(r.contains_key(b"c", &order));
        assert!(r.contains_key(b"d", &order));
        assert!(!r.contains_key(b"a", &order));
        assert!(!r.contains_key(b"e", &order));
    }

    #[test]
    fn key_range_overlap() {
        let order = KeyOrder::default();

        assert!(range("a", "f").overlaps_with(&range("b", "h"), &order));
        assert!(range("a", "f").overlaps_with(&range("f", "t"), &order));
        assert!(!range("a", "f").overlaps_with(&range("g", "t"), &order));
    }

    #[test]
    fn key_range_overlap_interval() {
        let order = KeyOrder::default();

        // [from, to) is half-open
        assert!(range("a", "f").overlaps_with_interval(b"f", b"x", &order));
        assert!(!range("g", "t").overlaps_with_interval(b"a", b"g", &order));
        assert!(range("g", "t").overlaps_with_interval(b"a", b"h", &order));
    }

    #[test]
    fn key_range_disjoint() {
        let order = KeyOrder::default();

        assert!(KeyRange::is_disjoint(
            &[&range("a", "d"), &range("g", "z")],
            &order
        ));
        assert!(!KeyRange::is_disjoint(
            &[&range("a", "d"), &range("d", "e")],
            &order
        ));
    }

    #[test]
    fn key_range_round_trip() {
        let r = range("abc", "xyz");
        let bytes = r.encode_into_vec();
        let decoded = KeyRange::decode_from(&mut &bytes[..]).expect("should decode");
        assert_eq!(r, decoded);
    }
}
