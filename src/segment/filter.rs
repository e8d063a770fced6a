// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Two hashes that are used for double hashing
pub type CompositeHash = (u64, u64);

/// Gets the composite hash of a key.
#[must_use]
pub fn hash_key(key: &[u8]) -> CompositeHash {
    let h0 = xxhash_rust::xxh3::xxh3_128(key);
    let h1 = (h0 >> 64) as u64;
    let h2 = h0 as u64;
    (h1, h2)
}

/// A standard bloom filter over the point keys of a segment
///
/// Uses double hashing instead of `k` independent hash functions. Built in
/// memory by the segment writer, persisted as its own block, and queried
/// through [`FilterReader`] without copying the payload.
#[derive(Debug, Eq, PartialEq)]
pub struct BloomFilter {
    bits: Vec<u8>,

    /// Bit count
    m: usize,

    /// Number of hash functions
    k: usize,
}

impl BloomFilter {
    /// Constructs a bloom filter that can hold `n` items while maintaining
    /// a certain false positive rate.
    #[must_use]
    pub fn with_fp_rate(n: usize, fp_rate: f32) -> Self {
        use std::f32::consts::LN_2;

        assert!(n > 0);

        // NOTE: Some sensible minimum
        let fp_rate = fp_rate.max(0.000_001);

        let m = Self::calculate_m(n, fp_rate);
        let bpk = m / n;
        let k = (((bpk as f32) * LN_2) as usize).max(1);

        Self {
            bits: vec![0; m / 8],
            m,
            k,
        }
    }

    fn calculate_m(n: usize, fp_rate: f32) -> usize {
        use std::f32::consts::LN_2;

        let n = n as f32;
        let ln2_squared = LN_2.powi(2);

        let numerator = n * fp_rate.ln();
        let m = -(numerator / ln2_squared);

        // Round up to next byte
        ((m / 8.0).ceil() * 8.0) as usize
    }

    /// Adds a key hash to the filter.
    pub fn set_with_hash(&mut self, (mut h1, mut h2): CompositeHash) {
        for i in 0..(self.k as u64) {
            let idx = (h1 % (self.m as u64)) as usize;

            if let Some(byte) = self.bits.get_mut(idx / 8) {
                *byte |= 1 << (idx % 8);
            }

            h1 = h1.wrapping_add(h2);
            h2 = h2.wrapping_add(i);
        }
    }

    /// Serializes the filter into a block payload.
    pub fn encode_into_vec(&self) -> crate::Result<Vec<u8>> {
        let mut out = vec![];
        out.write_u64::<BigEndian>(self.m as u64)
            .map_err(crate::coding::EncodeError::from)?;
        out.write_u64::<BigEndian>(self.k as u64)
            .map_err(crate::coding::EncodeError::from)?;
        out.extend_from_slice(&self.bits);
        Ok(out)
    }
}

/// Queries a persisted bloom filter directly on its block payload
pub struct FilterReader<'a> {
    bits: &'a [u8],
    m: u64,
    k: u64,
}

impl<'a> FilterReader<'a> {
    pub fn new(payload: &'a [u8]) -> crate::Result<Self> {
        let mut reader = payload;
        let m = reader
            .read_u64::<BigEndian>()
            .map_err(crate::coding::DecodeError::from)?;
        let k = reader
            .read_u64::<BigEndian>()
            .map_err(crate::coding::DecodeError::from)?;

        let bits = payload
            .get(16..)
            .ok_or(crate::Error::CorruptedBlock("truncated bloom filter"))?;

        if (bits.len() as u64) * 8 < m {
            return Err(crate::Error::CorruptedBlock("truncated bloom filter"));
        }

        Ok(Self { bits, m, k })
    }

    /// Returns `true` if the key may be contained.
    ///
    /// Will never have a false negative.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.contains_hash(hash_key(key))
    }

    /// Returns `true` if the hash may be contained.
    #[must_use]
    pub fn contains_hash(&self, (mut h1, mut h2): CompositeHash) -> bool {
        for i in 0..self.k {
            let idx = (h1 % self.m) as usize;

            let Some(byte) = self.bits.get(idx / 8) else {
                return false;
            };
            if byte & (1 << (idx % 8)) == 0 {
                return false;
            }

            h1 = h1.wrapping_add(h2);
            h2 = h2.wrapping_add(i);
        }

        true
    }
}
