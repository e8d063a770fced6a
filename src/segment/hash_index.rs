// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use xxhash_rust::xxh3::xxh3_64;

/// Bound on linear probing, declared in the block payload
pub const MAX_PROBE: u8 = 8;

const FREE: u32 = 0;

fn bucket_position(key: &[u8], bucket_count: u32) -> usize {
    (xxh3_64(key) % u64::from(bucket_count)) as usize
}

/// Open-addressed map from key fingerprint to restart section
///
/// Buckets store `section index + 1`; zero marks a free bucket. An insert
/// that exhausts its probe budget is dropped, clearing the completeness
/// flag, and such keys are only found through the binary search path.
#[derive(Debug)]
pub struct Builder {
    buckets: Vec<u32>,
    max_probe: u8,
    complete: bool,
}

impl Builder {
    #[must_use]
    pub fn with_bucket_count(bucket_count: u32) -> Self {
        Self {
            buckets: vec![FREE; bucket_count.max(1) as usize],
            max_probe: MAX_PROBE,
            complete: true,
        }
    }

    pub fn insert(&mut self, key: &[u8], section: u32) {
        let bucket_count = self.buckets.len() as u32;
        let start = bucket_position(key, bucket_count);
        let marker = section + 1;

        for probe in 0..usize::from(self.max_probe) {
            let idx = (start + probe) % bucket_count as usize;

            #[allow(clippy::indexing_slicing)]
            let bucket = &mut self.buckets[idx];

            if *bucket == FREE {
                *bucket = marker;
                return;
            }
            if *bucket == marker {
                // same section, nothing to add
                return;
            }
        }

        self.complete = false;
    }

    /// Serializes the table into a block payload.
    pub fn encode_into_vec(&self) -> crate::Result<Vec<u8>> {
        let mut out = vec![];
        out.write_u32::<BigEndian>(self.buckets.len() as u32)
            .map_err(crate::coding::EncodeError::from)?;
        out.write_u8(self.max_probe)
            .map_err(crate::coding::EncodeError::from)?;
        out.write_u8(u8::from(self.complete))
            .map_err(crate::coding::EncodeError::from)?;

        for bucket in &self.buckets {
            out.write_u32::<BigEndian>(*bucket)
                .map_err(crate::coding::EncodeError::from)?;
        }

        Ok(out)
    }
}

/// Outcome of probing the hash index
#[derive(Debug, Eq, PartialEq)]
pub enum Probe {
    /// Candidate restart sections to scan for the key, in probe order
    Candidates(Vec<u32>),

    /// The key is definitively not indexed (and the index is complete)
    Miss,

    /// The probe was inconclusive; fall back to binary search
    Inconclusive,
}

/// Probes a persisted hash index directly on its block payload
pub struct Reader<'a> {
    buckets: &'a [u8],
    bucket_count: u32,
    max_probe: u8,
    complete: bool,
}

impl<'a> Reader<'a> {
    pub fn new(payload: &'a [u8]) -> crate::Result<Self> {
        let mut reader = payload;
        let bucket_count = reader
            .read_u32::<BigEndian>()
            .map_err(crate::coding::DecodeError::from)?;
        let max_probe = reader
            .read_u8()
            .map_err(crate::coding::DecodeError::from)?;
        let complete = reader
            .read_u8()
            .map_err(crate::coding::DecodeError::from)?
            > 0;

        let buckets = payload
            .get(6..)
            .ok_or(crate::Error::CorruptedBlock("truncated hash index"))?;

        if buckets.len() < bucket_count as usize * 4 || bucket_count == 0 {
            return Err(crate::Error::CorruptedBlock("truncated hash index"));
        }

        Ok(Self {
            buckets,
            bucket_count,
            max_probe,
            complete,
        })
    }

    fn bucket(&self, idx: usize) -> u32 {
        self.buckets
            .get(idx * 4..idx * 4 + 4)
            .map_or(FREE, BigEndian::read_u32)
    }

    /// Probes for the restart sections possibly holding `key`.
    #[must_use]
    pub fn probe(&self, key: &[u8]) -> Probe {
        let start = bucket_position(key, self.bucket_count);
        let mut candidates = vec![];

        for probe in 0..usize::from(self.max_probe) {
            let idx = (start + probe) % self.bucket_count as usize;
            let bucket = self.bucket(idx);

            if bucket == FREE {
                // the insertion probe would have stopped here as well
                return if self.complete && candidates.is_empty() {
                    Probe::Miss
                } else if candidates.is_empty() {
                    Probe::Inconclusive
                } else {
                    Probe::Candidates(candidates)
                };
            }

            let section = bucket - 1;
            if !candidates.contains(&section) {
                candidates.push(section);
            }
        }

        if candidates.is_empty() {
            Probe::Inconclusive
        } else {
            Probe::Candidates(candidates)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn hash_index_round_trip() -> crate::Result<()> {
        let mut builder = Builder::with_bucket_count(64);
        builder.insert(b"a", 0);
        builder.insert(b"b", 0);
        builder.insert(b"m", 1);
        builder.insert(b"z", 2);

        let payload = builder.encode_into_vec()?;
        let reader = Reader::new(&payload)?;

        let Probe::Candidates(sections) = reader.probe(b"m") else {
            panic!("should find candidates");
        };
        assert!(sections.contains(&1));

        let Probe::Candidates(sections) = reader.probe(b"a") else {
            panic!("should find candidates");
        };
        assert!(sections.contains(&0));
        Ok(())
    }

    #[test]
    fn hash_index_definitive_miss() -> crate::Result<()> {
        let mut builder = Builder::with_bucket_count(64);
        builder.insert(b"a", 0);

        let payload = builder.encode_into_vec()?;
        let reader = Reader::new(&payload)?;

        // an absent key either misses outright or returns candidates that
        // will not verify; a complete index never reports Inconclusive on
        // a free bucket
        match reader.probe(b"definitely-absent") {
            Probe::Miss | Probe::Candidates(_) => {}
            Probe::Inconclusive => panic!("complete index should not be inconclusive"),
        }
        Ok(())
    }

    #[test]
    fn hash_index_overfull_falls_back() -> crate::Result<()> {
        // bucket count 1 forces every key into the same bucket
        let mut builder = Builder::with_bucket_count(1);
        builder.insert(b"a", 0);
        builder.insert(b"b", 1);

        let payload = builder.encode_into_vec()?;
        let reader = Reader::new(&payload)?;

        // key "b" was dropped; probing must not claim a definitive miss
        assert_ne!(Probe::Miss, reader.probe(b"b"));
        Ok(())
    }
}
