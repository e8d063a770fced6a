// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};

/// Collects the sorted-index byte offsets of restart points
#[derive(Debug, Default)]
pub struct Builder(Vec<u32>);

impl Builder {
    pub fn insert(&mut self, offset: u32) {
        self.0.push(offset);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serializes the offsets into a block payload.
    pub fn encode_into_vec(&self) -> crate::Result<Vec<u8>> {
        let mut out = vec![];
        out.write_u32::<BigEndian>(self.0.len() as u32)
            .map_err(crate::coding::EncodeError::from)?;

        for offset in &self.0 {
            out.write_u32::<BigEndian>(*offset)
                .map_err(crate::coding::EncodeError::from)?;
        }

        Ok(out)
    }
}

/// Reads restart point offsets directly from a block payload
pub struct Reader<'a> {
    data: &'a [u8],
    len: usize,
}

impl<'a> Reader<'a> {
    pub fn new(payload: &'a [u8]) -> crate::Result<Self> {
        let mut reader = payload;
        let len = reader
            .read_u32::<BigEndian>()
            .map_err(crate::coding::DecodeError::from)? as usize;

        let data = payload
            .get(4..)
            .ok_or(crate::Error::CorruptedBlock("truncated binary index"))?;

        if data.len() < len * 4 {
            return Err(crate::Error::CorruptedBlock("truncated binary index"));
        }

        Ok(Self { data, len })
    }

    /// Returns the number of restart points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the sorted-index byte offset of the i-th restart point.
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<u32> {
        let start = idx * 4;
        self.data.get(start..start + 4).map(BigEndian::read_u32)
    }

    /// Collects all restart point offsets.
    #[must_use]
    pub fn offsets(&self) -> Vec<u32> {
        (0..self.len).filter_map(|idx| self.get(idx)).collect()
    }
}
