// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use std::io::{Read, Write};

/// Compression algorithm applied to a block payload
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CompressionType {
    /// No compression
    #[default]
    None,

    /// LZ4 compression (fast compression & decompression)
    Lz4,
}

impl CompressionType {
    pub(crate) fn id(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4 => 1,
        }
    }

    pub(crate) fn from_id(id: u8) -> Result<Self, DecodeError> {
        match id {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            other => Err(DecodeError::InvalidTag(("CompressionType", other))),
        }
    }

    /// Compresses a payload.
    pub(crate) fn compress(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::None => data.to_vec(),
            Self::Lz4 => lz4_flex::compress(data),
        }
    }

    /// Decompresses a payload of known uncompressed size.
    pub(crate) fn decompress(self, data: &[u8], uncompressed_size: usize) -> crate::Result<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Lz4 => lz4_flex::decompress(data, uncompressed_size)
                .map_err(|_| crate::Error::Decompress(self)),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::None => "no compression",
                Self::Lz4 => "lz4",
            }
        )
    }
}

impl Encode for CompressionType {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&[self.id()])?;
        Ok(())
    }
}

impl Decode for CompressionType {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut buf = [0];
        reader.read_exact(&mut buf)?;
        Self::from_id(buf[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn compression_round_trip_none() -> crate::Result<()> {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(10);
        let compressed = CompressionType::None.compress(&data);
        assert_eq!(data, compressed);
        assert_eq!(
            data,
            CompressionType::None.decompress(&compressed, data.len())?
        );
        Ok(())
    }

    #[test]
    fn compression_round_trip_lz4() -> crate::Result<()> {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(10);
        let compressed = CompressionType::Lz4.compress(&data);
        assert!(compressed.len() < data.len());
        assert_eq!(
            data,
            CompressionType::Lz4.decompress(&compressed, data.len())?
        );
        Ok(())
    }

    #[test]
    fn compression_garbage_fails() {
        let garbage = [0xAB; 16];
        assert!(CompressionType::Lz4.decompress(&garbage, 1_000).is_err());
    }
}
