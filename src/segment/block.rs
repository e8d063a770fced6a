// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    CompressionType, Slice,
};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Framing header preceding every block payload
///
/// ```text
/// uncompressed_size: varuint
/// compressed_size:   varuint  (equals uncompressed_size without compression)
/// compression_id:    u8
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    /// Size of the payload after decompression
    pub uncompressed_size: u32,

    /// On-disk size of the payload
    pub compressed_size: u32,

    /// Compression applied to the payload
    pub compression: CompressionType,
}

impl Encode for BlockHeader {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32_varint(self.uncompressed_size)?;
        writer.write_u32_varint(self.compressed_size)?;
        writer.write_all(&[self.compression.id()])?;
        Ok(())
    }
}

impl Decode for BlockHeader {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let uncompressed_size = reader.read_u32_varint()?;
        let compressed_size = reader.read_u32_varint()?;

        let mut id = [0];
        reader.read_exact(&mut id)?;
        let compression = CompressionType::from_id(id[0])?;

        Ok(Self {
            uncompressed_size,
            compressed_size,
            compression,
        })
    }
}

/// Frames a payload into `header + compressed payload`.
pub fn write_block<W: Write>(
    writer: &mut W,
    payload: &[u8],
    compression: CompressionType,
) -> crate::Result<u64> {
    let compressed = compression.compress(payload);

    // Compression that grows the payload is pointless
    let (compression, compressed) = if compressed.len() >= payload.len() {
        (CompressionType::None, payload.to_vec())
    } else {
        (compression, compressed)
    };

    let header = BlockHeader {
        uncompressed_size: payload.len() as u32,
        compressed_size: compressed.len() as u32,
        compression,
    };

    let mut framed = vec![];
    header.encode_into(&mut framed)?;
    framed.extend_from_slice(&compressed);

    writer.write_all(&framed)?;

    Ok(framed.len() as u64)
}

/// Unframes a block from its raw on-disk bytes, returning the decompressed
/// payload.
pub fn read_block(raw: &[u8]) -> crate::Result<Slice> {
    let mut reader = std::io::Cursor::new(raw);
    let header = BlockHeader::decode_from(&mut reader)?;

    let payload_start = reader.position() as usize;
    let payload_end = payload_start + header.compressed_size as usize;

    let payload = raw
        .get(payload_start..payload_end)
        .ok_or(crate::Error::CorruptedBlock("truncated block payload"))?;

    let data = header
        .compression
        .decompress(payload, header.uncompressed_size as usize)?;

    if data.len() != header.uncompressed_size as usize {
        return Err(crate::Error::CorruptedBlock("uncompressed size mismatch"));
    }

    Ok(data.into())
}
