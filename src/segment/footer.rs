// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    key_range::KeyRange,
    time::Time,
    Slice,
};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Magic bytes at the start of every segment file
pub const MAGIC_BYTES: [u8; 4] = *b"LSME";

/// Current segment format version, the first byte after the magic
pub const FORMAT_VERSION: u8 = 1;

/// Size of the fixed trailer at the end of a segment file
pub const TRAILER_SIZE: usize = 12;

const HANDLE_VALUES: u8 = 1;
const HANDLE_SORTED_INDEX: u8 = 2;
const HANDLE_BINARY_INDEX: u8 = 3;
const HANDLE_HASH_INDEX: u8 = 4;
const HANDLE_BLOOM_FILTER: u8 = 5;

/// Location of a framed block within the segment file
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockHandle {
    /// File offset of the block frame
    pub offset: u64,

    /// Total size of the block frame, header included
    pub size: u64,
}

impl Encode for BlockHandle {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64_varint(self.offset)?;
        writer.write_u64_varint(self.size)?;
        Ok(())
    }
}

impl Decode for BlockHandle {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let offset = reader.read_u64_varint()?;
        let size = reader.read_u64_varint()?;
        Ok(Self { offset, size })
    }
}

/// Self-describing trailer of a segment
///
/// Records the location of every block, the authoritative key range, entry
/// counts, creation time and format version. A CRC32 over the footer bytes
/// validates integrity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Footer {
    /// Format version the segment was written with
    pub format_version: u8,

    /// Creation wall clock, Unix milliseconds
    pub created_at: u64,

    /// Highest time token stored in the segment
    pub max_time: Time,

    /// Authoritative key range for level-placement decisions
    pub key_range: KeyRange,

    /// Number of point entries
    pub point_count: u64,

    /// Number of range entries
    pub range_count: u64,

    /// Restart interval the sorted index was written with
    pub restart_interval: u8,

    /// Values block
    pub values: BlockHandle,

    /// Primary index block
    pub sorted_index: BlockHandle,

    /// Restart point offsets, if written
    pub binary_index: Option<BlockHandle>,

    /// Key fingerprint table, if written
    pub hash_index: Option<BlockHandle>,

    /// Bloom filter, if written (never for segments with ranges)
    pub bloom_filter: Option<BlockHandle>,
}

impl Footer {
    /// Returns the total number of entries.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.point_count + self.range_count
    }

    fn encode_body(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = vec![];

        out.write_all(&[self.format_version])?;
        out.write_u64_varint(self.created_at)?;

        out.write_u32_varint(self.max_time.bytes().len() as u32)?;
        out.write_all(self.max_time.bytes())?;

        self.key_range.encode_into(&mut out)?;

        out.write_u64_varint(self.point_count)?;
        out.write_u64_varint(self.range_count)?;
        out.write_all(&[self.restart_interval])?;

        let mut handles: Vec<(u8, BlockHandle)> = vec![
            (HANDLE_VALUES, self.values),
            (HANDLE_SORTED_INDEX, self.sorted_index),
        ];
        if let Some(handle) = self.binary_index {
            handles.push((HANDLE_BINARY_INDEX, handle));
        }
        if let Some(handle) = self.hash_index {
            handles.push((HANDLE_HASH_INDEX, handle));
        }
        if let Some(handle) = self.bloom_filter {
            handles.push((HANDLE_BLOOM_FILTER, handle));
        }

        out.write_all(&[handles.len() as u8])?;
        for (id, handle) in handles {
            out.write_all(&[id])?;
            handle.encode_into(&mut out)?;
        }

        Ok(out)
    }
}

impl Encode for Footer {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let body = self.encode_body()?;
        writer.write_all(&body)?;
        writer.write_u32::<BigEndian>(crc32fast::hash(&body))?;
        Ok(())
    }
}

impl Decode for Footer {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut body = vec![];
        reader.read_to_end(&mut body)?;

        if body.len() < 4 {
            return Err(DecodeError::InvalidHeader("Footer"));
        }

        let crc_start = body.len() - 4;
        let expected = BigEndian::read_u32(body.get(crc_start..).unwrap_or_default());
        let body = body.get(..crc_start).unwrap_or_default();

        let got = crc32fast::hash(body);
        if got != expected {
            return Err(DecodeError::Checksum((got, expected)));
        }

        let mut reader = body;

        let mut format_version = [0];
        reader.read_exact(&mut format_version)?;
        let format_version = format_version[0];

        let created_at = reader.read_u64_varint()?;

        let time_len = reader.read_u32_varint()? as usize;
        let max_time = Time::from(Slice::from_reader(&mut reader, time_len)?);

        let key_range = KeyRange::decode_from(&mut reader)?;

        let point_count = reader.read_u64_varint()?;
        let range_count = reader.read_u64_varint()?;

        let mut restart_interval = [0];
        reader.read_exact(&mut restart_interval)?;
        let restart_interval = restart_interval[0];

        let mut handle_count = [0];
        reader.read_exact(&mut handle_count)?;

        let mut values = None;
        let mut sorted_index = None;
        let mut binary_index = None;
        let mut hash_index = None;
        let mut bloom_filter = None;

        for _ in 0..handle_count[0] {
            let mut id = [0];
            reader.read_exact(&mut id)?;
            let handle = BlockHandle::decode_from(&mut reader)?;

            match id[0] {
                HANDLE_VALUES => values = Some(handle),
                HANDLE_SORTED_INDEX => sorted_index = Some(handle),
                HANDLE_BINARY_INDEX => binary_index = Some(handle),
                HANDLE_HASH_INDEX => hash_index = Some(handle),
                HANDLE_BLOOM_FILTER => bloom_filter = Some(handle),
                other => return Err(DecodeError::InvalidTag(("BlockHandle", other))),
            }
        }

        let (Some(values), Some(sorted_index)) = (values, sorted_index) else {
            return Err(DecodeError::InvalidHeader("Footer"));
        };

        Ok(Self {
            format_version,
            created_at,
            max_time,
            key_range,
            point_count,
            range_count,
            restart_interval,
            values,
            sorted_index,
            binary_index,
            hash_index,
            bloom_filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn footer() -> Footer {
        Footer {
            format_version: FORMAT_VERSION,
            created_at: 1_700_000_000_000,
            max_time: Time::from(42),
            key_range: KeyRange::new((Slice::from(b"aaa"), Slice::from(b"zzz"))),
            point_count: 100,
            range_count: 2,
            restart_interval: 16,
            values: BlockHandle { offset: 5, size: 4_000 },
            sorted_index: BlockHandle {
                offset: 4_005,
                size: 2_000,
            },
            binary_index: Some(BlockHandle {
                offset: 6_005,
                size: 64,
            }),
            hash_index: None,
            bloom_filter: Some(BlockHandle {
                offset: 6_069,
                size: 256,
            }),
        }
    }

    #[test]
    fn footer_round_trip() {
        let footer = footer();
        let bytes = footer.encode_into_vec();
        let decoded = Footer::decode_from(&mut &bytes[..]).expect("should decode");
        assert_eq!(footer, decoded);
    }

    #[test]
    fn footer_crc_detects_corruption() {
        let footer = footer();
        let mut bytes = footer.encode_into_vec();

        // flip a byte in the middle
        bytes[10] ^= 0xFF;

        assert!(matches!(
            Footer::decode_from(&mut &bytes[..]),
            Err(DecodeError::Checksum(_))
        ));
    }
}
