// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The appendix records the current segment set of every persistent level.
//!
//! It is rewritten atomically on each commit, before the in-memory level
//! state is swapped, so a crash between the two leaves at worst unreferenced
//! segment files, which recovery removes.

use crate::{
    coding::DecodeError,
    file::{rewrite_atomic, APPENDIX_FILE},
    segment::SegmentId,
};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::path::{Path, PathBuf};
use varint_rs::{VarintReader, VarintWriter};

const MAGIC_BYTES: [u8; 4] = *b"LSMA";
const VERSION: u8 = 1;

fn appendix_path(db_root: &Path) -> PathBuf {
    db_root.join(APPENDIX_FILE)
}

/// Returns `true` if a database appendix exists in the directory.
#[must_use]
pub fn exists(db_root: &Path) -> bool {
    appendix_path(db_root).try_exists().unwrap_or(false)
}

/// Atomically persists the segment ids of every level (index 0 holds
/// level 1).
pub fn write(db_root: &Path, levels: &[Vec<SegmentId>]) -> crate::Result<()> {
    let mut body = vec![];
    body.extend_from_slice(&MAGIC_BYTES);
    body.push(VERSION);

    body.push(levels.len() as u8);
    for segment_ids in levels {
        body.write_u32_varint(segment_ids.len() as u32)
            .map_err(crate::coding::EncodeError::from)?;

        for id in segment_ids {
            body.write_u64_varint(*id)
                .map_err(crate::coding::EncodeError::from)?;
        }
    }

    body.write_u32::<BigEndian>(crc32fast::hash(&body))
        .map_err(crate::coding::EncodeError::from)?;

    rewrite_atomic(&appendix_path(db_root), &body)?;

    log::trace!(
        "persisted appendix: {:?}",
        levels.iter().map(Vec::len).collect::<Vec<_>>(),
    );

    Ok(())
}

/// Reads the persisted segment ids of every level.
pub fn read(db_root: &Path) -> crate::Result<Vec<Vec<SegmentId>>> {
    let body = std::fs::read(appendix_path(db_root))?;

    if body.len() < MAGIC_BYTES.len() + 2 + 4 {
        return Err(DecodeError::InvalidHeader("Appendix").into());
    }

    let crc_start = body.len() - 4;
    let expected = BigEndian::read_u32(body.get(crc_start..).unwrap_or_default());
    let body = body.get(..crc_start).unwrap_or_default();

    let got = crc32fast::hash(body);
    if got != expected {
        return Err(DecodeError::Checksum((got, expected)).into());
    }

    let mut reader = body;

    let mut magic = [0u8; 4];
    std::io::Read::read_exact(&mut reader, &mut magic).map_err(DecodeError::from)?;
    if magic != MAGIC_BYTES {
        return Err(DecodeError::InvalidHeader("Appendix").into());
    }

    let mut version = [0u8; 1];
    std::io::Read::read_exact(&mut reader, &mut version).map_err(DecodeError::from)?;
    if version[0] != VERSION {
        return Err(crate::Error::InvalidVersion(version[0]));
    }

    let mut level_count = [0u8; 1];
    std::io::Read::read_exact(&mut reader, &mut level_count).map_err(DecodeError::from)?;

    let mut levels = Vec::with_capacity(usize::from(level_count[0]));

    for _ in 0..level_count[0] {
        let count = reader.read_u32_varint().map_err(DecodeError::from)? as usize;

        let mut segment_ids = Vec::with_capacity(count);
        for _ in 0..count {
            segment_ids.push(reader.read_u64_varint().map_err(DecodeError::from)?);
        }

        levels.push(segment_ids);
    }

    Ok(levels)
}
