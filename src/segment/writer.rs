// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    binary_index,
    block::write_block,
    filter::{hash_key, BloomFilter},
    footer::{BlockHandle, Footer, FORMAT_VERSION, MAGIC_BYTES},
    hash_index,
    sorted_index::{write_entry, ValuesWriter},
};
use crate::{
    coding::Encode,
    entry::Entry,
    key_range::KeyRange,
    order::KeyOrder,
    time::{unix_millis_now, Time},
    CompressionType, UserKey,
};
use byteorder::{BigEndian, WriteBytesExt};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Block parameters for segments written by one level
#[derive(Clone, Debug)]
pub struct WriterOptions {
    /// Compression applied to data-bearing blocks
    pub compression: CompressionType,

    /// Restart interval of the sorted index (power of two)
    pub restart_interval: u8,

    /// Write the restart point index
    pub use_binary_index: bool,

    /// Bucket count per point entry; `None` skips the hash index
    pub hash_index_ratio: Option<f32>,

    /// False positive rate; `None` skips the bloom filter
    pub bloom_fp_rate: Option<f32>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            compression: CompressionType::Lz4,
            restart_interval: 16,
            use_binary_index: true,
            hash_index_ratio: Some(1.3),
            bloom_fp_rate: Some(0.01),
        }
    }
}

impl WriterOptions {
    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.restart_interval == 0 || !self.restart_interval.is_power_of_two() {
            return Err(crate::Error::InvalidInput(
                "restart interval must be a power of two",
            ));
        }
        Ok(())
    }
}

struct CountingWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Persists one segment file from a key-ordered entry stream.
///
/// The entries must be sorted by start key under `order`, with ranges in
/// the split form (no point strictly inside a range span). The file is
/// fsynced; the caller is responsible for syncing the directory.
#[allow(clippy::too_many_lines)]
pub fn write_segment(
    path: &Path,
    entries: &[Entry],
    order: &KeyOrder,
    opts: &WriterOptions,
) -> crate::Result<()> {
    opts.validate()?;

    if entries.is_empty() {
        return Err(crate::Error::InvalidInput("cannot write an empty segment"));
    }

    let interval = usize::from(opts.restart_interval);

    let mut index = vec![];
    let mut values = ValuesWriter::default();
    let mut restarts = binary_index::Builder::default();

    let mut point_count: u64 = 0;
    let mut range_count: u64 = 0;
    let mut hash_entries: Vec<(UserKey, u32)> = vec![];
    let mut bloom_hashes = vec![];

    let mut restart_key: Vec<u8> = vec![];
    let mut max_time = Time::empty();
    let mut max_key: Option<UserKey> = None;

    fn track_time(max_time: &mut Time, time: &Time) {
        if *time > *max_time {
            *max_time = time.clone();
        }
    }

    for (i, entry) in entries.iter().enumerate() {
        if i % interval == 0 {
            restarts.insert(index.len() as u32);
            restart_key = entry.start_key().to_vec();
            write_entry(&mut index, entry, None, &mut values)?;
        } else {
            write_entry(&mut index, entry, Some(&restart_key), &mut values)?;
        }

        let section = (restarts.len() - 1) as u32;

        match entry {
            Entry::Point { key, value } => {
                point_count += 1;
                hash_entries.push((key.clone(), section));
                bloom_hashes.push(hash_key(key));
                track_time(&mut max_time, value.time());
            }
            Entry::Range {
                to_key,
                from_value,
                range_value,
                ..
            } => {
                range_count += 1;
                track_time(&mut max_time, range_value.time());
                if let Some(from_value) = from_value {
                    track_time(&mut max_time, from_value.time());
                }

                let beyond = max_key
                    .as_ref()
                    .map_or(true, |max| order.gt(to_key, max));
                if beyond {
                    max_key = Some(to_key.clone());
                }
            }
        }

        let beyond = max_key
            .as_ref()
            .map_or(true, |max| order.gt(entry.start_key(), max));
        if beyond {
            max_key = Some(entry.start_key().clone());
        }
    }

    let key_range = KeyRange::new((
        entries
            .first()
            .expect("entries are not empty")
            .start_key()
            .clone(),
        max_key.expect("entries are not empty"),
    ));

    let file = std::fs::File::create(path)?;
    let mut writer = CountingWriter {
        inner: BufWriter::new(file),
        written: 0,
    };

    writer.write_all(&MAGIC_BYTES)?;
    writer.write_all(&[FORMAT_VERSION])?;

    let write_framed = |writer: &mut CountingWriter<BufWriter<std::fs::File>>,
                        payload: &[u8],
                        compression: CompressionType|
     -> crate::Result<BlockHandle> {
        let offset = writer.written;
        let size = write_block(writer, payload, compression)?;
        Ok(BlockHandle { offset, size })
    };

    let values_handle = write_framed(&mut writer, &values.into_inner(), opts.compression)?;
    let index_handle = write_framed(&mut writer, &index, opts.compression)?;

    let needs_binary = opts.use_binary_index || opts.hash_index_ratio.is_some();
    let binary_handle = if needs_binary {
        Some(write_framed(
            &mut writer,
            &restarts.encode_into_vec()?,
            opts.compression,
        )?)
    } else {
        None
    };

    let hash_handle = match opts.hash_index_ratio {
        Some(ratio) if point_count > 0 => {
            let bucket_count = ((point_count as f32) * ratio).ceil() as u32;
            let mut builder = hash_index::Builder::with_bucket_count(bucket_count);
            for (key, section) in &hash_entries {
                builder.insert(key, *section);
            }
            Some(write_framed(
                &mut writer,
                &builder.encode_into_vec()?,
                opts.compression,
            )?)
        }
        _ => None,
    };

    // A bloom filter only covers point keys; a segment holding ranges
    // answers for keys it never stored, so it gets none
    let bloom_handle = match opts.bloom_fp_rate {
        Some(fp_rate) if range_count == 0 && point_count > 0 => {
            let mut filter = BloomFilter::with_fp_rate(point_count as usize, fp_rate);
            for hash in bloom_hashes {
                filter.set_with_hash(hash);
            }
            Some(write_framed(
                &mut writer,
                &filter.encode_into_vec()?,
                CompressionType::None,
            )?)
        }
        _ => None,
    };

    let footer = Footer {
        format_version: FORMAT_VERSION,
        created_at: unix_millis_now(),
        max_time,
        key_range,
        point_count,
        range_count,
        restart_interval: opts.restart_interval,
        values: values_handle,
        sorted_index: index_handle,
        binary_index: binary_handle,
        hash_index: hash_handle,
        bloom_filter: bloom_handle,
    };

    let footer_handle = write_framed(&mut writer, &footer.encode_into_vec(), CompressionType::None)?;

    writer.write_u64::<BigEndian>(footer_handle.offset)?;
    writer.write_u32::<BigEndian>(footer_handle.size as u32)?;

    writer.flush()?;
    writer.inner.into_inner().map_err(|e| e.into_error())?.sync_all()?;

    Ok(())
}

/// Splits a merged entry stream into per-segment chunks of roughly
/// `target_size` bytes.
///
/// Cuts happen after point entries only: a chunk ending in a range would
/// carry a key range reaching up to the next chunk's first key.
#[must_use]
pub fn split_for_segments(entries: Vec<Entry>, target_size: u64) -> Vec<Vec<Entry>> {
    let mut chunks = vec![];
    let mut current = vec![];
    let mut current_size: u64 = 0;

    for entry in entries {
        current_size += entry.approximate_size() as u64;
        let is_point = !entry.is_range();
        current.push(entry);

        if current_size >= target_size && is_point {
            chunks.push(std::mem::take(&mut current));
            current_size = 0;
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{entry::Value, Slice};
    use test_log::test;

    fn put(key: &[u8], value: &[u8], time: u64) -> Entry {
        Entry::Point {
            key: Slice::from(key),
            value: Value::Put {
                value: Some(Slice::from(value)),
                deadline: None,
                time: Time::from(time),
            },
        }
    }

    #[test]
    fn writer_rejects_empty_stream() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let result = write_segment(
            &dir.path().join("0.seg"),
            &[],
            &KeyOrder::default(),
            &WriterOptions::default(),
        );
        assert!(matches!(result, Err(crate::Error::InvalidInput(_))));
    }

    #[test]
    fn writer_rejects_bad_restart_interval() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let opts = WriterOptions {
            restart_interval: 3,
            ..Default::default()
        };
        let result = write_segment(
            &dir.path().join("0.seg"),
            &[put(b"a", b"v", 1)],
            &KeyOrder::default(),
            &opts,
        );
        assert!(matches!(result, Err(crate::Error::InvalidInput(_))));
    }

    #[test]
    fn split_respects_target_size() {
        let entries: Vec<Entry> = (0..100u32)
            .map(|i| put(&i.to_be_bytes(), &[0; 100], 1))
            .collect();

        let chunks = split_for_segments(entries, 1_000);
        assert!(chunks.len() > 1);
        assert_eq!(100, chunks.iter().map(Vec::len).sum::<usize>());
    }
}
