// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Entry codec of the primary index block.
//!
//! Entries are stored in key order. Keys are prefix-compressed against the
//! key of the enclosing restart point; a restart resets prefix compression
//! so sections can be decoded independently. User values and nested
//! payloads live in the values block and are referenced by offset.

use crate::{
    coding::{Decode, DecodeError, Encode},
    entry::{Apply, Entry, Value},
    time::{Deadline, Time},
    Slice, UserKey,
};
use std::io::Read;
use varint_rs::{VarintReader, VarintWriter};

const TAG_PUT: u8 = 0;
const TAG_UPDATE: u8 = 1;
const TAG_REMOVE: u8 = 2;
const TAG_FUNCTION: u8 = 3;
const TAG_PENDING_APPLY: u8 = 4;
const TAG_RANGE: u8 = 5;

const FLAG_HAS_VALUE: u8 = 1 << 0;
const FLAG_HAS_DEADLINE: u8 = 1 << 1;

/// Accumulates the values block while the sorted index is written
#[derive(Default)]
pub struct ValuesWriter {
    buf: Vec<u8>,
}

impl ValuesWriter {
    /// Appends a payload, returning its `(offset, length)` reference.
    pub fn append(&mut self, bytes: &[u8]) -> (u32, u32) {
        let offset = self.buf.len() as u32;
        self.buf.extend_from_slice(bytes);
        (offset, bytes.len() as u32)
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn write_time(out: &mut Vec<u8>, time: &Time) -> crate::Result<()> {
    out.write_u32_varint(time.bytes().len() as u32)
        .map_err(crate::coding::EncodeError::from)?;
    out.extend_from_slice(time.bytes());
    Ok(())
}

fn write_ref(out: &mut Vec<u8>, (offset, len): (u32, u32)) -> crate::Result<()> {
    out.write_u32_varint(offset)
        .map_err(crate::coding::EncodeError::from)?;
    out.write_u32_varint(len)
        .map_err(crate::coding::EncodeError::from)?;
    Ok(())
}

fn write_value_slot(
    out: &mut Vec<u8>,
    value: Option<&Slice>,
    deadline: Option<Deadline>,
    values: &mut ValuesWriter,
) -> crate::Result<()> {
    let mut flags = 0;
    if value.is_some() {
        flags |= FLAG_HAS_VALUE;
    }
    if deadline.is_some() {
        flags |= FLAG_HAS_DEADLINE;
    }
    out.push(flags);

    if let Some(deadline) = deadline {
        out.write_u64_varint(deadline.unix_millis())
            .map_err(crate::coding::EncodeError::from)?;
    }
    if let Some(value) = value {
        write_ref(out, values.append(value))?;
    }
    Ok(())
}

/// Encodes one entry into the sorted index.
///
/// `restart_key` is `None` exactly at restart points, where the full key is
/// stored.
pub fn write_entry(
    out: &mut Vec<u8>,
    entry: &Entry,
    restart_key: Option<&[u8]>,
    values: &mut ValuesWriter,
) -> crate::Result<()> {
    let key = entry.start_key();

    let shared = restart_key.map_or(0, |restart| common_prefix_len(restart, key));
    let rest = key.get(shared..).unwrap_or_default();

    out.write_u32_varint(shared as u32)
        .map_err(crate::coding::EncodeError::from)?;
    out.write_u32_varint(rest.len() as u32)
        .map_err(crate::coding::EncodeError::from)?;
    out.extend_from_slice(rest);

    match entry {
        Entry::Point { value, .. } => match value {
            Value::Put {
                value,
                deadline,
                time,
            } => {
                out.push(TAG_PUT);
                write_time(out, time)?;
                write_value_slot(out, value.as_ref(), *deadline, values)?;
            }
            Value::Update {
                value,
                deadline,
                time,
            } => {
                out.push(TAG_UPDATE);
                write_time(out, time)?;
                write_value_slot(out, value.as_ref(), *deadline, values)?;
            }
            Value::Remove { deadline, time } => {
                out.push(TAG_REMOVE);
                write_time(out, time)?;

                match deadline {
                    Some(deadline) => {
                        out.push(FLAG_HAS_DEADLINE);
                        out.write_u64_varint(deadline.unix_millis())
                            .map_err(crate::coding::EncodeError::from)?;
                    }
                    None => out.push(0),
                }
            }
            Value::Function { function_id, time } => {
                out.push(TAG_FUNCTION);
                write_time(out, time)?;
                out.write_u32_varint(function_id.len() as u32)
                    .map_err(crate::coding::EncodeError::from)?;
                out.extend_from_slice(function_id);
            }
            Value::PendingApply { applies } => {
                out.push(TAG_PENDING_APPLY);

                let mut blob = vec![];
                blob.write_u32_varint(applies.len() as u32)
                    .map_err(crate::coding::EncodeError::from)?;
                for apply in applies {
                    apply.encode_into(&mut blob)?;
                }
                write_ref(out, values.append(&blob))?;
            }
        },
        Entry::Range {
            to_key,
            from_value,
            range_value,
            ..
        } => {
            out.push(TAG_RANGE);

            out.write_u32_varint(to_key.len() as u32)
                .map_err(crate::coding::EncodeError::from)?;
            out.extend_from_slice(to_key);

            let mut blob = vec![];
            match from_value {
                Some(from_value) => {
                    blob.push(1);
                    from_value.encode_into(&mut blob)?;
                }
                None => blob.push(0),
            }
            range_value.encode_into(&mut blob)?;
            write_ref(out, values.append(&blob))?;
        }
    }

    Ok(())
}

fn read_time<R: Read>(reader: &mut R) -> crate::Result<Time> {
    let len = reader.read_u32_varint()? as usize;
    let bytes = Slice::from_reader(reader, len)?;
    Ok(Time::from(bytes))
}

fn read_blob<'a, R: Read>(reader: &mut R, values: &'a [u8]) -> crate::Result<&'a [u8]> {
    let offset = reader.read_u32_varint()? as usize;
    let len = reader.read_u32_varint()? as usize;

    values
        .get(offset..offset + len)
        .ok_or(crate::Error::CorruptedBlock("value reference out of bounds"))
}

fn read_value_slot<R: Read>(
    reader: &mut R,
    values: &[u8],
) -> crate::Result<(Option<Slice>, Option<Deadline>)> {
    let mut flags = [0];
    reader.read_exact(&mut flags)?;
    let flags = flags[0];

    let deadline = if flags & FLAG_HAS_DEADLINE > 0 {
        Some(Deadline::from_unix_millis(reader.read_u64_varint()?))
    } else {
        None
    };

    let value = if flags & FLAG_HAS_VALUE > 0 {
        Some(Slice::from(read_blob(reader, values)?))
    } else {
        None
    };

    Ok((value, deadline))
}

/// Decodes the sorted index sequentially, section by section
pub struct IndexReader<'a> {
    index: &'a [u8],
    values: &'a [u8],
    pos: usize,
    end: usize,
    restart_interval: usize,
    position_in_section: usize,
    restart_key: Vec<u8>,
}

impl<'a> IndexReader<'a> {
    /// Starts decoding at `start`, which must be a restart point offset
    /// (or 0), up to `end`.
    #[must_use]
    pub fn new(
        index: &'a [u8],
        values: &'a [u8],
        restart_interval: usize,
        start: usize,
        end: usize,
    ) -> Self {
        Self {
            index,
            values,
            pos: start,
            end: end.min(index.len()),
            restart_interval: restart_interval.max(1),
            position_in_section: 0,
            restart_key: vec![],
        }
    }

    /// Returns the byte offset of the next entry.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Decodes the next entry, or `None` at the end bound.
    #[allow(clippy::too_many_lines)]
    pub fn next_entry(&mut self) -> crate::Result<Option<(usize, Entry)>> {
        if self.pos >= self.end {
            return Ok(None);
        }

        let offset = self.pos;
        let remaining = self
            .index
            .get(self.pos..)
            .ok_or(crate::Error::CorruptedBlock("index cursor out of bounds"))?;
        let mut reader = std::io::Cursor::new(remaining);

        let shared = reader.read_u32_varint()? as usize;
        let rest_len = reader.read_u32_varint()? as usize;
        let rest = Slice::from_reader(&mut reader, rest_len)?;

        let at_restart = self.position_in_section % self.restart_interval == 0;
        if at_restart && shared != 0 {
            return Err(crate::Error::CorruptedBlock("restart entry shares prefix"));
        }
        if shared > self.restart_key.len() {
            return Err(crate::Error::CorruptedBlock("shared prefix out of bounds"));
        }

        let key: UserKey = {
            let mut key = Vec::with_capacity(shared + rest.len());
            key.extend_from_slice(self.restart_key.get(..shared).unwrap_or_default());
            key.extend_from_slice(&rest);
            key.into()
        };

        if at_restart {
            self.restart_key = key.to_vec();
        }
        self.position_in_section += 1;

        let mut tag = [0];
        reader.read_exact(&mut tag)?;

        let entry = match tag[0] {
            TAG_PUT => {
                let time = read_time(&mut reader)?;
                let (value, deadline) = read_value_slot(&mut reader, self.values)?;
                Entry::Point {
                    key,
                    value: Value::Put {
                        value,
                        deadline,
                        time,
                    },
                }
            }
            TAG_UPDATE => {
                let time = read_time(&mut reader)?;
                let (value, deadline) = read_value_slot(&mut reader, self.values)?;
                Entry::Point {
                    key,
                    value: Value::Update {
                        value,
                        deadline,
                        time,
                    },
                }
            }
            TAG_REMOVE => {
                let time = read_time(&mut reader)?;

                let mut flags = [0];
                reader.read_exact(&mut flags)?;
                let deadline = if flags[0] & FLAG_HAS_DEADLINE > 0 {
                    Some(Deadline::from_unix_millis(reader.read_u64_varint()?))
                } else {
                    None
                };

                Entry::Point {
                    key,
                    value: Value::Remove { deadline, time },
                }
            }
            TAG_FUNCTION => {
                let time = read_time(&mut reader)?;
                let len = reader.read_u32_varint()? as usize;
                let function_id = Slice::from_reader(&mut reader, len)?;
                Entry::Point {
                    key,
                    value: Value::Function { function_id, time },
                }
            }
            TAG_PENDING_APPLY => {
                let blob = read_blob(&mut reader, self.values)?;
                let mut blob_reader = blob;

                let count = blob_reader.read_u32_varint()? as usize;
                let mut applies = Vec::with_capacity(count);
                for _ in 0..count {
                    applies.push(Apply::decode_from(&mut blob_reader)?);
                }
                if applies.is_empty() {
                    return Err(crate::Error::CorruptedBlock("empty pending apply"));
                }

                Entry::Point {
                    key,
                    value: Value::PendingApply { applies },
                }
            }
            TAG_RANGE => {
                let to_len = reader.read_u32_varint()? as usize;
                let to_key = Slice::from_reader(&mut reader, to_len)?;

                let blob = read_blob(&mut reader, self.values)?;
                let mut blob_reader = blob;

                let mut has_from = [0];
                blob_reader.read_exact(&mut has_from)?;
                let from_value = if has_from[0] > 0 {
                    Some(Value::decode_from(&mut blob_reader)?)
                } else {
                    None
                };
                let range_value = Value::decode_from(&mut blob_reader)?;

                Entry::Range {
                    from_key: key,
                    to_key,
                    from_value,
                    range_value,
                }
            }
            other => return Err(DecodeError::InvalidTag(("IndexEntry", other)).into()),
        };

        self.pos = offset + reader.position() as usize;
        Ok(Some((offset, entry)))
    }

    /// Drains the reader into a vector.
    pub fn collect_entries(&mut self) -> crate::Result<Vec<Entry>> {
        let mut out = vec![];
        while let Some((_, entry)) = self.next_entry()? {
            out.push(entry);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn encode_all(entries: &[Entry], interval: usize) -> (Vec<u8>, Vec<u8>, Vec<u32>) {
        let mut index = vec![];
        let mut values = ValuesWriter::default();
        let mut restarts = vec![];
        let mut restart_key: Vec<u8> = vec![];

        for (i, entry) in entries.iter().enumerate() {
            if i % interval == 0 {
                restarts.push(index.len() as u32);
                restart_key = entry.start_key().to_vec();
                write_entry(&mut index, entry, None, &mut values).expect("should encode");
            } else {
                write_entry(&mut index, entry, Some(&restart_key), &mut values)
                    .expect("should encode");
            }
        }

        (index, values.into_inner(), restarts)
    }

    #[test]
    fn index_round_trip_with_prefix_compression() -> crate::Result<()> {
        let entries = vec![
            put(b"user#0001", b"a", 1),
            put(b"user#0002", b"b", 2),
            put(b"user#0003", b"c", 3),
            put(b"user#0004", b"d", 4),
            put(b"user#0005", b"e", 5),
        ];

        let (index, values, restarts) = encode_all(&entries, 2);
        assert_eq!(3, restarts.len());

        let mut reader = IndexReader::new(&index, &values, 2, 0, index.len());
        let decoded = reader.collect_entries()?;

        assert_eq!(entries, decoded);
        Ok(())
    }

    #[test]
    fn index_round_trip_all_kinds() -> crate::Result<()> {
        let entries = vec![
            Entry::Point {
                key: Slice::from(b"a"),
                value: Value::Function {
                    function_id: Slice::from(b"fn1"),
                    time: Time::from(4),
                },
            },
            Entry::Point {
                key: Slice::from(b"b"),
                value: Value::PendingApply {
                    applies: vec![
                        Apply::Update {
                            value: Some(Slice::from(b"v")),
                            deadline: None,
                            time: Time::from(1),
                        },
                        Apply::Remove {
                            deadline: Some(Deadline::from_unix_millis(5)),
                            time: Time::from(2),
                        },
                    ],
                },
            },
            Entry::Range {
                from_key: Slice::from(b"c"),
                to_key: Slice::from(b"f"),
                from_value: Some(Value::Put {
                    value: None,
                    deadline: None,
                    time: Time::from(3),
                }),
                range_value: Value::Remove {
                    deadline: None,
                    time: Time::from(3),
                },
            },
            Entry::Point {
                key: Slice::from(b"g"),
                value: Value::Remove {
                    deadline: None,
                    time: Time::from(9),
                },
            },
            Entry::Point {
                key: Slice::from(b"h"),
                value: Value::Update {
                    value: Some(Slice::from(b"u")),
                    deadline: Some(Deadline::from_unix_millis(42)),
                    time: Time::from(10),
                },
            },
        ];

        let (index, values, _) = encode_all(&entries, 16);

        let mut reader = IndexReader::new(&index, &values, 16, 0, index.len());
        let decoded = reader.collect_entries()?;

        assert_eq!(entries, decoded);
        Ok(())
    }

    #[test]
    fn index_section_decodes_independently() -> crate::Result<()> {
        let entries = vec![
            put(b"key-aa", b"1", 1),
            put(b"key-ab", b"2", 2),
            put(b"key-ba", b"3", 3),
            put(b"key-bb", b"4", 4),
        ];

        let (index, values, restarts) = encode_all(&entries, 2);
        assert_eq!(2, restarts.len());

        // decode only the second section
        let start = restarts[1] as usize;
        let mut reader = IndexReader::new(&index, &values, 2, start, index.len());
        let decoded = reader.collect_entries()?;

        assert_eq!(&entries[2..], &decoded[..]);
        Ok(())
    }
}
