// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    order::KeyOrder,
    time::{Deadline, Time},
    Slice,
};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// User defined key
pub type UserKey = Slice;

/// User defined data (blob of bytes)
pub type UserValue = Slice;

/// A deferred operation awaiting a base value to collapse against
///
/// Pending applies accumulate when two non-Put payloads meet during a merge;
/// they are folded, oldest first, once a Put is encountered.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Apply {
    /// Deferred value/deadline modification
    Update {
        /// New value, if any
        value: Option<UserValue>,
        /// New deadline, if any
        deadline: Option<Deadline>,
        /// Write time
        time: Time,
    },

    /// Deferred registered function application
    Function {
        /// Id of the registered function
        function_id: Slice,
        /// Write time
        time: Time,
    },

    /// Deferred (scheduled) removal
    Remove {
        /// Expiry instant; `None` deletes immediately
        deadline: Option<Deadline>,
        /// Write time
        time: Time,
    },
}

impl Apply {
    /// Returns the write time.
    #[must_use]
    pub fn time(&self) -> &Time {
        match self {
            Self::Update { time, .. } | Self::Function { time, .. } | Self::Remove { time, .. } => {
                time
            }
        }
    }

    /// Converts into the equivalent point payload.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Update {
                value,
                deadline,
                time,
            } => Value::Update {
                value,
                deadline,
                time,
            },
            Self::Function { function_id, time } => Value::Function { function_id, time },
            Self::Remove { deadline, time } => Value::Remove { deadline, time },
        }
    }
}

impl Encode for Apply {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::Update {
                value,
                deadline,
                time,
            } => {
                writer.write_all(&[0])?;
                write_time(writer, time)?;
                write_value_and_deadline(writer, value.as_ref(), *deadline)?;
            }
            Self::Function { function_id, time } => {
                writer.write_all(&[1])?;
                write_time(writer, time)?;
                write_bytes(writer, function_id)?;
            }
            Self::Remove { deadline, time } => {
                writer.write_all(&[2])?;
                write_time(writer, time)?;
                write_deadline(writer, *deadline)?;
            }
        }
        Ok(())
    }
}

impl Decode for Apply {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut tag = [0];
        reader.read_exact(&mut tag)?;

        Ok(match tag[0] {
            0 => {
                let time = read_time(reader)?;
                let (value, deadline) = read_value_and_deadline(reader)?;
                Self::Update {
                    value,
                    deadline,
                    time,
                }
            }
            1 => {
                let time = read_time(reader)?;
                let function_id = read_bytes(reader)?;
                Self::Function { function_id, time }
            }
            2 => {
                let time = read_time(reader)?;
                let deadline = read_deadline(reader)?;
                Self::Remove { deadline, time }
            }
            other => return Err(DecodeError::InvalidTag(("Apply", other))),
        })
    }
}

/// Payload of a point entry
///
/// Also used for range edges (`from_value`, `range_value`), where `Put` is
/// only permitted as a `from_value`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Value {
    /// Writes a value; behaves as absent once the deadline elapses
    Put {
        /// The value; `None` stores the key without data
        value: Option<UserValue>,
        /// Expiry instant
        deadline: Option<Deadline>,
        /// Write time
        time: Time,
    },

    /// Modifies an existing Put; disappears if no Put exists beneath it
    Update {
        /// New value
        value: Option<UserValue>,
        /// New deadline
        deadline: Option<Deadline>,
        /// Write time
        time: Time,
    },

    /// Deletes, optionally at a scheduled instant
    Remove {
        /// Expiry instant; `None` deletes immediately
        deadline: Option<Deadline>,
        /// Write time
        time: Time,
    },

    /// Applies a registered transformation to the current value
    Function {
        /// Id of the registered function
        function_id: Slice,
        /// Write time
        time: Time,
    },

    /// Deferred compositions awaiting a Put to collapse against
    ///
    /// Never empty; applies are ordered by ascending time.
    PendingApply {
        /// The deferred operations
        applies: Vec<Apply>,
    },
}

impl Value {
    /// Returns the dominant (latest) write time of the payload.
    ///
    /// # Panics
    ///
    /// Panics if a pending apply is empty, which is a construction bug.
    #[must_use]
    pub fn time(&self) -> &Time {
        match self {
            Self::Put { time, .. }
            | Self::Update { time, .. }
            | Self::Remove { time, .. }
            | Self::Function { time, .. } => time,

            Self::PendingApply { applies } => {
                applies.last().expect("pending applies are never empty").time()
            }
        }
    }

    /// Returns `true` if this is a Put.
    #[must_use]
    pub fn is_put(&self) -> bool {
        matches!(self, Self::Put { .. })
    }

    /// Returns `true` if the payload cannot be altered by older entries
    /// (a Put, or an unconditional tombstone).
    #[must_use]
    pub fn is_definitive(&self) -> bool {
        matches!(self, Self::Put { .. } | Self::Remove { deadline: None, .. })
    }

    /// Converts a non-Put payload into the equivalent deferred operations.
    ///
    /// # Panics
    ///
    /// Panics on a Put, which never defers.
    #[must_use]
    pub(crate) fn into_applies(self) -> Vec<Apply> {
        match self {
            Self::Update {
                value,
                deadline,
                time,
            } => vec![Apply::Update {
                value,
                deadline,
                time,
            }],
            Self::Function { function_id, time } => vec![Apply::Function { function_id, time }],
            Self::Remove { deadline, time } => vec![Apply::Remove { deadline, time }],
            Self::PendingApply { applies } => applies,
            Self::Put { .. } => unreachable!("a put is never deferred"),
        }
    }

    /// Approximate in-memory footprint, used for write buffer accounting.
    #[must_use]
    pub fn approximate_size(&self) -> usize {
        let base = std::mem::size_of::<Self>();
        match self {
            Self::Put { value, .. } | Self::Update { value, .. } => {
                base + value.as_ref().map_or(0, Slice::len)
            }
            Self::Remove { .. } => base,
            Self::Function { function_id, .. } => base + function_id.len(),
            Self::PendingApply { applies } => {
                base + applies
                    .iter()
                    .map(|apply| apply.clone().into_value().approximate_size())
                    .sum::<usize>()
            }
        }
    }
}

impl Encode for Value {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::Put {
                value,
                deadline,
                time,
            } => {
                writer.write_all(&[0])?;
                write_time(writer, time)?;
                write_value_and_deadline(writer, value.as_ref(), *deadline)?;
            }
            Self::Update {
                value,
                deadline,
                time,
            } => {
                writer.write_all(&[1])?;
                write_time(writer, time)?;
                write_value_and_deadline(writer, value.as_ref(), *deadline)?;
            }
            Self::Remove { deadline, time } => {
                writer.write_all(&[2])?;
                write_time(writer, time)?;
                write_deadline(writer, *deadline)?;
            }
            Self::Function { function_id, time } => {
                writer.write_all(&[3])?;
                write_time(writer, time)?;
                write_bytes(writer, function_id)?;
            }
            Self::PendingApply { applies } => {
                writer.write_all(&[4])?;
                writer.write_u32_varint(applies.len() as u32)?;
                for apply in applies {
                    apply.encode_into(writer)?;
                }
            }
        }
        Ok(())
    }
}

impl Decode for Value {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut tag = [0];
        reader.read_exact(&mut tag)?;

        Ok(match tag[0] {
            0 => {
                let time = read_time(reader)?;
                let (value, deadline) = read_value_and_deadline(reader)?;
                Self::Put {
                    value,
                    deadline,
                    time,
                }
            }
            1 => {
                let time = read_time(reader)?;
                let (value, deadline) = read_value_and_deadline(reader)?;
                Self::Update {
                    value,
                    deadline,
                    time,
                }
            }
            2 => {
                let time = read_time(reader)?;
                let deadline = read_deadline(reader)?;
                Self::Remove { deadline, time }
            }
            3 => {
                let time = read_time(reader)?;
                let function_id = read_bytes(reader)?;
                Self::Function { function_id, time }
            }
            4 => {
                let count = reader.read_u32_varint()? as usize;
                let mut applies = Vec::with_capacity(count);
                for _ in 0..count {
                    applies.push(Apply::decode_from(reader)?);
                }
                if applies.is_empty() {
                    return Err(DecodeError::InvalidHeader("PendingApply"));
                }
                Self::PendingApply { applies }
            }
            other => return Err(DecodeError::InvalidTag(("Value", other))),
        })
    }
}

/// A stored entry, either a single key or a key interval
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Entry {
    /// A single-key entry
    Point {
        /// The key
        key: UserKey,
        /// The payload
        value: Value,
    },

    /// Applies `range_value` to every key in `[from_key, to_key)`;
    /// `from_value` overrides at exactly `from_key`
    Range {
        /// Inclusive interval start
        from_key: UserKey,
        /// Exclusive interval end
        to_key: UserKey,
        /// Override payload at `from_key` (the only place a Put may appear)
        from_value: Option<Value>,
        /// Payload applied to all other covered keys; never a Put
        range_value: Value,
    },
}

impl Entry {
    /// Returns the key (point) or interval start (range).
    #[must_use]
    pub fn start_key(&self) -> &UserKey {
        match self {
            Self::Point { key, .. } => key,
            Self::Range { from_key, .. } => from_key,
        }
    }

    /// Returns `true` for range entries.
    #[must_use]
    pub fn is_range(&self) -> bool {
        matches!(self, Self::Range { .. })
    }

    /// Returns the effective payload of a range at `key`, which must be
    /// covered by the range.
    #[must_use]
    pub(crate) fn range_edge(&self, key: &[u8], order: &KeyOrder) -> Option<Value> {
        match self {
            Self::Point { .. } => None,
            Self::Range {
                from_key,
                from_value,
                range_value,
                ..
            } => {
                if order.eq(key, from_key) {
                    Some(from_value.clone().unwrap_or_else(|| range_value.clone()))
                } else {
                    Some(range_value.clone())
                }
            }
        }
    }

    /// Returns `true` if a range entry covers `key`.
    #[must_use]
    pub(crate) fn covers(&self, key: &[u8], order: &KeyOrder) -> bool {
        match self {
            Self::Point { .. } => false,
            Self::Range {
                from_key, to_key, ..
            } => order.le(from_key, key) && order.gt(to_key, key),
        }
    }

    /// Approximate in-memory footprint.
    #[must_use]
    pub fn approximate_size(&self) -> usize {
        match self {
            Self::Point { key, value } => key.len() + value.approximate_size(),
            Self::Range {
                from_key,
                to_key,
                from_value,
                range_value,
            } => {
                from_key.len()
                    + to_key.len()
                    + from_value.as_ref().map_or(0, Value::approximate_size)
                    + range_value.approximate_size()
            }
        }
    }
}

fn write_time<W: Write>(writer: &mut W, time: &Time) -> Result<(), EncodeError> {
    writer.write_u32_varint(time.bytes().len() as u32)?;
    writer.write_all(time.bytes())?;
    Ok(())
}

fn read_time<R: Read>(reader: &mut R) -> Result<Time, DecodeError> {
    let len = reader.read_u32_varint()? as usize;
    let bytes = Slice::from_reader(reader, len)?;
    Ok(Time::from(bytes))
}

fn write_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<(), EncodeError> {
    writer.write_u32_varint(bytes.len() as u32)?;
    writer.write_all(bytes)?;
    Ok(())
}

fn read_bytes<R: Read>(reader: &mut R) -> Result<Slice, DecodeError> {
    let len = reader.read_u32_varint()? as usize;
    Ok(Slice::from_reader(reader, len)?)
}

const FLAG_HAS_VALUE: u8 = 1 << 0;
const FLAG_HAS_DEADLINE: u8 = 1 << 1;

fn write_value_and_deadline<W: Write>(
    writer: &mut W,
    value: Option<&UserValue>,
    deadline: Option<Deadline>,
) -> Result<(), EncodeError> {
    let mut flags = 0;
    if value.is_some() {
        flags |= FLAG_HAS_VALUE;
    }
    if deadline.is_some() {
        flags |= FLAG_HAS_DEADLINE;
    }
    writer.write_all(&[flags])?;

    if let Some(deadline) = deadline {
        writer.write_u64_varint(deadline.unix_millis())?;
    }
    if let Some(value) = value {
        write_bytes(writer, value)?;
    }
    Ok(())
}

#[allow(clippy::type_complexity)]
fn read_value_and_deadline<R: Read>(
    reader: &mut R,
) -> Result<(Option<UserValue>, Option<Deadline>), DecodeError> {
    let mut flags = [0];
    reader.read_exact(&mut flags)?;
    let flags = flags[0];

    let deadline = if flags & FLAG_HAS_DEADLINE > 0 {
        Some(Deadline::from_unix_millis(reader.read_u64_varint()?))
    } else {
        None
    };

    let value = if flags & FLAG_HAS_VALUE > 0 {
        Some(read_bytes(reader)?)
    } else {
        None
    };

    Ok((value, deadline))
}

fn write_deadline<W: Write>(writer: &mut W, deadline: Option<Deadline>) -> Result<(), EncodeError> {
    match deadline {
        Some(deadline) => {
            writer.write_all(&[FLAG_HAS_DEADLINE])?;
            writer.write_u64_varint(deadline.unix_millis())?;
        }
        None => writer.write_all(&[0])?,
    }
    Ok(())
}

fn read_deadline<R: Read>(reader: &mut R) -> Result<Option<Deadline>, DecodeError> {
    let mut flags = [0];
    reader.read_exact(&mut flags)?;

    Ok(if flags[0] & FLAG_HAS_DEADLINE > 0 {
        Some(Deadline::from_unix_millis(reader.read_u64_varint()?))
    } else {
        None
    })
}
