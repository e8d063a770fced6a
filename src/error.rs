// Copyright (c) 2025-present, lsm-engine contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    CompressionType,
};

/// Represents errors that can occur in the storage engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// Decompression failed
    Decompress(CompressionType),

    /// A block could not be recovered (bad framing, checksum or payload);
    /// surfaced after the retry budget is exhausted
    CorruptedBlock(&'static str),

    /// Invalid or unparsable data format version
    InvalidVersion(u8),

    /// Malformed input rejected at the API boundary
    InvalidInput(&'static str),

    /// The database was closed
    Closed,

    /// The selected committer does not support the requested commit shape
    Unsupported(&'static str),

    /// A compaction result was committed twice
    CommitRejected,

    /// Some required segments could not be recovered from disk
    Unrecoverable,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LsmEngineError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Engine result
pub type Result<T> = std::result::Result<T, Error>;
