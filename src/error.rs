use std::io;

use thiserror::Error;

/// The specific journal invariant that was found violated.
///
/// Kept separate from [`JournalError`] so callers (and tests) can match on
/// the exact reason without parsing a message string.
#[derive(Debug, Error)]
pub enum CorruptReason {
    #[error("record at offset {offset} in segment {segment} references undeclared handle {handle}")]
    UnresolvedHandle { segment: u64, offset: u64, handle: u32 },

    #[error("record at offset {offset} in segment {segment} declares length {declared} exceeding maximum {max}")]
    RecordTooLarge {
        segment: u64,
        offset: u64,
        declared: u32,
        max: u32,
    },

    #[error(
        "page image at offset {offset} in segment {segment} has left_size {left_size} exceeding buffer size {buffer_size}"
    )]
    LeftSizeOutOfRange {
        segment: u64,
        offset: u64,
        left_size: u32,
        buffer_size: u32,
    },

    #[error("checkpoint record at offset {offset} in segment {segment} has unexpected length {len}")]
    CheckpointLength { segment: u64, offset: u64, len: u32 },

    #[error("checksum mismatch for record at offset {offset} in segment {segment}")]
    ChecksumMismatch { segment: u64, offset: u64 },

    #[error("record at offset {offset} in segment {segment} declares length {length} smaller than the header")]
    HeaderLengthTooSmall { segment: u64, offset: u64, length: u32 },

    #[error("page address mismatch: expected {expected} found {found}")]
    PageAddressMismatch { expected: u64, found: u64 },

    #[error("buffer length mismatch: expected {expected} found {found}")]
    BufferLengthMismatch { expected: u32, found: u32 },

    #[error("volume id mismatch for {path}: expected {expected} found {found}")]
    VolumeIdMismatch { path: String, expected: u64, found: u64 },

    #[error("unknown record type tag {tag} at offset {offset} in segment {segment}")]
    UnknownRecordType { segment: u64, offset: u64, tag: u8 },
}

/// Top-level error returned by the journal's public API.
#[derive(Debug, Error)]
pub enum JournalError {
    /// A structural or semantic invariant of the journal was violated.
    #[error("journal corrupt: {0}")]
    Corrupt(#[from] CorruptReason),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// The caller invoked an operation the current lifecycle state forbids,
    /// e.g. writing before [`crate::manager::JournalManager::recover`] or
    /// after [`crate::manager::JournalManager::close`].
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
}

pub type Result<T> = std::result::Result<T, JournalError>;
