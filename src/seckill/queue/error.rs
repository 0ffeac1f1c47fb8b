//! Failures of the order queue's write-ahead journal.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Why a journal operation failed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JournalError {
    /// Reading, writing, mapping or renaming a segment file failed.
    #[error("journal I/O error{}: {message}", describe_path(.path))]
    Io {
        /// Message of the underlying `std::io::Error`.
        message: String,
        /// Segment or directory involved, when known.
        path: Option<PathBuf>,
    },

    /// The stored checksum does not match the frame bytes.
    #[error(
        "corrupt journal entry at sequence {sequence}: expected CRC {expected_crc:#010x}, got {actual_crc:#010x}"
    )]
    CorruptEntry {
        /// Sequence number written in the frame header.
        sequence: u64,
        /// Checksum stored after the payload.
        expected_crc: u32,
        /// Checksum recomputed on read.
        actual_crc: u32,
    },

    /// A queue record could not be decoded from its payload.
    #[error("journal deserialization error at sequence {sequence}: {message}")]
    DeserializationError {
        /// Sequence number of the frame.
        sequence: u64,
        /// Decoder message.
        message: String,
    },

    /// A queue record could not be encoded.
    #[error("journal serialization error: {message}")]
    SerializationError {
        /// Encoder message.
        message: String,
    },

    /// The encoded record would not fit even in a fresh segment.
    #[error("journal entry too large: {entry_bytes} bytes exceeds segment size {segment_size} bytes")]
    EntryTooLarge {
        /// Encoded frame length.
        entry_bytes: usize,
        /// Configured segment capacity.
        segment_size: usize,
    },

    /// A frame header is truncated or carries an impossible length.
    #[error("invalid journal entry header at offset {offset}: {message}")]
    InvalidEntryHeader {
        /// Byte offset of the frame within its segment.
        offset: usize,
        /// What was wrong with it.
        message: String,
    },

    /// A thread panicked while holding a journal or queue lock.
    #[error("journal internal mutex poisoned")]
    MutexPoisoned,
}

fn describe_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| format!(" at {}", p.display()))
        .unwrap_or_default()
}

impl From<std::io::Error> for JournalError {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        JournalError::Io {
            message: err.to_string(),
            path: None,
        }
    }
}

impl JournalError {
    /// An [`JournalError::Io`] that names the file it happened on.
    #[cold]
    pub(crate) fn io_at(err: &std::io::Error, path: &Path) -> Self {
        JournalError::Io {
            message: err.to_string(),
            path: Some(path.to_path_buf()),
        }
    }
}
