//! Append-only journal trait and the in-memory implementation.
//!
//! The [`Journal`] trait is the write-ahead log contract behind the order
//! queue: a record is committed only once [`append`](Journal::append)
//! returns `Ok(())`. See `FileJournal` (in the `file_journal` module) for
//! the durable memory-mapped implementation.

use super::error::JournalError;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Size of the fixed-size frame header in bytes.
///
/// Layout: `[4 bytes frame_length][8 bytes sequence_num][8 bytes timestamp_ns]`
pub const ENTRY_HEADER_SIZE: usize = 4 + 8 + 8;

/// Size of the CRC32 trailer appended to each frame in bytes.
pub const ENTRY_CRC_SIZE: usize = 4;

/// Total overhead per journal frame (header + CRC trailer) in bytes.
pub const ENTRY_OVERHEAD: usize = ENTRY_HEADER_SIZE + ENTRY_CRC_SIZE;

/// One record in the journal: a payload stamped with its position and time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord<T> {
    /// Monotonically increasing sequence number assigned by the writer.
    pub sequence_num: u64,
    /// Wall-clock time in nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    /// The journaled payload.
    pub payload: T,
}

/// Iterator returned by [`Journal::read_from`].
///
/// Each item is either a decoded record or the error that stopped decoding
/// it (corrupt CRC, malformed payload).
pub type JournalReadIter<T> = Box<dyn Iterator<Item = Result<JournalRecord<T>, JournalError>>>;

/// An append-only, ordered record log.
///
/// The intended usage is a single writer (the order queue serialises
/// appends) with occasional readers (recovery, dead-letter inspection).
pub trait Journal<T>: Send + Sync + 'static
where
    T: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync + 'static,
{
    /// Append a record. It must be durable before this returns `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if serialization, I/O or flushing fails.
    fn append(&self, record: &JournalRecord<T>) -> Result<(), JournalError>;

    /// Read records with `sequence_num >= sequence`, in append order.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the underlying storage cannot be opened.
    fn read_from(&self, sequence: u64) -> Result<JournalReadIter<T>, JournalError>;

    /// Sequence number of the last record, or `None` if the journal is empty.
    #[must_use]
    fn last_sequence(&self) -> Option<u64>;

    /// Check every record's integrity.
    ///
    /// # Errors
    ///
    /// Returns the first corruption found.
    fn verify_integrity(&self) -> Result<(), JournalError>;

    /// Drop records below `sequence` where the storage layout allows it.
    ///
    /// Records at or above `sequence` are always kept; older ones may
    /// survive when they share a storage unit with newer ones. Returns how
    /// many storage units were dropped. Journals that cannot drop anything
    /// keep the default.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the storage cannot be changed.
    fn discard_before(&self, sequence: u64) -> Result<usize, JournalError> {
        let _ = sequence;
        Ok(0)
    }
}

/// A journal held in process memory.
///
/// Not durable across restarts; used by tests and by deployments that keep
/// the durable log elsewhere.
#[derive(Debug)]
pub struct MemoryJournal<T> {
    records: Mutex<Vec<JournalRecord<T>>>,
}

impl<T> MemoryJournal<T> {
    /// Create an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    /// Number of records appended so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Returns `true` if nothing has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for MemoryJournal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Journal<T> for MemoryJournal<T>
where
    T: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync + 'static,
{
    fn append(&self, record: &JournalRecord<T>) -> Result<(), JournalError> {
        self.records
            .lock()
            .map_err(|_| JournalError::MutexPoisoned)?
            .push(record.clone());
        Ok(())
    }

    fn read_from(&self, sequence: u64) -> Result<JournalReadIter<T>, JournalError> {
        let records: Vec<JournalRecord<T>> = self
            .records
            .lock()
            .map_err(|_| JournalError::MutexPoisoned)?
            .iter()
            .filter(|r| r.sequence_num >= sequence)
            .cloned()
            .collect();
        Ok(Box::new(records.into_iter().map(Ok)))
    }

    fn last_sequence(&self) -> Option<u64> {
        self.records
            .lock()
            .ok()
            .and_then(|r| r.last().map(|rec| rec.sequence_num))
    }

    fn discard_before(&self, sequence: u64) -> Result<usize, JournalError> {
        let mut records = self.records.lock().map_err(|_| JournalError::MutexPoisoned)?;
        let before = records.len();
        records.retain(|r| r.sequence_num >= sequence);
        Ok(before.saturating_sub(records.len()))
    }

    fn verify_integrity(&self) -> Result<(), JournalError> {
        Ok(())
    }
}
