//! Order persistence queue and its write-ahead journal.
//!
//! The reservation engine appends an `Enqueued` record for every winning
//! reservation; the reconciliation worker appends `Acknowledged` or
//! `DeadLettered` once it is done with it. Folding the journal therefore
//! yields exactly the reservations that still need an order.
//!
//! # Journals
//!
//! - [`MemoryJournal`] keeps records in process memory.
//! - `FileJournal` (feature `journal`, on by default) writes CRC32-checked
//!   frames to memory-mapped segment files and flushes before returning.

mod error;
#[cfg(feature = "journal")]
mod file_journal;
mod journal;
mod order_queue;

pub use error::JournalError;
#[cfg(feature = "journal")]
pub use file_journal::FileJournal;
pub use journal::{
    ENTRY_CRC_SIZE, ENTRY_HEADER_SIZE, ENTRY_OVERHEAD, Journal, JournalReadIter, JournalRecord,
    MemoryJournal,
};
pub use order_queue::{DeadLetter, Delivery, OrderQueue, QueueConsumer, QueueRecord};
