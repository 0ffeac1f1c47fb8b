//! Write-ahead order queue between the reservation engine and the worker.
//!
//! Every state change is a [`QueueRecord`] appended to a [`Journal`] before
//! anything else happens, so the journal alone reconstructs which
//! reservations still need an order. Delivery to the worker rides on a
//! Tokio channel; the channel is only a wake-up path and losing it never
//! loses a reservation.

use super::error::JournalError;
use super::journal::{Journal, JournalRecord, MemoryJournal};
use crate::seckill::error::QueueError;
use crate::seckill::types::{ActivityId, IdempotencyKey, Reservation};
use crate::utils::current_time_nanos;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// A journaled state change of one reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueRecord {
    /// A reservation was admitted and awaits its order.
    Enqueued {
        /// The admitted reservation.
        reservation: Reservation,
    },
    /// The order for this key was persisted.
    Acknowledged {
        /// Key of the reservation that completed.
        idempotency_key: IdempotencyKey,
    },
    /// The worker gave up on the reservation.
    DeadLettered {
        /// The reservation that could not be persisted.
        reservation: Reservation,
        /// Last error observed.
        reason: String,
        /// Processing attempts made.
        attempts: u32,
    },
}

/// A reservation handed to the worker, tagged with its journal position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Sequence number of the `Enqueued` record.
    pub sequence: u64,
    /// The reservation to turn into an order.
    pub reservation: Reservation,
}

/// A dead-lettered reservation, as recorded in the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Sequence number of the `DeadLettered` record.
    pub sequence: u64,
    /// The reservation that could not be persisted.
    pub reservation: Reservation,
    /// Last error observed.
    pub reason: String,
    /// Processing attempts made.
    pub attempts: u32,
}

/// Receiving half of the queue, owned by exactly one worker.
#[derive(Debug)]
pub struct QueueConsumer {
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl QueueConsumer {
    /// Wait for the next delivery. `None` once the queue has been dropped.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Take a delivery if one is ready, without waiting.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }
}

/// Durable queue of admitted reservations.
///
/// Appends are serialised by an internal lock so sequence numbers are
/// assigned in append order. Any number of tasks may enqueue concurrently;
/// a single [`QueueConsumer`] drains deliveries.
pub struct OrderQueue {
    journal: Box<dyn Journal<QueueRecord>>,
    append_lock: Mutex<()>,
    sender: mpsc::UnboundedSender<Delivery>,
    consumer: Mutex<Option<QueueConsumer>>,
}

impl OrderQueue {
    /// Build a queue over an existing journal.
    pub fn new<J>(journal: J) -> Self
    where
        J: Journal<QueueRecord>,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            journal: Box::new(journal),
            append_lock: Mutex::new(()),
            sender,
            consumer: Mutex::new(Some(QueueConsumer { receiver })),
        }
    }

    /// A queue journaled in process memory only.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(MemoryJournal::<QueueRecord>::new())
    }

    /// A queue journaled to memory-mapped segment files under `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Journal`] if the journal cannot be opened.
    #[cfg(feature = "journal")]
    pub fn open_file<P: AsRef<std::path::Path>>(
        dir: P,
        segment_size: usize,
    ) -> Result<Self, QueueError> {
        let journal = super::FileJournal::<QueueRecord>::open_with_segment_size(dir, segment_size)?;
        Ok(Self::new(journal))
    }

    /// Take the consumer half. Only the first call succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConsumerTaken`] on every call after the first.
    pub fn take_consumer(&self) -> Result<QueueConsumer, QueueError> {
        self.consumer
            .lock()
            .map_err(|_| JournalError::MutexPoisoned)?
            .take()
            .ok_or(QueueError::ConsumerTaken)
    }

    fn append(&self, payload: QueueRecord) -> Result<u64, QueueError> {
        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| JournalError::MutexPoisoned)?;
        self.append_locked(payload)
    }

    /// Append while the caller holds `append_lock`.
    fn append_locked(&self, payload: QueueRecord) -> Result<u64, QueueError> {
        let sequence_num = self
            .journal
            .last_sequence()
            .map_or(0, |last| last.saturating_add(1));
        self.journal.append(&JournalRecord {
            sequence_num,
            timestamp_ns: current_time_nanos(),
            payload,
        })?;
        Ok(sequence_num)
    }

    /// Durably record a reservation, then wake the consumer.
    ///
    /// Once this returns `Ok` the reservation survives a crash. A consumer
    /// that has gone away is logged, not reported: the reservation is picked
    /// up again by [`redeliver_pending`](Self::redeliver_pending).
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Journal`] if the append fails; nothing was
    /// recorded in that case.
    pub fn enqueue(&self, reservation: &Reservation) -> Result<u64, QueueError> {
        let sequence = self.append(QueueRecord::Enqueued {
            reservation: reservation.clone(),
        })?;
        trace!(sequence, key = %reservation.idempotency_key, "reservation enqueued");

        let delivery = Delivery {
            sequence,
            reservation: reservation.clone(),
        };
        if self.sender.send(delivery).is_err() {
            warn!(
                sequence,
                key = %reservation.idempotency_key,
                "order consumer closed; reservation left for redelivery"
            );
        }
        Ok(sequence)
    }

    /// Record that the order for `key` has been persisted.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Journal`] if the append fails.
    pub fn acknowledge(&self, key: &IdempotencyKey) -> Result<(), QueueError> {
        let sequence = self.append(QueueRecord::Acknowledged {
            idempotency_key: key.clone(),
        })?;
        trace!(sequence, %key, "reservation acknowledged");
        Ok(())
    }

    /// Record that the worker gave up on `reservation`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Journal`] if the append fails.
    pub fn dead_letter(
        &self,
        reservation: &Reservation,
        reason: &str,
        attempts: u32,
    ) -> Result<(), QueueError> {
        let sequence = self.append(QueueRecord::DeadLettered {
            reservation: reservation.clone(),
            reason: reason.to_string(),
            attempts,
        })?;
        warn!(sequence, key = %reservation.idempotency_key, attempts, reason, "reservation dead-lettered");
        Ok(())
    }

    /// Replay the journal, skipping unreadable records.
    fn replay(&self) -> Result<Vec<JournalRecord<QueueRecord>>, QueueError> {
        let mut records = Vec::new();
        for item in self.journal.read_from(0)? {
            match item {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "skipping unreadable queue record"),
            }
        }
        Ok(records)
    }

    /// Reservations enqueued but neither acknowledged nor dead-lettered, in
    /// enqueue order.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Journal`] if the journal cannot be read.
    pub fn pending(&self) -> Result<Vec<Delivery>, QueueError> {
        Ok(live_records(self.replay()?)
            .into_iter()
            .filter_map(|(sequence, record)| match record {
                QueueRecord::Enqueued { reservation } => Some(Delivery {
                    sequence,
                    reservation,
                }),
                _ => None,
            })
            .collect())
    }

    /// [`pending`](Self::pending), restricted to one activity.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Journal`] if the journal cannot be read.
    pub fn pending_for(&self, activity_id: ActivityId) -> Result<Vec<Delivery>, QueueError> {
        let mut pending = self.pending()?;
        pending.retain(|d| d.reservation.activity_id == activity_id);
        Ok(pending)
    }

    /// Push every pending reservation back to the consumer. Returns how many
    /// were sent.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Journal`] if the journal cannot be read.
    pub fn redeliver_pending(&self) -> Result<usize, QueueError> {
        Ok(self.redeliver(self.pending()?))
    }

    /// Push the given deliveries to the consumer. Returns how many were sent.
    pub fn redeliver(&self, deliveries: Vec<Delivery>) -> usize {
        let mut sent = 0usize;
        for delivery in deliveries {
            if self.sender.send(delivery).is_err() {
                warn!("order consumer closed during redelivery");
                break;
            }
            sent = sent.saturating_add(1);
        }
        debug!(sent, "pending reservations redelivered");
        sent
    }

    /// Every dead-lettered reservation, oldest first. A reservation listed
    /// more than once in the journal appears once, at its latest record.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Journal`] if the journal cannot be read.
    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(live_records(self.replay()?)
            .into_iter()
            .filter_map(|(sequence, record)| match record {
                QueueRecord::DeadLettered {
                    reservation,
                    reason,
                    attempts,
                } => Some(DeadLetter {
                    sequence,
                    reservation,
                    reason,
                    attempts,
                }),
                _ => None,
            })
            .collect())
    }

    /// Discard journal history that no reader needs any more.
    ///
    /// Live records are pending reservations and dead letters; everything
    /// older than the oldest live record can go as is. When acknowledged
    /// records sit between live ones, the live records are first copied to
    /// the head of the journal in their original order, so the whole older
    /// range can go. The copy runs under the append lock, so no concurrent
    /// append interleaves with it. A crash between copying and discarding
    /// leaves duplicates, which every reader folds by idempotency key.
    ///
    /// Returns how many storage units the journal discarded.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Journal`] if the journal cannot be read,
    /// appended to or trimmed.
    pub fn compact(&self) -> Result<usize, QueueError> {
        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| JournalError::MutexPoisoned)?;

        let Some(last) = self.journal.last_sequence() else {
            return Ok(0);
        };
        let head = last.saturating_add(1);
        let records = self.replay()?;
        let total = records.len();
        let live = live_records(records.iter().cloned());

        let oldest_live = live.keys().next().copied();
        let interleaved = oldest_live.map_or(0, |oldest| {
            records
                .iter()
                .filter(|r| r.sequence_num > oldest && !live.contains_key(&r.sequence_num))
                .count()
        });

        let cutoff = if interleaved == 0 {
            oldest_live.unwrap_or(head)
        } else {
            for record in live.values() {
                self.append_locked(record.clone())?;
            }
            head
        };

        let discarded = self.journal.discard_before(cutoff)?;
        info!(
            records = total,
            live = live.len(),
            copied = if interleaved == 0 { 0 } else { live.len() },
            cutoff,
            discarded,
            "order queue compacted"
        );
        Ok(discarded)
    }

    /// Sequence number of the last journal record.
    #[must_use]
    pub fn last_sequence(&self) -> Option<u64> {
        self.journal.last_sequence()
    }

    /// Check the integrity of every journal record.
    ///
    /// # Errors
    ///
    /// Returns the first corruption found.
    pub fn verify_integrity(&self) -> Result<(), QueueError> {
        Ok(self.journal.verify_integrity()?)
    }
}

/// Fold records into the latest live record per idempotency key, keyed by
/// sequence. Acknowledged keys drop out.
fn live_records<I>(records: I) -> BTreeMap<u64, QueueRecord>
where
    I: IntoIterator<Item = JournalRecord<QueueRecord>>,
{
    let mut by_sequence: BTreeMap<u64, QueueRecord> = BTreeMap::new();
    let mut by_key: HashMap<IdempotencyKey, u64> = HashMap::new();

    for record in records {
        let key = match &record.payload {
            QueueRecord::Enqueued { reservation } | QueueRecord::DeadLettered { reservation, .. } => {
                reservation.idempotency_key.clone()
            }
            QueueRecord::Acknowledged { idempotency_key } => idempotency_key.clone(),
        };
        if let Some(previous) = by_key.remove(&key) {
            by_sequence.remove(&previous);
        }
        if !matches!(record.payload, QueueRecord::Acknowledged { .. }) {
            by_key.insert(key, record.sequence_num);
            by_sequence.insert(record.sequence_num, record.payload);
        }
    }
    by_sequence
}

impl std::fmt::Debug for OrderQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderQueue")
            .field("last_sequence", &self.journal.last_sequence())
            .finish_non_exhaustive()
    }
}
