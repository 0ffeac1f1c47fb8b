//! Memory-mapped file journal.
//!
//! [`FileJournal`] persists [`JournalRecord`]s to pre-allocated,
//! memory-mapped segment files. A segment is rotated when the next frame
//! does not fit.
//!
//! # Frame Format (little-endian)
//!
//! ```text
//! [4 bytes: frame_length][8 bytes: sequence_num][8 bytes: timestamp_ns]
//! [N bytes: JSON payload][4 bytes: CRC32]
//! ```
//!
//! `frame_length` counts every byte after itself (`20 + N`). The CRC covers
//! `sequence_num ‖ timestamp_ns ‖ payload`. A zero `frame_length` marks the
//! end of written data in the zero-filled tail of a segment.
//!
//! Segments are named `segment-{start_sequence:020}.journal`; archived
//! segments get the `.journal.archived` extension and are skipped on read.

use super::error::JournalError;
use super::journal::{ENTRY_CRC_SIZE, ENTRY_HEADER_SIZE, Journal, JournalReadIter, JournalRecord};
use crate::seckill::config::DEFAULT_JOURNAL_SEGMENT_SIZE;
use memmap2::{Mmap, MmapMut};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Bytes of `sequence_num ‖ timestamp_ns` at the start of each frame body.
const BODY_PREFIX: usize = 16;

#[inline]
fn read_u32_le(data: &[u8], at: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(at..at.checked_add(4)?)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

#[inline]
fn read_u64_le(data: &[u8], at: usize) -> Option<u64> {
    let bytes: [u8; 8] = data.get(at..at.checked_add(8)?)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Result of decoding one frame at a given offset.
enum Frame<'a> {
    /// Zero-filled tail: nothing more was written to this segment.
    End,
    /// The frame header points past the end of the segment.
    Truncated,
    /// The stored CRC does not match the frame body.
    Corrupt {
        sequence: u64,
        stored: u32,
        computed: u32,
        next: usize,
    },
    Valid {
        sequence: u64,
        timestamp_ns: u64,
        payload: &'a [u8],
        next: usize,
    },
}

fn read_frame(data: &[u8], offset: usize) -> Frame<'_> {
    match offset.checked_add(ENTRY_HEADER_SIZE) {
        Some(end) if end <= data.len() => {}
        _ => return Frame::End,
    }
    let Some(frame_length) = read_u32_le(data, offset) else {
        return Frame::End;
    };
    if frame_length == 0 {
        return Frame::End;
    }

    let body_start = offset.saturating_add(4);
    let Some(next) = body_start.checked_add(frame_length as usize) else {
        return Frame::Truncated;
    };
    if next > data.len() || (frame_length as usize) < BODY_PREFIX + ENTRY_CRC_SIZE {
        return Frame::Truncated;
    }

    let crc_start = next.saturating_sub(ENTRY_CRC_SIZE);
    let (Some(stored), Some(sequence), Some(timestamp_ns), Some(body)) = (
        read_u32_le(data, crc_start),
        read_u64_le(data, body_start),
        read_u64_le(data, body_start.saturating_add(8)),
        data.get(body_start..crc_start),
    ) else {
        return Frame::Truncated;
    };

    let computed = crc32fast::hash(body);
    if stored != computed {
        return Frame::Corrupt {
            sequence,
            stored,
            computed,
            next,
        };
    }

    Frame::Valid {
        sequence,
        timestamp_ns,
        payload: &body[BODY_PREFIX..],
        next,
    }
}

/// Walk a segment and return `(write_position, last_sequence)`.
fn scan_segment(data: &[u8]) -> (usize, Option<u64>) {
    let mut offset = 0usize;
    let mut last = None;
    loop {
        match read_frame(data, offset) {
            Frame::End | Frame::Truncated => break,
            Frame::Corrupt { next, .. } => offset = next,
            Frame::Valid { sequence, next, .. } => {
                last = Some(sequence);
                offset = next;
            }
        }
    }
    (offset, last)
}

fn map_read_only(path: &Path) -> Result<Mmap, JournalError> {
    let file = File::open(path).map_err(|e| JournalError::io_at(&e, path))?;
    // SAFETY: segments are only written through this process's single
    // writer, which never truncates a segment that is still mapped for
    // appending.
    unsafe { Mmap::map(&file) }.map_err(|e| JournalError::io_at(&e, path))
}

/// The segment currently being appended to.
struct SegmentWriter {
    mmap: MmapMut,
    write_pos: usize,
    capacity: usize,
    start_seq: u64,
    path: PathBuf,
}

impl SegmentWriter {
    /// Create and pre-allocate a new, zero-filled segment.
    fn create(path: &Path, capacity: usize, start_seq: u64) -> Result<Self, JournalError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| JournalError::io_at(&e, path))?;
        file.set_len(capacity as u64)
            .map_err(|e| JournalError::io_at(&e, path))?;

        // SAFETY: the segment was just created by this writer and is not
        // resized while mapped.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| JournalError::io_at(&e, path))?;

        Ok(Self {
            mmap,
            write_pos: 0,
            capacity,
            start_seq,
            path: path.to_path_buf(),
        })
    }

    /// Reopen an existing segment, positioned after its last frame.
    fn reopen(path: &Path, start_seq: u64) -> Result<(Self, Option<u64>), JournalError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| JournalError::io_at(&e, path))?;

        // SAFETY: see `create`.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| JournalError::io_at(&e, path))?;
        let (write_pos, last_seq) = scan_segment(&mmap);

        Ok((
            Self {
                capacity: mmap.len(),
                mmap,
                write_pos,
                start_seq,
                path: path.to_path_buf(),
            },
            last_seq,
        ))
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.write_pos)
    }

    /// Copy a frame into the mapping and flush it to disk.
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), JournalError> {
        let too_large = JournalError::EntryTooLarge {
            entry_bytes: frame.len(),
            segment_size: self.capacity,
        };
        let end = match self.write_pos.checked_add(frame.len()) {
            Some(end) if end <= self.capacity => end,
            _ => return Err(too_large),
        };

        self.mmap[self.write_pos..end].copy_from_slice(frame);
        self.mmap
            .flush_range(self.write_pos, frame.len())
            .map_err(|e| JournalError::io_at(&e, &self.path))?;
        self.write_pos = end;
        Ok(())
    }
}

struct WriterState {
    segment: SegmentWriter,
    last_seq: Option<u64>,
}

/// A durable, append-only journal backed by memory-mapped segment files.
///
/// Every append is flushed before it returns, so a record the journal
/// accepted survives a process crash. Appends are serialised by an internal
/// mutex; reads open their own read-only mappings and never block the
/// writer.
///
/// # Example
///
/// ```rust,no_run
/// use seckill_rs::seckill::queue::{FileJournal, Journal};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let journal: FileJournal<String> = FileJournal::open("/var/lib/seckill/journal")?;
/// println!("last sequence: {:?}", journal.last_sequence());
/// # Ok(())
/// # }
/// ```
pub struct FileJournal<T> {
    dir: PathBuf,
    segment_size: usize,
    state: Mutex<WriterState>,
    _phantom: PhantomData<T>,
}

impl<T> FileJournal<T>
where
    T: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync + 'static,
{
    /// Open or create a journal in `dir` with the default segment size.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the directory cannot be created or the
    /// latest segment cannot be mapped.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, JournalError> {
        Self::open_with_segment_size(dir, DEFAULT_JOURNAL_SEGMENT_SIZE)
    }

    /// Open or create a journal in `dir` with a custom segment size.
    ///
    /// An existing journal resumes appending to its latest segment.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the directory cannot be created or the
    /// latest segment cannot be mapped.
    pub fn open_with_segment_size<P: AsRef<Path>>(
        dir: P,
        segment_size: usize,
    ) -> Result<Self, JournalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| JournalError::io_at(&e, &dir))?;

        let segments = list_segments(&dir)?;
        let state = match segments.last() {
            Some(&start) => {
                let (segment, last_seq) = SegmentWriter::reopen(&segment_path(&dir, start), start)?;
                // An empty latest segment still follows the sealed ones.
                let last_seq = last_seq.or_else(|| start.checked_sub(1));
                debug!(dir = %dir.display(), start, ?last_seq, "journal reopened");
                WriterState { segment, last_seq }
            }
            None => WriterState {
                segment: SegmentWriter::create(&segment_path(&dir, 0), segment_size, 0)?,
                last_seq: None,
            },
        };

        Ok(Self {
            dir,
            segment_size,
            state: Mutex::new(state),
            _phantom: PhantomData,
        })
    }

    /// Archive every sealed segment whose records all precede
    /// `before_sequence`. Returns how many segments were archived.
    ///
    /// A segment is known to end before `before_sequence` when the next
    /// segment starts at or below it. The active segment is never archived.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if a segment cannot be renamed.
    pub fn archive_segments_before(&self, before_sequence: u64) -> Result<usize, JournalError> {
        let state = self.state.lock().map_err(|_| JournalError::MutexPoisoned)?;
        let active = state.segment.start_seq;

        let segments = list_segments(&self.dir)?;
        let mut archived = 0usize;
        for pair in segments.windows(2) {
            let (start, next_start) = (pair[0], pair[1]);
            if next_start > before_sequence || start == active {
                break;
            }
            let src = segment_path(&self.dir, start);
            let dst = src.with_extension("journal.archived");
            fs::rename(&src, &dst).map_err(|e| JournalError::io_at(&e, &src))?;
            archived = archived.saturating_add(1);
        }
        if archived > 0 {
            debug!(dir = %self.dir.display(), archived, before_sequence, "journal segments archived");
        }
        Ok(archived)
    }

    /// Seal the active segment and start a new one at `start_seq`.
    fn rotate(&self, state: &mut WriterState, start_seq: u64) -> Result<(), JournalError> {
        let old_path = state.segment.path.clone();
        let used = state.segment.write_pos;
        state
            .segment
            .mmap
            .flush()
            .map_err(|e| JournalError::io_at(&e, &old_path))?;

        state.segment =
            SegmentWriter::create(&segment_path(&self.dir, start_seq), self.segment_size, start_seq)?;

        // Reclaim the unused pre-allocated tail of the sealed segment.
        if let Ok(file) = OpenOptions::new().write(true).open(&old_path)
            && let Err(e) = file.set_len(used as u64)
        {
            warn!(path = %old_path.display(), error = %e, "failed to shrink sealed segment");
        }
        debug!(start_seq, "journal segment rotated");
        Ok(())
    }

    fn encode_frame(record: &JournalRecord<T>) -> Result<Vec<u8>, JournalError> {
        let payload =
            serde_json::to_vec(&record.payload).map_err(|e| JournalError::SerializationError {
                message: e.to_string(),
            })?;

        let frame_length = payload
            .len()
            .checked_add(BODY_PREFIX + ENTRY_CRC_SIZE)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| JournalError::SerializationError {
                message: "frame size overflow".to_string(),
            })?;

        let mut buf = Vec::with_capacity(frame_length as usize + 4);
        buf.extend_from_slice(&frame_length.to_le_bytes());
        buf.extend_from_slice(&record.sequence_num.to_le_bytes());
        buf.extend_from_slice(&record.timestamp_ns.to_le_bytes());
        buf.extend_from_slice(&payload);
        let crc = crc32fast::hash(&buf[4..]);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }
}

impl<T> Journal<T> for FileJournal<T>
where
    T: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync + 'static,
{
    fn append(&self, record: &JournalRecord<T>) -> Result<(), JournalError> {
        let frame = Self::encode_frame(record)?;
        let mut state = self.state.lock().map_err(|_| JournalError::MutexPoisoned)?;

        if state.segment.remaining() < frame.len() {
            if frame.len() > self.segment_size {
                return Err(JournalError::EntryTooLarge {
                    entry_bytes: frame.len(),
                    segment_size: self.segment_size,
                });
            }
            self.rotate(&mut state, record.sequence_num)?;
        }

        state.segment.write_frame(&frame)?;
        state.last_seq = Some(record.sequence_num);
        Ok(())
    }

    fn read_from(&self, sequence: u64) -> Result<JournalReadIter<T>, JournalError> {
        let segments = list_segments(&self.dir)?;
        // The first segment to read is the last one starting at or before `sequence`.
        let first = segments.partition_point(|&start| start <= sequence).saturating_sub(1);

        Ok(Box::new(SegmentIterator::<T> {
            dir: self.dir.clone(),
            segments: segments.into_iter().skip(first).collect(),
            next_segment: 0,
            current: None,
            offset: 0,
            start_sequence: sequence,
            _phantom: PhantomData,
        }))
    }

    fn discard_before(&self, sequence: u64) -> Result<usize, JournalError> {
        self.archive_segments_before(sequence)
    }

    fn last_sequence(&self) -> Option<u64> {
        self.state.lock().ok().and_then(|s| s.last_seq)
    }

    fn verify_integrity(&self) -> Result<(), JournalError> {
        for start in list_segments(&self.dir)? {
            let mmap = map_read_only(&segment_path(&self.dir, start))?;
            let mut offset = 0usize;
            loop {
                match read_frame(&mmap, offset) {
                    Frame::End => break,
                    Frame::Truncated => {
                        return Err(JournalError::InvalidEntryHeader {
                            offset,
                            message: "frame extends beyond segment data".to_string(),
                        });
                    }
                    Frame::Corrupt {
                        sequence,
                        stored,
                        computed,
                        ..
                    } => {
                        return Err(JournalError::CorruptEntry {
                            sequence,
                            expected_crc: stored,
                            actual_crc: computed,
                        });
                    }
                    Frame::Valid { next, .. } => offset = next,
                }
            }
        }
        Ok(())
    }
}

impl<T> std::fmt::Debug for FileJournal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileJournal")
            .field("dir", &self.dir)
            .field("segment_size", &self.segment_size)
            .field("last_seq", &self.state.lock().ok().and_then(|s| s.last_seq))
            .finish()
    }
}

/// Reads records across segment files in sequence order.
struct SegmentIterator<T> {
    dir: PathBuf,
    segments: Vec<u64>,
    next_segment: usize,
    current: Option<Mmap>,
    offset: usize,
    start_sequence: u64,
    _phantom: PhantomData<T>,
}

impl<T> SegmentIterator<T> {
    /// Map the next segment. `Ok(false)` when every segment has been read.
    fn advance_segment(&mut self) -> Result<bool, JournalError> {
        let Some(&start) = self.segments.get(self.next_segment) else {
            self.current = None;
            return Ok(false);
        };
        self.next_segment = self.next_segment.saturating_add(1);
        self.offset = 0;
        self.current = Some(map_read_only(&segment_path(&self.dir, start))?);
        Ok(true)
    }
}

impl<T> Iterator for SegmentIterator<T>
where
    T: for<'de> Deserialize<'de>,
{
    type Item = Result<JournalRecord<T>, JournalError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                match self.advance_segment() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => return Some(Err(e)),
                }
            }
            let mmap = self.current.as_ref()?;

            match read_frame(mmap, self.offset) {
                Frame::End | Frame::Truncated => self.current = None,
                Frame::Corrupt {
                    sequence,
                    stored,
                    computed,
                    next,
                } => {
                    self.offset = next;
                    return Some(Err(JournalError::CorruptEntry {
                        sequence,
                        expected_crc: stored,
                        actual_crc: computed,
                    }));
                }
                Frame::Valid {
                    sequence,
                    timestamp_ns,
                    payload,
                    next,
                } => {
                    self.offset = next;
                    if sequence < self.start_sequence {
                        continue;
                    }
                    return Some(
                        serde_json::from_slice(payload)
                            .map(|payload| JournalRecord {
                                sequence_num: sequence,
                                timestamp_ns,
                                payload,
                            })
                            .map_err(|e| JournalError::DeserializationError {
                                sequence,
                                message: e.to_string(),
                            }),
                    );
                }
            }
        }
    }
}

fn segment_path(dir: &Path, start_sequence: u64) -> PathBuf {
    dir.join(format!("segment-{start_sequence:020}.journal"))
}

/// Start sequences of the active (non-archived) segments, ascending.
fn list_segments(dir: &Path) -> Result<Vec<u64>, JournalError> {
    let mut starts = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| JournalError::io_at(&e, dir))? {
        let entry = entry.map_err(|e| JournalError::io_at(&e, dir))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix("segment-")
            && let Some(digits) = rest.strip_suffix(".journal")
            && let Ok(start) = digits.parse::<u64>()
        {
            starts.push(start);
        }
    }
    starts.sort_unstable();
    Ok(starts)
}
