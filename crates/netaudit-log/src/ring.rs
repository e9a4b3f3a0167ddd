//! Ring buffer storage
//!
//! A fixed byte region holding records in append order between two cursors:
//! `first` (oldest retained record) and `next` (where the next record goes).
//! Making room only ever advances `first`. A record never straddles the end
//! of the region; when it would, a sentinel is written and `next` restarts
//! at offset 0.
//!
//! This type does no locking; [`crate::AuditLog`] owns one behind a mutex.

use netaudit_core::ProcessDetails;
use tracing::trace;

use crate::codec::{self, Located, RecordPayload, HEADER_LEN, MIN_CAPACITY, RECORD_ALIGN};
use crate::error::LogError;

/// Position of a record: its append sequence number and its byte offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    pub seq: u64,
    pub offset: usize,
}

/// Outcome of [`RingBuffer::append`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    /// Where the record was written
    pub at: Cursor,
    pub slot_len: usize,
    /// Records dropped to make room
    pub evicted: u64,
    /// Whether a sentinel was written before the record
    pub wrapped: bool,
}

pub struct RingBuffer {
    buf: Box<[u8]>,
    first: Cursor,
    next: Cursor,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Result<Self, LogError> {
        if capacity < MIN_CAPACITY || capacity % RECORD_ALIGN != 0 {
            return Err(LogError::InvalidCapacity(capacity));
        }
        Ok(Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            first: Cursor::default(),
            next: Cursor::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Oldest retained record
    pub fn first(&self) -> Cursor {
        self.first
    }

    /// Next write position
    pub fn next(&self) -> Cursor {
        self.next
    }

    /// Number of retained records
    pub fn len(&self) -> u64 {
        self.next.seq - self.first.seq
    }

    pub fn is_empty(&self) -> bool {
        self.first.seq == self.next.seq
    }

    /// Largest slot a single record may occupy
    pub fn max_slot_len(&self) -> usize {
        self.capacity() - HEADER_LEN - RECORD_ALIGN
    }

    /// Store one record, evicting the oldest ones as needed
    pub fn append(
        &mut self,
        details: &ProcessDetails,
        payload: &RecordPayload<'_>,
    ) -> Result<Appended, LogError> {
        let slot_len = payload.slot_len();
        if slot_len > self.max_slot_len() {
            return Err(LogError::RecordTooLarge {
                len: slot_len,
                capacity: self.capacity(),
            });
        }

        let evicted = self.make_room(slot_len);

        // Keep a header's worth of slack so a sentinel always fits after the record
        let wrapped = self.next.offset + slot_len + HEADER_LEN >= self.capacity();
        if wrapped {
            codec::write_sentinel(&mut self.buf, self.next.offset);
            self.next.offset = 0;
            // An empty buffer restarts at the front; `first` must not stay on
            // a sentinel the new record may overwrite
            if self.is_empty() {
                self.first.offset = 0;
            }
        }

        let at = self.next;
        codec::encode(&mut self.buf[at.offset..at.offset + slot_len], details, payload);
        self.next = Cursor {
            seq: at.seq + 1,
            offset: at.offset + slot_len,
        };

        Ok(Appended {
            at,
            slot_len,
            evicted,
            wrapped,
        })
    }

    /// Evict from the head until `slot_len` plus a header fits contiguously
    fn make_room(&mut self, slot_len: usize) -> u64 {
        let needed = slot_len + HEADER_LEN;
        let mut evicted = 0;

        while !self.is_empty() {
            let free = if self.next.offset > self.first.offset {
                (self.capacity() - self.next.offset).max(self.first.offset)
            } else {
                self.first.offset - self.next.offset
            };
            if free > needed {
                break;
            }

            let successor = codec::successor(&self.buf, self.first.offset);
            trace!(
                seq = self.first.seq,
                offset = self.first.offset,
                "evicting oldest record"
            );
            self.first = Cursor {
                seq: self.first.seq + 1,
                offset: successor,
            };
            evicted += 1;
        }

        evicted
    }

    /// Decode the record a cursor points at
    pub fn decode(&self, cursor: Cursor) -> Located {
        codec::decode_at(&self.buf, cursor.offset)
    }

    /// Walk the retained records from `first` to `next`
    pub fn iter(&self) -> impl Iterator<Item = (u64, Located)> + '_ {
        let mut cursor = self.first;
        std::iter::from_fn(move || {
            if cursor.seq >= self.next.seq {
                return None;
            }
            let located = self.decode(cursor);
            let seq = cursor.seq;
            cursor = Cursor {
                seq: seq + 1,
                offset: located.successor,
            };
            Some((seq, located))
        })
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("first", &self.first)
            .field("next", &self.next)
            .finish()
    }
}
