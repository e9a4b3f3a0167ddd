//! Errors surfaced by the audit log

use std::io;
use thiserror::Error;

/// Errors creating or writing to the ring buffer
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogError {
    #[error("invalid log capacity {0}: must be a multiple of 8 and at least 4096 bytes")]
    InvalidCapacity(usize),

    #[error("record slot of {len} bytes cannot fit in a {capacity} byte log")]
    RecordTooLarge { len: usize, capacity: usize },
}

/// Outcomes of a read that did not produce a line
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// Nothing new and the session is non-blocking
    #[error("no record available")]
    WouldBlock,

    /// The wanted record was evicted. The session now points at the oldest
    /// retained record, sequence `resumed_at`.
    #[error("records lost, resynchronized at sequence {resumed_at}")]
    DataLost { resumed_at: u64 },

    /// The rendered line needs `needed` bytes; the cursor did not move
    #[error("read buffer too small, {needed} bytes needed")]
    BufferTooSmall { needed: usize },

    /// A blocked read was cancelled
    #[error("read interrupted")]
    Interrupted,
}

impl From<ReadError> for io::Error {
    fn from(err: ReadError) -> Self {
        let kind = match err {
            ReadError::WouldBlock => io::ErrorKind::WouldBlock,
            ReadError::DataLost { .. } => io::ErrorKind::BrokenPipe,
            ReadError::BufferTooSmall { .. } => io::ErrorKind::InvalidInput,
            ReadError::Interrupted => io::ErrorKind::Interrupted,
        };
        io::Error::new(kind, err)
    }
}

/// Rejected seek requests
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SeekError {
    #[error("unsupported seek mode {0}")]
    InvalidWhence(i32),

    #[error("seeking to offset {0} is not supported")]
    UnsupportedOffset(i64),
}
