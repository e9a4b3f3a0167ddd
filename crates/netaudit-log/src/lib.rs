//! netaudit log - the shared audit trail
//!
//! A bounded ring buffer of variable length records with any number of
//! independent reader sessions:
//!
//! - **Storage**: fixed capacity, oldest-first eviction, wrap sentinel
//! - **Producers**: [`AuditLog::record_network_event`] and
//!   [`AuditLog::record_execution_event`] never fail; oversized fields are
//!   truncated
//! - **Sessions**: blocking and non-blocking reads, readiness polling, seek
//!   to start or tail, loss detection with resynchronization

pub mod codec;
pub mod error;
pub mod format;
pub mod log;
pub mod ring;
pub mod session;

pub use error::{LogError, ReadError, SeekError};
pub use format::{LineFormat, LINE_CAPACITY};
pub use log::{AuditLog, LogStatus, SessionOptions};
pub use ring::{Cursor, RingBuffer};
pub use session::{InterruptHandle, Readiness, Session, Whence};
