//! The shared audit log: producers append, sessions read
//!
//! One [`AuditLog`] value is created at startup and cloned into every
//! component that needs it. All clones share the same ring buffer, cursors
//! and wake-up condition.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, warn};

use netaudit_core::{NetworkEvent, ProcessDetails, ProcessIdentity, SharedMetrics};

use crate::codec::RecordPayload;
use crate::error::LogError;
use crate::format::LineFormat;
use crate::ring::{Cursor, RingBuffer};
use crate::session::Session;

/// Divisor of the capacity giving the longest network path stored
pub const NETWORK_PATH_DIVISOR: usize = 16;

/// Divisor of the capacity giving the longest execution path, and argv
pub const EXEC_FIELD_DIVISOR: usize = 32;

/// Settings snapshotted by each session when it is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionOptions {
    pub format: LineFormat,
    /// Report end-of-stream once caught up instead of waiting
    pub send_eof: bool,
}

pub(crate) struct LogState {
    pub(crate) ring: RingBuffer,
    /// Whether any session was ever opened
    opened: bool,
    pub(crate) closed: bool,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<LogState>,
    pub(crate) readable: Condvar,
    options: RwLock<SessionOptions>,
    pub(crate) metrics: SharedMetrics,
    capacity: usize,
}

/// Point-in-time view of the log cursors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStatus {
    pub capacity: usize,
    pub first: Cursor,
    pub next: Cursor,
    pub closed: bool,
}

impl LogStatus {
    pub fn retained(&self) -> u64 {
        self.next.seq - self.first.seq
    }
}

/// Handle to the shared audit log
#[derive(Clone)]
pub struct AuditLog {
    shared: Arc<Shared>,
}

impl AuditLog {
    pub fn new(capacity: usize, metrics: SharedMetrics) -> Result<Self, LogError> {
        let ring = RingBuffer::new(capacity)?;
        debug!(capacity, "audit log created");
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LogState {
                    ring,
                    opened: false,
                    closed: false,
                }),
                readable: Condvar::new(),
                options: RwLock::new(SessionOptions::default()),
                metrics,
                capacity,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.shared.metrics
    }

    /// Options given to sessions opened from now on
    pub fn set_options(&self, options: SessionOptions) {
        *self.shared.options.write() = options;
    }

    pub fn options(&self) -> SessionOptions {
        *self.shared.options.read()
    }

    /// Record a classified socket operation. Never fails; an oversized path
    /// is truncated.
    pub fn record_network_event(&self, identity: ProcessIdentity, event: &NetworkEvent) {
        let limit = self.capacity() / NETWORK_PATH_DIVISOR;
        let path = self.truncated("path", event.path.as_bytes(), limit);
        self.append(identity, RecordPayload::network(event, path));
    }

    /// Record a program execution. `argv` is the NUL separated argument
    /// vector. Never fails; oversized fields are truncated.
    pub fn record_execution_event(&self, identity: ProcessIdentity, path: &str, argv: &[u8]) {
        let limit = self.capacity() / EXEC_FIELD_DIVISOR;
        let path = self.truncated("path", path.as_bytes(), limit);
        let argv = self.truncated("argv", argv, limit);
        self.append(identity, RecordPayload::Execution { path, argv });
    }

    fn truncated<'a>(&self, field: &'static str, value: &'a [u8], limit: usize) -> &'a [u8] {
        if value.len() <= limit {
            return value;
        }
        warn!(field, size = value.len(), limit, "truncating oversized field");
        self.shared.metrics.field_truncated();
        &value[..limit]
    }

    fn append(&self, identity: ProcessIdentity, payload: RecordPayload<'_>) {
        let kind = payload.kind();
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                debug!(kind = kind.tag(), "audit log closed, dropping record");
                return;
            }

            let details = ProcessDetails::new(now_ns(), identity);
            match state.ring.append(&details, &payload) {
                Ok(appended) => {
                    for _ in 0..appended.evicted {
                        self.shared.metrics.record_evicted();
                    }
                    self.shared.metrics.record_written(kind, appended.slot_len);
                }
                Err(e) => {
                    error!(kind = kind.tag(), error = %e, "failed to store record");
                    return;
                }
            }
        }
        self.shared.readable.notify_all();
    }

    /// Open a reader session. The first session ever opened starts at the
    /// oldest retained record, later ones at the tail.
    pub fn open(&self) -> Session {
        let options = self.options();
        let cursor = {
            let mut state = self.shared.state.lock();
            if state.opened {
                state.ring.next()
            } else {
                state.opened = true;
                state.ring.first()
            }
        };
        debug!(seq = cursor.seq, offset = cursor.offset, "session opened");
        Session::new(Arc::clone(&self.shared), cursor, options)
    }

    /// Stop accepting records and release every blocked reader with
    /// end-of-stream once it has caught up
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.readable.notify_all();
    }

    pub fn status(&self) -> LogStatus {
        let state = self.shared.state.lock();
        LogStatus {
            capacity: state.ring.capacity(),
            first: state.ring.first(),
            next: state.ring.next(),
            closed: state.closed,
        }
    }

    /// Records stored since creation
    pub fn records_written(&self) -> u64 {
        self.status().next.seq
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("status", &self.status())
            .finish()
    }
}

fn now_ns() -> u64 {
    Utc::now()
        .timestamp_nanos_opt()
        .map_or(0, |ns| u64::try_from(ns).unwrap_or(0))
}
