//! Reader sessions
//!
//! A session owns a private cursor into the shared log. Reads return one
//! rendered line each; a session that fell behind the retained history is
//! told so once and resynchronized to the oldest record.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::debug;

use crate::error::{ReadError, SeekError};
use crate::format;
use crate::log::{LogState, SessionOptions, Shared};
use crate::ring::Cursor;

bitflags! {
    /// Readiness reported by [`Session::poll`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Readiness: u32 {
        /// A read would return something without waiting
        const READABLE = 1 << 0;
        /// Records this session has not read were evicted
        const LOST = 1 << 1;
    }
}

/// Seek origins. Values follow `SEEK_SET`, `SEEK_CUR` and `SEEK_END`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// Oldest retained record
    Start,
    /// Leave the cursor where it is
    Current,
    /// Current tail: only records appended from now on
    End,
}

impl TryFrom<i32> for Whence {
    type Error = SeekError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Whence::Start),
            1 => Ok(Whence::Current),
            2 => Ok(Whence::End),
            other => Err(SeekError::InvalidWhence(other)),
        }
    }
}

/// Cancels a blocked read or wait of one session from another thread.
///
/// An interrupt only cancels calls already in progress; a later read or
/// wait is unaffected.
#[derive(Clone)]
pub struct InterruptHandle {
    interrupts: Arc<AtomicU64>,
    shared: Arc<Shared>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        // Taking the lock orders this wake-up after a reader's predicate check
        let _state = self.shared.state.lock();
        self.shared.readable.notify_all();
    }
}

pub struct Session {
    shared: Arc<Shared>,
    cursor: Cursor,
    options: SessionOptions,
    nonblocking: bool,
    interrupts: Arc<AtomicU64>,
}

impl Session {
    pub(crate) fn new(shared: Arc<Shared>, cursor: Cursor, options: SessionOptions) -> Self {
        Self {
            shared,
            cursor,
            options,
            nonblocking: false,
            interrupts: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.nonblocking = nonblocking;
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            interrupts: Arc::clone(&self.interrupts),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Read the next record into `out`. Returns the line length, or 0 at
    /// end-of-stream.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize, ReadError> {
        match self.read_line(out.len())? {
            Some(line) => {
                out[..line.len()].copy_from_slice(line.as_bytes());
                Ok(line.len())
            }
            None => Ok(0),
        }
    }

    /// Read the next record as a line of at most `capacity` bytes.
    /// `Ok(None)` is end-of-stream.
    pub fn read_line(&mut self, capacity: usize) -> Result<Option<String>, ReadError> {
        let armed = self.interrupts.load(Ordering::SeqCst);
        let mut state = self.shared.state.lock();

        while self.cursor.seq == state.ring.next().seq {
            if self.nonblocking {
                return Err(ReadError::WouldBlock);
            }
            if self.options.send_eof || state.closed {
                return Ok(None);
            }
            if self.interrupted_since(armed) {
                return Err(ReadError::Interrupted);
            }
            self.shared.readable.wait(&mut state);
        }

        let first = state.ring.first();
        if self.cursor.seq < first.seq {
            debug!(
                behind = first.seq - self.cursor.seq,
                resumed_at = first.seq,
                "session lost records"
            );
            self.cursor = first;
            self.shared.metrics.reader_lost_data();
            return Err(ReadError::DataLost {
                resumed_at: first.seq,
            });
        }

        let located = state.ring.decode(self.cursor);
        drop(state);

        let line = format::render(&located.record, self.options.format);
        if line.len() > capacity {
            return Err(ReadError::BufferTooSmall { needed: line.len() });
        }

        self.cursor = Cursor {
            seq: self.cursor.seq + 1,
            offset: located.successor,
        };
        Ok(Some(line))
    }

    /// Move the cursor. Only `Current` accepts a nonzero offset, and ignores it.
    pub fn seek(&mut self, whence: Whence, offset: i64) -> Result<(), SeekError> {
        if offset != 0 && whence != Whence::Current {
            return Err(SeekError::UnsupportedOffset(offset));
        }
        let state = self.shared.state.lock();
        match whence {
            Whence::Start => self.cursor = state.ring.first(),
            Whence::End => self.cursor = state.ring.next(),
            Whence::Current => {}
        }
        Ok(())
    }

    pub fn poll(&self) -> Readiness {
        let state = self.shared.state.lock();
        self.readiness(&state)
    }

    /// Block until the session is readable, the log is closed, the session
    /// is interrupted or `timeout` expires. Returns the readiness at that point.
    pub fn wait(&self, timeout: Option<Duration>) -> Readiness {
        let armed = self.interrupts.load(Ordering::SeqCst);
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        loop {
            let ready = self.readiness(&state);
            if !ready.is_empty() || state.closed {
                return ready;
            }
            if self.interrupted_since(armed) {
                return ready;
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .readable
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return self.readiness(&state);
                    }
                }
                None => self.shared.readable.wait(&mut state),
            }
        }
    }

    fn interrupted_since(&self, armed: u64) -> bool {
        self.interrupts.load(Ordering::SeqCst) != armed
    }

    fn readiness(&self, state: &LogState) -> Readiness {
        let mut ready = Readiness::empty();
        if self.cursor.seq < state.ring.next().seq {
            ready |= Readiness::READABLE;
            if self.cursor.seq < state.ring.first().seq {
                ready |= Readiness::LOST;
            }
        }
        ready
    }
}

impl io::Read for Session {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Session::read(self, buf).map_err(io::Error::from)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("cursor", &self.cursor)
            .field("options", &self.options)
            .field("nonblocking", &self.nonblocking)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::LineFormat;
    use crate::AuditLog;
    use netaudit_core::{
        create_metrics, Action, AddressFamily, Endpoint, NetworkEvent, ProcessIdentity, Protocol,
    };
    use std::thread;

    fn log(capacity: usize) -> AuditLog {
        AuditLog::new(capacity, create_metrics()).unwrap()
    }

    fn exec(log: &AuditLog, pid: u32) {
        let identity = ProcessIdentity {
            pid,
            tid: pid,
            ..Default::default()
        };
        log.record_execution_event(identity, "/bin/sleep", b"sleep\x001\0");
    }

    fn pid_of(line: &str) -> u32 {
        line.split("pid=")
            .nth(1)
            .and_then(|rest| rest.split(' ').next())
            .map(|pid| pid.parse().unwrap())
            .unwrap()
    }

    #[test]
    fn test_nonblocking_empty_would_block() {
        let log = log(4096);
        let mut session = log.open();
        session.set_nonblocking(true);
        assert_eq!(session.read_line(8192), Err(ReadError::WouldBlock));
    }

    #[test]
    fn test_reads_in_order() {
        let log = log(8192);
        let mut session = log.open();
        session.set_nonblocking(true);
        for pid in 1..=3 {
            exec(&log, pid);
        }
        for pid in 1..=3 {
            let line = session.read_line(8192).unwrap().unwrap();
            assert_eq!(pid_of(&line), pid);
        }
        assert_eq!(session.read_line(8192), Err(ReadError::WouldBlock));
    }

    #[test]
    fn test_buffer_too_small_keeps_cursor() {
        let log = log(4096);
        let mut session = log.open();
        exec(&log, 9);

        let before = session.cursor();
        let needed = match session.read_line(16) {
            Err(ReadError::BufferTooSmall { needed }) => needed,
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(session.cursor(), before);

        let line = session.read_line(needed).unwrap().unwrap();
        assert_eq!(line.len(), needed);
        assert_eq!(pid_of(&line), 9);
    }

    #[test]
    fn test_data_lost_resyncs_to_first() {
        let log = log(4096);
        let mut session = log.open();
        session.set_nonblocking(true);
        // Each record takes an 80 byte slot; 200 of them cycle the buffer several times
        for pid in 0..200 {
            exec(&log, pid);
        }

        let status = log.status();
        assert!(status.first.seq > 0);
        assert_eq!(session.poll(), Readiness::READABLE | Readiness::LOST);

        assert_eq!(
            session.read_line(8192),
            Err(ReadError::DataLost {
                resumed_at: status.first.seq
            })
        );
        assert_eq!(session.cursor(), status.first);

        let line = session.read_line(8192).unwrap().unwrap();
        assert_eq!(u64::from(pid_of(&line)), status.first.seq);
    }

    #[test]
    fn test_send_eof_when_caught_up() {
        let log = log(4096);
        log.set_options(SessionOptions {
            format: LineFormat::Simple,
            send_eof: true,
        });
        exec(&log, 1);

        let mut session = log.open();
        assert!(session.read_line(8192).unwrap().is_some());
        assert_eq!(session.read_line(8192), Ok(None));

        let mut buf = [0u8; 256];
        assert_eq!(session.read(&mut buf), Ok(0));
    }

    #[test]
    fn test_options_snapshot_at_open() {
        let log = log(4096);
        let mut syslog = log.open();
        log.set_options(SessionOptions {
            format: LineFormat::Simple,
            send_eof: false,
        });
        let mut simple = log.open();
        syslog.set_nonblocking(true);
        simple.set_nonblocking(true);

        exec(&log, 5);
        assert!(syslog.read_line(8192).unwrap().unwrap().starts_with("<86>1 - - execlog"));
        assert!(simple.read_line(8192).unwrap().unwrap().starts_with("execlog ["));
    }

    #[test]
    fn test_seek() {
        let log = log(8192);
        let _first = log.open();
        exec(&log, 1);
        exec(&log, 2);

        let mut session = log.open();
        assert_eq!(session.cursor(), log.status().next);

        session.seek(Whence::Start, 0).unwrap();
        assert_eq!(session.cursor(), log.status().first);

        session.seek(Whence::Current, 42).unwrap();
        assert_eq!(session.cursor(), log.status().first);

        assert_eq!(
            session.seek(Whence::End, 8),
            Err(SeekError::UnsupportedOffset(8))
        );
        session.seek(Whence::End, 0).unwrap();
        assert_eq!(session.cursor(), log.status().next);

        assert_eq!(Whence::try_from(2), Ok(Whence::End));
        assert_eq!(Whence::try_from(3), Err(SeekError::InvalidWhence(3)));
    }

    #[test]
    fn test_blocking_read_wakes_on_append() {
        let log = log(4096);
        let mut session = log.open();

        let producer = {
            let log = log.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                log.record_network_event(
                    ProcessIdentity::default(),
                    &NetworkEvent {
                        path: "/usr/bin/nc".to_string(),
                        action: Action::Connect,
                        protocol: Protocol::Udp,
                        family: AddressFamily::Inet,
                        src: Endpoint::new("127.0.0.1".parse().unwrap(), 5000),
                        dst: Endpoint::new("127.0.0.1".parse().unwrap(), 53),
                    },
                );
            })
        };

        let line = session.read_line(8192).unwrap().unwrap();
        assert!(line.contains("/usr/bin/nc CONNECT UDPv4 127.0.0.1:5000 -> 127.0.0.1:53"));
        producer.join().unwrap();
    }

    #[test]
    fn test_interrupt_cancels_blocked_read() {
        let log = log(4096);
        let mut session = log.open();
        let handle = session.interrupt_handle();

        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.interrupt();
        });

        assert_eq!(session.read_line(8192), Err(ReadError::Interrupted));
        interrupter.join().unwrap();
        assert_eq!(session.cursor().seq, 0);
    }

    #[test]
    fn test_earlier_interrupt_does_not_cancel_later_read() {
        let log = log(4096);
        let mut session = log.open();
        let handle = session.interrupt_handle();

        // Nobody is waiting yet, so this cancels nothing
        handle.interrupt();
        exec(&log, 1);
        assert_eq!(pid_of(&session.read_line(8192).unwrap().unwrap()), 1);

        let producer = {
            let log = log.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                exec(&log, 2);
            })
        };
        let line = session.read_line(8192).unwrap().unwrap();
        assert_eq!(pid_of(&line), 2);
        producer.join().unwrap();
    }

    #[test]
    fn test_close_releases_blocked_reader() {
        let log = log(4096);
        let mut session = log.open();

        let closer = {
            let log = log.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                log.close();
            })
        };

        assert_eq!(session.read_line(8192), Ok(None));
        closer.join().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let log = log(4096);
        let session = log.open();
        let ready = session.wait(Some(Duration::from_millis(20)));
        assert!(ready.is_empty());

        exec(&log, 1);
        assert_eq!(
            session.wait(Some(Duration::from_millis(20))),
            Readiness::READABLE
        );
    }

    #[tokio::test]
    async fn test_reader_on_blocking_pool() {
        let log = log(4096);
        let mut session = log.open();

        let reader = tokio::task::spawn_blocking(move || session.read_line(8192));
        tokio::time::sleep(Duration::from_millis(20)).await;
        exec(&log, 77);

        let line = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(pid_of(&line), 77);
    }

    #[test]
    fn test_io_read() {
        use std::io::Read;

        let log = log(4096);
        let mut session = log.open();
        session.set_nonblocking(true);

        let mut buf = [0u8; 512];
        let err = Read::read(&mut session, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        exec(&log, 3);
        let n = Read::read(&mut session, &mut buf).unwrap();
        assert!(buf[..n].ends_with(b"/bin/sleep sleep 1\n"));
    }
}
