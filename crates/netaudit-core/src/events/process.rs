//! Process details and execution events

use std::fmt;

/// Identity of the process (and thread) a record is about
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub tid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Common prefix of every audit record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessDetails {
    /// Wall clock time the record was stored, nanoseconds since the epoch
    pub timestamp_ns: u64,
    pub identity: ProcessIdentity,
}

impl ProcessDetails {
    pub fn new(timestamp_ns: u64, identity: ProcessIdentity) -> Self {
        Self {
            timestamp_ns,
            identity,
        }
    }

    /// Whole seconds of the timestamp
    pub fn seconds(&self) -> u64 {
        self.timestamp_ns / 1_000_000_000
    }

    /// Sub-second part of the timestamp in microseconds
    pub fn micros(&self) -> u64 {
        (self.timestamp_ns % 1_000_000_000) / 1_000
    }
}

impl fmt::Display for ProcessDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = &self.identity;
        write!(
            f,
            "pid={} tid={} ppid={} uid={} gid={}",
            id.pid, id.tid, id.ppid, id.uid, id.gid
        )
    }
}

/// Program execution event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecEvent {
    /// Executable path
    pub path: String,
    /// Argument vector, NUL separated as the kernel hands it over
    pub argv: Vec<u8>,
}

impl ExecEvent {
    pub fn new(path: impl Into<String>, argv: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            argv: argv.into(),
        }
    }

    /// Build an event from individual arguments
    pub fn from_args<S: AsRef<str>>(path: impl Into<String>, args: &[S]) -> Self {
        let mut argv = Vec::new();
        for arg in args {
            argv.extend_from_slice(arg.as_ref().as_bytes());
            argv.push(0);
        }
        Self::new(path, argv)
    }

    /// Arguments joined with spaces for display
    pub fn argv_display(&self) -> String {
        let trimmed = match self.argv.iter().rposition(|&b| b != 0) {
            Some(last) => &self.argv[..=last],
            None => &[][..],
        };
        let spaced: Vec<u8> = trimmed
            .iter()
            .map(|&b| if b == 0 { b' ' } else { b })
            .collect();
        String::from_utf8_lossy(&spaced).into_owned()
    }
}
