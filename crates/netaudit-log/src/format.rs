//! Text rendering of stored records
//!
//! One newline terminated line per record:
//!
//! ```text
//! <86>1 - - netlog - - - [1700000000.000001]: pid=.. tid=.. ppid=.. uid=.. gid=.. /usr/bin/curl CONNECT TCPv4 10.0.0.2:51000 -> 93.184.216.34:443
//! netlog [1700000000.000001]: pid=.. ... (simple format)
//! ```

use std::fmt::Write;

use netaudit_core::{ExecEvent, NetworkEvent, ProcessDetails, RecordBody, RecordKind};

use crate::codec::{StoredContent, StoredRecord};

/// Largest line a single read can produce
pub const LINE_CAPACITY: usize = 8192;

/// Syslog facility `authpriv`
pub const SYSLOG_FACILITY: u8 = 10;

/// Syslog severity `info`
pub const SYSLOG_SEVERITY: u8 = 6;

/// Replaces the body of a line that would exceed [`LINE_CAPACITY`]
pub const TRUNCATION_MARKER: &str = "TRUNC";

pub const BROKEN_RECORD: &str = "BROKEN RECORD";

pub const UNKNOWN_ENTRY: &str = "Unknown entry";

/// Line layout selected when a session is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineFormat {
    /// RFC 5424 shaped syslog line
    #[default]
    Syslog,
    /// Kind tag and timestamp only
    Simple,
}

impl LineFormat {
    pub fn from_simple(simple: bool) -> Self {
        if simple {
            LineFormat::Simple
        } else {
            LineFormat::Syslog
        }
    }
}

/// Syslog PRI value carried by every syslog line
pub fn syslog_priority() -> u8 {
    (SYSLOG_FACILITY << 3) | SYSLOG_SEVERITY
}

/// Render one stored record
pub fn render(record: &StoredRecord, format: LineFormat) -> String {
    let mut line = String::with_capacity(256);
    write_header(&mut line, kind_tag(&record.content), &record.details, format);
    let header_len = line.len();

    let _ = write!(line, "{} ", record.details);
    match &record.content {
        StoredContent::Complete(RecordBody::Network(event)) => write_network(&mut line, event),
        StoredContent::Complete(RecordBody::Execution(event)) => write_exec(&mut line, event),
        StoredContent::Broken(_) => line.push_str(BROKEN_RECORD),
        StoredContent::Unknown(_) => line.push_str(UNKNOWN_ENTRY),
    }
    line.push('\n');

    if line.len() > LINE_CAPACITY {
        line.truncate(header_len);
        line.push_str(TRUNCATION_MARKER);
        line.push('\n');
    }
    line
}

fn kind_tag(content: &StoredContent) -> &'static str {
    match content {
        StoredContent::Complete(RecordBody::Network(_)) => RecordKind::Network.tag(),
        StoredContent::Complete(RecordBody::Execution(_)) => RecordKind::Execution.tag(),
        StoredContent::Broken(kind) => kind.tag(),
        StoredContent::Unknown(_) => "unknown",
    }
}

fn write_header(line: &mut String, tag: &str, details: &ProcessDetails, format: LineFormat) {
    let secs = details.seconds();
    let micros = details.micros();
    let _ = match format {
        LineFormat::Syslog => write!(
            line,
            "<{}>1 - - {} - - - [{:5}.{:06}]: ",
            syslog_priority(),
            tag,
            secs,
            micros
        ),
        LineFormat::Simple => write!(line, "{} [{:5}.{:06}]: ", tag, secs, micros),
    };
}

fn write_network(line: &mut String, event: &NetworkEvent) {
    let _ = write!(
        line,
        "{} {} {}{} {}",
        event.path,
        event.action.as_str(),
        event.protocol.as_str(),
        event.family.suffix(),
        event.src
    );
    if let Some(dst) = event.destination() {
        let _ = write!(line, " -> {}", dst);
    }
}

fn write_exec(line: &mut String, event: &ExecEvent) {
    let _ = write!(line, "{} {}", event.path, event.argv_display());
}
