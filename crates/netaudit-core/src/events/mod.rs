//! Audit record catalog
//!
//! Every record stored in the audit log starts with the same
//! [`ProcessDetails`] prefix, followed by one of the shapes in [`RecordBody`].

pub mod network;
pub mod process;

pub use network::{Action, AddressFamily, Endpoint, NetworkEvent, Protocol};
pub use process::{ExecEvent, ProcessDetails, ProcessIdentity};

/// Discriminant selecting the concrete record shape
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Socket activity (connect, accept, bind, close)
    Network = 1,
    /// Program execution
    Execution = 2,
}

impl RecordKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(RecordKind::Network),
            2 => Some(RecordKind::Execution),
            _ => None,
        }
    }

    /// Tag printed at the start of each rendered line
    pub fn tag(&self) -> &'static str {
        match self {
            RecordKind::Network => "netlog",
            RecordKind::Execution => "execlog",
        }
    }
}

/// Shape-specific payload of an audit record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    Network(NetworkEvent),
    Execution(ExecEvent),
}
