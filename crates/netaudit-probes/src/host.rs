//! Host seam: tasks, sockets and process inspection
//!
//! Hooks never touch the OS directly. They see the calling task, resolve
//! descriptors through a [`SocketTable`] and read process attributes through
//! a [`ProcessInspector`].

use std::fs;
use std::sync::Arc;

use netaudit_core::{AddressFamily, Endpoint, ProcessIdentity};
use tracing::trace;

/// The thread running an intercepted operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Task {
    pub pid: u32,
    pub tid: u32,
}

impl Task {
    pub fn new(pid: u32, tid: u32) -> Self {
        Self { pid, tid }
    }
}

/// Socket state read at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketSnapshot {
    /// Raw address family, `AF_*`
    pub family: u16,
    /// Raw transport protocol, `IPPROTO_*`
    pub protocol: u8,
    pub src: Endpoint,
    pub dst: Endpoint,
}

impl SocketSnapshot {
    /// Unconnected, unbound socket of an inet family
    pub fn unbound(family: AddressFamily, protocol: u8) -> Self {
        Self {
            family: family as u16,
            protocol,
            src: Endpoint::unspecified(family),
            dst: Endpoint::unspecified(family),
        }
    }
}

/// A socket seen by a hook
pub trait SocketView: Send + Sync {
    /// Current state; `None` once the socket has no protocol state attached
    fn snapshot(&self) -> Option<SocketSnapshot>;
}

pub type SocketHandle = Arc<dyn SocketView>;

/// Descriptor to socket resolution for a task
pub trait SocketTable: Send + Sync {
    fn lookup(&self, task: Task, fd: i32) -> Option<SocketHandle>;
}

/// Process attributes of a task
pub trait ProcessInspector: Send + Sync {
    /// Path of the task's executable; `None` if it has no executable
    /// mapping (kernel threads, exiting processes)
    fn executable_path(&self, task: Task) -> Option<String>;

    fn identity(&self, task: Task) -> ProcessIdentity;
}

/// Reads process attributes from `/proc`
#[derive(Debug, Clone, Default)]
pub struct ProcfsInspector;

impl ProcfsInspector {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessInspector for ProcfsInspector {
    fn executable_path(&self, task: Task) -> Option<String> {
        match fs::read_link(format!("/proc/{}/exe", task.pid)) {
            Ok(exe) => Some(exe.to_string_lossy().into_owned()),
            Err(e) => {
                trace!(pid = task.pid, error = %e, "no executable mapping");
                None
            }
        }
    }

    fn identity(&self, task: Task) -> ProcessIdentity {
        let mut identity = ProcessIdentity {
            pid: task.pid,
            tid: task.tid,
            ..Default::default()
        };
        if let Ok(status) = fs::read_to_string(format!("/proc/{}/status", task.pid)) {
            apply_status(&mut identity, &status);
        }
        identity
    }
}

/// Fill ppid, uid and gid from the contents of `/proc/<pid>/status`
fn apply_status(identity: &mut ProcessIdentity, status: &str) {
    for line in status.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        // Uid and Gid lines carry real, effective, saved and fs ids
        let first = value.split_whitespace().next().and_then(|v| v.parse().ok());
        match (key, first) {
            ("PPid", Some(v)) => identity.ppid = v,
            ("Uid", Some(v)) => identity.uid = v,
            ("Gid", Some(v)) => identity.gid = v,
            _ => {}
        }
    }
}
