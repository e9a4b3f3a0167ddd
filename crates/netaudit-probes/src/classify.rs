//! Event classification
//!
//! Turns a socket seen by a hook into a [`NetworkEvent`], or nothing. Only
//! inet and inet6 sockets of the protocol expected at the call site are
//! classified; anything else is not an error, just not audited.

use std::sync::Arc;

use netaudit_core::{Action, AddressFamily, NetworkEvent, Protocol, SharedMetrics};
use tracing::trace;

use crate::host::{ProcessInspector, SocketSnapshot, Task};

/// An intercepted operation waiting for classification
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub action: Action,
    /// Protocol the call site audits
    pub protocol: Protocol,
    pub socket: SocketSnapshot,
}

pub struct EventClassifier {
    inspector: Arc<dyn ProcessInspector>,
    metrics: SharedMetrics,
}

impl EventClassifier {
    pub fn new(inspector: Arc<dyn ProcessInspector>, metrics: SharedMetrics) -> Self {
        Self { inspector, metrics }
    }

    pub fn inspector(&self) -> &Arc<dyn ProcessInspector> {
        &self.inspector
    }

    pub fn classify(&self, task: Task, candidate: &Candidate) -> Option<NetworkEvent> {
        let family = eligible(candidate)?;

        let Some(path) = self.inspector.executable_path(task) else {
            trace!(pid = task.pid, "dropping event of task without executable");
            self.metrics.event_unresolved();
            return None;
        };

        Some(NetworkEvent {
            path,
            action: candidate.action,
            protocol: candidate.protocol,
            family,
            src: candidate.socket.src,
            dst: candidate.socket.dst,
        })
    }
}

/// Family and protocol filter, plus the close rules: a TCP close counts
/// only once connected (destination port set), a UDP close only once bound
/// (source port set)
fn eligible(candidate: &Candidate) -> Option<AddressFamily> {
    let socket = &candidate.socket;
    let family = AddressFamily::from_raw(socket.family)?;
    if Protocol::from_raw(socket.protocol) != Some(candidate.protocol) {
        return None;
    }
    if candidate.action == Action::Close {
        let used = match candidate.protocol {
            Protocol::Tcp => socket.dst.port != 0,
            Protocol::Udp => socket.src.port != 0,
        };
        if !used {
            return None;
        }
    }
    Some(family)
}
