//! Hook bodies run at the interception points
//!
//! Entry hooks only stash state and never block. Exit hooks classify, check
//! the whitelist, and write to the audit log. Every hook runs behind a fault
//! boundary: a panic is logged and counted, never propagated into the
//! intercepted operation.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use netaudit_core::{Action, Protocol, SharedMetrics};
use netaudit_log::AuditLog;
use tracing::{debug, error};

use crate::category::{ProbeCategory, ProbePoint};
use crate::classify::{Candidate, EventClassifier};
use crate::controller::LoadedProbes;
use crate::correlation::InflightTable;
use crate::host::{ProcessInspector, SocketHandle, SocketSnapshot, SocketTable, Task};
use crate::whitelist::{AllowNone, Whitelist};

pub struct NetworkHooks {
    inflight: InflightTable<SocketHandle>,
    sockets: Arc<dyn SocketTable>,
    classifier: EventClassifier,
    whitelist: Arc<dyn Whitelist>,
    loaded: Arc<LoadedProbes>,
    log: AuditLog,
}

impl NetworkHooks {
    pub fn new(
        log: AuditLog,
        loaded: Arc<LoadedProbes>,
        sockets: Arc<dyn SocketTable>,
        inspector: Arc<dyn ProcessInspector>,
        max_threads: usize,
    ) -> Self {
        let classifier = EventClassifier::new(inspector, log.metrics().clone());
        Self {
            inflight: InflightTable::new(max_threads),
            sockets,
            classifier,
            whitelist: Arc::new(AllowNone),
            loaded,
            log,
        }
    }

    pub fn with_whitelist(mut self, whitelist: Arc<dyn Whitelist>) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn inflight(&self) -> &InflightTable<SocketHandle> {
        &self.inflight
    }

    fn metrics(&self) -> &SharedMetrics {
        self.log.metrics()
    }

    pub fn stream_connect_entry(&self, task: Task, socket: SocketHandle) {
        self.guarded(ProbePoint::StreamConnectEntry, || self.stash(task, socket));
    }

    /// The outcome of the connect is not consulted: an in-progress
    /// non-blocking connect is audited like a completed one
    pub fn stream_connect_exit(&self, task: Task) {
        self.guarded(ProbePoint::StreamConnectExit, || {
            if let Some(socket) = self.inflight.take_inflight(task.tid) {
                self.audit_socket(task, Action::Connect, Protocol::Tcp, &socket);
            }
        });
    }

    pub fn dgram_connect_entry(&self, task: Task, socket: SocketHandle) {
        self.guarded(ProbePoint::DgramConnectEntry, || self.stash(task, socket));
    }

    pub fn dgram_connect_exit(&self, task: Task) {
        self.guarded(ProbePoint::DgramConnectExit, || {
            if let Some(socket) = self.inflight.take_inflight(task.tid) {
                self.audit_socket(task, Action::Connect, Protocol::Udp, &socket);
            }
        });
    }

    /// `ret` is the accepted descriptor, or a negative errno
    pub fn accept_exit(&self, task: Task, ret: i64) {
        self.guarded(ProbePoint::AcceptExit, || {
            let Ok(fd) = i32::try_from(ret) else {
                return;
            };
            if fd < 0 {
                return;
            }
            if let Some(socket) = self.sockets.lookup(task, fd) {
                self.audit_socket(task, Action::Accept, Protocol::Tcp, &socket);
            }
        });
    }

    pub fn close_entry(&self, task: Task, fd: i32) {
        self.guarded(ProbePoint::CloseEntry, || {
            let Some(snapshot) = self.sockets.lookup(task, fd).and_then(|s| s.snapshot()) else {
                return;
            };
            let loaded = self.loaded.get();
            match Protocol::from_raw(snapshot.protocol) {
                Some(Protocol::Tcp) if loaded.contains(ProbeCategory::TCP_CLOSE) => {
                    self.audit(task, Action::Close, Protocol::Tcp, snapshot);
                }
                Some(Protocol::Udp) if loaded.contains(ProbeCategory::UDP_CLOSE) => {
                    self.audit(task, Action::Close, Protocol::Udp, snapshot);
                }
                _ => {}
            }
        });
    }

    pub fn bind_entry(&self, task: Task, fd: i32) {
        self.guarded(ProbePoint::BindEntry, || {
            match self.sockets.lookup(task, fd) {
                Some(socket) => self.stash(task, socket),
                // Nothing left over from an unfinished call may reach the exit
                None => {
                    self.inflight.take_inflight(task.tid);
                }
            }
        });
    }

    pub fn bind_exit(&self, task: Task) {
        self.guarded(ProbePoint::BindExit, || {
            if let Some(socket) = self.inflight.take_inflight(task.tid) {
                self.audit_socket(task, Action::Bind, Protocol::Udp, &socket);
            }
        });
    }

    fn stash(&self, task: Task, socket: SocketHandle) {
        if !self.inflight.record_inflight(task.tid, socket) {
            self.metrics().thread_uncorrelated();
        }
    }

    fn audit_socket(&self, task: Task, action: Action, protocol: Protocol, socket: &SocketHandle) {
        if let Some(snapshot) = socket.snapshot() {
            self.audit(task, action, protocol, snapshot);
        }
    }

    fn audit(&self, task: Task, action: Action, protocol: Protocol, socket: SocketSnapshot) {
        let candidate = Candidate {
            action,
            protocol,
            socket,
        };
        let Some(event) = self.classifier.classify(task, &candidate) else {
            return;
        };

        if self
            .whitelist
            .is_whitelisted(&event.path, event.family, &event.dst)
        {
            debug!(path = %event.path, action = action.as_str(), "event whitelisted");
            self.metrics().event_whitelisted();
            return;
        }

        let identity = self.classifier.inspector().identity(task);
        self.log.record_network_event(identity, &event);
    }

    fn guarded(&self, point: ProbePoint, hook: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(hook)) {
            error!(point = %point, fault = panic_message(&*payload), "fault inside probe");
            self.metrics().hook_fault();
        }
    }
}

impl std::fmt::Debug for NetworkHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkHooks")
            .field("inflight", &self.inflight)
            .field("loaded", &self.loaded.get())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown fault"
    }
}
