//! In-process interception backend
//!
//! [`LocalInterceptor`] stands in for the kernel: it owns a descriptor
//! table of synthetic sockets and exposes `connect`, `bind`, `accept` and
//! `close` call sites. Each call site runs the entry hook, the operation
//! itself and the exit hook, but only for interception points currently
//! attached through the [`ProbeBackend`] interface.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use netaudit_core::{AddressFamily, Endpoint, ProcessIdentity, Protocol};
use netaudit_log::AuditLog;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::backend::ProbeBackend;
use crate::category::ProbePoint;
use crate::controller::{LoadedProbes, ProbeController};
use crate::error::AttachError;
use crate::hooks::NetworkHooks;
use crate::host::{ProcessInspector, SocketHandle, SocketSnapshot, SocketTable, SocketView, Task};
use crate::whitelist::Whitelist;

const EBADF: i64 = 9;

/// First descriptor handed out per process
const FIRST_FD: i32 = 3;

const EPHEMERAL_PORT_START: u16 = 40000;

/// A synthetic socket
#[derive(Debug)]
pub struct LocalSocket {
    state: Mutex<Option<SocketSnapshot>>,
}

impl LocalSocket {
    pub fn new(family: AddressFamily, protocol: u8) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Some(SocketSnapshot::unbound(family, protocol))),
        })
    }

    pub fn set_src(&self, src: Endpoint) {
        if let Some(state) = self.state.lock().as_mut() {
            state.src = src;
        }
    }

    pub fn set_dst(&self, dst: Endpoint) {
        if let Some(state) = self.state.lock().as_mut() {
            state.dst = dst;
        }
    }

    /// Drop the protocol state; later snapshots return `None`
    pub fn release(&self) {
        *self.state.lock() = None;
    }
}

impl SocketView for LocalSocket {
    fn snapshot(&self) -> Option<SocketSnapshot> {
        *self.state.lock()
    }
}

#[derive(Default)]
struct DescriptorTable {
    sockets: HashMap<(u32, i32), Arc<LocalSocket>>,
    next_fd: HashMap<u32, i32>,
}

/// Per-process descriptor tables of synthetic sockets
#[derive(Default)]
pub struct LocalSocketTable {
    inner: Mutex<DescriptorTable>,
}

impl LocalSocketTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a socket in the task's process, returning its descriptor
    pub fn insert(&self, task: Task, socket: Arc<LocalSocket>) -> i32 {
        let mut table = self.inner.lock();
        let next = table.next_fd.entry(task.pid).or_insert(FIRST_FD);
        let fd = *next;
        *next += 1;
        table.sockets.insert((task.pid, fd), socket);
        fd
    }

    pub fn get(&self, task: Task, fd: i32) -> Option<Arc<LocalSocket>> {
        self.inner.lock().sockets.get(&(task.pid, fd)).cloned()
    }

    pub fn remove(&self, task: Task, fd: i32) -> Option<Arc<LocalSocket>> {
        self.inner.lock().sockets.remove(&(task.pid, fd))
    }

    /// Open descriptors across all processes
    pub fn len(&self) -> usize {
        self.inner.lock().sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SocketTable for LocalSocketTable {
    fn lookup(&self, task: Task, fd: i32) -> Option<SocketHandle> {
        self.get(task, fd).map(|socket| socket as SocketHandle)
    }
}

struct Program {
    path: String,
    identity: ProcessIdentity,
}

/// Process registry for synthetic tasks, optionally falling back to another
/// inspector for unknown ones
#[derive(Default)]
pub struct LocalProcesses {
    programs: RwLock<HashMap<u32, Program>>,
    fallback: Option<Arc<dyn ProcessInspector>>,
}

impl LocalProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn ProcessInspector>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Register the executable of the task's process
    pub fn register(&self, task: Task, path: impl Into<String>) {
        self.register_identity(
            ProcessIdentity {
                pid: task.pid,
                tid: task.tid,
                ppid: 1,
                ..Default::default()
            },
            path,
        );
    }

    pub fn register_identity(&self, identity: ProcessIdentity, path: impl Into<String>) {
        self.programs.write().insert(
            identity.pid,
            Program {
                path: path.into(),
                identity,
            },
        );
    }
}

impl ProcessInspector for LocalProcesses {
    fn executable_path(&self, task: Task) -> Option<String> {
        if let Some(program) = self.programs.read().get(&task.pid) {
            return Some(program.path.clone());
        }
        self.fallback.as_ref()?.executable_path(task)
    }

    fn identity(&self, task: Task) -> ProcessIdentity {
        if let Some(program) = self.programs.read().get(&task.pid) {
            return ProcessIdentity {
                tid: task.tid,
                ..program.identity
            };
        }
        match &self.fallback {
            Some(fallback) => fallback.identity(task),
            None => ProcessIdentity {
                pid: task.pid,
                tid: task.tid,
                ..Default::default()
            },
        }
    }
}

/// In-process [`ProbeBackend`] with instrumented socket call sites
pub struct LocalInterceptor {
    hooks: Arc<NetworkHooks>,
    sockets: Arc<LocalSocketTable>,
    attached: RwLock<HashSet<ProbePoint>>,
    missing_symbols: HashSet<&'static str>,
    next_port: AtomicU16,
    local_v4: Ipv4Addr,
    local_v6: Ipv6Addr,
}

impl LocalInterceptor {
    pub fn new(hooks: Arc<NetworkHooks>, sockets: Arc<LocalSocketTable>) -> Self {
        Self {
            hooks,
            sockets,
            attached: RwLock::new(HashSet::new()),
            missing_symbols: HashSet::new(),
            next_port: AtomicU16::new(EPHEMERAL_PORT_START),
            local_v4: Ipv4Addr::new(192, 0, 2, 10),
            local_v6: Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x10),
        }
    }

    /// Make attaching to `symbol` fail, as on a host lacking it
    pub fn without_symbol(mut self, symbol: &'static str) -> Self {
        self.missing_symbols.insert(symbol);
        self
    }

    pub fn sockets(&self) -> &Arc<LocalSocketTable> {
        &self.sockets
    }

    pub fn hooks(&self) -> &Arc<NetworkHooks> {
        &self.hooks
    }

    pub fn is_attached(&self, point: ProbePoint) -> bool {
        self.attached.read().contains(&point)
    }

    /// Create an unbound socket
    pub fn socket(&self, task: Task, family: AddressFamily, protocol: Protocol) -> i32 {
        self.sockets
            .insert(task, LocalSocket::new(family, protocol as u8))
    }

    pub fn connect(&self, task: Task, fd: i32, peer: SocketAddr) -> io::Result<()> {
        let socket = self.sockets.get(task, fd).ok_or_else(bad_descriptor)?;
        let snapshot = socket.snapshot().ok_or_else(bad_descriptor)?;
        let (entry, exit) = if Protocol::from_raw(snapshot.protocol) == Some(Protocol::Udp) {
            (ProbePoint::DgramConnectEntry, ProbePoint::DgramConnectExit)
        } else {
            (ProbePoint::StreamConnectEntry, ProbePoint::StreamConnectExit)
        };

        if self.is_attached(entry) {
            match entry {
                ProbePoint::DgramConnectEntry => self.hooks.dgram_connect_entry(task, socket.clone()),
                _ => self.hooks.stream_connect_entry(task, socket.clone()),
            }
        }

        let result = self.check_family(&snapshot, peer).map(|()| {
            if snapshot.src.port == 0 {
                socket.set_src(Endpoint::new(self.local_addr(peer), self.ephemeral_port()));
            }
            socket.set_dst(Endpoint::from(peer));
        });

        if self.is_attached(exit) {
            match exit {
                ProbePoint::DgramConnectExit => self.hooks.dgram_connect_exit(task),
                _ => self.hooks.stream_connect_exit(task),
            }
        }
        result
    }

    pub fn bind(&self, task: Task, fd: i32, local: SocketAddr) -> io::Result<()> {
        if self.is_attached(ProbePoint::BindEntry) {
            self.hooks.bind_entry(task, fd);
        }

        let result = self
            .sockets
            .get(task, fd)
            .and_then(|socket| socket.snapshot().map(|snapshot| (socket, snapshot)))
            .ok_or_else(bad_descriptor)
            .and_then(|(socket, snapshot)| {
                self.check_family(&snapshot, local)?;
                let port = match local.port() {
                    0 => self.ephemeral_port(),
                    port => port,
                };
                socket.set_src(Endpoint::new(local.ip(), port));
                Ok(())
            });

        if self.is_attached(ProbePoint::BindExit) {
            self.hooks.bind_exit(task);
        }
        result
    }

    /// Accept a connection from `peer` on a listening socket, returning the
    /// new descriptor
    pub fn accept(&self, task: Task, listener: i32, peer: SocketAddr) -> io::Result<i32> {
        let ret = match self.sockets.get(task, listener).and_then(|s| s.snapshot()) {
            Some(listening) => {
                let accepted = Arc::new(LocalSocket {
                    state: Mutex::new(Some(SocketSnapshot {
                        dst: Endpoint::from(peer),
                        ..listening
                    })),
                });
                i64::from(self.sockets.insert(task, accepted))
            }
            None => -EBADF,
        };

        if self.is_attached(ProbePoint::AcceptExit) {
            self.hooks.accept_exit(task, ret);
        }

        i32::try_from(ret)
            .ok()
            .filter(|fd| *fd >= 0)
            .ok_or_else(bad_descriptor)
    }

    pub fn close(&self, task: Task, fd: i32) -> io::Result<()> {
        if self.is_attached(ProbePoint::CloseEntry) {
            self.hooks.close_entry(task, fd);
        }
        let socket = self.sockets.remove(task, fd).ok_or_else(bad_descriptor)?;
        socket.release();
        Ok(())
    }

    fn check_family(&self, snapshot: &SocketSnapshot, addr: SocketAddr) -> io::Result<()> {
        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };
        if snapshot.family != family as u16 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "address family not supported by socket",
            ));
        }
        Ok(())
    }

    fn local_addr(&self, peer: SocketAddr) -> IpAddr {
        match peer.ip() {
            IpAddr::V4(v4) if v4.is_loopback() => IpAddr::V4(v4),
            IpAddr::V6(v6) if v6.is_loopback() => IpAddr::V6(v6),
            IpAddr::V4(_) => IpAddr::V4(self.local_v4),
            IpAddr::V6(_) => IpAddr::V6(self.local_v6),
        }
    }

    fn ephemeral_port(&self) -> u16 {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        if port == u16::MAX {
            self.next_port.store(EPHEMERAL_PORT_START, Ordering::Relaxed);
        }
        port
    }
}

impl ProbeBackend for LocalInterceptor {
    fn name(&self) -> &str {
        "local"
    }

    fn attach(&self, point: ProbePoint) -> Result<(), AttachError> {
        if self.missing_symbols.contains(point.symbol()) {
            return Err(AttachError::SymbolNotFound(point.symbol()));
        }
        if !self.attached.write().insert(point) {
            return Err(AttachError::AlreadyAttached(point));
        }
        Ok(())
    }

    fn detach(&self, point: ProbePoint) {
        if !self.attached.write().remove(&point) {
            debug!(point = %point, "detach of a point that is not attached");
        }
    }
}

fn bad_descriptor() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "bad file descriptor")
}

/// Everything needed to audit in-process socket activity, wired together
pub struct LocalStack {
    pub interceptor: Arc<LocalInterceptor>,
    pub controller: ProbeController,
    pub processes: Arc<LocalProcesses>,
}

impl LocalStack {
    pub fn new(
        log: AuditLog,
        processes: Arc<LocalProcesses>,
        whitelist: Arc<dyn Whitelist>,
        max_threads: usize,
    ) -> Self {
        Self::with_interceptor(log, processes, whitelist, max_threads, |i| i)
    }

    /// Like [`LocalStack::new`], with a chance to configure the interceptor
    /// before it is shared
    pub fn with_interceptor(
        log: AuditLog,
        processes: Arc<LocalProcesses>,
        whitelist: Arc<dyn Whitelist>,
        max_threads: usize,
        configure: impl FnOnce(LocalInterceptor) -> LocalInterceptor,
    ) -> Self {
        let loaded = Arc::new(LoadedProbes::default());
        let sockets = Arc::new(LocalSocketTable::new());
        let hooks = NetworkHooks::new(
            log,
            Arc::clone(&loaded),
            sockets.clone(),
            processes.clone(),
            max_threads,
        )
        .with_whitelist(whitelist);
        let interceptor = Arc::new(configure(LocalInterceptor::new(Arc::new(hooks), sockets)));
        let controller = ProbeController::with_loaded_probes(interceptor.clone(), loaded);
        Self {
            interceptor,
            controller,
            processes,
        }
    }
}
