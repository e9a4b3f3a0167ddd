//! netaudit probes - interception of socket operations
//!
//! - **Categories**: the switchable probe categories and the interception
//!   points behind them
//! - **Controller**: enable/disable/status of categories over a
//!   [`ProbeBackend`], with unwinding on partial failure
//! - **Correlation**: per-thread table handing entry state to exit hooks
//! - **Classify / Whitelist**: which observed operations become audit records
//! - **Hooks**: the hook bodies, each behind a fault boundary
//! - **Local**: an in-process backend with instrumented socket call sites

pub mod backend;
pub mod category;
pub mod classify;
pub mod controller;
pub mod correlation;
pub mod error;
pub mod hooks;
pub mod host;
pub mod local;
pub mod whitelist;

pub use backend::ProbeBackend;
pub use category::{HookPhase, ProbeCategory, ProbePoint, CLOSE_CATEGORIES, PLANT_ORDER};
pub use classify::{Candidate, EventClassifier};
pub use controller::{LoadedProbes, ProbeController};
pub use correlation::InflightTable;
pub use error::{AttachError, ProbeError, ProbeResult};
pub use hooks::NetworkHooks;
pub use host::{
    ProcessInspector, ProcfsInspector, SocketHandle, SocketSnapshot, SocketTable, SocketView, Task,
};
pub use local::{LocalInterceptor, LocalProcesses, LocalSocket, LocalSocketTable, LocalStack};
pub use whitelist::{AllowNone, StaticWhitelist, Whitelist};
