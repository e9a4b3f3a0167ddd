//! netaudit core - record catalog, configuration and metrics
//!
//! This crate holds the types shared by every other netaudit crate:
//!
//! - **Events**: the audit record shapes (network and execution events) and
//!   the process details prefixed to each of them
//! - **Config**: TOML configuration discovery, env overrides and validation
//! - **Metrics**: counters describing what the audit path did

pub mod config;
pub mod events;
pub mod metrics;

pub use config::{
    ConfigError, ConfigLoader, ConfigResult, LogSettings, ProbeSettings, SensorConfig,
    WhitelistRule,
};
pub use events::{
    Action, AddressFamily, Endpoint, ExecEvent, NetworkEvent, ProcessDetails,
    ProcessIdentity, Protocol, RecordBody, RecordKind,
};
pub use metrics::{create_metrics, AuditMetrics, SharedMetrics};

/// Sensor version
pub const SENSOR_VERSION: &str = env!("CARGO_PKG_VERSION");
