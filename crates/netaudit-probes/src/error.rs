//! Error types for probe management

use thiserror::Error;

use crate::category::ProbePoint;

/// Failure to install a single interception point
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("symbol not found: {0}")]
    SymbolNotFound(&'static str),

    #[error("{0} is already attached")]
    AlreadyAttached(ProbePoint),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Probe controller errors, one per category family
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to plant connect probe: {0}")]
    ConnectProbeFailed(#[source] AttachError),

    #[error("failed to plant accept probe: {0}")]
    AcceptProbeFailed(#[source] AttachError),

    #[error("failed to plant close probe: {0}")]
    CloseProbeFailed(#[source] AttachError),

    #[error("failed to plant bind probe: {0}")]
    BindProbeFailed(#[source] AttachError),

    #[error("unknown probe category: {0}")]
    UnknownCategory(String),
}

pub type ProbeResult<T> = Result<T, ProbeError>;
