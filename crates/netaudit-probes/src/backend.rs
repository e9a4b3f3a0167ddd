//! Attachment backend seam
//!
//! The controller decides *which* interception points must be installed; a
//! backend knows *how* to install them on its host.

use crate::category::ProbePoint;
use crate::error::AttachError;

/// Installs and removes interception points
pub trait ProbeBackend: Send + Sync {
    /// Backend name, for logs
    fn name(&self) -> &str;

    /// Check whether the backend can attach anything on this host
    fn is_available(&self) -> bool {
        true
    }

    /// Install one interception point
    fn attach(&self, point: ProbePoint) -> Result<(), AttachError>;

    /// Remove one interception point. Removing a point that is not installed
    /// is a no-op.
    fn detach(&self, point: ProbePoint);
}
