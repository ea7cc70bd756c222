//! Server error taxonomy
//!
//! Device and resource failures are reflected to the client as wire status
//! codes without closing the connection; server lifecycle errors surface
//! synchronously from `start()`/`stop()` or through the error callback.

use protocol::status;
use std::fmt;
use thiserror::Error;

/// Device-level failures, carried in protocol reply statuses
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// Device is already claimed by another connection
    #[error("device busy: already claimed")]
    DeviceBusy,

    /// Bus id unknown, or excluded by the device allow-list
    #[error("device not found")]
    NotFound,

    /// Underlying I/O failed while claiming the device
    #[error("claim failed: {0}")]
    ClaimFailed(String),

    /// Device disappeared while claimed
    #[error("device gone")]
    DeviceGone,
}

impl DeviceError {
    /// Wire status carried in the reply header for this error
    pub fn wire_status(&self) -> i32 {
        match self {
            Self::DeviceBusy => status::DEVICE_BUSY,
            Self::NotFound => status::NOT_FOUND,
            Self::ClaimFailed(_) => status::IO_ERROR,
            Self::DeviceGone => status::DEVICE_GONE,
        }
    }
}

/// Which concurrency bound an admission rejection hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    /// Per-connection concurrent-request limit
    Connection,
    /// Per-device pending-URB limit
    Device,
    /// Server-wide concurrent-request limit
    Server,
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => f.write_str("per-connection"),
            Self::Device => f.write_str("per-device"),
            Self::Server => f.write_str("server-wide"),
        }
    }
}

/// Resource and admission failures
///
/// Rejected immediately at admission time or resolved by the timeout
/// mechanism; never silently queued.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ResourceError {
    /// Accept-time rejection: connection count at `max_connections`
    #[error("too many connections")]
    TooManyConnections,

    /// A pending-transfer limit is reached
    #[error("{0} pending-transfer limit exceeded")]
    ResourceExhausted(LimitScope),

    /// A transfer exceeded the USB operation timeout
    #[error("USB operation timed out")]
    OperationTimeout,
}

impl ResourceError {
    /// Wire status carried in the reply header for this error
    pub fn wire_status(&self) -> i32 {
        match self {
            Self::TooManyConnections | Self::ResourceExhausted(_) => status::RESOURCE_EXHAUSTED,
            Self::OperationTimeout => status::TIMEOUT,
        }
    }
}

/// Server lifecycle errors, surfaced to the host process
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// Unexpected runtime failure the host process should react to
    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_statuses() {
        assert_eq!(DeviceError::DeviceBusy.wire_status(), status::DEVICE_BUSY);
        assert_eq!(DeviceError::NotFound.wire_status(), status::NOT_FOUND);
        assert_eq!(
            DeviceError::ClaimFailed("boom".into()).wire_status(),
            status::IO_ERROR
        );
        assert_eq!(DeviceError::DeviceGone.wire_status(), status::DEVICE_GONE);
    }

    #[test]
    fn test_resource_error_statuses() {
        assert_eq!(
            ResourceError::ResourceExhausted(LimitScope::Device).wire_status(),
            status::RESOURCE_EXHAUSTED
        );
        assert_eq!(
            ResourceError::OperationTimeout.wire_status(),
            status::TIMEOUT
        );
    }

    #[test]
    fn test_limit_scope_display() {
        let msg = format!("{}", ResourceError::ResourceExhausted(LimitScope::Server));
        assert!(msg.contains("server-wide"));
    }
}
