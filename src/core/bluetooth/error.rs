//! Error taxonomy of the link core.
//!
//! Every failure surfaced to a caller, either as the `Err` of a method or as
//! the payload of a [`ConnectionResult::Error`](super::ConnectionResult) or
//! [`PrintResult::Error`](super::PrintResult), is a [`BleError`]. None of them
//! leave the core unusable: a new `connect` is always possible afterwards.

use thiserror::Error;

use crate::core::bluetooth::types::GattStatus;

/// Errors produced by the scanning, bonding, connection and transport layers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    /// The caller has not granted the capability this operation needs.
    #[error("Bluetooth permission has not been granted")]
    PermissionDenied,

    /// The bonding handshake did not reach the bonded state.
    #[error("Bonding failed: {0}")]
    BondingFailed(String),

    /// GATT connect or service discovery failed after the retry budget.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The link was lost, by the peer or by the platform.
    #[error("Disconnected")]
    Disconnected,

    /// The target characteristic is absent or supports no usable write mode.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A conflicting request is already in flight.
    #[error("Another request is already in progress")]
    Busy,

    /// The platform rejected a characteristic write.
    #[error("Characteristic write failed: {0}")]
    WriteFailed(GattStatus),

    /// No session is open.
    #[error("Not connected to a Bluetooth device")]
    NotConnected,

    /// A platform callback did not arrive in time.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// The platform adapter refused a command or stopped delivering events.
    #[error("Bluetooth adapter error: {0}")]
    Adapter(String),
}

/// A specialized [`Result`] type for link core operations.
pub type Result<T> = std::result::Result<T, BleError>;

impl BleError {
    /// Returns `true` if a fresh connection attempt may clear this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::Disconnected | Self::Timeout(_) | Self::Adapter(_)
        )
    }

    /// Returns a machine-readable error code.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::BondingFailed(_) => "BONDING_FAILED",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::Disconnected => "DISCONNECTED",
            Self::Unsupported(_) => "UNSUPPORTED",
            Self::Busy => "BUSY",
            Self::WriteFailed(_) => "WRITE_FAILED",
            Self::NotConnected => "NOT_CONNECTED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Adapter(_) => "ADAPTER_ERROR",
        }
    }
}
