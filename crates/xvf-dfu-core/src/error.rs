//! Top-level error type and the stable codes reported to error hooks.

use std::fmt;

use thiserror::Error;

use crate::chunker::ChunkerError;
use crate::config::ConfigError;
use crate::firmware::{FirmwareError, FirmwareVersion};
use crate::protocol::{DeviceState, DeviceStatus, FrameError};
use crate::state::DfuState;
use crate::transport::TransportError;

/// Result type alias for updater operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Failure code handed to `on_error` hooks.
///
/// Values 1 and 3-5 keep the numbering of the updater status codes the
/// device integration has always reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    Transport = 1,
    Timeout = 3,
    VerifyFailed = 4,
    BadState = 5,
    ActivationFailed = 6,
    Integrity = 7,
    NoImage = 8,
    Cancelled = 9,
    DeviceStatus = 10,
    Busy = 11,
    Config = 12,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::VerifyFailed => "verify-failed",
            Self::BadState => "bad-state",
            Self::ActivationFailed => "activation-failed",
            Self::Integrity => "integrity",
            Self::NoImage => "no-image",
            Self::Cancelled => "cancelled",
            Self::DeviceStatus => "device-status",
            Self::Busy => "busy",
            Self::Config => "config",
        };
        write!(f, "{} ({})", name, self.as_u8())
    }
}

/// Failures the device reports through the DFU protocol itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Device rejected the image during manifestation: {status}")]
    VerifyFailed { status: DeviceStatus },

    #[error("Device runs {actual} after reboot, expected {expected}")]
    ActivationFailed {
        expected: FirmwareVersion,
        actual: FirmwareVersion,
    },

    #[error("Device reported {status} in state {state}")]
    DeviceStatus {
        state: DeviceState,
        status: DeviceStatus,
    },
}

#[derive(Error, Debug)]
pub enum DfuError {
    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Chunking error: {0}")]
    Chunker(#[from] ChunkerError),

    #[error("{operation} failed after {attempts} attempts")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("Timed out after {timeout_ms}ms in {state}")]
    Timeout { state: DfuState, timeout_ms: u64 },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("An update is already in progress")]
    Busy,

    #[error("No validated firmware image loaded")]
    NoImage,

    #[error("Update cancelled")]
    Cancelled,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DfuError {
    /// Stable code for hooks and exit statuses.
    pub fn code(&self) -> ErrorCode {
        match self {
            DfuError::Firmware(FirmwareError::Integrity { .. }) => ErrorCode::Integrity,
            DfuError::Firmware(_) => ErrorCode::NoImage,
            DfuError::Transport(_) | DfuError::RetriesExhausted { .. } => ErrorCode::Transport,
            DfuError::Frame(_) | DfuError::Chunker(_) => ErrorCode::BadState,
            DfuError::Timeout { .. } => ErrorCode::Timeout,
            DfuError::Protocol(ProtocolError::VerifyFailed { .. }) => ErrorCode::VerifyFailed,
            DfuError::Protocol(ProtocolError::ActivationFailed { .. }) => {
                ErrorCode::ActivationFailed
            }
            DfuError::Protocol(ProtocolError::DeviceStatus { .. }) => ErrorCode::DeviceStatus,
            DfuError::Busy => ErrorCode::Busy,
            DfuError::NoImage => ErrorCode::NoImage,
            DfuError::Cancelled => ErrorCode::Cancelled,
            DfuError::Config(_) => ErrorCode::Config,
        }
    }

    /// Transient failures where restarting the whole update may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DfuError::Transport(_)
                | DfuError::RetriesExhausted { .. }
                | DfuError::Timeout { .. }
                | DfuError::Busy
        )
    }
}
