//! GETSTATUS response parsing.
//!
//! The device answers a status request with five payload bytes:
//! `[status, delay_lo, delay_mid, delay_hi, state]`. The 24-bit delay is
//! the number of milliseconds the host must wait before the next request.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::DFU_STATUS_LEN;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StatusError {
    #[error("Status response too short: expected {expected}, got {actual}")]
    TooShort { expected: usize, actual: usize },
}

/// Device-side DFU state (`dfu_int` numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DnloadSync,
    DnBusy,
    DnloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    DfuError,
    Unknown(u8),
}

impl DeviceState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::AppIdle,
            1 => Self::AppDetach,
            2 => Self::DfuIdle,
            3 => Self::DnloadSync,
            4 => Self::DnBusy,
            5 => Self::DnloadIdle,
            6 => Self::ManifestSync,
            7 => Self::Manifest,
            8 => Self::ManifestWaitReset,
            9 => Self::UploadIdle,
            10 => Self::DfuError,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::AppIdle => 0,
            Self::AppDetach => 1,
            Self::DfuIdle => 2,
            Self::DnloadSync => 3,
            Self::DnBusy => 4,
            Self::DnloadIdle => 5,
            Self::ManifestSync => 6,
            Self::Manifest => 7,
            Self::ManifestWaitReset => 8,
            Self::UploadIdle => 9,
            Self::DfuError => 10,
            Self::Unknown(v) => *v,
        }
    }

    /// The device accepts the next request in this state.
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            Self::DfuIdle | Self::DnloadIdle | Self::ManifestWaitReset
        )
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AppIdle => write!(f, "appIDLE"),
            Self::AppDetach => write!(f, "appDETACH"),
            Self::DfuIdle => write!(f, "dfuIDLE"),
            Self::DnloadSync => write!(f, "dfuDNLOAD-SYNC"),
            Self::DnBusy => write!(f, "dfuDNBUSY"),
            Self::DnloadIdle => write!(f, "dfuDNLOAD-IDLE"),
            Self::ManifestSync => write!(f, "dfuMANIFEST-SYNC"),
            Self::Manifest => write!(f, "dfuMANIFEST"),
            Self::ManifestWaitReset => write!(f, "dfuMANIFEST-WAIT-RESET"),
            Self::UploadIdle => write!(f, "dfuUPLOAD-IDLE"),
            Self::DfuError => write!(f, "dfuERROR"),
            Self::Unknown(v) => write!(f, "unknown({})", v),
        }
    }
}

/// Device-side DFU status code. `0` is OK; everything else is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus(pub u8);

impl DeviceStatus {
    pub const OK: DeviceStatus = DeviceStatus(0);
    pub const ERR_ERASE: DeviceStatus = DeviceStatus(4);
    pub const ERR_WRITE: DeviceStatus = DeviceStatus(3);
    pub const ERR_VERIFY: DeviceStatus = DeviceStatus(7);
    pub const ERR_FIRMWARE: DeviceStatus = DeviceStatus(10);

    pub fn is_ok(&self) -> bool {
        self.0 == 0
    }

    pub fn name(&self) -> &'static str {
        match self.0 {
            0 => "OK",
            1 => "errTARGET",
            2 => "errFILE",
            3 => "errWRITE",
            4 => "errERASE",
            5 => "errCHECK_ERASED",
            6 => "errPROG",
            7 => "errVERIFY",
            8 => "errADDRESS",
            9 => "errNOTDONE",
            10 => "errFIRMWARE",
            11 => "errVENDOR",
            12 => "errUSBR",
            13 => "errPOR",
            14 => "errUNKNOWN",
            15 => "errSTALLEDPKT",
            _ => "reserved",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// Largest poll delay the 24-bit field can carry.
pub const MAX_POLL_DELAY_MS: u32 = 0xFF_FFFF;

/// Parsed GETSTATUS payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: DeviceStatus,
    /// Milliseconds the device asks the host to wait before polling again.
    pub poll_delay_ms: u32,
    pub state: DeviceState,
}

impl StatusResponse {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StatusError> {
        if bytes.len() < DFU_STATUS_LEN {
            return Err(StatusError::TooShort {
                expected: DFU_STATUS_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            status: DeviceStatus(bytes[0]),
            poll_delay_ms: LittleEndian::read_u24(&bytes[1..4]),
            state: DeviceState::from_u8(bytes[4]),
        })
    }

    /// Encode as the device would; the poll delay keeps its low 24 bits.
    pub fn to_bytes(&self) -> [u8; DFU_STATUS_LEN] {
        let mut bytes = [0u8; DFU_STATUS_LEN];
        bytes[0] = self.status.0;
        LittleEndian::write_u24(&mut bytes[1..4], self.poll_delay_ms & MAX_POLL_DELAY_MS);
        bytes[4] = self.state.as_u8();
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        let resp = StatusResponse::from_bytes(&[0, 0x10, 0x27, 0x00, 5]).unwrap();
        assert!(resp.status.is_ok());
        assert_eq!(resp.poll_delay_ms, 10_000);
        assert_eq!(resp.state, DeviceState::DnloadIdle);
        assert!(resp.state.is_ready());
    }

    #[test]
    fn test_status_too_short() {
        assert_eq!(
            StatusResponse::from_bytes(&[0, 1, 2]),
            Err(StatusError::TooShort {
                expected: 5,
                actual: 3
            })
        );
    }

    #[test]
    fn test_busy_state_not_ready() {
        assert!(!DeviceState::DnBusy.is_ready());
        assert!(!DeviceState::DfuError.is_ready());
        assert_eq!(DeviceState::from_u8(42), DeviceState::Unknown(42));
    }

    #[test]
    fn test_status_bytes_match_wire_layout() {
        let resp = StatusResponse {
            status: DeviceStatus::ERR_VERIFY,
            poll_delay_ms: 0x0001_0203,
            state: DeviceState::DfuError,
        };
        assert_eq!(resp.to_bytes(), [7, 0x03, 0x02, 0x01, 10]);
    }

    #[test]
    fn test_poll_delay_keeps_24_bits() {
        let resp = StatusResponse {
            status: DeviceStatus::OK,
            poll_delay_ms: 0x0A12_3456,
            state: DeviceState::DfuIdle,
        };
        let bytes = resp.to_bytes();
        assert_eq!(&bytes[1..4], &[0x56, 0x34, 0x12]);
        let parsed = StatusResponse::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.poll_delay_ms, 0x12_3456);

        let max = StatusResponse::from_bytes(&[0, 0xFF, 0xFF, 0xFF, 2]).unwrap();
        assert_eq!(max.poll_delay_ms, MAX_POLL_DELAY_MS);
    }
}
