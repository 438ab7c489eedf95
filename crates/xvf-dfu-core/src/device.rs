//! DFU controller requests on top of a `RegisterBus`.

use tracing::{debug, instrument};

use crate::firmware::FirmwareVersion;
use crate::protocol::constants::*;
use crate::protocol::{Frame, StatusResponse};
use crate::transport::{Register, RegisterBus, TransportError};

/// Typed requests against the DFU controller servicer.
///
/// Implemented for every `RegisterBus`.
pub trait DfuDevice: RegisterBus {
    /// GETSTATUS: device status, requested poll delay and DFU state.
    fn dfu_status(&mut self) -> Result<StatusResponse, TransportError> {
        let bytes = self.read(Register::dfu(DFU_CMD_GETSTATUS), DFU_STATUS_LEN)?;
        StatusResponse::from_bytes(&bytes).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    /// GETVERSION: version of the running firmware.
    fn dfu_version(&mut self) -> Result<FirmwareVersion, TransportError> {
        let bytes = self.read(Register::dfu(DFU_CMD_GETVERSION), DFU_VERSION_LEN)?;
        if bytes.len() < DFU_VERSION_LEN {
            return Err(TransportError::ShortRead {
                register: Register::dfu(DFU_CMD_GETVERSION),
                expected: DFU_VERSION_LEN,
                actual: bytes.len(),
            });
        }
        let version = FirmwareVersion::new(bytes[0], bytes[1], bytes[2]);
        debug!(%version, "DFU version");
        Ok(version)
    }

    /// SETALTERNATE(upgrade): select and erase the upgrade partition.
    fn dfu_set_alternate(&mut self) -> Result<(), TransportError> {
        self.write(
            Register::dfu(DFU_CMD_SETALTERNATE),
            &[DFU_ALTERNATE_UPGRADE],
        )
    }

    /// DNLOAD: write one padded block (`FRAME_CAPACITY` bytes).
    #[instrument(level = "debug", skip(self, frame), fields(seq = frame.sequence(), len = frame.payload_len()))]
    fn dfu_download(&mut self, frame: &Frame) -> Result<(), TransportError> {
        self.write(Register::dfu(DFU_CMD_DNLOAD), frame.as_bytes())
    }

    /// REBOOT: restart into the newly written image.
    fn dfu_reboot(&mut self) -> Result<(), TransportError> {
        self.write(Register::dfu(DFU_CMD_REBOOT), &[1])
    }
}

impl<B: RegisterBus + ?Sized> DfuDevice for B {}
