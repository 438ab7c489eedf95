//! Emulated XVF3800 DFU controller for tests and dry runs.
//!
//! The mock follows the device-side `dfu_int` state machine closely enough
//! to drive a full update: SETALTERNATE erases and enters `dfuIDLE`, DNLOAD
//! frames are appended to the received image, an empty DNLOAD enters
//! manifestation, and REBOOT swaps in the pending version. Faults can be
//! injected per frame sequence or per phase.
//!
//! The GPO and configuration servicers are emulated too: mute output, LED
//! effect and ring, direction of arrival and VNR.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::traits::{Register, RegisterBus, TransportError};
use crate::firmware::FirmwareVersion;
use crate::protocol::constants::*;
use crate::protocol::{DeviceState, DeviceStatus, Frame, StatusResponse};

#[derive(Debug)]
struct MockDevice {
    connected: bool,
    version: FirmwareVersion,
    pending_version: Option<FirmwareVersion>,
    state: DeviceState,
    status: DeviceStatus,
    poll_delay_ms: u32,
    /// Status reads that still report `dfuDNBUSY`.
    busy_reads: u32,
    /// Busy reads injected after every accepted request.
    busy_reads_per_request: u32,
    /// SETALTERNATE requests whose erase never completes.
    stalled_erases: u32,
    /// Version reads that fail after a reboot.
    reboot_unavailable_reads: u32,
    reboot_reads_remaining: u32,
    /// Status reported after the end-of-download frame.
    manifest_status: DeviceStatus,
    received: Vec<u8>,
    frames: Vec<Frame>,
    /// Blocks accepted since the last SETALTERNATE.
    blocks: u16,
    frame_failures: HashMap<u16, u32>,
    frame_attempts: HashMap<u16, u32>,
    write_log: Vec<(Register, Vec<u8>)>,
    erase_requests: u32,
    reboots: u32,
    gpo: [u8; GPO_READ_LEN],
    led_effect: Option<u8>,
    led_ring: Option<Vec<u32>>,
    doa: (u16, u16),
    vnr: u8,
}

impl MockDevice {
    fn accept_request(&mut self) {
        self.busy_reads = self.busy_reads_per_request;
    }

    fn handle_gpo_write(&mut self, cmd: u8, data: &[u8]) -> Result<(), TransportError> {
        match (cmd, data) {
            (GPO_CMD_WRITE_VALUE, [MUTE_GPIO, value]) => {
                if *value != 0 {
                    self.gpo[1] |= 0x01;
                } else {
                    self.gpo[1] &= !0x01;
                }
            }
            (GPO_CMD_LED_EFFECT, [effect]) => self.led_effect = Some(*effect),
            (GPO_CMD_LED_RING_VALUE, bytes) if bytes.len() == LED_RING_COUNT * 4 => {
                let colors = bytes
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                self.led_ring = Some(colors);
            }
            _ => {
                return Err(TransportError::Malformed(format!(
                    "unexpected GPO write cmd {cmd} ({} bytes)",
                    data.len()
                )));
            }
        }
        Ok(())
    }

    fn handle_write(&mut self, register: Register, data: &[u8]) -> Result<(), TransportError> {
        if register.resid == GPO_SERVICER_RESID {
            return self.handle_gpo_write(register.cmd, data);
        }
        if register.resid != DFU_CONTROLLER_SERVICER_RESID {
            return Ok(());
        }
        match register.cmd {
            DFU_CMD_SETALTERNATE => {
                self.erase_requests += 1;
                self.blocks = 0;
                self.received.clear();
                self.status = DeviceStatus::OK;
                if self.stalled_erases > 0 {
                    self.stalled_erases -= 1;
                    self.state = DeviceState::DnBusy;
                    self.busy_reads = u32::MAX;
                } else {
                    self.state = DeviceState::DfuIdle;
                    self.accept_request();
                }
            }
            DFU_CMD_DNLOAD => {
                if data.len() != FRAME_CAPACITY {
                    return Err(TransportError::Malformed(format!(
                        "DNLOAD of {} bytes, expected {}",
                        data.len(),
                        FRAME_CAPACITY
                    )));
                }
                let seq = self.blocks;
                let frame = Frame::decode(seq, data)
                    .map_err(|e| TransportError::Malformed(e.to_string()))?;
                *self.frame_attempts.entry(seq).or_insert(0) += 1;
                if let Some(remaining) = self.frame_failures.get_mut(&seq)
                    && *remaining > 0
                {
                    *remaining -= 1;
                    return Err(TransportError::Nack { address: 0 });
                }
                if frame.is_end_of_download() {
                    self.status = self.manifest_status;
                    self.state = if self.manifest_status.is_ok() {
                        DeviceState::ManifestWaitReset
                    } else {
                        DeviceState::DfuError
                    };
                } else {
                    self.received.extend_from_slice(frame.payload());
                    self.state = DeviceState::DnloadIdle;
                }
                self.frames.push(frame);
                self.blocks = self.blocks.wrapping_add(1);
                self.accept_request();
            }
            DFU_CMD_REBOOT => {
                self.reboots += 1;
                if let Some(v) = self.pending_version.take() {
                    self.version = v;
                }
                self.state = DeviceState::AppIdle;
                self.reboot_reads_remaining = self.reboot_unavailable_reads;
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_read(&mut self, register: Register, len: usize) -> Result<Vec<u8>, TransportError> {
        let payload = match (register.resid, register.cmd) {
            (DFU_CONTROLLER_SERVICER_RESID, DFU_CMD_GETSTATUS) => {
                let state = if self.busy_reads > 0 {
                    if self.busy_reads != u32::MAX {
                        self.busy_reads -= 1;
                    }
                    DeviceState::DnBusy
                } else {
                    self.state
                };
                StatusResponse {
                    status: self.status,
                    poll_delay_ms: self.poll_delay_ms,
                    state,
                }
                .to_bytes()
                .to_vec()
            }
            (DFU_CONTROLLER_SERVICER_RESID, DFU_CMD_GETVERSION) => {
                if self.reboot_reads_remaining > 0 {
                    self.reboot_reads_remaining -= 1;
                    return Err(TransportError::Nack { address: 0 });
                }
                vec![self.version.major, self.version.minor, self.version.patch]
            }
            (GPO_SERVICER_RESID, GPO_CMD_READ_VALUES) => self.gpo.to_vec(),
            (GPO_SERVICER_RESID, GPO_CMD_DOA_VALUE) => {
                let (direction, speech) = self.doa;
                let mut bytes = direction.to_le_bytes().to_vec();
                bytes.extend_from_slice(&speech.to_le_bytes());
                bytes
            }
            (CONFIGURATION_SERVICER_RESID, CONFIG_CMD_VNR_VALUE) => vec![self.vnr],
            _ => vec![0u8; len],
        };
        if payload.len() < len {
            return Err(TransportError::ShortRead {
                register,
                expected: len,
                actual: payload.len(),
            });
        }
        Ok(payload[..len].to_vec())
    }
}

/// Mock register bus for unit testing the updater.
///
/// Clones share the same emulated device, so a test can keep a handle while
/// the updater borrows another.
#[derive(Debug, Clone)]
pub struct MockBus {
    device: Arc<Mutex<MockDevice>>,
    address: u8,
}

impl MockBus {
    /// A device running `version`.
    pub fn new(version: FirmwareVersion) -> Self {
        Self {
            device: Arc::new(Mutex::new(MockDevice {
                connected: true,
                version,
                pending_version: None,
                state: DeviceState::AppIdle,
                status: DeviceStatus::OK,
                poll_delay_ms: 0,
                busy_reads: 0,
                busy_reads_per_request: 0,
                stalled_erases: 0,
                reboot_unavailable_reads: 0,
                reboot_reads_remaining: 0,
                manifest_status: DeviceStatus::OK,
                received: Vec::new(),
                frames: Vec::new(),
                blocks: 0,
                frame_failures: HashMap::new(),
                frame_attempts: HashMap::new(),
                write_log: Vec::new(),
                erase_requests: 0,
                reboots: 0,
                gpo: [0; GPO_READ_LEN],
                led_effect: None,
                led_ring: None,
                doa: (0, 0),
                vnr: 0,
            })),
            address: DEFAULT_I2C_ADDRESS,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockDevice) -> R) -> R {
        let mut device = self.device.lock().unwrap();
        f(&mut *device)
    }

    /// Version the device reports after its next reboot.
    pub fn set_pending_version(&self, version: FirmwareVersion) {
        self.with(|d| d.pending_version = Some(version));
    }

    pub fn version(&self) -> FirmwareVersion {
        self.with(|d| d.version)
    }

    /// Report `dfuDNBUSY` for this many status reads after each request.
    pub fn set_busy_reads(&self, reads: u32) {
        self.with(|d| d.busy_reads_per_request = reads);
    }

    /// Poll delay advertised in every status response.
    pub fn set_poll_delay(&self, ms: u32) {
        self.with(|d| d.poll_delay_ms = ms);
    }

    /// The next `count` erase requests never complete.
    pub fn stall_erases(&self, count: u32) {
        self.with(|d| d.stalled_erases = count);
    }

    /// Fail the next `times` writes of the frame with this sequence.
    pub fn fail_frame(&self, sequence: u16, times: u32) {
        self.with(|d| {
            d.frame_failures.insert(sequence, times);
        });
    }

    /// Status the device reports after the end-of-download frame.
    pub fn set_manifest_status(&self, status: DeviceStatus) {
        self.with(|d| d.manifest_status = status);
    }

    /// Version reads fail this many times after each reboot.
    pub fn set_reboot_unavailable_reads(&self, reads: u32) {
        self.with(|d| d.reboot_unavailable_reads = reads);
    }

    /// Force a device state and status, as if reported by the firmware.
    pub fn force_status(&self, state: DeviceState, status: DeviceStatus) {
        self.with(|d| {
            d.state = state;
            d.status = status;
            d.busy_reads = 0;
        });
    }

    /// Image bytes accepted so far.
    pub fn received(&self) -> Vec<u8> {
        self.with(|d| d.received.clone())
    }

    /// Every DNLOAD frame accepted, including the end-of-download frame.
    pub fn frames(&self) -> Vec<Frame> {
        self.with(|d| d.frames.clone())
    }

    /// Accepted DNLOAD frames that carried image data.
    pub fn data_frames(&self) -> Vec<Frame> {
        self.with(|d| {
            d.frames
                .iter()
                .filter(|f| !f.is_end_of_download())
                .cloned()
                .collect()
        })
    }

    /// Write attempts seen for a frame sequence, failed ones included.
    pub fn frame_attempts(&self, sequence: u16) -> u32 {
        self.with(|d| d.frame_attempts.get(&sequence).copied().unwrap_or(0))
    }

    pub fn erase_requests(&self) -> u32 {
        self.with(|d| d.erase_requests)
    }

    pub fn reboots(&self) -> u32 {
        self.with(|d| d.reboots)
    }

    /// Last LED effect written, if any.
    pub fn led_effect(&self) -> Option<u8> {
        self.with(|d| d.led_effect)
    }

    /// Colors last written to the LED ring.
    pub fn led_ring(&self) -> Option<Vec<u32>> {
        self.with(|d| d.led_ring.clone())
    }

    pub fn is_muted(&self) -> bool {
        self.with(|d| d.gpo[1] & 0x01 != 0)
    }

    /// Direction of arrival and speech flag reported by the beamformer.
    pub fn set_doa(&self, direction: u16, speech: u16) {
        self.with(|d| d.doa = (direction, speech));
    }

    pub fn set_vnr(&self, vnr: u8) {
        self.with(|d| d.vnr = vnr);
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<(Register, Vec<u8>)> {
        self.with(|d| d.write_log.clone())
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.with(|d| d.connected = false);
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        self.with(|d| d.connected = true);
    }
}

impl RegisterBus for MockBus {
    fn write(&mut self, register: Register, data: &[u8]) -> Result<(), TransportError> {
        self.with(|d| {
            if !d.connected {
                return Err(TransportError::Disconnected);
            }
            d.write_log.push((register, data.to_vec()));
            d.handle_write(register, data)
        })
    }

    fn read(&mut self, register: Register, len: usize) -> Result<Vec<u8>, TransportError> {
        self.with(|d| {
            if !d.connected {
                return Err(TransportError::Disconnected);
            }
            d.handle_read(register, len)
        })
    }

    fn address(&self) -> u8 {
        self.address
    }
}
