//! Protocol constants for the XMOS device control servicers.
//!
//! Derived from the XVF3800 `dfu_int` state machine and the control
//! transport used by the host-side `xvf_host` tool.

// ============================================================================
// Bus addressing
// ============================================================================

/// Default 7-bit I2C address of the XVF3800.
pub const DEFAULT_I2C_ADDRESS: u8 = 0x2C;

/// Addresses tried, in order, when detecting the device.
pub const CANDIDATE_ADDRESSES: [u8; 7] = [0x2C, 0x28, 0x2A, 0x42, 0x44, 0x50, 0x51];

/// Set on the command byte to turn a write request into a read request.
pub const COMMAND_READ_BIT: u8 = 0x80;

// ============================================================================
// Resource IDs
// ============================================================================

/// DFU controller servicer.
pub const DFU_CONTROLLER_SERVICER_RESID: u8 = 240;
/// Configuration servicer.
pub const CONFIGURATION_SERVICER_RESID: u8 = 241;
/// GPO servicer: GPIO outputs, LED ring and direction of arrival.
pub const GPO_SERVICER_RESID: u8 = 20;

// ============================================================================
// DFU controller commands
// ============================================================================

pub const DFU_CMD_DETACH: u8 = 0;
pub const DFU_CMD_DNLOAD: u8 = 1;
pub const DFU_CMD_UPLOAD: u8 = 2;
pub const DFU_CMD_GETSTATUS: u8 = 3;
pub const DFU_CMD_CLRSTATUS: u8 = 4;
pub const DFU_CMD_GETSTATE: u8 = 5;
pub const DFU_CMD_ABORT: u8 = 6;
pub const DFU_CMD_SETALTERNATE: u8 = 64;
pub const DFU_CMD_TRANSFERBLOCK: u8 = 65;
pub const DFU_CMD_GETVERSION: u8 = 88;
pub const DFU_CMD_REBOOT: u8 = 89;

/// Alternate setting selecting the upgrade partition.
pub const DFU_ALTERNATE_UPGRADE: u8 = 1;
/// Alternate setting selecting the factory partition.
pub const DFU_ALTERNATE_FACTORY: u8 = 0;

// ============================================================================
// Control servicer commands
// ============================================================================

/// Voice-to-noise ratio estimate (configuration servicer).
pub const CONFIG_CMD_VNR_VALUE: u8 = 0;

pub const GPO_CMD_READ_VALUES: u8 = 0;
pub const GPO_CMD_WRITE_VALUE: u8 = 1;
pub const GPO_CMD_LED_EFFECT: u8 = 12;
pub const GPO_CMD_LED_RING_VALUE: u8 = 18;
pub const GPO_CMD_DOA_VALUE: u8 = 19;

/// GPO read payload: one byte per output port.
pub const GPO_READ_LEN: usize = 5;
/// DoA read payload: direction (u16 LE), speech detected (u16 LE).
pub const DOA_READ_LEN: usize = 4;
/// VNR read payload.
pub const VNR_READ_LEN: usize = 1;

/// GPIO pin wired to the microphone mute.
pub const MUTE_GPIO: u8 = 30;

/// LEDs on the ring.
pub const LED_RING_COUNT: usize = 12;

/// LED effect shown while an update runs.
pub const LED_EFFECT_UPDATING: u8 = 2;

// ============================================================================
// Response sizes
// ============================================================================

/// GETSTATUS payload: status, 24-bit poll delay, state.
pub const DFU_STATUS_LEN: usize = 5;
/// GETVERSION payload: major, minor, patch.
pub const DFU_VERSION_LEN: usize = 3;

// ============================================================================
// Transfer sizing
// ============================================================================

/// Largest payload carried by a single DNLOAD frame (the device's block size).
pub const MAX_XFER: usize = 128;

/// Payload size used when the configuration does not override it.
pub const DEFAULT_XFER: usize = MAX_XFER;

/// Fixed-position frame header: payload length (u16 LE).
pub const FRAME_HEADER_LEN: usize = 2;

/// Bytes sent with every DNLOAD request, padding included.
pub const FRAME_CAPACITY: usize = FRAME_HEADER_LEN + MAX_XFER;

// ============================================================================
// Timing
// ============================================================================

/// Default bound on a single DFU phase waiting for the device.
pub const DFU_TIMEOUT_MS: u64 = 4000;

/// Interval between version reads while the device reboots.
pub const ACTIVATION_POLL_MS: u64 = 500;

/// Default upper bound on any device-requested wait.
pub const PROCESSING_TIMEOUT_MS: u64 = 1000;

/// Pause between updater polls when driven by `run`.
pub const POLL_INTERVAL_MS: u64 = 10;

// ============================================================================
// Retry budgets
// ============================================================================

/// Extra SETALTERNATE requests sent when an erase does not complete in time.
pub const ERASE_RETRIES: u32 = 2;

/// Extra writes of a request that failed on the bus.
pub const FRAME_RETRIES: u32 = 3;
