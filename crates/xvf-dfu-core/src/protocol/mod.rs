//! XMOS DFU controller protocol definitions.

pub mod constants;
pub mod frame;
pub mod status;

pub use constants::*;
pub use frame::{Frame, FrameError};
pub use status::{DeviceState, DeviceStatus, MAX_POLL_DELAY_MS, StatusError, StatusResponse};
