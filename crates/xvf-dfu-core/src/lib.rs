//! XVF-DFU-Core: firmware updates for XMOS XVF3800-class audio front-ends.
//!
//! This crate drives the device's DFU controller over a register-level bus:
//! it verifies a firmware image, erases the upgrade partition, streams the
//! image in bounded frames, waits for the device to accept it, reboots and
//! confirms the new version.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, DNLOAD frame layout, status responses
//! - **Transport**: Register bus abstraction (embedded-hal I2C, mock)
//! - **Device**: Typed DFU controller requests on any bus
//! - **Control**: Mute, LED and beam-direction requests
//! - **Firmware**: Image retrieval, MD5 verification, versions
//! - **Chunker**: Frame-sized slicing of the image
//! - **State**: DFU state machine and per-phase steps
//! - **Events**: Update hooks and observers
//! - **Updater**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use xvf_dfu_core::{DfuConfig, DfuUpdater, FileFetcher, FirmwareSource, MockBus};
//!
//! let mut bus = MockBus::new("2.0.5".parse().unwrap());
//! let mut updater = DfuUpdater::new(&mut bus, DfuConfig::default());
//! updater.on_progress(|p| println!("{:.0}%", p * 100.0));
//!
//! let source = FirmwareSource {
//!     url: "xvf3800_v2.0.6.bin".to_string(),
//!     version: "2.0.6".parse().unwrap(),
//!     md5: "5eb63bbbe01eeed093cb22bb8f5acdc3".to_string(),
//! };
//! updater.load_firmware(&source, &FileFetcher::new()).expect("bad image");
//! updater.flash().expect("update failed");
//! ```

pub mod chunker;
pub mod clock;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod events;
pub mod firmware;
pub mod protocol;
pub mod state;
pub mod transport;
pub mod updater;

// Re-exports for convenience
pub use chunker::{Chunk, Chunker, ChunkerError, Chunks};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ConfigError, DfuConfig, DfuSettings};
pub use control::{BeamDirection, ControlDevice, GpoValues};
pub use device::DfuDevice;
pub use error::{DfuError, DfuResult, ErrorCode, ProtocolError};
pub use events::{DfuEvent, DfuObserver, EventNotifier, LogLevel, NullObserver, TracingObserver};
pub use firmware::{
    CachingFetcher, FileFetcher, FirmwareError, FirmwareFetcher, FirmwareImage, FirmwareSource,
    FirmwareStore, FirmwareVersion, md5_hex,
};
pub use protocol::{DeviceState, DeviceStatus, Frame, FrameError, StatusResponse};
pub use state::{DfuState, TransferSession};
pub use transport::{I2cBus, MockBus, Register, RegisterBus, TransportError};
pub use updater::{DfuUpdater, VersionCheck};
