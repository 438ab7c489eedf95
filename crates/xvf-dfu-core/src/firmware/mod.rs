//! Firmware image store: retrieval, MD5 verification and versioning.

pub mod fetch;
pub mod image;
pub mod store;
pub mod version;

use thiserror::Error;

pub use fetch::{CachingFetcher, FileFetcher, FirmwareFetcher};
pub use image::{FirmwareImage, md5_hex};
pub use store::{FirmwareSource, FirmwareStore};
pub use version::FirmwareVersion;

#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("Invalid MD5 checksum '{0}': expected 32 hex characters")]
    InvalidChecksum(String),

    #[error("Invalid version '{0}': expected major.minor.patch")]
    InvalidVersion(String),

    #[error("Image of {len} bytes exceeds the 4 GiB transfer limit")]
    TooLarge { len: usize },

    #[error("Unsupported firmware locator: {0}")]
    UnsupportedUrl(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
