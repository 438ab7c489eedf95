//! Holder for the single validated image an updater flashes.

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::fetch::FirmwareFetcher;
use super::image::parse_md5;
use super::{FirmwareError, FirmwareImage, FirmwareVersion};

/// Where an image comes from and what it must hash to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareSource {
    /// Path, `file://` URL, or any locator the fetcher understands.
    pub url: String,
    pub version: FirmwareVersion,
    /// Expected MD5, 32 hex characters.
    pub md5: String,
}

impl FirmwareSource {
    /// Check the declared fields without fetching anything.
    pub fn validate(&self) -> Result<(), FirmwareError> {
        if self.url.trim().is_empty() {
            return Err(FirmwareError::UnsupportedUrl(self.url.clone()));
        }
        parse_md5(&self.md5)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FirmwareStore {
    image: Option<FirmwareImage>,
}

impl FirmwareStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch and verify `source`. On failure the previously held image is kept.
    pub fn load<F: FirmwareFetcher + ?Sized>(
        &mut self,
        source: &FirmwareSource,
        fetcher: &F,
    ) -> Result<&FirmwareImage, FirmwareError> {
        source.validate()?;
        let data = fetcher.fetch(&source.url)?;
        let image = FirmwareImage::verified(data, source.version, &source.md5).inspect_err(|e| {
            error!(url = %source.url, error = %e, "Firmware rejected");
        })?;
        info!(
            url = %source.url,
            version = %image.version(),
            bytes = image.len(),
            "Firmware verified"
        );
        Ok(self.image.insert(image))
    }

    pub fn set(&mut self, image: FirmwareImage) {
        self.image = Some(image);
    }

    pub fn image(&self) -> Option<&FirmwareImage> {
        self.image.as_ref()
    }

    pub fn clear(&mut self) {
        self.image = None;
    }
}
