//! Firmware retrieval collaborators.
//!
//! Retrieval is not verified here; callers hand the bytes to
//! [`FirmwareImage::verified`](super::FirmwareImage::verified).

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::FirmwareError;
use super::image::md5_hex;

/// Fetches raw firmware bytes for a locator.
pub trait FirmwareFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FirmwareError>;
}

impl<F: FirmwareFetcher + ?Sized> FirmwareFetcher for &F {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FirmwareError> {
        (**self).fetch(url)
    }
}

/// Reads plain paths and `file://` URLs from the local filesystem.
///
/// Relative paths resolve against `base_dir` when one is set.
#[derive(Debug, Clone, Default)]
pub struct FileFetcher {
    base_dir: Option<PathBuf>,
}

impl FileFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir<P: Into<PathBuf>>(base_dir: P) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, url: &str) -> Result<PathBuf, FirmwareError> {
        let path = if let Some(rest) = url.strip_prefix("file://") {
            rest
        } else if url.contains("://") {
            return Err(FirmwareError::UnsupportedUrl(url.to_string()));
        } else {
            url
        };
        let path = Path::new(path);
        Ok(match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        })
    }
}

impl FirmwareFetcher for FileFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FirmwareError> {
        let path = self.resolve(url)?;
        info!(path = %path.display(), "Loading firmware");
        Ok(fs::read(&path)?)
    }
}

/// Keeps a copy of every fetched image under `dir`, named by the MD5 of its
/// locator, and serves repeat fetches from there.
#[derive(Debug, Clone)]
pub struct CachingFetcher<F> {
    inner: F,
    dir: PathBuf,
}

impl<F: FirmwareFetcher> CachingFetcher<F> {
    pub fn new<P: Into<PathBuf>>(inner: F, dir: P) -> Self {
        Self {
            inner,
            dir: dir.into(),
        }
    }

    /// Cache file for a locator.
    pub fn cache_path(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", md5_hex(url.as_bytes())))
    }
}

impl<F: FirmwareFetcher> FirmwareFetcher for CachingFetcher<F> {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FirmwareError> {
        let path = self.cache_path(url);
        if path.is_file() {
            debug!(path = %path.display(), "Firmware cache hit");
            return Ok(fs::read(&path)?);
        }

        let data = self.inner.fetch(url)?;
        fs::create_dir_all(&self.dir)?;
        fs::write(&path, &data)?;
        info!(path = %path.display(), bytes = data.len(), "Cached firmware");
        Ok(data)
    }
}
