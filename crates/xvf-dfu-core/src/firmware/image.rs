//! Verified, immutable firmware image.

use md5::{Digest, Md5};

use super::{FirmwareError, FirmwareVersion};

/// Number of hex characters in an MD5 digest.
pub const MD5_HEX_LEN: usize = 32;

/// Lower-case hex MD5 of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Normalise a declared checksum, rejecting anything that is not 32 hex digits.
pub fn parse_md5(expected: &str) -> Result<String, FirmwareError> {
    let expected = expected.trim();
    if expected.len() != MD5_HEX_LEN || hex::decode(expected).is_err() {
        return Err(FirmwareError::InvalidChecksum(expected.to_string()));
    }
    Ok(expected.to_ascii_lowercase())
}

/// Firmware bytes whose checksum has been checked against the declared value.
///
/// The only constructor is [`FirmwareImage::verified`], so holding one means
/// the integrity check passed.
#[derive(Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    version: FirmwareVersion,
    md5: String,
}

impl FirmwareImage {
    /// Accept `data` only if its MD5 equals `expected_md5`.
    pub fn verified(
        data: Vec<u8>,
        version: FirmwareVersion,
        expected_md5: &str,
    ) -> Result<Self, FirmwareError> {
        let expected = parse_md5(expected_md5)?;
        if data.len() > u32::MAX as usize {
            return Err(FirmwareError::TooLarge { len: data.len() });
        }
        let actual = md5_hex(&data);
        if actual != expected {
            return Err(FirmwareError::Integrity { expected, actual });
        }
        Ok(Self {
            data,
            version,
            md5: actual,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Image length. Fits `u32` by construction.
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn version(&self) -> FirmwareVersion {
        self.version
    }

    pub fn md5(&self) -> &str {
        &self.md5
    }
}

impl std::fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("len", &self.data.len())
            .field("version", &self.version)
            .field("md5", &self.md5)
            .finish()
    }
}
