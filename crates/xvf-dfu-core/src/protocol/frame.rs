//! DNLOAD frame layout.
//!
//! ```text
//! [0..2]  payload length (u16 LE)
//! [2..]   payload, zero-padded to MAX_XFER
//! ```
//!
//! The encoded frame is always `FRAME_CAPACITY` bytes. An all-zero frame
//! (length 0) marks the end of the download. The sequence number is host
//! bookkeeping only and never goes on the wire; the device counts blocks
//! itself.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::{FRAME_CAPACITY, FRAME_HEADER_LEN, MAX_XFER};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Payload of {len} bytes exceeds maximum transfer size {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Read at offset {offset} (+{len}) past image end {total}")]
    OutOfBounds { offset: u32, len: usize, total: u32 },

    #[error("Frame too short: expected {expected}, got {actual}")]
    TooShort { expected: usize, actual: usize },
}

/// A single fixed-capacity DNLOAD frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    sequence: u16,
    len: u16,
    buf: [u8; FRAME_CAPACITY],
}

/// Image length as a `u32`, or the bounds error for a read at `offset`.
fn image_total(image_len: usize, offset: u32, len: usize) -> Result<u32, FrameError> {
    u32::try_from(image_len).map_err(|_| FrameError::OutOfBounds {
        offset,
        len,
        total: u32::MAX,
    })
}

impl Frame {
    /// All-zero frame that concludes a download.
    pub fn end_of_download(sequence: u16) -> Self {
        Self {
            sequence,
            len: 0,
            buf: [0u8; FRAME_CAPACITY],
        }
    }

    /// Copy `len` bytes of `image` starting at `offset` into a new frame.
    ///
    /// Each byte is checked against the image length before it is copied, so a
    /// bad offset or length produces an error and never an overrun.
    pub fn build(sequence: u16, image: &[u8], offset: u32, len: usize) -> Result<Self, FrameError> {
        if len > MAX_XFER {
            return Err(FrameError::PayloadTooLarge { len, max: MAX_XFER });
        }
        let total = image_total(image.len(), offset, len)?;
        if offset > total || len > (total - offset) as usize {
            return Err(FrameError::OutOfBounds { offset, len, total });
        }

        let mut frame = Self::end_of_download(sequence);
        let payload = &mut frame.buf[FRAME_HEADER_LEN..];
        for i in 0..len as u32 {
            let src = offset + i;
            if src >= total {
                return Err(FrameError::OutOfBounds { offset, len, total });
            }
            payload[i as usize] = image[src as usize];
        }
        frame.len = len as u16;
        LittleEndian::write_u16(&mut frame.buf[0..FRAME_HEADER_LEN], frame.len);
        Ok(frame)
    }

    /// Build a frame from an already-sliced payload.
    pub fn from_payload(sequence: u16, payload: &[u8]) -> Result<Self, FrameError> {
        Self::build(sequence, payload, 0, payload.len())
    }

    /// Parse an encoded frame, tagging it with the receiver's block count.
    pub fn decode(sequence: u16, bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(FrameError::TooShort {
                expected: FRAME_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let len = LittleEndian::read_u16(&bytes[0..FRAME_HEADER_LEN]) as usize;
        if len > MAX_XFER {
            return Err(FrameError::PayloadTooLarge { len, max: MAX_XFER });
        }
        if bytes.len() < FRAME_HEADER_LEN + len {
            return Err(FrameError::TooShort {
                expected: FRAME_HEADER_LEN + len,
                actual: bytes.len(),
            });
        }
        Self::from_payload(sequence, &bytes[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len])
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn payload_len(&self) -> usize {
        self.len as usize
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + self.len as usize]
    }

    pub fn is_end_of_download(&self) -> bool {
        self.len == 0
    }

    /// Full wire encoding, always `FRAME_CAPACITY` bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("len", &self.len)
            .finish()
    }
}
