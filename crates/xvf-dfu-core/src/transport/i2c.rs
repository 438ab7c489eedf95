//! `embedded-hal` I2C implementation of `RegisterBus`.

use embedded_hal::i2c::{Error as _, ErrorKind, I2c};
use tracing::{debug, info, instrument, trace};

use super::traits::{Register, RegisterBus, TransportError};
use crate::protocol::COMMAND_READ_BIT;

/// Largest value the one-byte length field can carry.
const MAX_REQUEST_LEN: usize = u8::MAX as usize;

/// Register bus over any `embedded_hal::i2c::I2c` implementation.
pub struct I2cBus<I> {
    i2c: I,
    address: u8,
}

impl<I: I2c> I2cBus<I> {
    pub fn new(i2c: I, address: u8) -> Self {
        Self { i2c, address }
    }

    /// Find the device by trying a one-byte read at each candidate address.
    ///
    /// The first address that acknowledges wins. When none does the bus is
    /// dropped and `NoDevice` is returned.
    pub fn detect(mut i2c: I, candidates: &[u8]) -> Result<Self, TransportError> {
        for &address in candidates {
            let mut byte = [0u8; 1];
            match i2c.read(address, &mut byte) {
                Ok(()) => {
                    info!(address = format_args!("0x{:02X}", address), "Found device");
                    return Ok(Self::new(i2c, address));
                }
                Err(e) => {
                    debug!(address = format_args!("0x{:02X}", address), error = ?e.kind(), "No response");
                }
            }
        }
        Err(TransportError::NoDevice {
            tried: candidates.len(),
        })
    }

    /// Give the underlying bus back.
    pub fn release(self) -> I {
        self.i2c
    }

    fn map_error(&self, kind: ErrorKind) -> TransportError {
        match kind {
            ErrorKind::NoAcknowledge(_) => TransportError::Nack {
                address: self.address,
            },
            other => TransportError::Bus(format!("{:?}", other)),
        }
    }
}

impl<I: I2c> RegisterBus for I2cBus<I> {
    #[instrument(skip(self, data), fields(addr = self.address, len = data.len()))]
    fn write(&mut self, register: Register, data: &[u8]) -> Result<(), TransportError> {
        if data.len() > MAX_REQUEST_LEN {
            return Err(TransportError::RequestTooLarge {
                len: data.len(),
                max: MAX_REQUEST_LEN,
            });
        }

        let mut buf = Vec::with_capacity(3 + data.len());
        buf.extend_from_slice(&[register.resid, register.cmd, data.len() as u8]);
        buf.extend_from_slice(data);

        self.i2c
            .write(self.address, &buf)
            .map_err(|e| self.map_error(e.kind()))?;
        trace!(bytes_written = buf.len(), "Write complete");
        Ok(())
    }

    #[instrument(skip(self), fields(addr = self.address))]
    fn read(&mut self, register: Register, len: usize) -> Result<Vec<u8>, TransportError> {
        // One extra byte for the leading control status.
        let wire_len = len + 1;
        if wire_len > MAX_REQUEST_LEN {
            return Err(TransportError::RequestTooLarge {
                len,
                max: MAX_REQUEST_LEN - 1,
            });
        }

        let request = [
            register.resid,
            register.cmd | COMMAND_READ_BIT,
            wire_len as u8,
        ];
        self.i2c
            .write(self.address, &request)
            .map_err(|e| self.map_error(e.kind()))?;

        let mut resp = vec![0u8; wire_len];
        self.i2c
            .read(self.address, &mut resp)
            .map_err(|e| self.map_error(e.kind()))?;

        if resp[0] != 0 {
            debug!(status = resp[0], %register, "Control request not done");
            return Err(TransportError::ControlStatus {
                register,
                status: resp[0],
            });
        }
        resp.remove(0);
        Ok(resp)
    }

    fn address(&self) -> u8 {
        self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DfuDevice;
    use crate::protocol::{
        DFU_CMD_GETVERSION, DFU_CMD_SETALTERNATE, Frame, MAX_XFER, CANDIDATE_ADDRESSES,
    };
    use embedded_hal::i2c::{ErrorType, NoAcknowledgeSource, Operation};
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeI2c {
        writes: Vec<(u8, Vec<u8>)>,
        reads: VecDeque<Vec<u8>>,
        nack: bool,
        /// Only this address acknowledges, when set.
        present: Option<u8>,
        attempted: Vec<u8>,
    }

    impl ErrorType for FakeI2c {
        type Error = ErrorKind;
    }

    impl I2c for FakeI2c {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            self.attempted.push(address);
            if self.nack || self.present.is_some_and(|p| p != address) {
                return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
            }
            for op in operations {
                match op {
                    Operation::Write(bytes) => self.writes.push((address, bytes.to_vec())),
                    Operation::Read(buf) => {
                        let data = self.reads.pop_front().unwrap_or_default();
                        for (dst, src) in buf.iter_mut().zip(data) {
                            *dst = src;
                        }
                    }
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_write_framing() {
        let mut bus = I2cBus::new(FakeI2c::default(), 0x2C);
        bus.write(Register::dfu(DFU_CMD_SETALTERNATE), &[1]).unwrap();
        let fake = bus.release();
        assert_eq!(fake.writes, vec![(0x2C, vec![240, 64, 1, 1])]);
    }

    #[test]
    fn test_read_strips_control_status() {
        let mut fake = FakeI2c::default();
        fake.reads.push_back(vec![0, 3, 1, 7]);
        let mut bus = I2cBus::new(fake, 0x2C);
        let version = bus.read(Register::dfu(DFU_CMD_GETVERSION), 3).unwrap();
        assert_eq!(version, vec![3, 1, 7]);
        let fake = bus.release();
        assert_eq!(fake.writes, vec![(0x2C, vec![240, 88 | 0x80, 4])]);
    }

    #[test]
    fn test_read_control_status_error() {
        let mut fake = FakeI2c::default();
        fake.reads.push_back(vec![1, 0, 0, 0]);
        let mut bus = I2cBus::new(fake, 0x2C);
        let err = bus.read(Register::dfu(DFU_CMD_GETVERSION), 3).unwrap_err();
        assert!(matches!(err, TransportError::ControlStatus { status: 1, .. }));
    }

    #[test]
    fn test_nack_maps_to_transport_error() {
        let fake = FakeI2c {
            nack: true,
            ..Default::default()
        };
        let mut bus = I2cBus::new(fake, 0x2C);
        let err = bus.write(Register::dfu(DFU_CMD_SETALTERNATE), &[1]).unwrap_err();
        assert!(matches!(err, TransportError::Nack { address: 0x2C }));
    }

    #[test]
    fn test_oversized_request_rejected() {
        let mut bus = I2cBus::new(FakeI2c::default(), 0x2C);
        let data = vec![0u8; 256];
        assert!(matches!(
            bus.write(Register::dfu(1), &data),
            Err(TransportError::RequestTooLarge { .. })
        ));
        assert!(bus.release().writes.is_empty());
    }

    #[test]
    fn test_dnload_block_bytes() {
        let image: Vec<u8> = (0..200u8).collect();
        let mut bus = I2cBus::new(FakeI2c::default(), 0x2C);
        bus.dfu_download(&Frame::build(3, &image, 0, MAX_XFER).unwrap())
            .unwrap();
        bus.dfu_download(&Frame::build(4, &image, 128, 72).unwrap())
            .unwrap();
        let fake = bus.release();

        let mut full = vec![240, 1, 130, 128, 0];
        full.extend_from_slice(&image[..128]);
        assert_eq!(full.len(), 133);
        assert_eq!(fake.writes[0], (0x2C, full));

        let mut last = vec![240, 1, 130, 72, 0];
        last.extend_from_slice(&image[128..]);
        last.resize(133, 0);
        assert_eq!(fake.writes[1], (0x2C, last));
    }

    #[test]
    fn test_end_of_download_bytes() {
        let mut bus = I2cBus::new(FakeI2c::default(), 0x2C);
        bus.dfu_download(&Frame::end_of_download(5)).unwrap();
        let fake = bus.release();

        let mut expected = vec![240, 1, 130];
        expected.resize(133, 0);
        assert_eq!(fake.writes, vec![(0x2C, expected)]);
    }

    #[test]
    fn test_detect_finds_first_answering_address() {
        let fake = FakeI2c {
            present: Some(0x42),
            ..Default::default()
        };
        let bus = I2cBus::detect(fake, &CANDIDATE_ADDRESSES).unwrap();
        assert_eq!(bus.address(), 0x42);
        assert_eq!(bus.release().attempted, vec![0x2C, 0x28, 0x2A, 0x42]);
    }

    #[test]
    fn test_detect_without_device() {
        let fake = FakeI2c {
            nack: true,
            ..Default::default()
        };
        assert!(matches!(
            I2cBus::detect(fake, &CANDIDATE_ADDRESSES),
            Err(TransportError::NoDevice { tried: 7 })
        ));
    }
}
