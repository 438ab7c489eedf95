//! Register bus abstraction.
//!
//! Defines the `RegisterBus` trait for talking to the device's control
//! servicers, allowing different implementations (I2C, mock, etc.).

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No acknowledge from device at 0x{address:02X}")]
    Nack { address: u8 },

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Device returned control status {status} for {register}")]
    ControlStatus { register: Register, status: u8 },

    #[error("Short read from {register}: expected {expected}, got {actual}")]
    ShortRead {
        register: Register,
        expected: usize,
        actual: usize,
    },

    #[error("Request of {len} bytes exceeds the {max} byte limit")]
    RequestTooLarge { len: usize, max: usize },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("No device answered on any of {tried} addresses")]
    NoDevice { tried: usize },
}

/// A `(resource id, command)` pair addressing one control register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    pub resid: u8,
    pub cmd: u8,
}

impl Register {
    pub const fn new(resid: u8, cmd: u8) -> Self {
        Self { resid, cmd }
    }

    /// A command on the DFU controller servicer.
    pub const fn dfu(cmd: u8) -> Self {
        Self::new(crate::protocol::DFU_CONTROLLER_SERVICER_RESID, cmd)
    }

    /// A command on the GPO servicer.
    pub const fn gpo(cmd: u8) -> Self {
        Self::new(crate::protocol::GPO_SERVICER_RESID, cmd)
    }

    /// A command on the configuration servicer.
    pub const fn config(cmd: u8) -> Self {
        Self::new(crate::protocol::CONFIGURATION_SERVICER_RESID, cmd)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resid {}/cmd {}", self.resid, self.cmd)
    }
}

/// Abstract register-level transport to a device at a fixed address.
///
/// Implementations handle the control framing: a write carries
/// `[resid, cmd, len, data..]`, a read requests `len` payload bytes and
/// strips the leading control status byte.
pub trait RegisterBus {
    /// Write `data` to a register.
    fn write(&mut self, register: Register, data: &[u8]) -> Result<(), TransportError>;

    /// Read `len` payload bytes from a register.
    fn read(&mut self, register: Register, len: usize) -> Result<Vec<u8>, TransportError>;

    /// 7-bit target address.
    fn address(&self) -> u8;
}

impl<T: RegisterBus + ?Sized> RegisterBus for &mut T {
    fn write(&mut self, register: Register, data: &[u8]) -> Result<(), TransportError> {
        (**self).write(register, data)
    }

    fn read(&mut self, register: Register, len: usize) -> Result<Vec<u8>, TransportError> {
        (**self).read(register, len)
    }

    fn address(&self) -> u8 {
        (**self).address()
    }
}
