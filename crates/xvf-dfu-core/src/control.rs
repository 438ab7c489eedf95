//! Audio front-end control requests: mute, LEDs, beam direction, VNR.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, instrument};

use crate::protocol::constants::*;
use crate::transport::{Register, RegisterBus, TransportError};

/// Raw GPO output port values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpoValues(pub [u8; GPO_READ_LEN]);

impl GpoValues {
    /// Microphone mute output (GPIO 30).
    pub fn is_muted(&self) -> bool {
        self.0[1] & 0x01 != 0
    }
}

/// Beamformer direction of arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeamDirection {
    pub direction: u16,
    pub speech_detected: bool,
}

impl BeamDirection {
    /// LED on the ring pointing at the speaker, if the value names one.
    pub fn led_index(&self) -> Option<u8> {
        (usize::from(self.direction) < LED_RING_COUNT).then_some(self.direction as u8)
    }
}

/// Typed requests against the GPO and configuration servicers.
///
/// Implemented for every `RegisterBus`.
pub trait ControlDevice: RegisterBus {
    /// Current voice-to-noise ratio estimate.
    fn read_vnr(&mut self) -> Result<u8, TransportError> {
        let bytes = self.read(Register::config(CONFIG_CMD_VNR_VALUE), VNR_READ_LEN)?;
        bytes
            .first()
            .copied()
            .ok_or(TransportError::ShortRead {
                register: Register::config(CONFIG_CMD_VNR_VALUE),
                expected: VNR_READ_LEN,
                actual: 0,
            })
    }

    fn read_gpo_values(&mut self) -> Result<GpoValues, TransportError> {
        let register = Register::gpo(GPO_CMD_READ_VALUES);
        let bytes = self.read(register, GPO_READ_LEN)?;
        let values: [u8; GPO_READ_LEN] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| TransportError::ShortRead {
                    register,
                    expected: GPO_READ_LEN,
                    actual: bytes.len(),
                })?;
        debug!(?values, "GPO values");
        Ok(GpoValues(values))
    }

    fn read_mute(&mut self) -> Result<bool, TransportError> {
        Ok(self.read_gpo_values()?.is_muted())
    }

    /// Drive the mute output.
    fn set_mute(&mut self, muted: bool) -> Result<(), TransportError> {
        self.write(
            Register::gpo(GPO_CMD_WRITE_VALUE),
            &[MUTE_GPIO, u8::from(muted)],
        )
    }

    /// Select one of the firmware's built-in LED effects.
    fn set_led_effect(&mut self, effect: u8) -> Result<(), TransportError> {
        self.write(Register::gpo(GPO_CMD_LED_EFFECT), &[effect])
    }

    /// Set every LED on the ring; colors are `0xBBGGRR`.
    #[instrument(level = "debug", skip_all)]
    fn set_led_ring(&mut self, colors: &[u32; LED_RING_COUNT]) -> Result<(), TransportError> {
        let mut payload = [0u8; LED_RING_COUNT * 4];
        for (slot, color) in payload.chunks_exact_mut(4).zip(colors) {
            LittleEndian::write_u32(slot, color & 0x00FF_FFFF);
        }
        self.write(Register::gpo(GPO_CMD_LED_RING_VALUE), &payload)
    }

    fn read_beam_direction(&mut self) -> Result<BeamDirection, TransportError> {
        let register = Register::gpo(GPO_CMD_DOA_VALUE);
        let bytes = self.read(register, DOA_READ_LEN)?;
        if bytes.len() < DOA_READ_LEN {
            return Err(TransportError::ShortRead {
                register,
                expected: DOA_READ_LEN,
                actual: bytes.len(),
            });
        }
        let beam = BeamDirection {
            direction: LittleEndian::read_u16(&bytes[0..2]),
            speech_detected: LittleEndian::read_u16(&bytes[2..4]) != 0,
        };
        debug!(direction = beam.direction, speech = beam.speech_detected, "DoA");
        Ok(beam)
    }
}

impl<B: RegisterBus + ?Sized> ControlDevice for B {}
