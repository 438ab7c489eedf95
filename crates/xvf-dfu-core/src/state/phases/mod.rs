//! Per-phase step logic.
//!
//! Each active state has a `step` function that performs at most one
//! request and reports whether the machine stays or moves on:
//! - `erase`: SETALTERNATE and wait for the erased partition
//! - `download`: one DNLOAD frame per ready status
//! - `verify`: end-of-download frame and manifestation result
//! - `activate`: REBOOT and version polling

mod activate;
mod download;
mod erase;
mod verify;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::DfuSettings;
use crate::device::DfuDevice;
use crate::error::{DfuError, DfuResult};
use crate::events::{DfuEvent, EventNotifier, LogLevel};
use crate::firmware::FirmwareImage;
use crate::protocol::{DeviceState, StatusResponse};
use crate::state::machine::{DfuState, TransferSession};
use crate::transport::{RegisterBus, TransportError};

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Stay,
    Goto(DfuState),
}

/// What a status poll found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// No status read was due, or the read failed.
    NotYet,
    /// Device is still working on the last request.
    Busy,
    Ready(StatusResponse),
    /// Device reported an error status or the error state.
    Failed(StatusResponse),
}

/// Everything a phase needs for one step.
pub(crate) struct PhaseContext<'a, B: RegisterBus + ?Sized, C: Clock + ?Sized> {
    pub bus: &'a mut B,
    pub clock: &'a C,
    pub settings: &'a DfuSettings,
    /// Cap on any device-requested wait.
    pub processing_timeout_ms: u64,
    pub image: &'a FirmwareImage,
    pub session: &'a mut TransferSession,
    pub notifier: &'a mut EventNotifier,
}

impl<B: RegisterBus + ?Sized, C: Clock + ?Sized> PhaseContext<'_, B, C> {
    pub(crate) fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn emit(&self, event: DfuEvent) {
        self.notifier.emit(event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.notifier.log(level, message);
    }

    /// Read the device status if the device's requested poll delay has passed.
    pub(crate) fn poll_ready(&mut self) -> Readiness {
        let now = self.now();
        if now < self.session.next_poll_ms {
            return Readiness::NotYet;
        }
        let status = match self.bus.dfu_status() {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, state = %self.session.state(), "Status read failed");
                return Readiness::NotYet;
            }
        };
        let delay = u64::from(status.poll_delay_ms).min(self.processing_timeout_ms);
        self.session.next_poll_ms = now + delay;

        if !status.status.is_ok() || status.state == DeviceState::DfuError {
            Readiness::Failed(status)
        } else if status.state.is_ready() {
            self.session.touch(now);
            Readiness::Ready(status)
        } else {
            debug!(device_state = %status.state, "Device busy");
            Readiness::Busy
        }
    }

    /// No sign of life from the device for longer than the phase allows.
    pub(crate) fn timed_out(&self) -> bool {
        self.now().saturating_sub(self.session.last_activity_ms()) > self.settings.phase_timeout_ms
    }

    pub(crate) fn timeout_error(&self) -> DfuError {
        DfuError::Timeout {
            state: self.session.state(),
            timeout_ms: self.settings.phase_timeout_ms,
        }
    }

    /// Count a failed write against `budget` extra attempts.
    ///
    /// Within budget the step stays put so the next poll writes again.
    pub(crate) fn retry_write(
        &mut self,
        operation: &str,
        budget: u32,
        source: TransportError,
    ) -> DfuResult<Transition> {
        let attempts = self.session.record_failure();
        if attempts > budget {
            return Err(DfuError::RetriesExhausted {
                operation: operation.to_string(),
                attempts,
                source,
            });
        }
        warn!(error = %source, attempt = attempts, budget, "{} failed, retrying", operation);
        self.emit(DfuEvent::Retry {
            operation: operation.to_string(),
            attempt: attempts,
            max_attempts: budget + 1,
        });
        Ok(Transition::Stay)
    }
}

/// Advance the active phase by one step.
pub(crate) fn step<B: RegisterBus + ?Sized, C: Clock + ?Sized>(
    ctx: &mut PhaseContext<'_, B, C>,
) -> DfuResult<Transition> {
    match ctx.session.state() {
        DfuState::Erasing => erase::step(ctx),
        DfuState::Downloading => download::step(ctx),
        DfuState::Verifying => verify::step(ctx),
        DfuState::Activating => activate::step(ctx),
        DfuState::Idle | DfuState::Ended | DfuState::Error => Ok(Transition::Stay),
    }
}
