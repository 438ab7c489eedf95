//! ACTIVATING: reboot into the new image and confirm the running version.
//!
//! Version reads fail while the device restarts; those failures are
//! tolerated until the phase timeout.

use tracing::{debug, info};

use super::{PhaseContext, Transition};
use crate::clock::Clock;
use crate::device::DfuDevice;
use crate::error::{DfuError, DfuResult, ProtocolError};
use crate::events::LogLevel;
use crate::state::DfuState;
use crate::transport::RegisterBus;

pub(super) fn step<B: RegisterBus + ?Sized, C: Clock + ?Sized>(
    ctx: &mut PhaseContext<'_, B, C>,
) -> DfuResult<Transition> {
    if !ctx.session.request_sent() {
        return match ctx.bus.dfu_reboot() {
            Ok(()) => {
                let now = ctx.now();
                ctx.session.mark_sent(now);
                ctx.session.next_poll_ms = now + ctx.settings.activation_poll_ms;
                info!("Reboot requested");
                ctx.log(LogLevel::Info, "Rebooting into the new image");
                Ok(Transition::Stay)
            }
            Err(e) => {
                let budget = ctx.settings.frame_retries;
                ctx.retry_write("Reboot request", budget, e)
            }
        };
    }

    let now = ctx.now();
    if now < ctx.session.next_poll_ms {
        return Ok(Transition::Stay);
    }
    ctx.session.next_poll_ms = now + ctx.settings.activation_poll_ms;

    let expected = ctx.image.version();
    match ctx.bus.dfu_version() {
        Ok(actual) if actual == expected => {
            info!(version = %actual, "Device runs the new image");
            Ok(Transition::Goto(DfuState::Ended))
        }
        Ok(actual) => Err(DfuError::Protocol(ProtocolError::ActivationFailed {
            expected,
            actual,
        })),
        Err(e) => {
            debug!(error = %e, "Device not answering yet");
            if ctx.timed_out() {
                Err(ctx.timeout_error())
            } else {
                Ok(Transition::Stay)
            }
        }
    }
}
