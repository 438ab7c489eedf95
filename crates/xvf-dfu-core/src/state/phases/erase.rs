//! ERASING: select the upgrade partition and wait for the erase to finish.

use tracing::{info, warn};

use super::{PhaseContext, Readiness, Transition};
use crate::clock::Clock;
use crate::control::ControlDevice;
use crate::device::DfuDevice;
use crate::error::{DfuError, DfuResult, ProtocolError};
use crate::events::{DfuEvent, LogLevel};
use crate::state::DfuState;
use crate::transport::RegisterBus;

pub(super) fn step<B: RegisterBus + ?Sized, C: Clock + ?Sized>(
    ctx: &mut PhaseContext<'_, B, C>,
) -> DfuResult<Transition> {
    let budget = ctx.settings.erase_retries;

    if !ctx.session.request_sent() {
        return match ctx.bus.dfu_set_alternate() {
            Ok(()) => {
                let now = ctx.now();
                ctx.session.mark_sent(now);
                info!("Erase requested");
                signal_update(ctx);
                Ok(Transition::Stay)
            }
            Err(e) => ctx.retry_write("Erase request", budget, e),
        };
    }

    match ctx.poll_ready() {
        Readiness::Ready(status) => {
            info!(device_state = %status.state, "Erase complete");
            ctx.log(LogLevel::Info, "Upgrade partition erased");
            Ok(Transition::Goto(DfuState::Downloading))
        }
        Readiness::Failed(status) => Err(DfuError::Protocol(ProtocolError::DeviceStatus {
            state: status.state,
            status: status.status,
        })),
        Readiness::Busy | Readiness::NotYet => {
            if !ctx.timed_out() {
                return Ok(Transition::Stay);
            }
            let attempts = ctx.session.record_failure();
            if attempts > budget {
                return Err(ctx.timeout_error());
            }
            warn!(attempt = attempts, budget, "Erase timed out, requesting again");
            ctx.emit(DfuEvent::Retry {
                operation: "Erase".into(),
                attempt: attempts,
                max_attempts: budget + 1,
            });
            ctx.session.resend();
            Ok(Transition::Stay)
        }
    }
}

/// Switch the LEDs to the update effect once per session. Failure only warns.
fn signal_update<B: RegisterBus + ?Sized, C: Clock + ?Sized>(ctx: &mut PhaseContext<'_, B, C>) {
    if !ctx.settings.update_led || ctx.session.led_signalled {
        return;
    }
    ctx.session.led_signalled = true;
    let effect = ctx.settings.led_effect;
    if let Err(e) = ctx.bus.set_led_effect(effect) {
        warn!(error = %e, effect, "Failed to set LED effect");
        ctx.log(LogLevel::Warn, format!("LED effect {effect} not set: {e}"));
    }
}
