//! VERIFYING: conclude the download and wait for the manifestation result.

use tracing::{info, warn};

use super::{PhaseContext, Readiness, Transition};
use crate::clock::Clock;
use crate::device::DfuDevice;
use crate::error::{DfuError, DfuResult, ProtocolError};
use crate::events::LogLevel;
use crate::protocol::{DeviceState, Frame};
use crate::state::DfuState;
use crate::transport::RegisterBus;

pub(super) fn step<B: RegisterBus + ?Sized, C: Clock + ?Sized>(
    ctx: &mut PhaseContext<'_, B, C>,
) -> DfuResult<Transition> {
    let readiness = ctx.poll_ready();

    if !ctx.session.request_sent() {
        // The last data frame must be acknowledged before the end frame.
        return match readiness {
            Readiness::Ready(_) => send_end_of_download(ctx),
            Readiness::Failed(status) => Err(DfuError::Protocol(ProtocolError::DeviceStatus {
                state: status.state,
                status: status.status,
            })),
            Readiness::Busy | Readiness::NotYet => waiting(ctx),
        };
    }

    match readiness {
        Readiness::Ready(status)
            if matches!(
                status.state,
                DeviceState::ManifestWaitReset | DeviceState::DfuIdle
            ) =>
        {
            info!(device_state = %status.state, "Image accepted");
            ctx.log(LogLevel::Info, "Device verified the image");
            Ok(Transition::Goto(DfuState::Activating))
        }
        Readiness::Failed(status) => {
            warn!(status = %status.status, device_state = %status.state, "Verification failed");
            Err(DfuError::Protocol(ProtocolError::VerifyFailed {
                status: status.status,
            }))
        }
        Readiness::Ready(_) | Readiness::Busy | Readiness::NotYet => waiting(ctx),
    }
}

fn send_end_of_download<B: RegisterBus + ?Sized, C: Clock + ?Sized>(
    ctx: &mut PhaseContext<'_, B, C>,
) -> DfuResult<Transition> {
    let sequence = ctx.session.chunker().count() as u16;
    let frame = Frame::end_of_download(sequence);
    match ctx.bus.dfu_download(&frame) {
        Ok(()) => {
            let now = ctx.now();
            ctx.session.mark_sent(now);
            info!(seq = sequence, "End of download sent");
            Ok(Transition::Stay)
        }
        Err(e) => {
            let budget = ctx.settings.frame_retries;
            ctx.retry_write("End of download", budget, e)
        }
    }
}

fn waiting<B: RegisterBus + ?Sized, C: Clock + ?Sized>(
    ctx: &PhaseContext<'_, B, C>,
) -> DfuResult<Transition> {
    if ctx.timed_out() {
        Err(ctx.timeout_error())
    } else {
        Ok(Transition::Stay)
    }
}
