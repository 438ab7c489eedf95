//! DOWNLOADING: one DNLOAD frame per ready status until the image is sent.

use tracing::debug;

use super::{PhaseContext, Readiness, Transition};
use crate::clock::Clock;
use crate::device::DfuDevice;
use crate::error::{DfuError, DfuResult, ProtocolError};
use crate::events::DfuEvent;
use crate::protocol::{Frame, FrameError};
use crate::state::DfuState;
use crate::transport::RegisterBus;

pub(super) fn step<B: RegisterBus + ?Sized, C: Clock + ?Sized>(
    ctx: &mut PhaseContext<'_, B, C>,
) -> DfuResult<Transition> {
    if ctx.session.is_transfer_complete() {
        return Ok(Transition::Goto(DfuState::Verifying));
    }

    match ctx.poll_ready() {
        Readiness::Ready(_) => {}
        Readiness::Failed(status) => {
            return Err(DfuError::Protocol(ProtocolError::DeviceStatus {
                state: status.state,
                status: status.status,
            }));
        }
        Readiness::Busy | Readiness::NotYet => {
            if ctx.timed_out() {
                return Err(ctx.timeout_error());
            }
            return Ok(Transition::Stay);
        }
    }

    let offset = ctx.session.offset();
    let total = ctx.session.total();
    let data = ctx.image.data();
    let Some(chunk) = ctx.session.chunker().chunk_at(data, offset) else {
        return Err(FrameError::OutOfBounds {
            offset,
            len: ctx.session.chunker().chunk_size(),
            total,
        }
        .into());
    };
    // Host-side block number for logs and events; wraps, never sent.
    let sequence = chunk.index as u16;
    let len = chunk.len();
    let frame = Frame::build(sequence, data, chunk.offset, len)?;

    if let Err(e) = ctx.bus.dfu_download(&frame) {
        let budget = ctx.settings.frame_retries;
        return ctx.retry_write(&format!("Frame {}", chunk.index), budget, e);
    }

    let now = ctx.now();
    ctx.session.touch(now);
    if !ctx.session.advance(len as u32) {
        return Err(FrameError::OutOfBounds {
            offset,
            len,
            total,
        }
        .into());
    }
    debug!(seq = sequence, offset, len, total, "Frame written");
    ctx.emit(DfuEvent::FrameSent { sequence, len });
    ctx.notifier.progress(ctx.session.offset(), total);
    Ok(Transition::Stay)
}
