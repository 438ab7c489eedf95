//! Updater states and the per-session bookkeeping.

use std::fmt;

use crate::chunker::Chunker;

/// Phase of a firmware update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DfuState {
    /// No update running.
    #[default]
    Idle,
    /// Upgrade partition is being erased.
    Erasing,
    /// Image frames are being written.
    Downloading,
    /// End of download sent, device is checking the image.
    Verifying,
    /// Device rebooted, waiting for it to report the new version.
    Activating,
    /// Update finished and the device runs the new image.
    Ended,
    /// Update failed.
    Error,
}

impl DfuState {
    /// `Ended` and `Error` are only left by starting a new update.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DfuState::Ended | DfuState::Error)
    }

    /// A session is in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DfuState::Erasing | DfuState::Downloading | DfuState::Verifying | DfuState::Activating
        )
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::Idle => write!(f, "IDLE"),
            DfuState::Erasing => write!(f, "ERASING"),
            DfuState::Downloading => write!(f, "DOWNLOADING"),
            DfuState::Verifying => write!(f, "VERIFYING"),
            DfuState::Activating => write!(f, "ACTIVATING"),
            DfuState::Ended => write!(f, "ENDED"),
            DfuState::Error => write!(f, "ERROR"),
        }
    }
}

/// Runtime state of one update, owned by the updater while it is active.
///
/// `offset` never exceeds `total`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    state: DfuState,
    chunker: Chunker,
    offset: u32,
    started_ms: u64,
    /// Last time the device answered ready or accepted a request.
    last_activity_ms: u64,
    /// Earliest time the next status read may be issued.
    pub(crate) next_poll_ms: u64,
    /// Failures counted against the current phase's budget.
    attempts: u32,
    /// The current phase's request has been written.
    request_sent: bool,
    /// The update LED effect has been requested.
    pub(crate) led_signalled: bool,
}

impl TransferSession {
    pub fn new(chunker: Chunker, now_ms: u64) -> Self {
        Self {
            state: DfuState::Idle,
            chunker,
            offset: 0,
            started_ms: now_ms,
            last_activity_ms: now_ms,
            next_poll_ms: now_ms,
            attempts: 0,
            request_sent: false,
            led_signalled: false,
        }
    }

    pub fn state(&self) -> DfuState {
        self.state
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn total(&self) -> u32 {
        self.chunker.total()
    }

    /// Completed fraction in `[0, 1]`.
    pub fn fraction(&self) -> f32 {
        match self.total() {
            0 => 0.0,
            total => (f64::from(self.offset) / f64::from(total)) as f32,
        }
    }

    pub fn is_transfer_complete(&self) -> bool {
        self.offset == self.total()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn started_ms(&self) -> u64 {
        self.started_ms
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms
    }

    pub(crate) fn request_sent(&self) -> bool {
        self.request_sent
    }

    /// Enter a new phase. Retry budget and request flag start over.
    pub(crate) fn goto(&mut self, to: DfuState, now_ms: u64) -> DfuState {
        let from = self.state;
        self.state = to;
        self.attempts = 0;
        self.request_sent = false;
        self.last_activity_ms = now_ms;
        from
    }

    pub(crate) fn touch(&mut self, now_ms: u64) {
        self.last_activity_ms = now_ms;
    }

    pub(crate) fn mark_sent(&mut self, now_ms: u64) {
        self.request_sent = true;
        self.touch(now_ms);
    }

    /// Send the current phase's request again on the next poll.
    pub(crate) fn resend(&mut self) {
        self.request_sent = false;
    }

    pub(crate) fn record_failure(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Move the offset past an acknowledged chunk.
    ///
    /// Returns `false`, leaving the offset unchanged, if that would pass
    /// the end of the image.
    pub(crate) fn advance(&mut self, len: u32) -> bool {
        match self.offset.checked_add(len) {
            Some(next) if next <= self.total() => {
                self.offset = next;
                self.attempts = 0;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(total: u32) -> TransferSession {
        TransferSession::new(Chunker::new(total, 120).unwrap(), 0)
    }

    #[test]
    fn test_advance_never_passes_total() {
        let mut s = session(1000);
        assert!(s.advance(960));
        assert!(!s.advance(41));
        assert_eq!(s.offset(), 960);
        assert!(s.advance(40));
        assert!(s.is_transfer_complete());
        assert!(!s.advance(1));
        assert_eq!(s.fraction(), 1.0);
    }

    #[test]
    fn test_goto_resets_phase_counters() {
        let mut s = session(10);
        s.record_failure();
        s.mark_sent(5);
        s.record_failure();
        assert_eq!(s.attempts(), 2);
        let from = s.goto(DfuState::Downloading, 20);
        assert_eq!(from, DfuState::Idle);
        assert_eq!(s.attempts(), 0);
        assert!(!s.request_sent());
        assert_eq!(s.last_activity_ms(), 20);
    }

    #[test]
    fn test_empty_session() {
        let s = session(0);
        assert!(s.is_transfer_complete());
        assert_eq!(s.fraction(), 0.0);
    }

    #[test]
    fn test_terminal_states() {
        assert!(DfuState::Ended.is_terminal());
        assert!(DfuState::Error.is_terminal());
        assert!(!DfuState::Idle.is_terminal());
        assert!(DfuState::Verifying.is_active());
        assert!(!DfuState::Idle.is_active());
        assert_eq!(DfuState::Downloading.to_string(), "DOWNLOADING");
    }
}
