//! DFU updater - high-level orchestrator for one device.
//!
//! The updater borrows the bus for its whole life, holds the validated image
//! and drives the state machine one step per [`DfuUpdater::poll`]. Callers
//! either poll from their own loop or let [`DfuUpdater::run`] do it.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::chunker::Chunker;
use crate::clock::{Clock, MonotonicClock};
use crate::config::{ConfigError, DfuConfig};
use crate::device::DfuDevice;
use crate::error::{DfuError, DfuResult, ErrorCode};
use crate::events::{DfuEvent, DfuObserver, EventNotifier};
use crate::firmware::{FirmwareFetcher, FirmwareImage, FirmwareSource, FirmwareStore, FirmwareVersion};
use crate::state::phases::{self, PhaseContext, Transition};
use crate::state::{DfuState, TransferSession};
use crate::transport::RegisterBus;

/// Result of comparing the running firmware with the loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionCheck {
    pub device: FirmwareVersion,
    pub image: Option<FirmwareVersion>,
    pub needs_update: bool,
}

/// Drives firmware updates on one device.
pub struct DfuUpdater<'a, B: RegisterBus, C: Clock = MonotonicClock> {
    bus: &'a mut B,
    clock: C,
    config: DfuConfig,
    store: FirmwareStore,
    notifier: EventNotifier,
    session: Option<TransferSession>,
    /// State reported while no session is active.
    outcome: DfuState,
    last_error: Option<ErrorCode>,
    cancel_requested: bool,
}

impl<'a, B: RegisterBus> DfuUpdater<'a, B, MonotonicClock> {
    /// Create an updater that uses wall-clock time.
    pub fn new(bus: &'a mut B, config: DfuConfig) -> Self {
        Self::with_clock(bus, config, MonotonicClock::new())
    }
}

impl<'a, B: RegisterBus, C: Clock> DfuUpdater<'a, B, C> {
    pub fn with_clock(bus: &'a mut B, config: DfuConfig, clock: C) -> Self {
        Self {
            bus,
            clock,
            config,
            store: FirmwareStore::new(),
            notifier: EventNotifier::new(),
            session: None,
            outcome: DfuState::Idle,
            last_error: None,
            cancel_requested: false,
        }
    }

    pub fn config(&self) -> &DfuConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    // ------------------------------------------------------------------
    // Image
    // ------------------------------------------------------------------

    /// Replace the image used by the next flash.
    pub fn set_image(&mut self, image: FirmwareImage) -> DfuResult<()> {
        if self.is_busy() {
            return Err(DfuError::Busy);
        }
        self.store.set(image);
        Ok(())
    }

    /// Fetch and verify an image.
    ///
    /// A failed load fires the error hook and keeps the previous image; the
    /// updater state does not change.
    pub fn load_firmware<F: FirmwareFetcher + ?Sized>(
        &mut self,
        source: &FirmwareSource,
        fetcher: &F,
    ) -> DfuResult<FirmwareVersion> {
        if self.is_busy() {
            return Err(DfuError::Busy);
        }
        let loaded = self
            .store
            .load(source, fetcher)
            .map(|image| image.version());
        loaded.map_err(|e| self.report(e.into()))
    }

    /// Load the image named in the `[firmware]` section of the config.
    pub fn load_configured_firmware<F: FirmwareFetcher + ?Sized>(
        &mut self,
        fetcher: &F,
    ) -> DfuResult<FirmwareVersion> {
        let Some(source) = self.config.firmware.clone() else {
            return Err(ConfigError::Invalid("no [firmware] section".into()).into());
        };
        self.load_firmware(&source, fetcher)
    }

    pub fn image(&self) -> Option<&FirmwareImage> {
        self.store.image()
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    pub fn on_begin<F: FnMut() + Send + 'static>(&mut self, hook: F) {
        self.notifier.on_begin(hook);
    }

    pub fn on_progress<F: FnMut(f32) + Send + 'static>(&mut self, hook: F) {
        self.notifier.on_progress(hook);
    }

    pub fn on_end<F: FnMut() + Send + 'static>(&mut self, hook: F) {
        self.notifier.on_end(hook);
    }

    pub fn on_error<F: FnMut(ErrorCode) + Send + 'static>(&mut self, hook: F) {
        self.notifier.on_error(hook);
    }

    pub fn subscribe(&mut self, observer: Arc<dyn DfuObserver>) {
        self.notifier.subscribe(observer);
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn state(&self) -> DfuState {
        self.session
            .as_ref()
            .map_or(self.outcome, |session| session.state())
    }

    pub fn is_busy(&self) -> bool {
        self.session.is_some()
    }

    /// Completed fraction of the current or last update.
    pub fn progress(&self) -> f32 {
        match &self.session {
            Some(session) => session.fraction(),
            None if self.outcome == DfuState::Ended => 1.0,
            None => self.notifier.last_progress().unwrap_or(0.0),
        }
    }

    pub fn session(&self) -> Option<&TransferSession> {
        self.session.as_ref()
    }

    /// Code of the last failure, cleared when a new update starts.
    pub fn last_error(&self) -> Option<ErrorCode> {
        self.last_error
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    /// Begin an update with the loaded image.
    ///
    /// Rejected with [`DfuError::Busy`] while an update runs; the running
    /// session is not touched.
    pub fn start_flash(&mut self) -> DfuResult<()> {
        if let Some(session) = &self.session {
            warn!(state = %session.state(), "Flash requested while an update is running");
            return Err(DfuError::Busy);
        }
        self.cancel_requested = false;
        self.last_error = None;

        let Some(image) = self.store.image() else {
            return Err(self.fail(DfuError::NoImage));
        };
        let total = image.len();
        let version = image.version();
        let chunker = match Chunker::new(total, self.config.dfu.max_xfer) {
            Ok(chunker) => chunker,
            Err(e) => return Err(self.fail(e.into())),
        };

        let now = self.clock.now_ms();
        let mut session = TransferSession::new(chunker, now);
        let from = session.goto(DfuState::Erasing, now);
        self.session = Some(session);

        info!(
            bytes = total,
            version = %version,
            chunks = chunker.count(),
            chunk_size = chunker.chunk_size(),
            "Starting firmware update"
        );
        self.notifier.begin(total, version);
        self.notifier.emit(DfuEvent::StateChanged {
            from,
            to: DfuState::Erasing,
        });
        Ok(())
    }

    /// Ask the running update to stop at the next poll.
    ///
    /// Returns `false` when nothing is running.
    pub fn cancel(&mut self) -> bool {
        if self.session.is_none() {
            return false;
        }
        info!(state = %self.state(), "Cancellation requested");
        self.cancel_requested = true;
        true
    }

    /// Advance the update by one step.
    ///
    /// Returns the state after the step. The step that fails the update
    /// returns the error; later polls report `Ok(DfuState::Error)`.
    pub fn poll(&mut self) -> DfuResult<DfuState> {
        if self.session.is_none() {
            return Ok(self.outcome);
        }
        if self.cancel_requested {
            return Err(self.fail(DfuError::Cancelled));
        }

        let result = match (self.session.as_mut(), self.store.image()) {
            (Some(session), Some(image)) => {
                let mut ctx = PhaseContext {
                    bus: &mut *self.bus,
                    clock: &self.clock,
                    settings: &self.config.dfu,
                    processing_timeout_ms: self.config.processing_timeout_ms,
                    image,
                    session,
                    notifier: &mut self.notifier,
                };
                phases::step(&mut ctx)
            }
            _ => Err(DfuError::NoImage),
        };

        match result {
            Ok(Transition::Stay) => Ok(self.state()),
            Ok(Transition::Goto(to)) => Ok(self.transition(to)),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Poll until the update leaves the active states.
    pub fn run(&mut self) -> DfuResult<DfuState> {
        loop {
            let state = self.poll()?;
            if !state.is_active() {
                return Ok(state);
            }
            self.clock.delay_ms(self.config.dfu.poll_interval_ms);
        }
    }

    /// Start an update and drive it to completion.
    #[instrument(skip(self))]
    pub fn flash(&mut self) -> DfuResult<()> {
        self.start_flash()?;
        self.run()?;
        Ok(())
    }

    /// Compare the device's running version with the loaded image.
    pub fn check_version(&mut self) -> DfuResult<VersionCheck> {
        if self.is_busy() {
            return Err(DfuError::Busy);
        }
        let device = self.bus.dfu_version()?;
        let image = self.store.image().map(|image| image.version());
        let needs_update = image.is_some_and(|version| version != device);
        info!(device = %device, image = ?image, needs_update, "Version check");
        Ok(VersionCheck {
            device,
            image,
            needs_update,
        })
    }

    /// Flash only when the device runs a different version.
    ///
    /// Returns whether an update was performed.
    pub fn update_if_needed(&mut self) -> DfuResult<bool> {
        let check = self.check_version()?;
        if !check.needs_update {
            info!(version = %check.device, "Firmware is up to date");
            return Ok(false);
        }
        self.flash()?;
        Ok(true)
    }

    fn transition(&mut self, to: DfuState) -> DfuState {
        let now = self.clock.now_ms();
        let Some(session) = self.session.as_mut() else {
            return self.outcome;
        };
        let from = session.goto(to, now);
        info!(from = %from, to = %to, "State transition");
        self.notifier.emit(DfuEvent::StateChanged { from, to });

        if to == DfuState::Ended {
            let version = self
                .store
                .image()
                .map(|image| image.version())
                .unwrap_or_default();
            self.session = None;
            self.outcome = DfuState::Ended;
            self.notifier.end(version);
        }
        to
    }

    /// Fire the error hook for a failure outside any update.
    fn report(&mut self, err: DfuError) -> DfuError {
        let code = err.code();
        error!(code = %code, "Firmware load failed: {}", err);
        self.last_error = Some(code);
        self.notifier.error(code, err.to_string());
        err
    }

    /// The single path into `Error`: drops the session and fires the error hook.
    fn fail(&mut self, err: DfuError) -> DfuError {
        let code = err.code();
        let from = self.state();
        error!(code = %code, state = %from, "Update failed: {}", err);

        self.session = None;
        self.cancel_requested = false;
        self.outcome = DfuState::Error;
        self.last_error = Some(code);
        self.notifier.emit(DfuEvent::StateChanged {
            from,
            to: DfuState::Error,
        });
        self.notifier.error(code, err.to_string());
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ProtocolError;
    use crate::firmware::{FirmwareError, md5_hex};
    use crate::protocol::{
        DFU_CMD_SETALTERNATE, DeviceState, DeviceStatus, GPO_CMD_LED_EFFECT, GPO_SERVICER_RESID,
        LED_EFFECT_UPDATING,
    };
    use crate::transport::{MockBus, Register};
    use std::sync::Mutex;

    const OLD: FirmwareVersion = FirmwareVersion::new(2, 0, 5);
    const NEW: FirmwareVersion = FirmwareVersion::new(2, 0, 6);

    fn image_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn image(len: usize) -> FirmwareImage {
        let data = image_data(len);
        let md5 = md5_hex(&data);
        FirmwareImage::verified(data, NEW, &md5).unwrap()
    }

    fn config(max_xfer: usize) -> DfuConfig {
        let mut config = DfuConfig::default();
        config.dfu.max_xfer = max_xfer;
        config
    }

    fn device() -> MockBus {
        let bus = MockBus::new(OLD);
        bus.set_pending_version(NEW);
        bus
    }

    #[derive(Clone, Default)]
    struct Hooks {
        calls: Arc<Mutex<Vec<String>>>,
        progress: Arc<Mutex<Vec<f32>>>,
        errors: Arc<Mutex<Vec<ErrorCode>>>,
    }

    impl Hooks {
        fn attach<B: RegisterBus, C: Clock>(updater: &mut DfuUpdater<'_, B, C>) -> Self {
            let hooks = Self::default();
            let calls = hooks.calls.clone();
            updater.on_begin(move || calls.lock().unwrap().push("begin".into()));
            let calls = hooks.calls.clone();
            let progress = hooks.progress.clone();
            updater.on_progress(move |p| {
                calls.lock().unwrap().push("progress".into());
                progress.lock().unwrap().push(p);
            });
            let calls = hooks.calls.clone();
            updater.on_end(move || calls.lock().unwrap().push("end".into()));
            let calls = hooks.calls.clone();
            let errors = hooks.errors.clone();
            updater.on_error(move |code| {
                calls.lock().unwrap().push("error".into());
                errors.lock().unwrap().push(code);
            });
            hooks
        }

        fn count(&self, name: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| *c == name).count()
        }

        fn progress(&self) -> Vec<f32> {
            self.progress.lock().unwrap().clone()
        }

        fn errors(&self) -> Vec<ErrorCode> {
            self.errors.lock().unwrap().clone()
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<DfuEvent>>);

    impl DfuObserver for Recorder {
        fn on_event(&self, event: &DfuEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    struct StaticFetcher(Vec<u8>);

    impl FirmwareFetcher for StaticFetcher {
        fn fetch(&self, _url: &str) -> Result<Vec<u8>, FirmwareError> {
            Ok(self.0.clone())
        }
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-6, "{actual:?} vs {expected:?}");
        }
    }

    #[test]
    fn test_full_update() {
        let mut bus = device();
        let dev = bus.clone();
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        updater.set_image(image(500)).unwrap();
        let hooks = Hooks::attach(&mut updater);

        updater.flash().unwrap();

        assert_eq!(updater.state(), DfuState::Ended);
        assert_eq!(updater.progress(), 1.0);
        assert!(!updater.is_busy());
        assert_close(&hooks.progress(), &[0.24, 0.48, 0.72, 0.96, 1.0]);
        assert_eq!(hooks.count("begin"), 1);
        assert_eq!(hooks.count("end"), 1);
        assert_eq!(hooks.count("error"), 0);
        assert_eq!(hooks.calls.lock().unwrap().first().unwrap(), "begin");
        assert_eq!(hooks.calls.lock().unwrap().last().unwrap(), "end");

        let lens: Vec<usize> = dev.data_frames().iter().map(|f| f.payload_len()).collect();
        assert_eq!(lens, vec![120, 120, 120, 120, 20]);
        assert_eq!(dev.received(), image_data(500));
        assert_eq!(dev.erase_requests(), 1);
        assert_eq!(dev.reboots(), 1);
        assert_eq!(dev.version(), NEW);
        assert!(dev.frames().last().unwrap().is_end_of_download());
    }

    #[test]
    fn test_default_transfer_size() {
        let mut bus = device();
        let dev = bus.clone();
        let mut updater =
            DfuUpdater::with_clock(&mut bus, DfuConfig::default(), ManualClock::new());
        updater.set_image(image(300)).unwrap();
        updater.flash().unwrap();

        let lens: Vec<usize> = dev.data_frames().iter().map(|f| f.payload_len()).collect();
        assert_eq!(lens, vec![128, 128, 44]);
        let seqs: Vec<u16> = dev.data_frames().iter().map(|f| f.sequence()).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_flash_while_busy_is_rejected() {
        let mut bus = device();
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        updater.set_image(image(500)).unwrap();
        let hooks = Hooks::attach(&mut updater);

        updater.start_flash().unwrap();
        for _ in 0..4 {
            updater.poll().unwrap();
        }
        assert_eq!(updater.state(), DfuState::Downloading);
        let offset = updater.session().unwrap().offset();
        assert!(offset > 0);

        assert!(matches!(updater.start_flash(), Err(DfuError::Busy)));
        assert!(matches!(updater.set_image(image(10)), Err(DfuError::Busy)));
        assert_eq!(updater.session().unwrap().offset(), offset);
        assert_eq!(updater.state(), DfuState::Downloading);
        assert_eq!(hooks.count("begin"), 1);
        assert_eq!(hooks.count("error"), 0);

        updater.run().unwrap();
        assert_eq!(updater.state(), DfuState::Ended);
    }

    #[test]
    fn test_frame_fault_recovers_within_budget() {
        let mut bus = device();
        let dev = bus.clone();
        dev.fail_frame(2, 2);
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        updater.set_image(image(500)).unwrap();
        let hooks = Hooks::attach(&mut updater);

        updater.flash().unwrap();

        assert_eq!(dev.frame_attempts(2), 3);
        for seq in [0, 1, 3, 4] {
            assert_eq!(dev.frame_attempts(seq), 1);
        }
        assert_eq!(dev.received(), image_data(500));
        assert_close(&hooks.progress(), &[0.24, 0.48, 0.72, 0.96, 1.0]);
        assert_eq!(hooks.count("error"), 0);
    }

    #[test]
    fn test_frame_fault_escalates_after_budget() {
        let mut bus = device();
        let dev = bus.clone();
        dev.fail_frame(2, 10);
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        updater.set_image(image(500)).unwrap();
        let hooks = Hooks::attach(&mut updater);

        let err = updater.flash().unwrap_err();

        assert!(matches!(
            err,
            DfuError::RetriesExhausted { attempts: 4, .. }
        ));
        assert_eq!(err.code(), ErrorCode::Transport);
        assert_eq!(dev.frame_attempts(2), 4);
        assert_eq!(dev.frame_attempts(3), 0);
        assert_eq!(updater.state(), DfuState::Error);
        assert_eq!(updater.last_error(), Some(ErrorCode::Transport));
        assert_eq!(hooks.errors(), vec![ErrorCode::Transport]);
        assert_eq!(hooks.count("end"), 0);
        assert_close(&hooks.progress(), &[0.24, 0.48]);
        assert_eq!(dev.reboots(), 0);
    }

    #[test]
    fn test_empty_image() {
        let mut bus = device();
        let dev = bus.clone();
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        updater.set_image(image(0)).unwrap();
        let hooks = Hooks::attach(&mut updater);

        updater.flash().unwrap();

        assert_eq!(updater.state(), DfuState::Ended);
        assert!(dev.data_frames().is_empty());
        assert_eq!(dev.frames().len(), 1);
        assert!(hooks.progress().is_empty());
        assert_eq!(hooks.count("begin"), 1);
        assert_eq!(hooks.count("end"), 1);
    }

    #[test]
    fn test_corrupted_image_never_flashed() {
        let mut bus = device();
        let dev = bus.clone();
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        let hooks = Hooks::attach(&mut updater);

        let data = image_data(500);
        let source = FirmwareSource {
            url: "fw.bin".into(),
            version: NEW,
            md5: md5_hex(&data),
        };
        let mut corrupted = data.clone();
        corrupted[100] ^= 0xFF;

        let err = updater
            .load_firmware(&source, &StaticFetcher(corrupted))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Integrity);
        assert_eq!(hooks.errors(), vec![ErrorCode::Integrity]);
        assert!(updater.image().is_none());
        assert_eq!(updater.state(), DfuState::Idle);
        assert_eq!(updater.last_error(), Some(ErrorCode::Integrity));

        let err = updater.start_flash().unwrap_err();
        assert!(matches!(err, DfuError::NoImage));
        assert_eq!(updater.state(), DfuState::Error);
        assert_eq!(hooks.errors(), vec![ErrorCode::Integrity, ErrorCode::NoImage]);
        assert_eq!(hooks.count("begin"), 0);
        assert!(dev.get_writes().is_empty());

        // The verified copy goes through.
        updater
            .load_firmware(&source, &StaticFetcher(data.clone()))
            .unwrap();
        updater.flash().unwrap();
        assert_eq!(dev.received(), data);
    }

    #[test]
    fn test_failed_load_keeps_previous_image() {
        let mut bus = device();
        let dev = bus.clone();
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        updater.set_image(image(64)).unwrap();

        let source = FirmwareSource {
            url: "fw.bin".into(),
            version: NEW,
            md5: md5_hex(b"expected"),
        };
        let recorder = Arc::new(Recorder::default());
        updater.subscribe(recorder.clone());
        assert!(
            updater
                .load_firmware(&source, &StaticFetcher(b"tampered".to_vec()))
                .is_err()
        );
        assert_eq!(updater.state(), DfuState::Idle);
        assert!(
            !recorder
                .0
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, DfuEvent::StateChanged { .. }))
        );
        updater.flash().unwrap();
        assert_eq!(dev.received(), image_data(64));
    }

    #[test]
    fn test_stalled_erase_is_retried() {
        let mut bus = device();
        let dev = bus.clone();
        dev.stall_erases(1);
        let clock = ManualClock::new();
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), clock.clone());
        updater.set_image(image(100)).unwrap();

        updater.flash().unwrap();

        assert_eq!(dev.erase_requests(), 2);
        assert!(clock.now_ms() > DfuConfig::default().dfu.phase_timeout_ms);
        let led_writes = dev
            .get_writes()
            .iter()
            .filter(|(register, _)| register.resid == GPO_SERVICER_RESID)
            .count();
        assert_eq!(led_writes, 1);
    }

    #[test]
    fn test_update_led_follows_erase() {
        let mut bus = device();
        let dev = bus.clone();
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        updater.set_image(image(200)).unwrap();

        updater.start_flash().unwrap();
        assert_eq!(dev.led_effect(), None);
        updater.poll().unwrap();
        assert_eq!(dev.erase_requests(), 1);
        assert_eq!(dev.led_effect(), Some(LED_EFFECT_UPDATING));

        let writes = dev.get_writes();
        assert_eq!(writes[0].0, Register::dfu(DFU_CMD_SETALTERNATE));
        assert_eq!(
            writes[1],
            (Register::gpo(GPO_CMD_LED_EFFECT), vec![LED_EFFECT_UPDATING])
        );
        updater.run().unwrap();
    }

    #[test]
    fn test_update_led_disabled() {
        let mut bus = device();
        let dev = bus.clone();
        let mut config = config(120);
        config.dfu.update_led = false;
        let mut updater = DfuUpdater::with_clock(&mut bus, config, ManualClock::new());
        updater.set_image(image(200)).unwrap();

        updater.flash().unwrap();
        assert_eq!(dev.led_effect(), None);
    }

    #[test]
    fn test_erase_timeout_after_retries() {
        let mut bus = device();
        let dev = bus.clone();
        dev.stall_erases(10);
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        updater.set_image(image(100)).unwrap();
        let hooks = Hooks::attach(&mut updater);

        let err = updater.flash().unwrap_err();

        assert!(matches!(
            err,
            DfuError::Timeout {
                state: DfuState::Erasing,
                timeout_ms: 4000
            }
        ));
        assert_eq!(dev.erase_requests(), 3);
        assert!(dev.data_frames().is_empty());
        assert_eq!(hooks.errors(), vec![ErrorCode::Timeout]);
    }

    #[test]
    fn test_verify_failure_has_distinct_code() {
        let mut bus = device();
        let dev = bus.clone();
        dev.set_manifest_status(DeviceStatus::ERR_VERIFY);
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        updater.set_image(image(500)).unwrap();
        let hooks = Hooks::attach(&mut updater);

        let err = updater.flash().unwrap_err();

        assert!(matches!(
            err,
            DfuError::Protocol(ProtocolError::VerifyFailed {
                status: DeviceStatus::ERR_VERIFY
            })
        ));
        assert_eq!(hooks.errors(), vec![ErrorCode::VerifyFailed]);
        assert_ne!(ErrorCode::VerifyFailed, ErrorCode::Transport);
        assert_eq!(dev.reboots(), 0);
    }

    #[test]
    fn test_device_error_during_download() {
        let mut bus = device();
        let dev = bus.clone();
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        updater.set_image(image(500)).unwrap();

        updater.start_flash().unwrap();
        for _ in 0..3 {
            updater.poll().unwrap();
        }
        dev.force_status(DeviceState::DfuError, DeviceStatus::ERR_WRITE);

        let err = updater.poll().unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeviceStatus);
        assert_eq!(dev.data_frames().len(), 1);
    }

    #[test]
    fn test_activation_version_mismatch() {
        let mut bus = MockBus::new(OLD);
        let dev = bus.clone();
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        updater.set_image(image(200)).unwrap();
        let hooks = Hooks::attach(&mut updater);

        let err = updater.flash().unwrap_err();

        match err {
            DfuError::Protocol(ProtocolError::ActivationFailed { expected, actual }) => {
                assert_eq!(expected, NEW);
                assert_eq!(actual, OLD);
            }
            other => panic!("expected activation failure, got {other:?}"),
        }
        assert_eq!(hooks.errors(), vec![ErrorCode::ActivationFailed]);
        assert_eq!(dev.reboots(), 1);
    }

    #[test]
    fn test_activation_tolerates_reboot_gap() {
        let mut bus = device();
        let dev = bus.clone();
        dev.set_reboot_unavailable_reads(3);
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        updater.set_image(image(200)).unwrap();

        updater.flash().unwrap();
        assert_eq!(updater.state(), DfuState::Ended);
    }

    #[test]
    fn test_activation_timeout() {
        let mut bus = device();
        let dev = bus.clone();
        dev.set_reboot_unavailable_reads(u32::MAX);
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        updater.set_image(image(200)).unwrap();

        let err = updater.flash().unwrap_err();
        assert!(matches!(
            err,
            DfuError::Timeout {
                state: DfuState::Activating,
                ..
            }
        ));
    }

    #[test]
    fn test_unreachable_device_times_out() {
        let mut bus = device();
        let dev = bus.clone();
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        updater.set_image(image(500)).unwrap();

        updater.start_flash().unwrap();
        for _ in 0..3 {
            updater.poll().unwrap();
        }
        dev.disconnect();

        let err = updater.run().unwrap_err();
        assert!(matches!(
            err,
            DfuError::Timeout {
                state: DfuState::Downloading,
                ..
            }
        ));
    }

    #[test]
    fn test_device_poll_delay_is_capped() {
        let mut bus = device();
        let dev = bus.clone();
        dev.set_poll_delay(0xFF_FFFF);
        dev.set_busy_reads(1);
        let clock = ManualClock::new();
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), clock.clone());
        updater.set_image(image(480)).unwrap();

        updater.flash().unwrap();

        assert_eq!(dev.received(), image_data(480));
        // Every status read waits the capped delay, never the requested one.
        assert!(clock.now_ms() >= 1000);
        assert!(clock.now_ms() < 0xFF_FFFF);
    }

    #[test]
    fn test_cancel_between_frames() {
        let mut bus = device();
        let dev = bus.clone();
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        updater.set_image(image(500)).unwrap();
        let hooks = Hooks::attach(&mut updater);

        assert!(!updater.cancel());
        updater.start_flash().unwrap();
        for _ in 0..4 {
            updater.poll().unwrap();
        }
        assert_eq!(dev.data_frames().len(), 2);

        assert!(updater.cancel());
        assert!(matches!(updater.poll(), Err(DfuError::Cancelled)));
        assert_eq!(updater.poll().unwrap(), DfuState::Error);
        assert_eq!(updater.poll().unwrap(), DfuState::Error);

        assert_eq!(dev.data_frames().len(), 2);
        assert_eq!(hooks.errors(), vec![ErrorCode::Cancelled]);
        assert_eq!(updater.last_error(), Some(ErrorCode::Cancelled));
    }

    #[test]
    fn test_restart_after_error() {
        let mut bus = device();
        let dev = bus.clone();
        dev.fail_frame(1, 10);
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        updater.set_image(image(500)).unwrap();
        let hooks = Hooks::attach(&mut updater);

        assert!(updater.flash().is_err());
        dev.fail_frame(1, 0);
        updater.flash().unwrap();

        assert_eq!(hooks.count("begin"), 2);
        assert_eq!(hooks.count("error"), 1);
        assert_eq!(updater.last_error(), None);
        assert_eq!(dev.received(), image_data(500));
        assert_eq!(dev.erase_requests(), 2);
    }

    #[test]
    fn test_observer_sees_state_sequence() {
        let mut bus = device();
        let recorder = Arc::new(Recorder::default());
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        updater.subscribe(recorder.clone());
        updater.set_image(image(500)).unwrap();

        updater.flash().unwrap();

        let events = recorder.0.lock().unwrap();
        let transitions: Vec<(DfuState, DfuState)> = events
            .iter()
            .filter_map(|e| match e {
                DfuEvent::StateChanged { from, to } => Some((*from, *to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (DfuState::Idle, DfuState::Erasing),
                (DfuState::Erasing, DfuState::Downloading),
                (DfuState::Downloading, DfuState::Verifying),
                (DfuState::Verifying, DfuState::Activating),
                (DfuState::Activating, DfuState::Ended),
            ]
        );
        let frames = events
            .iter()
            .filter(|e| matches!(e, DfuEvent::FrameSent { .. }))
            .count();
        assert_eq!(frames, 5);
        assert!(matches!(events.first(), Some(DfuEvent::Begin { total: 500, .. })));
        assert!(matches!(events.last(), Some(DfuEvent::End { version }) if *version == NEW));
    }

    #[test]
    fn test_version_check_and_conditional_update() {
        let mut bus = device();
        let dev = bus.clone();
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());

        let check = updater.check_version().unwrap();
        assert_eq!(check.device, OLD);
        assert!(!check.needs_update);

        updater.set_image(image(300)).unwrap();
        let check = updater.check_version().unwrap();
        assert!(check.needs_update);
        assert_eq!(check.image, Some(NEW));

        assert!(updater.update_if_needed().unwrap());
        assert_eq!(dev.version(), NEW);
        assert!(!updater.update_if_needed().unwrap());
        assert_eq!(dev.reboots(), 1);
    }

    #[test]
    fn test_configured_firmware_missing() {
        let mut bus = device();
        let mut updater = DfuUpdater::with_clock(&mut bus, config(120), ManualClock::new());
        let err = updater
            .load_configured_firmware(&StaticFetcher(Vec::new()))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Config);
        assert_eq!(updater.state(), DfuState::Idle);
    }
}
