//! Event system for UI decoupling.
//!
//! Two layers: the four update hooks (`begin`, `progress`, `end`, `error`)
//! that integrations register closures on, and a `DfuObserver` stream that
//! sees every event the updater produces, for logging and front-ends.

use std::fmt;
use std::sync::Arc;

use crate::error::ErrorCode;
use crate::firmware::FirmwareVersion;
use crate::state::DfuState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted by the updater.
#[derive(Debug, Clone, PartialEq)]
pub enum DfuEvent {
    /// An update session started.
    Begin { total: u32, version: FirmwareVersion },
    /// State machine transition.
    StateChanged { from: DfuState, to: DfuState },
    /// Bytes acknowledged by the bus so far.
    Progress { fraction: f32, offset: u32, total: u32 },
    /// A DNLOAD frame was written.
    FrameSent { sequence: u16, len: usize },
    /// A failed request will be attempted again.
    Retry {
        operation: String,
        attempt: u32,
        max_attempts: u32,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Device is running the new image.
    End { version: FirmwareVersion },
    /// The session failed.
    Error { code: ErrorCode, message: String },
}

/// Observer trait for receiving updater events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait DfuObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DfuEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DfuObserver for NullObserver {
    fn on_event(&self, _event: &DfuEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DfuObserver for TracingObserver {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::Begin { total, version } => {
                tracing::info!(bytes = total, version = %version, "Update started");
            }
            DfuEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "State changed");
            }
            DfuEvent::Progress {
                fraction,
                offset,
                total,
            } => {
                tracing::debug!(
                    offset = offset,
                    total = total,
                    progress = %format!("{:.1}%", fraction * 100.0),
                    "Progress"
                );
            }
            DfuEvent::FrameSent { sequence, len } => {
                tracing::trace!(seq = sequence, len = len, "Frame sent");
            }
            DfuEvent::Retry {
                operation,
                attempt,
                max_attempts,
            } => {
                tracing::warn!(attempt = attempt, max = max_attempts, "Retrying {}", operation);
            }
            DfuEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            DfuEvent::End { version } => {
                tracing::info!(version = %version, "Update complete");
            }
            DfuEvent::Error { code, message } => {
                tracing::error!(code = %code, "Error: {}", message);
            }
        }
    }
}

type Hook = Box<dyn FnMut() + Send>;
type ProgressHook = Box<dyn FnMut(f32) + Send>;
type ErrorHook = Box<dyn FnMut(ErrorCode) + Send>;

/// Fans updater events out to registered hooks and observers.
///
/// Hooks run synchronously, in registration order, on the thread that polls
/// the updater. Progress never goes backwards within a session: a value below
/// the last delivered one is dropped.
#[derive(Default)]
pub struct EventNotifier {
    begin: Vec<Hook>,
    progress: Vec<ProgressHook>,
    end: Vec<Hook>,
    error: Vec<ErrorHook>,
    observers: Vec<Arc<dyn DfuObserver>>,
    last_progress: Option<f32>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_begin<F: FnMut() + Send + 'static>(&mut self, hook: F) {
        self.begin.push(Box::new(hook));
    }

    pub fn on_progress<F: FnMut(f32) + Send + 'static>(&mut self, hook: F) {
        self.progress.push(Box::new(hook));
    }

    pub fn on_end<F: FnMut() + Send + 'static>(&mut self, hook: F) {
        self.end.push(Box::new(hook));
    }

    pub fn on_error<F: FnMut(ErrorCode) + Send + 'static>(&mut self, hook: F) {
        self.error.push(Box::new(hook));
    }

    pub fn subscribe(&mut self, observer: Arc<dyn DfuObserver>) {
        self.observers.push(observer);
    }

    /// Forward an event to observers only.
    pub fn emit(&self, event: DfuEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(DfuEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub fn begin(&mut self, total: u32, version: FirmwareVersion) {
        self.last_progress = None;
        self.emit(DfuEvent::Begin { total, version });
        for hook in &mut self.begin {
            hook();
        }
    }

    /// Report `offset` of `total` bytes transferred.
    ///
    /// Returns `false` when the value was dropped as a regression.
    pub fn progress(&mut self, offset: u32, total: u32) -> bool {
        let fraction = if total == 0 {
            1.0
        } else {
            (f64::from(offset) / f64::from(total)).clamp(0.0, 1.0) as f32
        };
        if self.last_progress.is_some_and(|last| fraction < last) {
            return false;
        }
        self.last_progress = Some(fraction);
        self.emit(DfuEvent::Progress {
            fraction,
            offset,
            total,
        });
        for hook in &mut self.progress {
            hook(fraction);
        }
        true
    }

    pub fn end(&mut self, version: FirmwareVersion) {
        self.emit(DfuEvent::End { version });
        for hook in &mut self.end {
            hook();
        }
    }

    pub fn error(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.emit(DfuEvent::Error {
            code,
            message: message.into(),
        });
        for hook in &mut self.error {
            hook(code);
        }
    }

    /// Last progress value delivered in the current session.
    pub fn last_progress(&self) -> Option<f32> {
        self.last_progress
    }
}

impl fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventNotifier")
            .field("begin", &self.begin.len())
            .field("progress", &self.progress.len())
            .field("end", &self.end.len())
            .field("error", &self.error.len())
            .field("observers", &self.observers.len())
            .field("last_progress", &self.last_progress)
            .finish()
    }
}
