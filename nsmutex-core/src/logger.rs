//! Leveled log callback.
//!
//! The crate logs through `tracing`. Hosts that want plain
//! `(level, line)` callbacks instead, such as a C caller or a GUI log pane,
//! install [`CallbackLayer`] and register a function on the returned
//! [`LoggerHandle`]. Until one is registered the layer discards
//! everything. Only INFO, WARN and ERROR events are forwarded.

use std::fmt::{self, Write};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Severity of a forwarded log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Err,
}

impl LogLevel {
    fn from_tracing(level: &Level) -> Option<Self> {
        match *level {
            Level::ERROR => Some(Self::Err),
            Level::WARN => Some(Self::Warn),
            Level::INFO => Some(Self::Info),
            _ => None,
        }
    }
}

/// A registered log sink.
pub type LoggerCallback = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

type Sink = Arc<RwLock<Option<LoggerCallback>>>;

/// Controls the callback of a [`CallbackLayer`] after installation.
#[derive(Clone)]
pub struct LoggerHandle {
    sink: Sink,
}

impl LoggerHandle {
    /// Route subsequent log lines to `callback`, replacing any previous one.
    pub fn set_logger<F>(&self, callback: F)
    where
        F: Fn(LogLevel, &str) + Send + Sync + 'static,
    {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Go back to discarding log lines.
    pub fn clear(&self) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl fmt::Debug for LoggerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = self
            .sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        f.debug_struct("LoggerHandle").field("callback_set", &set).finish()
    }
}

/// `tracing` layer forwarding events to a [`LoggerCallback`].
pub struct CallbackLayer {
    sink: Sink,
}

impl CallbackLayer {
    /// Create a layer with no callback, plus the handle that sets one.
    pub fn new() -> (Self, LoggerHandle) {
        let sink: Sink = Arc::new(RwLock::new(None));
        (
            Self {
                sink: Arc::clone(&sink),
            },
            LoggerHandle { sink },
        )
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn into_line(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} ({})", self.message, self.fields.trim_start())
        }
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for CallbackLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(level) = LogLevel::from_tracing(event.metadata().level()) else {
            return;
        };
        let callback = match &*self.sink.read().unwrap_or_else(PoisonError::into_inner) {
            Some(callback) => Arc::clone(callback),
            None => return,
        };

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        callback(level, &visitor.into_line());
    }
}
