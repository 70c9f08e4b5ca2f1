//! Capturing tracing output in memory so tests can assert on what was
//! logged.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// One recorded event.
#[derive(Clone, Debug)]
pub struct LogRecord {
    /// Event level.
    pub level: Level,
    /// Module path the event came from.
    pub target: String,
    /// The `message` field, empty if the event had none.
    pub message: String,
    /// Every other field, rendered as text. Strings are unquoted.
    pub fields: BTreeMap<String, String>,
}

/// Shared handle to the records collected by [`capture_logs`].
#[derive(Clone, Default)]
pub struct LogCapture {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl LogCapture {
    /// Copy of everything recorded so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Records at exactly `level`.
    pub fn at(&self, level: Level) -> Vec<LogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.level == level)
            .cloned()
            .collect()
    }

    /// Whether some record at `level` has a message containing `needle`.
    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|r| r.level == level && r.message.contains(needle))
    }

    /// Values logged under field `name`, in order.
    pub fn field_values(&self, name: &str) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| r.fields.get(name).cloned())
            .collect()
    }
}

#[derive(Default)]
struct Collect {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Collect {
    fn put(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            let _ = self.fields.insert(field.name().to_owned(), value);
        }
    }
}

impl Visit for Collect {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, format!("{value:?}"));
    }
}

struct CaptureLayer(LogCapture);

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _: Context<'_, S>) {
        let mut collect = Collect::default();
        event.record(&mut collect);
        let meta = event.metadata();
        self.0.records.lock().push(LogRecord {
            level: *meta.level(),
            target: meta.target().to_owned(),
            message: collect.message,
            fields: collect.fields,
        });
    }
}

/// Route this thread's events, at every level, into a fresh [`LogCapture`]
/// until the guard drops.
///
/// Thread-local, so parallel tests do not see each other's events. For
/// `#[tokio::test]` this covers the test body on the default
/// current-thread runtime.
pub fn capture_logs() -> (LogCapture, DefaultGuard) {
    let capture = LogCapture::default();
    let guard = tracing_subscriber::registry()
        .with(CaptureLayer(capture.clone()))
        .set_default();
    (capture, guard)
}
