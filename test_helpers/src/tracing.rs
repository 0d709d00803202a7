//! Capture `tracing` events so tests can assert on what was logged.
use std::{fmt, sync::Arc};

use observability_deps::tracing::{
    self,
    field::{Field, Visit},
    span::{Attributes, Id, Record},
    subscriber::{DefaultGuard, Subscriber},
    Event, Metadata,
};
use parking_lot::Mutex;

/// A single captured event: `level`, `message` and every structured field, in emission order.
pub type LogLine = Vec<(String, String)>;

type SharedLogLines = Arc<Mutex<Vec<LogLine>>>;

/// Captures `tracing` events emitted on the current thread.
///
/// The capture is installed as the thread-local default subscriber on creation and uninstalled
/// when dropped. Use a current-thread runtime (plain `#[tokio::test]`) so that spawned tasks log
/// on the capturing thread.
#[derive(Debug)]
pub struct TracingCapture {
    lines: SharedLogLines,
    _guard: DefaultGuard,
}

impl TracingCapture {
    /// Create a new capture and register it for the current thread.
    #[expect(clippy::new_without_default)]
    #[must_use]
    pub fn new() -> Self {
        let lines = SharedLogLines::default();
        let subscriber = CaptureSubscriber {
            lines: Arc::clone(&lines),
        };
        let _guard = tracing::subscriber::set_default(subscriber);

        Self { lines, _guard }
    }

    /// All captured lines.
    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().clone()
    }

    /// Captured `message` fields, in order.
    pub fn messages(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter_map(|line| {
                line.into_iter()
                    .find_map(|(k, v)| (k == "message").then_some(v))
            })
            .collect()
    }

    /// Returns true if any line contains all of the given `key = value` pairs.
    pub fn contains(&self, pairs: &[(&str, &str)]) -> bool {
        self.lines().iter().any(|line| {
            pairs
                .iter()
                .all(|(key, value)| line.iter().any(|(k, v)| k == key && v == value))
        })
    }
}

impl fmt::Display for TracingCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.lines() {
            for (k, v) in line {
                write!(f, "{k} = {v}; ")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

struct CaptureSubscriber {
    lines: SharedLogLines,
}

impl Subscriber for CaptureSubscriber {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn new_span(&self, _span: &Attributes<'_>) -> Id {
        Id::from_u64(1)
    }

    fn record(&self, _span: &Id, _values: &Record<'_>) {}

    fn record_follows_from(&self, _span: &Id, _follows: &Id) {}

    fn event(&self, event: &Event<'_>) {
        let mut visitor = LineVisitor::default();
        visitor
            .line
            .push(("level".to_owned(), event.metadata().level().to_string()));
        event.record(&mut visitor);
        self.lines.lock().push(visitor.line);
    }

    fn enter(&self, _span: &Id) {}

    fn exit(&self, _span: &Id) {}
}

#[derive(Debug, Default)]
struct LineVisitor {
    line: LogLine,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.line.push((field.name().to_owned(), value.to_owned()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.line
            .push((field.name().to_owned(), format!("{value:?}")));
    }
}
