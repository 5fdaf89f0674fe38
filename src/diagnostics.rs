//! Buffered diagnostics for sign-in handshakes.
//!
//! [`DiagnosticsLog`] is a bounded, shareable line buffer that request handlers
//! drain on demand. Messages flagged as containing personal data are never
//! written. Lines are tagged with the correlation id of the handshake that
//! produced them, when there is one.
//!
//! [`DiagnosticsLayer`] feeds `tracing` events from this crate into a
//! `DiagnosticsLog`; events carrying `pii = true` are skipped.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Default number of retained lines.
pub const DEFAULT_MAX_LINES: usize = 1000;

tokio::task_local! {
    static CORRELATION_ID: String;
}

/// Run `future` with `id` as the correlation id of every line it logs.
pub async fn with_correlation_id<F: Future>(id: impl Into<String>, future: F) -> F::Output {
    CORRELATION_ID.scope(id.into(), future).await
}

/// Synchronous counterpart of [`with_correlation_id`].
pub fn with_correlation_id_sync<R>(id: impl Into<String>, f: impl FnOnce() -> R) -> R {
    CORRELATION_ID.sync_scope(id.into(), f)
}

/// Correlation id of the current scope.
pub fn current_correlation_id() -> Option<String> {
    CORRELATION_ID.try_with(|id| id.clone()).ok()
}

#[derive(Debug)]
struct Buffer {
    lines: VecDeque<String>,
    max_lines: usize,
    evicted: u64,
}

/// Bounded diagnostics buffer. Clones share the same buffer.
#[derive(Debug, Clone)]
pub struct DiagnosticsLog {
    inner: Arc<Mutex<Buffer>>,
}

impl DiagnosticsLog {
    pub fn new() -> Self {
        Self::with_max_lines(DEFAULT_MAX_LINES)
    }

    /// Keep at most `max_lines` lines; the oldest are evicted first.
    pub fn with_max_lines(max_lines: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Buffer {
                lines: VecDeque::new(),
                max_lines: max_lines.max(1),
                evicted: 0,
            })),
        }
    }

    /// Append `message` unless it contains personal data.
    pub fn log(&self, level: Level, message: &str, contains_pii: bool) {
        if contains_pii {
            return;
        }

        let correlation_id = current_correlation_id().unwrap_or_default();
        let line = format!("{} - {} - {}", correlation_id, level, message);

        let mut buffer = self.lock();
        if buffer.lines.len() == buffer.max_lines {
            buffer.lines.pop_front();
            buffer.evicted += 1;
        }
        buffer.lines.push_back(line);
    }

    /// Take all buffered text, leaving the buffer empty.
    pub fn drain(&self) -> String {
        let lines = std::mem::take(&mut self.lock().lines);

        let mut text = String::new();
        for line in lines {
            let _ = writeln!(text, "{}", line);
        }
        text
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines dropped because the buffer was full.
    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DiagnosticsLog {
    fn default() -> Self {
        Self::new()
    }
}

/// `tracing` layer writing this crate's events into a [`DiagnosticsLog`].
#[derive(Debug, Clone)]
pub struct DiagnosticsLayer {
    log: DiagnosticsLog,
    target_prefix: &'static str,
}

impl DiagnosticsLayer {
    pub fn new(log: DiagnosticsLog) -> Self {
        Self {
            log,
            target_prefix: env!("CARGO_CRATE_NAME"),
        }
    }
}

impl<S: Subscriber> Layer<S> for DiagnosticsLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !metadata.target().starts_with(self.target_prefix) {
            return;
        }

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        self.log.log(*metadata.level(), &visitor.message, visitor.pii);
    }
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    pii: bool,
}

impl Visit for EventVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "pii" {
            self.pii = value;
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_pii_is_never_written() {
        let log = DiagnosticsLog::new();
        log.log(Level::ERROR, "user jane@contoso.com failed", true);
        assert!(log.is_empty());
        assert!(!log.drain().contains("jane@contoso.com"));
    }

    #[test]
    fn test_drain_returns_once() {
        let log = DiagnosticsLog::new();
        log.log(Level::INFO, "token acquired", false);

        let text = log.drain();
        assert_eq!(text.matches("token acquired").count(), 1);
        assert_eq!(text, " - INFO - token acquired\n");
        assert_eq!(log.drain(), "");
    }

    #[test]
    fn test_bounded() {
        let log = DiagnosticsLog::with_max_lines(2);
        log.log(Level::INFO, "one", false);
        log.log(Level::INFO, "two", false);
        log.log(Level::INFO, "three", false);

        assert_eq!(log.len(), 2);
        assert_eq!(log.evicted(), 1);
        let text = log.drain();
        assert!(!text.contains("one"));
        assert!(text.contains("two") && text.contains("three"));
    }

    #[tokio::test]
    async fn test_correlation_id_tags_lines() {
        let log = DiagnosticsLog::new();
        with_correlation_id("req-42", async {
            log.log(Level::WARN, "inside", false);
        })
        .await;
        log.log(Level::WARN, "outside", false);

        let text = log.drain();
        assert!(text.contains("req-42 - WARN - inside"));
        assert!(text.contains(" - WARN - outside"));
        assert!(current_correlation_id().is_none());
    }

    #[test]
    fn test_sync_correlation_scope() {
        let id = with_correlation_id_sync("req-7", current_correlation_id);
        assert_eq!(id.as_deref(), Some("req-7"));
    }

    #[test]
    fn test_concurrent_log_and_drain() {
        let log = DiagnosticsLog::with_max_lines(100_000);
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        log.log(Level::DEBUG, &format!("w{}-{}", w, i), false);
                    }
                })
            })
            .collect();

        let mut drained = String::new();
        for _ in 0..50 {
            drained.push_str(&log.drain());
        }
        for writer in writers {
            writer.join().unwrap();
        }
        drained.push_str(&log.drain());

        // Every line arrives whole, exactly once
        let lines: Vec<&str> = drained.lines().collect();
        assert_eq!(lines.len(), 2000);
        assert!(lines.iter().all(|l| l.starts_with(" - DEBUG - w")));
    }

    #[test]
    fn test_layer_forwards_crate_events() {
        let log = DiagnosticsLog::new();
        let subscriber = tracing_subscriber::registry().with(DiagnosticsLayer::new(log.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("redeemed code");
            tracing::info!(pii = true, "signed in as jane@contoso.com");
            tracing::info!(target: "hyper", "connection closed");
        });

        let text = log.drain();
        assert!(text.contains("INFO - redeemed code"));
        assert!(!text.contains("jane@contoso.com"));
        assert!(!text.contains("connection closed"));
    }
}
