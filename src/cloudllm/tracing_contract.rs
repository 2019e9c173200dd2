//! Structured tracing for a single task's execution.
//!
//! Every step-loop round opens one span named `"@<agent> Round R/N"` and the
//! span is guaranteed to close on every exit path — normal completion,
//! early termination, or a propagated error — so a trace reader never sees
//! a round that started but never ended. Spans nest via a task-local
//! current-span slot rather than a global registry, so concurrent tasks in
//! the same orchestrator run don't interleave each other's spans.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;

tokio::task_local! {
    static CURRENT_SPAN: std::cell::RefCell<Vec<SpanContext>>;
}

static NEXT_SPAN_ID: AtomicU64 = AtomicU64::new(1);

fn next_span_id() -> u64 {
    NEXT_SPAN_ID.fetch_add(1, Ordering::Relaxed)
}

/// One recorded point-in-time fact attached to a span: a tool call, a retry,
/// an overflow action, anything worth replaying later.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub name: String,
    pub payload: Value,
    pub at: Duration,
}

/// Identifies a span and its position in the current task's span stack.
#[derive(Debug, Clone)]
pub struct SpanContext {
    pub span_id: u64,
    pub parent_span_id: Option<u64>,
    pub task_id: String,
    pub name: String,
}

/// One finished or in-flight unit of traced work.
#[derive(Debug, Clone)]
pub struct Span {
    pub context: SpanContext,
    started_at: Instant,
    pub events: Vec<TraceEvent>,
    pub duration: Option<Duration>,
    pub error: Option<String>,
}

impl Span {
    fn new(context: SpanContext) -> Self {
        Span {
            context,
            started_at: Instant::now(),
            events: Vec::new(),
            duration: None,
            error: None,
        }
    }

    fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// A guard returned by [`start_span`]. Dropping it (including via an early
/// `?` return or a panic unwind) records the span's end; calling
/// [`SpanGuard::finish`]/[`SpanGuard::finish_with_error`] explicitly lets the
/// caller attach an outcome before that happens.
pub struct SpanGuard {
    span: Option<Span>,
    sink: SharedSpanSink,
}

/// Where completed spans are delivered. Kept as a trait object so tests can
/// capture spans in memory while production wiring can forward them to a
/// log sink or an exporter without this module depending on either.
pub trait SpanSink: Send + Sync {
    fn record(&self, span: Span);
}

/// A sink that simply logs each finished span via the `log` crate, at
/// `debug` level for a clean span and `warn` for one that recorded an
/// error. The default wired into a fresh runner.
#[derive(Clone, Default)]
pub struct LoggingSpanSink;

impl SpanSink for LoggingSpanSink {
    fn record(&self, span: Span) {
        let duration_ms = span.duration.map(|d| d.as_millis()).unwrap_or(0);
        match &span.error {
            Some(err) => log::warn!(
                "@tracing span '{}' (task {}) failed after {}ms: {}",
                span.context.name,
                span.context.task_id,
                duration_ms,
                err
            ),
            None => log::debug!(
                "@tracing span '{}' (task {}) finished in {}ms with {} event(s)",
                span.context.name,
                span.context.task_id,
                duration_ms,
                span.events.len()
            ),
        }
    }
}

/// Concrete sink handle threaded through [`start_span`]; an `Arc<dyn
/// SpanSink>` so cloning is cheap and shared across concurrently running
/// spans.
pub type SharedSpanSink = std::sync::Arc<dyn SpanSink>;

fn default_sink() -> SharedSpanSink {
    std::sync::Arc::new(LoggingSpanSink)
}

/// Open a span under the task-local current span (if any), scoped to
/// `task_id`. Must be called from within [`with_task_scope`]'s future.
pub fn start_span(task_id: impl Into<String>, name: impl Into<String>, sink: SharedSpanSink) -> SpanGuard {
    let task_id = task_id.into();
    let parent_span_id = CURRENT_SPAN
        .try_with(|stack| stack.borrow().last().map(|s| s.span_id))
        .unwrap_or(None);
    let context = SpanContext {
        span_id: next_span_id(),
        parent_span_id,
        task_id,
        name: name.into(),
    };
    let _ = CURRENT_SPAN.try_with(|stack| stack.borrow_mut().push(context.clone()));
    SpanGuard {
        span: Some(Span::new(context)),
        sink,
    }
}

/// Establish the task-local span stack for the duration of `fut`. The
/// runner calls this once per task so every span opened inside, at any
/// nesting depth, shares one stack.
pub async fn with_task_scope<F: std::future::Future>(fut: F) -> F::Output {
    CURRENT_SPAN.scope(std::cell::RefCell::new(Vec::new()), fut).await
}

impl SpanGuard {
    /// Attach a traced event to the still-open span.
    pub fn record_event(&mut self, name: impl Into<String>, payload: Value) {
        if let Some(span) = self.span.as_mut() {
            span.events.push(TraceEvent {
                name: name.into(),
                payload,
                at: span.elapsed(),
            });
        }
    }

    /// Close the span successfully.
    pub fn finish(mut self) {
        self.close(None);
    }

    /// Close the span with a recorded error, without panicking or losing
    /// the event log gathered so far.
    pub fn finish_with_error(mut self, error: impl Into<String>) {
        self.close(Some(error.into()));
    }

    fn close(&mut self, error: Option<String>) {
        if let Some(mut span) = self.span.take() {
            span.duration = Some(span.elapsed());
            span.error = error;
            let _ = CURRENT_SPAN.try_with(|stack| {
                let mut stack = stack.borrow_mut();
                if stack.last().map(|s| s.span_id) == Some(span.context.span_id) {
                    stack.pop();
                }
            });
            self.sink.record(span);
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        // Guarantees span-close-on-every-exit-path: a `?` early return or an
        // unwinding panic still reaches here and records the span, just
        // without an explicit outcome.
        if self.span.is_some() {
            self.close(None);
        }
    }
}

/// Convenience for a default-configured logging sink.
pub fn default_span_sink() -> SharedSpanSink {
    default_sink()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct CapturingSink {
        spans: StdMutex<Vec<Span>>,
    }

    impl SpanSink for std::sync::Arc<CapturingSink> {
        fn record(&self, span: Span) {
            self.spans.lock().unwrap().push(span);
        }
    }

    #[tokio::test]
    async fn span_records_on_explicit_finish() {
        let sink = std::sync::Arc::new(CapturingSink::default());
        with_task_scope(async {
            let mut span = start_span("t1", "@agent Round 1/8", sink.clone());
            span.record_event("tool_call", serde_json::json!({"name": "search"}));
            span.finish();
        })
        .await;
        let spans = sink.spans.lock().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].context.name, "@agent Round 1/8");
        assert_eq!(spans[0].events.len(), 1);
        assert!(spans[0].error.is_none());
    }

    #[tokio::test]
    async fn span_records_on_drop_without_explicit_finish() {
        let sink = std::sync::Arc::new(CapturingSink::default());
        with_task_scope(async {
            let _span = start_span("t1", "@agent Round 1/8", sink.clone());
            // dropped here without calling finish()
        })
        .await;
        assert_eq!(sink.spans.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn nested_spans_record_parent_span_id() {
        let sink = std::sync::Arc::new(CapturingSink::default());
        with_task_scope(async {
            let outer = start_span("t1", "outer", sink.clone());
            let inner = start_span("t1", "inner", sink.clone());
            inner.finish();
            outer.finish();
        })
        .await;
        let spans = sink.spans.lock().unwrap();
        assert_eq!(spans.len(), 2);
        let inner = spans.iter().find(|s| s.context.name == "inner").unwrap();
        let outer = spans.iter().find(|s| s.context.name == "outer").unwrap();
        assert_eq!(inner.context.parent_span_id, Some(outer.context.span_id));
    }
}
