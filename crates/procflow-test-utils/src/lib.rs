//! Shared test utilities: scripted handlers, a recording span sink and
//! definition fixtures.

pub mod fixtures;
pub mod handlers;

use std::sync::Mutex;

use procflow_core::{Span, SpanSink};

pub use fixtures::{exclusive, linear, parallel, single_task, temp_dir, DefinitionBuilder};
pub use handlers::{
    EchoHandler, FailingHandler, FlakyHandler, Journal, RecordingHandler, SlowHandler,
    SucceedHandler,
};

/// Span sink that keeps every span it sees.
#[derive(Default)]
pub struct RecordingSink {
    spans: Mutex<Vec<Span>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl SpanSink for RecordingSink {
    fn on_span(&self, span: &Span) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.push(span.clone());
        }
    }
}
