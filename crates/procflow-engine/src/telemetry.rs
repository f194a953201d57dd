use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use procflow_core::{Span, SpanId, SpanSink, SpanStatus};
use tokio::sync::broadcast;

/// A span that has started but not yet closed.
///
/// Its id is fixed at creation so children can reference it while it is
/// still open. It becomes an immutable [`Span`] when handed to
/// [`TelemetryCollector::close`].
#[derive(Debug)]
pub struct OpenSpan {
    id: SpanId,
    parent_id: Option<SpanId>,
    node_id: String,
    task_kind: String,
    attempt: u32,
    started_at: DateTime<Utc>,
    attributes: BTreeMap<String, serde_json::Value>,
}

impl OpenSpan {
    pub fn start(
        node_id: impl Into<String>,
        task_kind: impl Into<String>,
        parent: Option<&SpanId>,
    ) -> Self {
        Self {
            id: SpanId::new(),
            parent_id: parent.cloned(),
            node_id: node_id.into(),
            task_kind: task_kind.into(),
            attempt: 0,
            started_at: Utc::now(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn id(&self) -> &SpanId {
        &self.id
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.attributes.insert(key.into(), value.into());
    }
}

struct CollectorState {
    spans: Vec<Span>,
    next_seq: u64,
}

/// Append-only store of closed spans for one run.
///
/// Appends from concurrent branches are serialized under one lock, which
/// also assigns `seq`, so sinks and subscribers observe spans in `seq` order.
pub struct TelemetryCollector {
    state: Mutex<CollectorState>,
    sinks: RwLock<Vec<Arc<dyn SpanSink>>>,
    tx: broadcast::Sender<Span>,
}

impl TelemetryCollector {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(CollectorState {
                spans: Vec::new(),
                next_seq: 0,
            }),
            sinks: RwLock::new(Vec::new()),
            tx,
        }
    }

    /// Register a callback invoked once per closed span.
    pub fn add_sink(&self, sink: Arc<dyn SpanSink>) {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    /// Receive every span closed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Span> {
        self.tx.subscribe()
    }

    /// Close a span with its terminal status and append it.
    pub fn close(&self, open: OpenSpan, status: SpanStatus) -> Span {
        let ended_at = Utc::now().max(open.started_at);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let span = Span {
            id: open.id,
            seq: state.next_seq,
            parent_id: open.parent_id,
            node_id: open.node_id,
            task_kind: open.task_kind,
            attempt: open.attempt,
            started_at: open.started_at,
            ended_at,
            status,
            attributes: open.attributes,
        };
        state.next_seq += 1;
        state.spans.push(span.clone());

        // Still under the lock: delivery order matches seq order.
        for sink in self
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            sink.on_span(&span);
        }
        // Ignore error if no receivers
        let _ = self.tx.send(span.clone());

        span
    }

    /// Snapshot of every span appended so far, in `seq` order.
    pub fn spans(&self) -> Vec<Span> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spans
            .clone()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spans
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new(256)
    }
}
