use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use procflow_core::{ExecutionContext, Invocation, TaskError, TaskHandler};

/// Always succeeds with a fixed output.
pub struct SucceedHandler {
    name: String,
    output: serde_json::Value,
    calls: AtomicU32,
}

impl SucceedHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_output(name, serde_json::json!("ok"))
    }

    pub fn with_output(name: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            output,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TaskHandler for SucceedHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a mut ExecutionContext,
        _invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<serde_json::Value, TaskError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let output = self.output.clone();
        Box::pin(async move { Ok(output) })
    }
}

/// Fails the first `failures` calls with `kind`, then succeeds.
pub struct FlakyHandler {
    name: String,
    failures: u32,
    kind: String,
    calls: AtomicU32,
}

impl FlakyHandler {
    pub fn new(name: impl Into<String>, failures: u32) -> Self {
        Self {
            name: name.into(),
            failures,
            kind: TaskError::TRANSIENT.to_string(),
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TaskHandler for FlakyHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a mut ExecutionContext,
        _invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<serde_json::Value, TaskError>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move {
            if call <= self.failures {
                Err(TaskError::new(
                    self.kind.clone(),
                    format!("flaky failure {}", call),
                ))
            } else {
                Ok(serde_json::json!({ "call": call }))
            }
        })
    }
}

/// Fails every call.
pub struct FailingHandler {
    name: String,
    kind: String,
    calls: AtomicU32,
}

impl FailingHandler {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TaskHandler for FailingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a mut ExecutionContext,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<serde_json::Value, TaskError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            Err(TaskError::new(
                self.kind.clone(),
                format!("{} always fails", invocation.node_id),
            ))
        })
    }
}

/// Shared, ordered log of what a [`RecordingHandler`] did.
pub type Journal = Arc<Mutex<Vec<String>>>;

/// Compensable handler that records executions and rollbacks.
///
/// Executions are logged as `run:<node>`, compensations as `undo:<node>`.
/// Each execution also writes `<node>.done = true` into the context.
pub struct RecordingHandler {
    name: String,
    journal: Journal,
    fail_compensation: bool,
}

impl RecordingHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            journal: Arc::new(Mutex::new(Vec::new())),
            fail_compensation: false,
        }
    }

    /// Share a journal with other handlers to observe global ordering.
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    pub fn failing_compensation(mut self) -> Self {
        self.fail_compensation = true;
        self
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }

    /// Nodes compensated so far, in call order.
    pub fn compensated(&self) -> Vec<String> {
        self.journal()
            .into_iter()
            .filter_map(|e| e.strip_prefix("undo:").map(str::to_string))
            .collect()
    }

    fn record(&self, entry: String) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(entry);
        }
    }
}

impl TaskHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<serde_json::Value, TaskError>> {
        Box::pin(async move {
            self.record(format!("run:{}", invocation.node_id));
            ctx.set(format!("{}.done", invocation.node_id), serde_json::json!(true));
            Ok(serde_json::json!(invocation.node_id))
        })
    }

    fn compensable(&self) -> bool {
        true
    }

    fn compensate<'a>(
        &'a self,
        _ctx: &'a ExecutionContext,
        _prior: &'a serde_json::Value,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<(), TaskError>> {
        Box::pin(async move {
            self.record(format!("undo:{}", invocation.node_id));
            if self.fail_compensation {
                Err(TaskError::permanent("rollback refused"))
            } else {
                Ok(())
            }
        })
    }
}

/// Sleeps before succeeding. Tracks whether any call ran to completion.
pub struct SlowHandler {
    name: String,
    delay: Duration,
    finished: AtomicBool,
}

impl SlowHandler {
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            finished: AtomicBool::new(false),
        }
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl TaskHandler for SlowHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a mut ExecutionContext,
        _invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<serde_json::Value, TaskError>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(serde_json::json!("slow"))
        })
    }
}

/// Returns the value at a context path (`path` param, default `item`).
///
/// Fails with `kind = "bad_item"` when the value equals the `fail_on`
/// param, which makes single multi-instance elements fail on demand.
pub struct EchoHandler;

impl TaskHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<serde_json::Value, TaskError>> {
        Box::pin(async move {
            let path = invocation
                .param("path")
                .and_then(|v| v.as_str())
                .unwrap_or("item");
            let value = ctx.lookup(path).cloned().unwrap_or(serde_json::Value::Null);
            if invocation.param("fail_on") == Some(&value) {
                return Err(TaskError::new("bad_item", format!("refusing {}", value)));
            }
            Ok(value)
        })
    }
}
