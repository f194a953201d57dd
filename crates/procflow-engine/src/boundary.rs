use std::time::Duration;

use procflow_core::{
    ExecutionContext, Invocation, ProcflowError, SpanId, SpanStatus, TaskError,
};
use procflow_graph::{BoundaryPolicy, Fallback, Severity, TaskSpec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::interpreter::RunState;
use crate::saga::SagaEntry;
use crate::telemetry::OpenSpan;

/// One guarded task execution request.
pub(crate) struct GuardedTask {
    pub node_id: String,
    pub spec: TaskSpec,
    /// Context the attempts start from. Never mutated in place.
    pub context: ExecutionContext,
    pub parent: SpanId,
    pub branch: String,
    pub instance: Option<usize>,
    pub cancel: CancellationToken,
}

/// How a guarded task ended.
#[derive(Debug)]
pub(crate) enum BoundaryOutcome {
    /// The handler (or its alternate) succeeded; `context` holds its writes.
    Completed {
        context: ExecutionContext,
        value: serde_json::Value,
        degraded: bool,
    },
    /// Retries and fallback are exhausted.
    Failed {
        error: TaskError,
        severity: Severity,
    },
    /// Cancellation was observed at a suspension point.
    Cancelled,
}

/// Run a task node under its boundary policy.
///
/// Every attempt runs on a scratch copy of the context and gets its own
/// span; the copy is returned only on success.
pub(crate) async fn guard(state: &RunState, task: GuardedTask) -> BoundaryOutcome {
    let policy = task.spec.policy();
    let timeout = task
        .spec
        .timeout_ms
        .or(state.default_timeout_ms)
        .map(Duration::from_millis);

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if task.cancel.is_cancelled() {
            return BoundaryOutcome::Cancelled;
        }

        let invocation = Invocation {
            node_id: task.node_id.clone(),
            attempt,
            instance: task.instance,
            params: task.spec.config.clone(),
        };
        let mut span = attempt_span(&task, &task.spec.handler, attempt);
        let mut scratch = task.context.clone();

        debug!(node_id = %task.node_id, handler = %task.spec.handler, attempt, "Dispatching task");
        // Handlers run to completion; cancellation is observed between attempts.
        let result = state
            .registry
            .dispatch(&task.spec.handler, &mut scratch, &invocation, timeout)
            .await;

        let error = match result {
            Ok(value) => {
                span.set("boundary.attempts", attempt);
                span.set("boundary.outcome", if attempt > 1 { "recovered" } else { "ok" });
                commit(state, &task, &task.spec.handler, invocation, &mut scratch, &value);
                state.collector.close(span, SpanStatus::Ok);
                return BoundaryOutcome::Completed {
                    context: scratch,
                    value,
                    degraded: false,
                };
            }
            Err(e) => e,
        };

        span.set("error.kind", error.kind.as_str());
        span.set("error.message", error.message.as_str());

        if policy.is_retryable(&error.kind) && attempt <= policy.max_retries {
            let delay = policy.backoff.delay(attempt);
            span.set("boundary.outcome", "retry");
            span.set("boundary.backoff_ms", delay.as_millis() as u64);
            state.collector.close(span, SpanStatus::Error);
            warn!(
                node_id = %task.node_id,
                attempt,
                max_retries = policy.max_retries,
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying task"
            );
            tokio::select! {
                _ = task.cancel.cancelled() => return BoundaryOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
            continue;
        }

        span.set("boundary.attempts", attempt);
        span.set("boundary.severity", policy.severity.to_string());
        return exhausted(state, &task, &policy, span, error, attempt).await;
    }
}

/// Apply the fallback once retries are spent.
async fn exhausted(
    state: &RunState,
    task: &GuardedTask,
    policy: &BoundaryPolicy,
    mut span: OpenSpan,
    error: TaskError,
    attempt: u32,
) -> BoundaryOutcome {
    let failed = BoundaryOutcome::Failed {
        error: error.clone(),
        severity: policy.severity,
    };

    match &policy.fallback {
        Fallback::None => {
            span.set("boundary.outcome", "failed");
            state.collector.close(span, SpanStatus::Error);
            failed
        }
        Fallback::AlternateHandler { handler } => {
            span.set("boundary.outcome", "fallback");
            span.set("boundary.fallback", handler.as_str());
            state.collector.close(span, SpanStatus::Error);
            info!(node_id = %task.node_id, fallback = %handler, "Retries exhausted, invoking alternate handler");

            let invocation = Invocation {
                node_id: task.node_id.clone(),
                attempt: attempt + 1,
                instance: task.instance,
                params: task.spec.config.clone(),
            };
            let mut alt_span = attempt_span(task, handler, attempt + 1);
            alt_span.set("boundary.fallback", true);
            let mut scratch = task.context.clone();
            let timeout = task
                .spec
                .timeout_ms
                .or(state.default_timeout_ms)
                .map(Duration::from_millis);

            match state
                .registry
                .dispatch(handler, &mut scratch, &invocation, timeout)
                .await
            {
                Ok(value) => {
                    alt_span.set("boundary.outcome", "degraded");
                    commit(state, task, handler, invocation, &mut scratch, &value);
                    state.collector.close(alt_span, SpanStatus::Degraded);
                    BoundaryOutcome::Completed {
                        context: scratch,
                        value,
                        degraded: true,
                    }
                }
                Err(alt_error) => {
                    alt_span.set("boundary.outcome", "failed");
                    alt_span.set("error.kind", alt_error.kind.as_str());
                    alt_span.set("error.message", alt_error.message.as_str());
                    state.collector.close(alt_span, SpanStatus::Degraded);
                    warn!(node_id = %task.node_id, error = %alt_error, "Alternate handler failed");
                    failed
                }
            }
        }
        Fallback::Compensation => {
            let entries = state.saga.drain_branch(&task.branch);
            info!(
                node_id = %task.node_id,
                branch = %task.branch,
                count = entries.len(),
                "Retries exhausted, compensating branch"
            );
            let compensated = compensate(state, entries, span.id()).await;
            span.set("boundary.outcome", "compensated");
            span.set("boundary.compensations", compensated);
            state.collector.close(span, SpanStatus::Error);
            failed
        }
    }
}

/// Invoke `compensate` on each entry in the given order, once, without retries.
///
/// Failures are recorded and logged but never raised. Returns the node ids
/// that were compensated successfully.
pub(crate) async fn compensate(
    state: &RunState,
    entries: Vec<SagaEntry>,
    parent: &SpanId,
) -> Vec<String> {
    let mut compensated = Vec::new();
    for entry in entries {
        let mut span = OpenSpan::start(&entry.node_id, &entry.handler, Some(parent));
        span.set("compensation", true);
        span.set("compensation.of_attempt", entry.invocation.attempt);

        let outcome = match state.registry.get(&entry.handler) {
            Some(handler) => {
                handler
                    .compensate(&entry.context, &entry.result, &entry.invocation)
                    .await
            }
            None => Err(TaskError::permanent(format!(
                "handler '{}' is not registered",
                entry.handler
            ))),
        };
        match outcome {
            Ok(()) => {
                debug!(node_id = %entry.node_id, "Compensated task");
                state.collector.close(span, SpanStatus::Compensated);
                compensated.push(entry.node_id);
            }
            Err(e) => {
                warn!(node_id = %entry.node_id, error = %e, "Compensation failed");
                span.set("error.kind", e.kind.as_str());
                span.set("error.message", e.message.as_str());
                state.collector.close(span, SpanStatus::Error);
                state.record_compensation_failure(ProcflowError::Compensation {
                    node_id: entry.node_id,
                    message: e.to_string(),
                });
            }
        }
    }
    compensated
}

fn attempt_span(task: &GuardedTask, handler: &str, attempt: u32) -> OpenSpan {
    let mut span = OpenSpan::start(&task.node_id, handler, Some(&task.parent)).with_attempt(attempt);
    span.set("branch", task.branch.as_str());
    if let Some(i) = task.instance {
        span.set("instance", i);
    }
    span
}

/// Store the result and push the rollback entry for a success.
fn commit(
    state: &RunState,
    task: &GuardedTask,
    handler: &str,
    invocation: Invocation,
    scratch: &mut ExecutionContext,
    value: &serde_json::Value,
) {
    if let Some(key) = &task.spec.result_key {
        scratch.set(key.clone(), value.clone());
    }
    let compensable = state
        .registry
        .get(handler)
        .is_some_and(|h| h.compensable());
    if compensable {
        state.saga.push(
            &task.node_id,
            &task.branch,
            handler,
            invocation,
            scratch.clone(),
            value.clone(),
        );
    }
}
