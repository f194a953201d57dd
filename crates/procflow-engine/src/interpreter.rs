use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{join_all, BoxFuture};
use procflow_core::{
    span_kind, ExecutionContext, ProcflowError, Result, SpanId, SpanStatus, TaskError,
};
use procflow_graph::{Completion, MultiInstanceSpec, Node, NodeKind, ProcessDefinition, Severity};
use procflow_tasks::TaskRegistry;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::boundary::{self, BoundaryOutcome, GuardedTask};
use crate::saga::SagaStack;
use crate::telemetry::{OpenSpan, TelemetryCollector};

/// Everything one run shares across its branches.
pub(crate) struct RunState {
    pub definition: Arc<ProcessDefinition>,
    pub registry: Arc<TaskRegistry>,
    pub collector: Arc<TelemetryCollector>,
    pub saga: SagaStack,
    pub cancel: CancellationToken,
    pub default_timeout_ms: Option<u64>,
    pub max_instance_concurrency: usize,
    compensation_failures: Mutex<Vec<ProcflowError>>,
}

impl RunState {
    pub fn new(
        definition: Arc<ProcessDefinition>,
        registry: Arc<TaskRegistry>,
        collector: Arc<TelemetryCollector>,
        cancel: CancellationToken,
        default_timeout_ms: Option<u64>,
        max_instance_concurrency: usize,
    ) -> Self {
        Self {
            definition,
            registry,
            collector,
            saga: SagaStack::new(),
            cancel,
            default_timeout_ms,
            max_instance_concurrency,
            compensation_failures: Mutex::new(Vec::new()),
        }
    }

    /// Signal every branch to stop at its next suspension point.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn record_compensation_failure(&self, err: ProcflowError) {
        self.compensation_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(err);
    }

    pub fn take_compensation_failures(&self) -> Vec<ProcflowError> {
        std::mem::take(
            &mut *self
                .compensation_failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

/// Where a walk stops, and what its spans and rollback entries hang under.
#[derive(Debug, Clone)]
pub(crate) struct Scope {
    /// Branch path, `main` for the top level.
    pub branch: String,
    pub parent: SpanId,
    /// Join gateway that ends this branch.
    pub stop_at: Option<String>,
}

/// A walk that stopped early, with the context as it was at that point.
#[derive(Debug)]
pub(crate) struct Aborted {
    pub error: ProcflowError,
    pub context: ExecutionContext,
}

pub(crate) type WalkResult = std::result::Result<ExecutionContext, Aborted>;

enum Step {
    Next(String),
    Done,
}

/// Execute the definition from its start node.
pub(crate) async fn execute(
    state: Arc<RunState>,
    initial: ExecutionContext,
    root: &SpanId,
) -> WalkResult {
    let start = state.definition.start_node().id.clone();
    let scope = Scope {
        branch: "main".to_string(),
        parent: root.clone(),
        stop_at: None,
    };
    walk(state, initial, start, scope).await
}

/// Follow flows from `from` until an end node or the scope's join.
///
/// Boxed so parallel branches can recurse into it and be spawned.
fn walk(
    state: Arc<RunState>,
    ctx: ExecutionContext,
    from: String,
    scope: Scope,
) -> BoxFuture<'static, WalkResult> {
    Box::pin(async move {
        let definition = state.definition.clone();
        let mut ctx = ctx;
        let mut current = from;

        loop {
            if scope.stop_at.as_deref() == Some(current.as_str()) {
                return Ok(ctx);
            }
            if state.cancel.is_cancelled() {
                debug!(branch = %scope.branch, node_id = %current, "Branch observed cancellation");
                return Err(Aborted {
                    error: ProcflowError::Cancelled,
                    context: ctx,
                });
            }

            let Some(node) = definition.node(&current) else {
                state.abort();
                return Err(Aborted {
                    error: ProcflowError::Definition(format!("unknown node '{}'", current)),
                    context: ctx,
                });
            };
            debug!(node_id = %node.id, kind = node.kind.label(), branch = %scope.branch, "Entering node");

            match step(&state, node, &mut ctx, &scope).await {
                Ok(Step::Next(next)) => current = next,
                Ok(Step::Done) => return Ok(ctx),
                Err(error) => {
                    state.abort();
                    return Err(Aborted {
                        error,
                        context: ctx,
                    });
                }
            }
        }
    })
}

async fn step(
    state: &Arc<RunState>,
    node: &Node,
    ctx: &mut ExecutionContext,
    scope: &Scope,
) -> Result<Step> {
    match &node.kind {
        NodeKind::Start => follow(&state.definition, &node.id),
        NodeKind::End => Ok(Step::Done),
        NodeKind::Task(spec) => {
            let task = GuardedTask {
                node_id: node.id.clone(),
                spec: spec.clone(),
                context: ctx.clone(),
                parent: scope.parent.clone(),
                branch: scope.branch.clone(),
                instance: None,
                cancel: state.cancel.clone(),
            };
            match boundary::guard(state, task).await {
                BoundaryOutcome::Completed {
                    context, degraded, ..
                } => {
                    if degraded {
                        info!(node_id = %node.id, "Task completed through its fallback");
                    }
                    *ctx = context;
                    follow(&state.definition, &node.id)
                }
                BoundaryOutcome::Failed { error, severity } => {
                    route_failure(state, node, ctx, error, severity)
                }
                BoundaryOutcome::Cancelled => Err(ProcflowError::Cancelled),
            }
        }
        NodeKind::ExclusiveGateway => choose(state, node, ctx, scope),
        NodeKind::ParallelGateway => {
            if state.definition.is_split(node) {
                fork(state, node, ctx, scope).await
            } else {
                follow(&state.definition, &node.id)
            }
        }
        NodeKind::MultiInstance(mi) => fan_out(state, node, mi, ctx, scope).await,
    }
}

fn follow(definition: &ProcessDefinition, node_id: &str) -> Result<Step> {
    definition
        .next_flow(node_id)
        .map(|flow| Step::Next(flow.target.clone()))
        .ok_or_else(|| ProcflowError::Definition(format!("node '{}' has no outgoing flow", node_id)))
}

/// Take the error flow for a non-critical failure, or abort.
fn route_failure(
    state: &RunState,
    node: &Node,
    ctx: &mut ExecutionContext,
    error: TaskError,
    severity: Severity,
) -> Result<Step> {
    if severity < Severity::Critical {
        if let Some(flow) = state.definition.error_flow(&node.id) {
            warn!(
                node_id = %node.id,
                error = %error,
                target = %flow.target,
                "Task failed, taking error flow"
            );
            ctx.set(
                format!("{}.error", node.id),
                serde_json::Value::String(error.message.clone()),
            );
            return Ok(Step::Next(flow.target.clone()));
        }
    }

    error!(
        node_id = %node.id,
        severity = %severity,
        error = %error,
        "Unresolved task failure, aborting run"
    );
    Err(ProcflowError::Task {
        node_id: node.id.clone(),
        source: error,
    })
}

/// Exclusive gateway: first matching flow in declared order, else the default.
fn choose(
    state: &RunState,
    node: &Node,
    ctx: &ExecutionContext,
    scope: &Scope,
) -> Result<Step> {
    let flows = state.definition.outgoing(&node.id);

    let matched = flows
        .iter()
        .find(|(flow, condition)| {
            !flow.default && condition.map_or(true, |c| c.evaluate(ctx))
        })
        .map(|(flow, _)| (*flow, false));
    let taken = matched.or_else(|| {
        flows
            .iter()
            .find(|(flow, _)| flow.default)
            .map(|(flow, _)| (*flow, true))
    });

    // Unconditional pass-through merges are not decisions.
    let decides = flows.len() > 1 || flows.iter().any(|(_, condition)| condition.is_some());
    let mut span = decides
        .then(|| OpenSpan::start(&node.id, span_kind::EXCLUSIVE_GATEWAY, Some(&scope.parent)));

    match taken {
        Some((flow, used_default)) => {
            debug!(gateway = %node.id, target = %flow.target, used_default, "Gateway routed");
            if let Some(mut span) = span.take() {
                span.set("gateway.taken", flow.target.as_str());
                span.set("gateway.default", used_default);
                state.collector.close(span, SpanStatus::Ok);
            }
            Ok(Step::Next(flow.target.clone()))
        }
        None => {
            if let Some(mut span) = span.take() {
                span.set("error.message", "no flow matched and no default is declared");
                state.collector.close(span, SpanStatus::Error);
            }
            error!(gateway = %node.id, "No outgoing flow matched");
            Err(ProcflowError::Routing {
                gateway: node.id.clone(),
            })
        }
    }
}

/// Parallel split: run every branch to the matching join, then merge.
async fn fork(
    state: &Arc<RunState>,
    node: &Node,
    ctx: &mut ExecutionContext,
    scope: &Scope,
) -> Result<Step> {
    let join = state
        .definition
        .matching_join(&node.id)
        .ok_or_else(|| {
            ProcflowError::Definition(format!("parallel split '{}' has no matching join", node.id))
        })?
        .to_string();
    let targets: Vec<String> = state
        .definition
        .outgoing(&node.id)
        .iter()
        .map(|(flow, _)| flow.target.clone())
        .collect();
    let branch_count = targets.len();

    let mut split_span = OpenSpan::start(&node.id, span_kind::PARALLEL_SPLIT, Some(&scope.parent));
    split_span.set("branches", branch_count);
    split_span.set("join", join.as_str());
    debug!(split = %node.id, join = %join, branches = branch_count, "Forking parallel branches");

    let base = ctx.clone();
    let branch_names: Vec<String> = (0..branch_count)
        .map(|i| format!("{}/{}#{}", scope.branch, node.id, i))
        .collect();
    let handles: Vec<_> = targets
        .into_iter()
        .zip(branch_names.iter())
        .map(|(target, branch)| {
            let branch_scope = Scope {
                branch: branch.clone(),
                parent: split_span.id().clone(),
                stop_at: Some(join.clone()),
            };
            tokio::spawn(walk(state.clone(), base.clone(), target, branch_scope))
        })
        .collect();

    // Barrier: exactly one completion signal per branch.
    let results = join_all(handles).await;

    let mut branch_contexts = Vec::with_capacity(branch_count);
    let mut failure: Option<ProcflowError> = None;
    for (joined, branch) in results.into_iter().zip(branch_names) {
        let error = match joined {
            Ok(Ok(branch_ctx)) => {
                branch_contexts.push(branch_ctx);
                continue;
            }
            Ok(Err(aborted)) => aborted.error,
            Err(e) => {
                state.abort();
                ProcflowError::BranchPanicked {
                    branch,
                    message: e.to_string(),
                }
            }
        };
        // Prefer the triggering failure over siblings' cancellations.
        let replace = match &failure {
            None => true,
            Some(ProcflowError::Cancelled) => !matches!(error, ProcflowError::Cancelled),
            Some(_) => false,
        };
        if replace {
            failure = Some(error);
        }
    }
    // Branches that finished after the run was aborted do not release the join.
    if failure.is_none() && state.cancel.is_cancelled() {
        failure = Some(ProcflowError::Cancelled);
    }

    if let Some(error) = failure {
        split_span.set("error.message", error.to_string());
        state.collector.close(split_span, SpanStatus::Error);
        return Err(error);
    }
    state.collector.close(split_span, SpanStatus::Ok);

    let mut join_span = OpenSpan::start(&join, span_kind::PARALLEL_JOIN, Some(&scope.parent));
    let collisions = merge_branches(ctx, &base, &branch_contexts, &join);
    join_span.set("split", node.id.as_str());
    join_span.set("branches", branch_contexts.len());
    join_span.set("collisions", collisions);
    state.collector.close(join_span, SpanStatus::Ok);
    debug!(join = %join, "Join barrier passed");

    follow(&state.definition, &join)
}

/// Apply each branch's writes in flow order; later branches win.
///
/// Returns the keys written by more than one branch.
fn merge_branches(
    ctx: &mut ExecutionContext,
    base: &ExecutionContext,
    branches: &[ExecutionContext],
    join: &str,
) -> Vec<String> {
    let mut writers: HashMap<String, usize> = HashMap::new();
    let mut collisions = BTreeSet::new();

    for (i, branch) in branches.iter().enumerate() {
        for (key, value) in branch.changes_since(base) {
            if let Some(previous) = writers.insert(key.clone(), i) {
                warn!(
                    join = %join,
                    key = %key,
                    first_branch = previous,
                    winning_branch = i,
                    "Parallel branches wrote the same key, last writer wins"
                );
                collisions.insert(key.clone());
            }
            ctx.set(key, value);
        }
    }
    collisions.into_iter().collect()
}

/// Multi-instance node: one guarded execution per collection element.
async fn fan_out(
    state: &Arc<RunState>,
    node: &Node,
    mi: &MultiInstanceSpec,
    ctx: &mut ExecutionContext,
    scope: &Scope,
) -> Result<Step> {
    let severity = mi.task.policy().severity;
    let mut span = OpenSpan::start(&node.id, span_kind::MULTI_INSTANCE, Some(&scope.parent));

    let resolved = match ctx.lookup(&mi.collection) {
        Some(serde_json::Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err("not an array"),
        None => Err("missing"),
    };
    let items = match resolved {
        Ok(items) => items,
        Err(reason) => {
            let error = TaskError::permanent(format!(
                "collection '{}' is {}",
                mi.collection, reason
            ));
            span.set("error.message", error.message.as_str());
            state.collector.close(span, SpanStatus::Error);
            return route_failure(state, node, ctx, error, severity);
        }
    };

    let count = items.len();
    let fail_fast = mi.completion == Completion::FailFast;
    span.set("instances", count);
    span.set("completion", if fail_fast { "fail_fast" } else { "all" });

    let limit = mi.max_concurrency.or_else(|| {
        (state.max_instance_concurrency > 0).then_some(state.max_instance_concurrency)
    });
    let semaphore = limit.map(|n| Arc::new(Semaphore::new(n)));
    let cancel = state.cancel.child_token();
    debug!(node_id = %node.id, instances = count, limit = ?limit, "Fanning out instances");

    let handles: Vec<_> = items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let mut instance_ctx = ctx.clone();
            instance_ctx.set(mi.element_var.clone(), item);
            instance_ctx.set(format!("{}_index", mi.element_var), serde_json::json!(i));

            let task = GuardedTask {
                node_id: node.id.clone(),
                spec: mi.task.clone(),
                context: instance_ctx,
                parent: span.id().clone(),
                branch: format!("{}/{}[{}]", scope.branch, node.id, i),
                instance: Some(i),
                cancel: cancel.clone(),
            };
            let state = state.clone();
            let semaphore = semaphore.clone();

            tokio::spawn(async move {
                let _permit = match semaphore {
                    Some(sem) => tokio::select! {
                        _ = task.cancel.cancelled() => return BoundaryOutcome::Cancelled,
                        permit = sem.acquire_owned() => permit.ok(),
                    },
                    None => None,
                };
                let cancel = task.cancel.clone();
                let outcome = boundary::guard(&state, task).await;
                if fail_fast && matches!(outcome, BoundaryOutcome::Failed { .. }) {
                    cancel.cancel();
                }
                outcome
            })
        })
        .collect();

    let results = join_all(handles).await;

    let mut values = Vec::with_capacity(count);
    let mut first_failure: Option<(usize, TaskError, Severity)> = None;
    let mut degraded = 0usize;
    for (i, joined) in results.into_iter().enumerate() {
        let outcome = joined.unwrap_or_else(|e| BoundaryOutcome::Failed {
            error: TaskError::permanent(format!("instance terminated abnormally: {}", e)),
            severity,
        });
        match outcome {
            BoundaryOutcome::Completed {
                value,
                degraded: d,
                ..
            } => {
                degraded += usize::from(d);
                values.push(value);
            }
            BoundaryOutcome::Failed { error, severity } => {
                if first_failure.is_none() {
                    first_failure = Some((i, error, severity));
                }
                values.push(serde_json::Value::Null);
            }
            BoundaryOutcome::Cancelled => values.push(serde_json::Value::Null),
        }
    }

    if state.cancel.is_cancelled() {
        span.set("error.message", "cancelled");
        state.collector.close(span, SpanStatus::Error);
        return Err(ProcflowError::Cancelled);
    }

    if let Some((index, error, severity)) = first_failure {
        span.set("failed_instance", index);
        span.set("error.kind", error.kind.as_str());
        span.set("error.message", error.message.as_str());
        state.collector.close(span, SpanStatus::Error);
        return route_failure(state, node, ctx, error, severity);
    }

    span.set("degraded_instances", degraded);
    let status = if degraded > 0 {
        SpanStatus::Degraded
    } else {
        SpanStatus::Ok
    };
    state.collector.close(span, status);
    ctx.set(mi.result_key.clone(), serde_json::Value::Array(values));

    follow(&state.definition, &node.id)
}
