use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use procflow_core::config::EngineConfig;
use procflow_core::{span_kind, ExecutionContext, ProcflowError, ScoringRules, SpanStatus};
use procflow_engine::{Engine, HealthScorer, RunReport, RunStatus};
use procflow_graph::{MultiInstanceSpec, Node, ProcessDefinition, TaskSpec};
use procflow_tasks::TaskRegistry;
use procflow_test_utils::{
    parallel, DefinitionBuilder, EchoHandler, Journal, RecordingHandler, SlowHandler,
};
use tokio_util::sync::CancellationToken;

fn scorer() -> HealthScorer {
    HealthScorer::new(ScoringRules::default()).unwrap()
}

async fn execute(
    definition: ProcessDefinition,
    registry: TaskRegistry,
    ctx: ExecutionContext,
) -> RunReport {
    let engine = Engine::new(definition, Arc::new(registry), EngineConfig::default()).unwrap();
    engine.run(ctx, &scorer()).await
}

fn assert_well_formed(report: &RunReport) {
    let ids: HashSet<_> = report.spans.iter().map(|s| &s.id).collect();
    assert_eq!(ids.len(), report.spans.len());
    assert_eq!(report.spans.iter().filter(|s| s.is_root()).count(), 1);
    for span in &report.spans {
        if let Some(parent) = &span.parent_id {
            assert!(ids.contains(parent), "dangling parent on {}", span.node_id);
        }
    }
    for pair in report.spans.windows(2) {
        assert!(pair[0].seq < pair[1].seq);
    }
}

#[tokio::test]
async fn test_join_fires_once_after_all_branches() {
    let journal = Journal::default();
    let mut registry = TaskRegistry::new();
    registry.register(RecordingHandler::new("record").with_journal(journal.clone()));

    let definition = parallel("fanout", vec![TaskSpec::new("record"); 3])
        .build()
        .unwrap();
    let report = execute(definition, registry, ExecutionContext::new()).await;

    assert!(report.is_ok(), "failure: {:?}", report.failure);
    let joins: Vec<_> = report
        .spans
        .iter()
        .filter(|s| s.task_kind == span_kind::PARALLEL_JOIN)
        .collect();
    assert_eq!(joins.len(), 1);
    assert_eq!(joins[0].attr("branches"), Some(&serde_json::json!(3)));

    // Every branch closed its span before the join did.
    for node in ["b0", "b1", "b2"] {
        let attempt = report.attempts(node)[0];
        assert!(attempt.seq < joins[0].seq);
        assert_eq!(report.context.get(&format!("{}.done", node)), Some(&serde_json::json!(true)));
    }
    assert_eq!(journal.lock().unwrap().len(), 3);
    assert_well_formed(&report);
}

#[tokio::test]
async fn test_branch_writes_merge_last_writer_wins() {
    let registry = TaskRegistry::with_builtins();
    let assign = |value: i64| {
        TaskSpec::new("assign").with_config(serde_json::json!({"values": {"winner": value}}))
    };
    let definition = parallel("merge", vec![assign(0), assign(1)]).build().unwrap();

    let report = execute(definition, registry, ExecutionContext::new()).await;

    assert!(report.is_ok());
    assert_eq!(report.context.get("winner"), Some(&serde_json::json!(1)));
    let join = report.spans_for("join").next().unwrap();
    assert_eq!(join.attr("collisions"), Some(&serde_json::json!(["winner"])));
}

fn instances(spec: MultiInstanceSpec) -> ProcessDefinition {
    DefinitionBuilder::new("instances")
        .node(Node::start("start"))
        .node(Node::multi_instance("each", spec))
        .node(Node::end("end"))
        .edge("start", "each")
        .edge("each", "end")
        .build()
        .unwrap()
}

fn items() -> ExecutionContext {
    ExecutionContext::from_json(serde_json::json!({"order": {"items": ["a", "b", "c"]}}))
}

#[tokio::test]
async fn test_multi_instance_collects_results_in_order() {
    let mut registry = TaskRegistry::new();
    registry.register(EchoHandler);
    let mut spec = MultiInstanceSpec::new(TaskSpec::new("echo"), "order.items", "echoed");
    spec.max_concurrency = Some(1);

    let report = execute(instances(spec), registry, items()).await;

    assert!(report.is_ok(), "failure: {:?}", report.failure);
    assert_eq!(
        report.context.get("echoed"),
        Some(&serde_json::json!(["a", "b", "c"]))
    );
    // Instance variables do not leak into the run context.
    assert!(report.context.get("item").is_none());

    let attempts = report.attempts("each");
    assert_eq!(attempts.len(), 3);
    let mut seen: Vec<_> = attempts
        .iter()
        .filter_map(|s| s.attr("instance").and_then(|v| v.as_u64()))
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2]);
    assert_well_formed(&report);
}

#[tokio::test]
async fn test_multi_instance_element_var_and_index() {
    let mut registry = TaskRegistry::new();
    registry.register(EchoHandler);
    let mut spec = MultiInstanceSpec::new(
        TaskSpec::new("echo").with_config(serde_json::json!({"path": "line_index"})),
        "order.items",
        "positions",
    );
    spec.element_var = "line".into();

    let report = execute(instances(spec), registry, items()).await;

    assert_eq!(
        report.context.get("positions"),
        Some(&serde_json::json!([0, 1, 2]))
    );
}

#[tokio::test]
async fn test_multi_instance_failure_aborts_run() {
    let mut registry = TaskRegistry::new();
    registry.register(EchoHandler);
    let spec = MultiInstanceSpec::new(
        TaskSpec::new("echo").with_config(serde_json::json!({"fail_on": "b"})),
        "order.items",
        "echoed",
    )
    .fail_fast();

    let report = execute(instances(spec), registry, items()).await;

    assert_eq!(report.status, RunStatus::Error);
    match &report.failure {
        Some(ProcflowError::Task { node_id, source }) => {
            assert_eq!(node_id, "each");
            assert_eq!(source.kind, "bad_item");
        }
        other => panic!("unexpected failure: {:?}", other),
    }
    let fan_out = report
        .spans
        .iter()
        .find(|s| s.task_kind == span_kind::MULTI_INSTANCE)
        .unwrap();
    assert_eq!(fan_out.status, SpanStatus::Error);
    assert_eq!(fan_out.attr("failed_instance"), Some(&serde_json::json!(1)));
    assert!(report.context.get("echoed").is_none());
}

#[tokio::test]
async fn test_multi_instance_missing_collection_fails() {
    let mut registry = TaskRegistry::new();
    registry.register(EchoHandler);
    let spec = MultiInstanceSpec::new(TaskSpec::new("echo"), "order.missing", "echoed");

    let report = execute(instances(spec), registry, items()).await;

    assert_eq!(report.status, RunStatus::Error);
    assert!(report.attempts("each").is_empty());
}

#[tokio::test]
async fn test_empty_collection_yields_empty_results() {
    let mut registry = TaskRegistry::new();
    registry.register(EchoHandler);
    let spec = MultiInstanceSpec::new(TaskSpec::new("echo"), "order.items", "echoed");
    let ctx = ExecutionContext::from_json(serde_json::json!({"order": {"items": []}}));

    let report = execute(instances(spec), registry, ctx).await;

    assert!(report.is_ok());
    assert_eq!(report.context.get("echoed"), Some(&serde_json::json!([])));
}

#[tokio::test(start_paused = true)]
async fn test_external_cancellation_stops_run() {
    let slow = Arc::new(SlowHandler::new("slow", Duration::from_secs(60)));
    let mut registry = TaskRegistry::new();
    registry.register_arc(slow.clone());
    let definition = parallel("cancel", vec![TaskSpec::new("slow"); 2])
        .build()
        .unwrap();
    let engine = Engine::new(definition, Arc::new(registry), EngineConfig::default()).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });
    let report = engine
        .run_with_cancel(ExecutionContext::new(), &scorer(), cancel)
        .await;

    assert_eq!(report.status, RunStatus::Error);
    assert!(matches!(report.failure, Some(ProcflowError::Cancelled)));
    // Running handlers finish, but the join is never released.
    assert!(slow.finished());
    assert_eq!(report.spans_for("join").count(), 0);
    let split = report.spans_for("split").next().unwrap();
    assert_eq!(split.status, SpanStatus::Error);
    assert_well_formed(&report);
}
