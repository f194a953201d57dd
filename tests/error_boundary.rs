use std::sync::Arc;

use procflow_core::config::EngineConfig;
use procflow_core::{ExecutionContext, ProcflowError, ScoringRules, SpanStatus, TaskError};
use procflow_engine::{Engine, HealthScorer, RunReport, RunStatus};
use procflow_graph::{BoundaryPolicy, Fallback, Flow, Node, ProcessDefinition, Severity, TaskSpec};
use procflow_tasks::TaskRegistry;
use procflow_test_utils::{
    linear, single_task, DefinitionBuilder, FailingHandler, RecordingHandler, SucceedHandler,
};

async fn execute(definition: ProcessDefinition, registry: TaskRegistry) -> RunReport {
    let scorer = HealthScorer::new(ScoringRules::default()).unwrap();
    let engine = Engine::new(definition, Arc::new(registry), EngineConfig::default()).unwrap();
    engine.run(ExecutionContext::new(), &scorer).await
}

#[tokio::test]
async fn test_exhausted_retries_produce_n_plus_one_attempts() {
    let failing = Arc::new(FailingHandler::new("down", TaskError::TRANSIENT));
    let mut registry = TaskRegistry::new();
    registry.register_arc(failing.clone());

    let spec = TaskSpec::new("down").with_boundary(BoundaryPolicy::retries(2));
    let report = execute(single_task("retry", spec).build().unwrap(), registry).await;

    assert_eq!(report.status, RunStatus::Error);
    assert_eq!(failing.calls(), 3);
    let attempts = report.attempts("task");
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|s| s.status == SpanStatus::Error));
    let last = attempts[2];
    assert_eq!(last.attr("boundary.outcome"), Some(&serde_json::json!("failed")));
    assert_eq!(last.attr("boundary.attempts"), Some(&serde_json::json!(3)));
}

#[tokio::test]
async fn test_non_retryable_kind_fails_on_first_attempt() {
    let failing = Arc::new(FailingHandler::new("down", TaskError::PERMANENT));
    let mut registry = TaskRegistry::new();
    registry.register_arc(failing.clone());

    let spec = TaskSpec::new("down")
        .with_boundary(BoundaryPolicy::retries(5).retry_on(TaskError::TRANSIENT));
    let report = execute(single_task("retry", spec).build().unwrap(), registry).await;

    assert_eq!(report.status, RunStatus::Error);
    assert_eq!(failing.calls(), 1);
    assert_eq!(report.attempts("task").len(), 1);
}

#[tokio::test]
async fn test_alternate_handler_degrades_instead_of_failing() {
    let mut registry = TaskRegistry::new();
    registry.register(FailingHandler::new("primary", TaskError::PERMANENT));
    registry.register(SucceedHandler::with_output("backup", serde_json::json!("cached")));

    let spec = TaskSpec::new("primary").with_result_key("price").with_boundary(
        BoundaryPolicy::retries(1).with_fallback(Fallback::AlternateHandler {
            handler: "backup".into(),
        }),
    );
    let report = execute(single_task("fallback", spec).build().unwrap(), registry).await;

    assert!(report.is_ok(), "failure: {:?}", report.failure);
    assert_eq!(report.context.get_str("price"), Some("cached"));

    let attempts = report.attempts("task");
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[2].task_kind, "backup");
    assert_eq!(attempts[2].status, SpanStatus::Degraded);
}

#[tokio::test]
async fn test_failed_alternate_surfaces_original_error() {
    let mut registry = TaskRegistry::new();
    registry.register(FailingHandler::new("primary", "primary_kind"));
    registry.register(FailingHandler::new("backup", "backup_kind"));

    let spec = TaskSpec::new("primary").with_boundary(
        BoundaryPolicy::default().with_fallback(Fallback::AlternateHandler {
            handler: "backup".into(),
        }),
    );
    let report = execute(single_task("fallback", spec).build().unwrap(), registry).await;

    assert_eq!(report.status, RunStatus::Error);
    match &report.failure {
        Some(ProcflowError::Task { source, .. }) => assert_eq!(source.kind, "primary_kind"),
        other => panic!("unexpected failure: {:?}", other),
    }
}

#[tokio::test]
async fn test_compensation_fallback_rolls_back_in_reverse_order() {
    let first = Arc::new(RecordingHandler::new("record"));
    let mut registry = TaskRegistry::new();
    registry.register_arc(first.clone());
    registry.register(FailingHandler::new("boom", TaskError::PERMANENT));

    let definition = linear(
        "saga",
        vec![
            ("reserve", TaskSpec::new("record")),
            ("charge", TaskSpec::new("record")),
            (
                "ship",
                TaskSpec::new("boom").with_boundary(
                    BoundaryPolicy::default()
                        .with_severity(Severity::Critical)
                        .with_fallback(Fallback::Compensation),
                ),
            ),
        ],
    )
    .build()
    .unwrap();
    let report = execute(definition, registry).await;

    assert_eq!(report.status, RunStatus::Error);
    assert_eq!(
        first.journal(),
        vec!["run:reserve", "run:charge", "undo:charge", "undo:reserve"]
    );

    let ship = report.attempts("ship");
    assert_eq!(ship.len(), 1);
    assert_eq!(
        ship[0].attr("boundary.compensations"),
        Some(&serde_json::json!(["charge", "reserve"]))
    );
    // Compensation spans hang under the failing attempt.
    let undo: Vec<_> = report
        .spans
        .iter()
        .filter(|s| s.status == SpanStatus::Compensated)
        .collect();
    assert_eq!(undo.len(), 2);
    assert!(undo.iter().all(|s| s.parent_id.as_ref() == Some(&ship[0].id)));
}

#[tokio::test]
async fn test_compensation_failure_is_recorded_not_raised() {
    let mut registry = TaskRegistry::new();
    registry.register(RecordingHandler::new("record").failing_compensation());
    registry.register(FailingHandler::new("boom", TaskError::PERMANENT));

    let definition = linear(
        "saga",
        vec![
            ("reserve", TaskSpec::new("record")),
            (
                "ship",
                TaskSpec::new("boom")
                    .with_boundary(BoundaryPolicy::default().with_severity(Severity::Critical)),
            ),
        ],
    )
    .build()
    .unwrap();
    let report = execute(definition, registry).await;

    // The original failure is kept.
    match &report.failure {
        Some(ProcflowError::Task { node_id, .. }) => assert_eq!(node_id, "ship"),
        other => panic!("unexpected failure: {:?}", other),
    }
    assert_eq!(report.compensation_failures.len(), 1);
    assert!(matches!(
        &report.compensation_failures[0],
        ProcflowError::Compensation { node_id, .. } if node_id == "reserve"
    ));
}

/// start -> risky -> end, with risky -(error)-> cleanup -> end
fn error_flow_definition(severity: Severity) -> ProcessDefinition {
    DefinitionBuilder::new("errors")
        .node(Node::start("start"))
        .node(Node::task(
            "risky",
            TaskSpec::new("boom").with_boundary(BoundaryPolicy::default().with_severity(severity)),
        ))
        .node(Node::task("cleanup", TaskSpec::new("cleanup")))
        .node(Node::end("end"))
        .edge("start", "risky")
        .edge("risky", "end")
        .flow(Flow::on_error("risky", "cleanup"))
        .edge("cleanup", "end")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_non_critical_failure_takes_error_flow() {
    let cleanup = Arc::new(SucceedHandler::new("cleanup"));
    let mut registry = TaskRegistry::new();
    registry.register(FailingHandler::new("boom", TaskError::PERMANENT));
    registry.register_arc(cleanup.clone());

    let report = execute(error_flow_definition(Severity::High), registry).await;

    assert!(report.is_ok(), "failure: {:?}", report.failure);
    assert_eq!(cleanup.calls(), 1);
    assert_eq!(
        report.context.get_str("risky.error"),
        Some("risky always fails")
    );
}

#[tokio::test]
async fn test_critical_failure_ignores_error_flow() {
    let cleanup = Arc::new(SucceedHandler::new("cleanup"));
    let mut registry = TaskRegistry::new();
    registry.register(FailingHandler::new("boom", TaskError::PERMANENT));
    registry.register_arc(cleanup.clone());

    let report = execute(error_flow_definition(Severity::Critical), registry).await;

    assert_eq!(report.status, RunStatus::Error);
    assert_eq!(cleanup.calls(), 0);
}

#[tokio::test]
async fn test_non_critical_failure_without_error_flow_aborts() {
    let mut registry = TaskRegistry::new();
    registry.register(FailingHandler::new("boom", TaskError::PERMANENT));

    let spec = TaskSpec::new("boom").with_boundary(BoundaryPolicy::default().with_severity(Severity::Low));
    let report = execute(single_task("abort", spec).build().unwrap(), registry).await;

    assert_eq!(report.status, RunStatus::Error);
    assert!(matches!(report.failure, Some(ProcflowError::Task { .. })));
}
