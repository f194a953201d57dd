use std::path::PathBuf;
use std::sync::Arc;

use procflow_core::config::EngineConfig;
use procflow_core::{
    span_kind, ExecutionContext, ProcflowError, Result, ScoringRules, Span, SpanSink, SpanStatus,
};
use procflow_graph::ProcessDefinition;
use procflow_tasks::TaskRegistry;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::boundary;
use crate::health::{HealthReport, HealthScorer};
use crate::interpreter::{self, RunState};
use crate::span_log::SpanLogger;
use crate::telemetry::{OpenSpan, TelemetryCollector};

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Everything a finished run hands back.
///
/// A failed run still carries its partial context and full span trace.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    /// Final context, or the context at the point of abort.
    pub context: ExecutionContext,
    /// Spans in append order.
    pub spans: Vec<Span>,
    pub health: HealthReport,
    /// The error that aborted the run.
    pub failure: Option<ProcflowError>,
    /// Rollback failures; logged, never raised.
    pub compensation_failures: Vec<ProcflowError>,
    /// JSONL log written for this run, if span logging is enabled.
    pub log_path: Option<PathBuf>,
}

impl RunReport {
    pub fn is_ok(&self) -> bool {
        self.status == RunStatus::Ok
    }

    /// The run-root span.
    pub fn root(&self) -> Option<&Span> {
        self.spans.iter().find(|s| s.is_root())
    }

    /// Spans recorded for one node, in append order.
    pub fn spans_for<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Span> + 'a {
        self.spans.iter().filter(move |s| s.node_id == node_id)
    }

    /// Task attempt spans for one node, compensations excluded.
    pub fn attempts(&self, node_id: &str) -> Vec<&Span> {
        self.spans
            .iter()
            .filter(|s| s.node_id == node_id && s.attempt > 0 && s.attr("compensation").is_none())
            .collect()
    }
}

/// Executes one process definition against an explicit handler registry.
///
/// The definition is validated against the registry on construction, so
/// unknown handlers and bad task configs never surface mid-run. An engine
/// can be run any number of times; runs share nothing but the registry.
pub struct Engine {
    definition: Arc<ProcessDefinition>,
    registry: Arc<TaskRegistry>,
    config: EngineConfig,
    sinks: Vec<Arc<dyn SpanSink>>,
    span_log: Option<SpanLogger>,
}

impl Engine {
    pub fn new(
        definition: ProcessDefinition,
        registry: Arc<TaskRegistry>,
        config: EngineConfig,
    ) -> Result<Self> {
        registry.validate_definition(&definition)?;
        Ok(Self {
            definition: Arc::new(definition),
            registry,
            config,
            sinks: Vec::new(),
            span_log: None,
        })
    }

    /// Attach a sink that sees every span of every run as it closes.
    pub fn with_sink(mut self, sink: Arc<dyn SpanSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Write each run's spans to a JSONL file.
    pub fn with_span_log(mut self, logger: SpanLogger) -> Self {
        self.span_log = Some(logger);
        self
    }

    pub fn definition(&self) -> &ProcessDefinition {
        &self.definition
    }

    pub async fn run(&self, initial: ExecutionContext, scorer: &HealthScorer) -> RunReport {
        self.run_with_cancel(initial, scorer, CancellationToken::new())
            .await
    }

    /// Run with an external cancellation token.
    ///
    /// Cancelling `cancel` stops every branch at its next suspension point;
    /// completed compensable tasks are then rolled back.
    pub async fn run_with_cancel(
        &self,
        initial: ExecutionContext,
        scorer: &HealthScorer,
        cancel: CancellationToken,
    ) -> RunReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        let definition_id = self.definition.id().to_string();

        let collector = Arc::new(TelemetryCollector::new(self.config.span_buffer.max(1)));
        for sink in &self.sinks {
            collector.add_sink(sink.clone());
        }
        // Subscribe before the first span can close.
        let logger = self.span_log.clone().map(|logger| {
            tokio::spawn(logger.run(
                collector.subscribe(),
                definition_id.clone(),
                run_id.clone(),
            ))
        });

        let mut root = OpenSpan::start(&definition_id, span_kind::RUN, None);
        root.set("run_id", run_id.as_str());
        root.set("definition", definition_id.as_str());

        let state = Arc::new(RunState::new(
            self.definition.clone(),
            self.registry.clone(),
            collector.clone(),
            cancel.child_token(),
            self.config.default_task_timeout_ms,
            self.config.max_instance_concurrency,
        ));

        info!(run_id = %run_id, definition = %definition_id, "Run started");

        let (status, context, failure) =
            match interpreter::execute(state.clone(), initial, root.id()).await {
                Ok(context) => (RunStatus::Ok, context, None),
                Err(aborted) => {
                    state.abort();
                    let entries = state.saga.drain_all();
                    if !entries.is_empty() {
                        info!(run_id = %run_id, count = entries.len(), "Compensating completed tasks");
                    }
                    let compensated = boundary::compensate(&state, entries, root.id()).await;
                    error!(run_id = %run_id, error = %aborted.error, "Run aborted");
                    root.set("error.message", aborted.error.to_string());
                    root.set("compensations", compensated);
                    (RunStatus::Error, aborted.context, Some(aborted.error))
                }
            };

        let span_status = match status {
            RunStatus::Ok => SpanStatus::Ok,
            RunStatus::Error => SpanStatus::Error,
        };
        collector.close(root, span_status);

        let log_path = match logger {
            Some(handle) => match handle.await {
                Ok(path) => path,
                Err(e) => {
                    warn!(error = %e, "SpanLogger task failed");
                    None
                }
            },
            None => None,
        };

        let spans = collector.spans();
        let health = scorer.score(&spans);
        let compensation_failures = state.take_compensation_failures();

        info!(
            run_id = %run_id,
            status = %status,
            spans = spans.len(),
            score = health.overall,
            health = %health.status,
            "Run finished"
        );

        RunReport {
            run_id,
            status,
            context,
            spans,
            health,
            failure,
            compensation_failures,
            log_path,
        }
    }
}

/// One-shot entry point: validate, execute and score.
///
/// Load-time problems (unknown handlers, invalid task config, bad scoring
/// weights) are returned as errors before any node runs. Everything that
/// happens during the run is reported in the [`RunReport`].
pub async fn run(
    definition: ProcessDefinition,
    initial: ExecutionContext,
    registry: Arc<TaskRegistry>,
    rules: ScoringRules,
) -> Result<RunReport> {
    let scorer = HealthScorer::new(rules)?;
    let engine = Engine::new(definition, registry, EngineConfig::default())?;
    Ok(engine.run(initial, &scorer).await)
}
