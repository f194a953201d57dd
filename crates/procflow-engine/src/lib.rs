//! Process execution: interpreter, error boundaries, telemetry and health.
//!
//! [`Engine`] walks a validated [`procflow_graph::ProcessDefinition`],
//! dispatching task nodes through a [`procflow_tasks::TaskRegistry`] under
//! their boundary policies. Every node attempt closes a span into a
//! [`TelemetryCollector`]; after the run a [`HealthScorer`] grades the trace.

mod boundary;
pub mod engine;
pub mod health;
mod interpreter;
pub mod saga;
pub mod span_log;
pub mod telemetry;

pub use engine::{run, Engine, RunReport, RunStatus};
pub use health::{Dimension, DimensionScores, HealthIssue, HealthReport, HealthScorer, HealthStatus};
pub use saga::{SagaEntry, SagaStack};
pub use span_log::{read_spans, SpanLogger};
pub use telemetry::{OpenSpan, TelemetryCollector};
