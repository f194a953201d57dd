use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, info, warn};

use procflow_core::{ConfigSchema, ExecutionContext, Invocation, ParamType, TaskError, TaskHandler};

use super::interpolate;

/// Emits a log line; compensation emits the `undo_message`.
pub struct LogHandler;

#[derive(Deserialize)]
struct LogInput {
    message: String,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    undo_message: Option<String>,
}

fn parse_input(invocation: &Invocation) -> Result<LogInput, TaskError> {
    serde_json::from_value(serde_json::Value::Object(invocation.params.clone()))
        .map_err(|e| TaskError::permanent(e.to_string()))
}

fn emit(level: Option<&str>, node_id: &str, line: &str) {
    match level {
        Some("warn") => warn!(node_id = %node_id, "{}", line),
        Some("debug") => debug!(node_id = %node_id, "{}", line),
        _ => info!(node_id = %node_id, "{}", line),
    }
}

impl TaskHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    fn description(&self) -> &str {
        "Log `message`, with {path} placeholders filled from the context."
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::default()
            .required("message", ParamType::String)
            .optional("level", ParamType::String)
            .optional("undo_message", ParamType::String)
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<serde_json::Value, TaskError>> {
        Box::pin(async move {
            let input = parse_input(invocation)?;
            let line = interpolate(&input.message, ctx);
            emit(input.level.as_deref(), &invocation.node_id, &line);
            Ok(serde_json::Value::String(line))
        })
    }

    fn compensable(&self) -> bool {
        true
    }

    fn compensate<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
        prior: &'a serde_json::Value,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<(), TaskError>> {
        Box::pin(async move {
            let input = parse_input(invocation)?;
            let line = match input.undo_message {
                Some(undo) => interpolate(&undo, ctx),
                None => format!("Undo: {}", prior.as_str().unwrap_or_default()),
            };
            emit(input.level.as_deref(), &invocation.node_id, &line);
            Ok(())
        })
    }
}
