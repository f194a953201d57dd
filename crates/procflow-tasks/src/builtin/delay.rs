use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;

use procflow_core::{ConfigSchema, ExecutionContext, Invocation, ParamType, TaskError, TaskHandler};

/// Sleeps for a fixed duration.
pub struct DelayHandler;

#[derive(Deserialize)]
struct DelayInput {
    ms: u64,
}

impl TaskHandler for DelayHandler {
    fn name(&self) -> &str {
        "delay"
    }

    fn description(&self) -> &str {
        "Wait `ms` milliseconds, then succeed."
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::default().required("ms", ParamType::Integer)
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a mut ExecutionContext,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<serde_json::Value, TaskError>> {
        Box::pin(async move {
            let input: DelayInput =
                serde_json::from_value(serde_json::Value::Object(invocation.params.clone()))
                    .map_err(|e| TaskError::permanent(e.to_string()))?;
            tokio::time::sleep(Duration::from_millis(input.ms)).await;
            Ok(serde_json::json!({ "slept_ms": input.ms }))
        })
    }
}
