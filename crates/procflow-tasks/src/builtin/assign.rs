use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use procflow_core::{ConfigSchema, ExecutionContext, Invocation, ParamType, TaskError, TaskHandler};

/// Writes static values into the context.
pub struct AssignHandler;

#[derive(Deserialize)]
struct AssignInput {
    values: serde_json::Map<String, serde_json::Value>,
}

impl TaskHandler for AssignHandler {
    fn name(&self) -> &str {
        "assign"
    }

    fn description(&self) -> &str {
        "Set context variables from the node's `values` object. Returns the previous values."
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::default().required("values", ParamType::Object)
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<serde_json::Value, TaskError>> {
        Box::pin(async move {
            let input: AssignInput =
                serde_json::from_value(serde_json::Value::Object(invocation.params.clone()))
                    .map_err(|e| TaskError::permanent(e.to_string()))?;

            let mut previous = serde_json::Map::new();
            for (key, value) in input.values {
                let old = ctx.get(&key).cloned().unwrap_or(serde_json::Value::Null);
                previous.insert(key.clone(), old);
                debug!(node_id = %invocation.node_id, key = %key, "Assigning context variable");
                ctx.set(key, value);
            }
            Ok(serde_json::Value::Object(previous))
        })
    }
}
