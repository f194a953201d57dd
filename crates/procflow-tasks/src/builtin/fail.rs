use futures::future::BoxFuture;
use serde::Deserialize;

use procflow_core::{ConfigSchema, ExecutionContext, Invocation, ParamType, TaskError, TaskHandler};

/// Fails on purpose. Useful for exercising boundary policies.
pub struct FailHandler;

#[derive(Deserialize)]
struct FailInput {
    #[serde(default = "default_kind")]
    kind: String,
    #[serde(default = "default_message")]
    message: String,
    /// Fail only the first `times` attempts, then succeed.
    #[serde(default)]
    times: Option<u32>,
}

fn default_kind() -> String {
    TaskError::PERMANENT.to_string()
}

fn default_message() -> String {
    "failed on purpose".to_string()
}

impl TaskHandler for FailHandler {
    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Raise a task error of `kind` with `message`. With `times`, succeed from attempt times+1 on."
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::default()
            .optional("kind", ParamType::String)
            .optional("message", ParamType::String)
            .optional("times", ParamType::Integer)
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a mut ExecutionContext,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<serde_json::Value, TaskError>> {
        Box::pin(async move {
            let input: FailInput =
                serde_json::from_value(serde_json::Value::Object(invocation.params.clone()))
                    .map_err(|e| TaskError::permanent(e.to_string()))?;

            match input.times {
                Some(times) if invocation.attempt > times => {
                    Ok(serde_json::json!({ "recovered_on_attempt": invocation.attempt }))
                }
                _ => Err(TaskError::new(input.kind, input.message)),
            }
        })
    }
}
