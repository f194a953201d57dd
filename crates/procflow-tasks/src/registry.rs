use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use procflow_core::{ExecutionContext, Invocation, ProcflowError, Result, TaskError, TaskHandler};
use procflow_graph::{Fallback, ProcessDefinition};
use tracing::debug;

/// Registry of task handlers, keyed by the identifier task nodes reference.
///
/// Built before a run and passed in explicitly; there is no global registry.
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under its own name.
    pub fn register(&mut self, handler: impl TaskHandler) {
        self.register_arc(Arc::new(handler));
    }

    /// Register a shared handler, e.g. one the caller also inspects.
    pub fn register_arc(&mut self, handler: Arc<dyn TaskHandler>) {
        let name = handler.name().to_string();
        self.handlers.insert(name, handler);
    }

    /// Unregister a handler by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    /// Get a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered handler names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Check every handler reference and static config in a definition.
    pub fn validate_definition(&self, def: &ProcessDefinition) -> Result<()> {
        for (node_id, spec) in def.task_specs() {
            let handler = self
                .get(&spec.handler)
                .ok_or_else(|| ProcflowError::UnknownHandler {
                    node_id: node_id.to_string(),
                    handler: spec.handler.clone(),
                })?;

            handler
                .config_schema()
                .validate(&spec.config)
                .map_err(|message| ProcflowError::InvalidTaskConfig {
                    node_id: node_id.to_string(),
                    message,
                })?;

            // The alternate runs with the node's own config.
            if let Some(policy) = &spec.boundary {
                if let Fallback::AlternateHandler { handler: alt } = &policy.fallback {
                    let alternate = self.get(alt).ok_or_else(|| ProcflowError::UnknownHandler {
                        node_id: node_id.to_string(),
                        handler: alt.clone(),
                    })?;
                    alternate
                        .config_schema()
                        .validate(&spec.config)
                        .map_err(|message| ProcflowError::InvalidTaskConfig {
                            node_id: node_id.to_string(),
                            message: format!("alternate handler '{}': {}", alt, message),
                        })?;
                }
            }
        }
        debug!(
            definition = %def.id(),
            handlers = self.handlers.len(),
            "Handler references validated"
        );
        Ok(())
    }

    /// Run a handler with an optional time limit.
    ///
    /// Exceeding the limit yields a `timeout` task error; the handler future
    /// is dropped at that point.
    pub async fn dispatch(
        &self,
        name: &str,
        ctx: &mut ExecutionContext,
        invocation: &Invocation,
        timeout: Option<Duration>,
    ) -> std::result::Result<serde_json::Value, TaskError> {
        let handler = self
            .get(name)
            .ok_or_else(|| TaskError::permanent(format!("handler '{}' is not registered", name)))?;

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, handler.execute(ctx, invocation)).await
            {
                Ok(result) => result,
                Err(_) => Err(TaskError::timeout(limit.as_millis() as u64)),
            },
            None => handler.execute(ctx, invocation).await,
        }
    }

    /// Create a registry with all built-in handlers registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::assign::AssignHandler);
        registry.register(crate::builtin::delay::DelayHandler);
        registry.register(crate::builtin::fail::FailHandler);
        registry.register(crate::builtin::log::LogHandler);
        registry
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
