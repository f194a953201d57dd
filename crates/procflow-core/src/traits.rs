use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::types::{ExecutionContext, Span};

/// Static information about one handler invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Node that dispatched the handler.
    pub node_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Position within a multi-instance node, if any.
    pub instance: Option<usize>,
    /// Static configuration declared on the node.
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl Invocation {
    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.get(key)
    }
}

/// Task handler — pluggable unit of work dispatched by task nodes.
///
/// The engine offers at-least-once execution across retries, so `execute`
/// must tolerate being called more than once for the same node. Each attempt
/// receives a scratch copy of the context; writes are only kept if the
/// attempt succeeds.
pub trait TaskHandler: Send + Sync + 'static {
    /// Identifier that task nodes reference.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Parameters accepted in a node's static `config` block.
    ///
    /// Handlers that declare nothing accept any configuration.
    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::open()
    }

    /// Run the task.
    fn execute<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<serde_json::Value, TaskError>>;

    /// Whether `compensate` undoes anything. Only compensable successes are
    /// pushed on the rollback stack.
    fn compensable(&self) -> bool {
        false
    }

    /// Roll back a previous successful execution.
    ///
    /// `ctx` is the context as it was right after that execution; `prior`
    /// is the value it returned.
    fn compensate<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
        prior: &'a serde_json::Value,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<(), TaskError>> {
        let _ = (ctx, prior, invocation);
        Box::pin(async { Ok(()) })
    }
}

/// Receives every span the moment it closes.
///
/// Implementations must be cheap; they run on the appending task.
pub trait SpanSink: Send + Sync + 'static {
    fn on_span(&self, span: &Span);
}

/// JSON type accepted for a handler parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Bool,
    Array,
    Object,
    Any,
}

impl ParamType {
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Bool => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Bool => "bool",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        };
        write!(f, "{}", s)
    }
}

/// One declared parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    pub required: bool,
}

/// Declared shape of a handler's static configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSchema {
    pub params: Vec<ParamSpec>,
    /// Accept keys that are not declared.
    #[serde(default)]
    pub allow_unknown: bool,
}

impl ConfigSchema {
    /// A schema that accepts any configuration.
    pub fn open() -> Self {
        Self {
            params: vec![],
            allow_unknown: true,
        }
    }

    pub fn required(mut self, name: impl Into<String>, ty: ParamType) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            ty,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, ty: ParamType) -> Self {
        self.params.push(ParamSpec {
            name: name.into(),
            ty,
            required: false,
        });
        self
    }

    /// Check a node's static config against this schema.
    pub fn validate(
        &self,
        config: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), String> {
        for spec in &self.params {
            match config.get(&spec.name) {
                Some(value) if !spec.ty.accepts(value) => {
                    return Err(format!("parameter '{}' must be {}", spec.name, spec.ty));
                }
                None if spec.required => {
                    return Err(format!("missing required parameter '{}'", spec.name));
                }
                _ => {}
            }
        }
        if !self.allow_unknown {
            if let Some(unknown) = config
                .keys()
                .find(|k| !self.params.iter().any(|p| &p.name == *k))
            {
                return Err(format!("unknown parameter '{}'", unknown));
            }
        }
        Ok(())
    }
}
