use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique span identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SpanId(pub String);

impl SpanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SpanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SpanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Variables shared between the nodes of one run.
///
/// Each parallel branch works on its own clone; clones are merged back at
/// the join. Keys are strings, values are JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    data: HashMap<String, serde_json::Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context from initial data.
    pub fn from_map(data: HashMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    /// Create a context from a JSON object. Non-object values yield an empty context.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => Self {
                data: map.into_iter().collect(),
            },
            _ => Self::default(),
        }
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Resolve a dotted path such as `order.items.0.sku`.
    ///
    /// An exact top-level key match wins over path splitting, so keys that
    /// themselves contain dots (`charge.error`) stay addressable.
    pub fn lookup(&self, path: &str) -> Option<&serde_json::Value> {
        if let Some(v) = self.data.get(path) {
            return Some(v);
        }
        let mut parts = path.split('.');
        let mut current = self.data.get(parts.next()?)?;
        for part in parts {
            current = match current {
                serde_json::Value::Object(map) => map.get(part)?,
                serde_json::Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    /// Set a string value.
    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    /// Remove a value, returning it.
    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.data.remove(key)
    }

    /// Merge another context into this one (overwrites on conflict).
    pub fn merge(&mut self, other: &ExecutionContext) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    /// Keys whose value differs from `base` (new or changed), with their new values.
    ///
    /// Removals are not reported; branches cannot delete shared variables.
    pub fn changes_since(&self, base: &ExecutionContext) -> BTreeMap<String, serde_json::Value> {
        self.data
            .iter()
            .filter(|(k, v)| base.data.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    /// Render as a JSON object with sorted keys.
    pub fn to_json(&self) -> serde_json::Value {
        let sorted: BTreeMap<&String, &serde_json::Value> = self.data.iter().collect();
        serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Terminal status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Error,
    Compensated,
    Degraded,
}

impl std::fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Compensated => "compensated",
            Self::Degraded => "degraded",
        };
        write!(f, "{}", s)
    }
}

/// Well-known span kinds for nodes that are not task executions.
pub mod span_kind {
    pub const RUN: &str = "run";
    pub const EXCLUSIVE_GATEWAY: &str = "exclusive_gateway";
    pub const PARALLEL_SPLIT: &str = "parallel_split";
    pub const PARALLEL_JOIN: &str = "parallel_join";
    pub const MULTI_INSTANCE: &str = "multi_instance";
}

/// A closed execution record.
///
/// Spans are immutable once appended to a collector. `seq` is assigned on
/// append and is strictly increasing within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub id: SpanId,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SpanId>,
    pub node_id: String,
    /// Handler id for task attempts, otherwise one of [`span_kind`].
    pub task_kind: String,
    /// 1-based attempt number; 0 for spans that are not task attempts.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: SpanStatus,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Span {
    /// Wall-clock duration in milliseconds (0 if the clock went backwards).
    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn attr(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }
}
