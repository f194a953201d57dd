use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A node in the process graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within the definition.
    pub id: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub kind: NodeKind,
}

/// What a node does. Each kind carries exactly the configuration it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    Task(TaskSpec),
    ExclusiveGateway,
    ParallelGateway,
    MultiInstance(MultiInstanceSpec),
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::End)
    }

    pub fn task(id: impl Into<String>, spec: TaskSpec) -> Self {
        Self::new(id, NodeKind::Task(spec))
    }

    pub fn exclusive(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::ExclusiveGateway)
    }

    pub fn parallel(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::ParallelGateway)
    }

    pub fn multi_instance(id: impl Into<String>, spec: MultiInstanceSpec) -> Self {
        Self::new(id, NodeKind::MultiInstance(spec))
    }

    /// Set the human-readable name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The task dispatched by this node, if it dispatches one.
    pub fn task_spec(&self) -> Option<&TaskSpec> {
        match &self.kind {
            NodeKind::Task(spec) => Some(spec),
            NodeKind::MultiInstance(mi) => Some(&mi.task),
            _ => None,
        }
    }
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Task(_) => "task",
            Self::ExclusiveGateway => "exclusive_gateway",
            Self::ParallelGateway => "parallel_gateway",
            Self::MultiInstance(_) => "multi_instance",
        }
    }
}

/// Dispatch information for a task (or each multi-instance element).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Registered handler identifier.
    pub handler: String,
    /// Static configuration, validated against the handler's schema at load.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub config: serde_json::Map<String, serde_json::Value>,
    /// Maximum duration of a single attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Context key receiving the handler's result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boundary: Option<BoundaryPolicy>,
}

impl TaskSpec {
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            config: serde_json::Map::new(),
            timeout_ms: None,
            result_key: None,
            boundary: None,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = config {
            self.config = map;
        }
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn with_result_key(mut self, key: impl Into<String>) -> Self {
        self.result_key = Some(key.into());
        self
    }

    pub fn with_boundary(mut self, policy: BoundaryPolicy) -> Self {
        self.boundary = Some(policy);
        self
    }

    /// The attached policy, or the implicit single-attempt policy.
    pub fn policy(&self) -> BoundaryPolicy {
        self.boundary.clone().unwrap_or_default()
    }
}

/// Fan-out of one task over a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiInstanceSpec {
    pub task: TaskSpec,
    /// Dotted context path that must resolve to an array.
    pub collection: String,
    /// Context key receiving the ordered per-instance results.
    pub result_key: String,
    /// Variable name under which each instance sees its element.
    #[serde(default = "default_element_var")]
    pub element_var: String,
    #[serde(default)]
    pub completion: Completion,
    /// Cap on concurrently running instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

fn default_element_var() -> String {
    "item".to_string()
}

impl MultiInstanceSpec {
    pub fn new(task: TaskSpec, collection: impl Into<String>, result_key: impl Into<String>) -> Self {
        Self {
            task,
            collection: collection.into(),
            result_key: result_key.into(),
            element_var: default_element_var(),
            completion: Completion::default(),
            max_concurrency: None,
        }
    }

    pub fn fail_fast(mut self) -> Self {
        self.completion = Completion::FailFast;
        self
    }
}

/// When a multi-instance node stops waiting for its instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// Wait for every instance, then fail if any failed.
    #[default]
    All,
    /// Cancel outstanding instances on the first unresolved failure.
    FailFast,
}

/// Error-boundary policy attached to a task node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: Backoff,
    /// Error kinds worth retrying. Empty means every kind is retryable.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub retry_on: BTreeSet<String>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub fallback: Fallback,
}

impl Default for BoundaryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::default(),
            retry_on: BTreeSet::new(),
            severity: Severity::default(),
            fallback: Fallback::default(),
        }
    }
}

impl BoundaryPolicy {
    pub fn retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn retry_on(mut self, kind: impl Into<String>) -> Self {
        self.retry_on.insert(kind.into());
        self
    }

    pub fn is_retryable(&self, kind: &str) -> bool {
        self.retry_on.is_empty() || self.retry_on.contains(kind)
    }
}

/// Delay between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { base_ms: u64, cap_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed { delay_ms: 0 }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (1 = first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Self::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Exponential { base_ms, cap_ms } => {
                let exp = retry.saturating_sub(1).min(32);
                let ms = base_ms.saturating_mul(1u64 << exp).min(*cap_ms);
                Duration::from_millis(ms)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// What to do once retries are exhausted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fallback {
    #[default]
    None,
    /// Invoke another registered handler once.
    AlternateHandler { handler: String },
    /// Roll back completed work of the current branch.
    Compensation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_is_attempt_indexed_and_capped() {
        let backoff = Backoff::Exponential {
            base_ms: 100,
            cap_ms: 350,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(350));
        assert_eq!(backoff.delay(40), Duration::from_millis(350));
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = Backoff::Fixed { delay_ms: 25 };
        assert_eq!(backoff.delay(1), backoff.delay(7));
    }

    #[test]
    fn test_retryable_kinds() {
        let any = BoundaryPolicy::retries(2);
        assert!(any.is_retryable("whatever"));

        let narrow = BoundaryPolicy::retries(2).retry_on("transient");
        assert!(narrow.is_retryable("transient"));
        assert!(!narrow.is_retryable("permanent"));
    }

    #[test]
    fn test_node_kind_tagging() {
        let node: Node = serde_json::from_value(serde_json::json!({
            "id": "charge",
            "kind": {
                "type": "task",
                "handler": "charge_card",
                "config": {"amount": 10},
                "boundary": {
                    "max_retries": 3,
                    "backoff": {"type": "exponential", "base_ms": 10, "cap_ms": 100},
                    "severity": "critical",
                    "fallback": {"type": "alternate_handler", "handler": "queue_charge"}
                }
            }
        }))
        .unwrap();

        let NodeKind::Task(spec) = &node.kind else {
            panic!("expected task");
        };
        assert_eq!(spec.handler, "charge_card");
        let policy = spec.policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.severity, Severity::Critical);
        assert_eq!(
            policy.fallback,
            Fallback::AlternateHandler {
                handler: "queue_charge".into()
            }
        );
    }

    #[test]
    fn test_multi_instance_defaults() {
        let node: Node = serde_json::from_value(serde_json::json!({
            "id": "ship",
            "kind": {
                "type": "multi_instance",
                "collection": "order.items",
                "result_key": "shipments",
                "task": {"handler": "ship_item"}
            }
        }))
        .unwrap();

        let NodeKind::MultiInstance(spec) = &node.kind else {
            panic!("expected multi-instance");
        };
        assert_eq!(spec.element_var, "item");
        assert_eq!(spec.completion, Completion::All);
        assert!(spec.task.boundary.is_none());
        assert_eq!(spec.task.policy(), BoundaryPolicy::default());
    }
}
