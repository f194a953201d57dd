use serde::{Deserialize, Serialize};

/// A directed flow between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    /// Condition evaluated by an exclusive gateway. See [`crate::Condition`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Taken by an exclusive gateway when no condition matches.
    #[serde(default, skip_serializing_if = "is_false")]
    pub default: bool,
    /// Taken when the source task fails with a non-critical unresolved error.
    #[serde(default, skip_serializing_if = "is_false")]
    pub on_error: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Flow {
    /// Create an unconditional flow.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: None,
            default: false,
            on_error: false,
        }
    }

    /// Create a conditional flow.
    pub fn conditional(
        source: impl Into<String>,
        target: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self {
            condition: Some(expr.into()),
            ..Self::new(source, target)
        }
    }

    /// Create the default flow of an exclusive gateway.
    pub fn default_flow(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            default: true,
            ..Self::new(source, target)
        }
    }

    /// Create an error flow.
    pub fn on_error(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            on_error: true,
            ..Self::new(source, target)
        }
    }

    /// Whether this flow is followed on normal completion of its source.
    pub fn is_normal(&self) -> bool {
        !self.on_error
    }
}
