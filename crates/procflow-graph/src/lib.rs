//! Process definitions: nodes, flows, conditions and structural validation.
//!
//! A [`ProcessDefinition`] is built once from JSON or TOML and never mutated.
//! Building it checks every structural rule (unique ids, one start node, no
//! dangling flows, a matching join for every parallel split) so the
//! interpreter can walk it without re-validating.

pub mod condition;
pub mod definition;
pub mod flow;
pub mod node;
pub mod topology;

pub use condition::{CompareOp, Condition};
pub use definition::{DefinitionDocument, ProcessDefinition};
pub use flow::Flow;
pub use node::{
    Backoff, BoundaryPolicy, Completion, Fallback, MultiInstanceSpec, Node, NodeKind, Severity,
    TaskSpec,
};
pub use topology::Topology;
