//! Task handler registry and the handlers shipped with procflow.

pub mod builtin;
pub mod registry;

pub use registry::TaskRegistry;
