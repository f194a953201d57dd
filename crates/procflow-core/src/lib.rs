pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{ProcflowConfig, ScoringRules};
pub use error::{ProcflowError, Result, TaskError};
pub use traits::{ConfigSchema, Invocation, ParamType, SpanSink, TaskHandler};
pub use types::*;
