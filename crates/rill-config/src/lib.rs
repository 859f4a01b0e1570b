pub mod logging;
pub mod pipeline;
pub mod processor;
pub mod runtime;
pub mod types;
mod validate;
pub mod window;

pub use logging::{LogFormat, LoggingConfig};
pub use pipeline::{
    Constraint, MergeSpec, Pipeline, PropertyRule, SinkSpec, SourceKind, SourceSpec, UpdateStage,
    ValidateSpec, WhenMatched, WhenNotMatched,
};
pub use processor::ProcessorConfig;
pub use runtime::{RetryConfig, RuntimeConfig};
pub use types::{FieldType, HumanDuration, LatePolicy, TimeUnit, ValidationAction};
pub use window::{AccumulatorOp, AccumulatorSpec, GroupSpec, WindowDefaults, WindowSpec};
