#[macro_use]
mod log_macros;

pub mod error;
mod ingest;
pub mod lifecycle;
pub mod sink_build;
pub mod source;
pub mod stats;
pub mod tracing_init;
mod worker;

pub use lifecycle::{Processor, ProcessorState, wait_for_signal};
pub use sink_build::SinkCatalog;
pub use stats::StatsSnapshot;
