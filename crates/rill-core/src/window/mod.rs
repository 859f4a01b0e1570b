mod assigner;
mod store;
mod watermark;

pub use assigner::{WindowAssigner, WindowBounds, WindowId};
pub use store::{FoldOutcome, WindowEmission, WindowPhase, WindowStore};
pub use watermark::{NO_WATERMARK, SharedWatermark, WatermarkEstimator};
