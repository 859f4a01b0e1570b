pub mod aggregate;
pub mod document;
pub mod error;
pub mod merge;
pub mod sink;
pub mod validate;
pub mod window;

pub use document::{Document, MalformedRecord};
pub use error::{CoreError, CoreReason, CoreResult};
