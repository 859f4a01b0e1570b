mod accumulator;
mod group;
mod key;

pub use accumulator::{Accumulator, FoldError};
pub use group::GroupState;
pub use key::GroupKey;
