//! Queue synchronization.
//!
//! The [`Fence`] is the only primitive that can answer "has GPU work up to value
//! N finished?".

mod fence;

pub use fence::{Fence, FenceValue};
