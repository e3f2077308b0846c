//! Resource binding.
//!
//! The device owns one [`DescriptorHeap`]; compute command lists bind ranges of
//! it ([`DescriptorRange`]) to resource table slots.

mod heap;

pub use heap::{DescriptorHeap, DescriptorRange};

/// Number of resource table slots a command list can bind.
pub const MAX_TABLE_SLOTS: u32 = 8;
