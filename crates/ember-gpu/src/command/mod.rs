//! Command recording.
//!
//! This module is responsible for:
//! - the allocator pools that recycle recording storage across submissions
//! - the command list recording session and its state machine
//! - the recorded command stream handed to the queue

mod allocator;
mod category;
mod list;
mod pool;
mod stream;

pub use allocator::{AllocatorId, CommandAllocator};
pub use category::CommandCategory;
pub use list::{CommandList, ListId, ListState};
pub use pool::{AllocatorPool, PooledAllocator};
pub use stream::{Command, CommandStream};
