//! Native queue backends.
//!
//! A backend is the only code that talks to the native queue. The device hands
//! it fully recorded command streams through [`Backend::submit`]; the backend
//! executes them in FIFO order and reports completion on the fence.
//!
//! Contract for implementors:
//! - submissions run in the order `submit` was called
//! - recorded streams are dropped before [`Fence::complete`] is called, so an
//!   allocator whose stamp is reached can always reclaim its storage
//! - completion is reported exactly for the submission's `signal` value

pub mod soft;
pub mod webgpu;

use std::fmt;
use std::sync::Arc;

use crate::binding::DescriptorHeap;
use crate::command::CommandStream;
use crate::error::Result;
use crate::sync::{Fence, FenceValue};

pub use self::soft::SoftBackend;
pub use self::webgpu::WgpuBackend;

/// GPU buffer handle as seen by the recording layer.
pub trait GpuBuffer: Clone + Send + Sync + fmt::Debug + 'static {
    /// Size in bytes.
    fn size(&self) -> u64;
}

/// Native queue + resource types.
pub trait Backend: Send + Sync + Sized + 'static {
    type Buffer: GpuBuffer;
    /// Binding layout produced by the shader compiler.
    type BindingLayout: Send + Sync + 'static;
    /// Compiled compute pipeline produced by the shader compiler.
    type Pipeline: Send + Sync + 'static;

    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// Queues a batch of recorded streams behind all earlier submissions.
    fn submit(&self, submission: Submission<Self>) -> Result<()>;
}

/// One queue entry: streams executed in order, then a single fence signal.
pub struct Submission<B: Backend> {
    pub signal: FenceValue,
    pub fence: Arc<Fence>,
    pub heap: Arc<DescriptorHeap<B>>,
    pub streams: Vec<Arc<CommandStream<B>>>,
}

impl<B: Backend> Submission<B> {
    /// Total number of recorded commands across all streams.
    pub fn command_count(&self) -> usize {
        self.streams.iter().map(|s| s.len()).sum()
    }
}
