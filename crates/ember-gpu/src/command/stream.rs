use std::fmt;
use std::sync::Arc;

use crate::backend::Backend;
use crate::binding::DescriptorRange;
use crate::pipeline::PipelineBundle;

use super::CommandCategory;

/// One recorded operation.
pub enum Command<B: Backend> {
    SetPipeline(Arc<PipelineBundle<B>>),
    SetResourceTable {
        slot: u32,
        range: DescriptorRange,
    },
    CopyRegion {
        src: B::Buffer,
        src_offset: u64,
        dst: B::Buffer,
        dst_offset: u64,
        size: u64,
    },
    Dispatch {
        groups: [u32; 3],
    },
}

impl<B: Backend> Command<B> {
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetPipeline(_) => "set_pipeline",
            Command::SetResourceTable { .. } => "set_resource_table",
            Command::CopyRegion { .. } => "copy_region",
            Command::Dispatch { .. } => "dispatch",
        }
    }
}

impl<B: Backend> fmt::Debug for Command<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetPipeline(bundle) => {
                f.debug_tuple("SetPipeline").field(bundle.kernel()).finish()
            }
            Command::SetResourceTable { slot, range } => f
                .debug_struct("SetResourceTable")
                .field("slot", slot)
                .field("range", range)
                .finish(),
            Command::CopyRegion {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => f
                .debug_struct("CopyRegion")
                .field("src", src)
                .field("src_offset", src_offset)
                .field("dst", dst)
                .field("dst_offset", dst_offset)
                .field("size", size)
                .finish(),
            Command::Dispatch { groups } => {
                f.debug_struct("Dispatch").field("groups", groups).finish()
            }
        }
    }
}

/// Recorded command storage owned by a [`CommandAllocator`](super::CommandAllocator).
///
/// While a list is open the allocator owns the stream exclusively. On submission
/// it is frozen into an `Arc` shared with the queue; the allocator can only
/// reclaim it once the queue has dropped its reference.
pub struct CommandStream<B: Backend> {
    category: CommandCategory,
    commands: Vec<Command<B>>,
}

impl<B: Backend> CommandStream<B> {
    pub(crate) fn new(category: CommandCategory, commands: Vec<Command<B>>) -> Self {
        Self { category, commands }
    }

    #[inline]
    pub fn category(&self) -> CommandCategory {
        self.category
    }

    #[inline]
    pub fn commands(&self) -> &[Command<B>] {
        &self.commands
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub(crate) fn push(&mut self, command: Command<B>) {
        self.commands.push(command);
    }

    /// Drops recorded commands, keeping capacity for the next recording.
    pub(crate) fn clear(&mut self) {
        self.commands.clear();
    }
}

impl<B: Backend> fmt::Debug for CommandStream<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStream")
            .field("category", &self.category)
            .field("commands", &self.commands)
            .finish()
    }
}
