use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::backend::{Backend, GpuBuffer};
use crate::binding::{DescriptorHeap, DescriptorRange, MAX_TABLE_SLOTS};
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::pipeline::PipelineBundle;
use crate::sync::FenceValue;

use super::{AllocatorId, Command, CommandAllocator, CommandCategory, CommandStream};

/// Identity of a command list within its device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListId(pub u64);

impl fmt::Display for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Recording state of a command list.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ListState {
    /// Accepting commands.
    Open,
    /// Recording ended; waiting to be handed to [`Device::execute`].
    Closed,
    /// Handed to the queue. Terminal.
    Submitted,
}

impl fmt::Display for ListState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ListState::Open => "open",
            ListState::Closed => "closed",
            ListState::Submitted => "submitted",
        })
    }
}

/// Single-use recording session.
///
/// A list exclusively owns one allocator from its category's pool until it is
/// dropped. Dropping returns the allocator stamped with the submission's fence
/// value, or with the stamp it had before acquisition when nothing was
/// submitted.
///
/// Lists borrow their device and are neither `Send` nor `Sync`: recording stays
/// on the thread and in the scope that opened the list.
pub struct CommandList<'d, B: Backend> {
    device: &'d Device<B>,
    id: ListId,
    category: CommandCategory,
    state: ListState,
    allocator: Option<CommandAllocator<B>>,
    allocator_id: AllocatorId,
    prior_stamp: FenceValue,
    submitted: Option<FenceValue>,
    heap: Option<Arc<DescriptorHeap<B>>>,
    pipeline: Option<Arc<PipelineBundle<B>>>,
    tables: [Option<DescriptorRange>; MAX_TABLE_SLOTS as usize],
    _not_send: PhantomData<*const ()>,
}

impl<'d, B: Backend> CommandList<'d, B> {
    pub(crate) fn open(
        device: &'d Device<B>,
        id: ListId,
        category: CommandCategory,
        allocator: CommandAllocator<B>,
        heap: Option<Arc<DescriptorHeap<B>>>,
    ) -> Self {
        Self {
            device,
            id,
            category,
            state: ListState::Open,
            allocator_id: allocator.id(),
            prior_stamp: allocator.stamp(),
            allocator: Some(allocator),
            submitted: None,
            heap,
            pipeline: None,
            tables: [None; MAX_TABLE_SLOTS as usize],
            _not_send: PhantomData,
        }
    }

    #[inline]
    pub fn id(&self) -> ListId {
        self.id
    }

    #[inline]
    pub fn category(&self) -> CommandCategory {
        self.category
    }

    #[inline]
    pub fn state(&self) -> ListState {
        self.state
    }

    #[inline]
    pub fn allocator_id(&self) -> AllocatorId {
        self.allocator_id
    }

    /// Fence value signalled by this list's submission.
    #[inline]
    pub fn submitted_value(&self) -> Option<FenceValue> {
        self.submitted
    }

    /// Shared descriptor heap; `None` for copy lists.
    #[inline]
    pub fn descriptor_heap(&self) -> Option<&Arc<DescriptorHeap<B>>> {
        self.heap.as_ref()
    }

    #[inline]
    pub fn bound_pipeline(&self) -> Option<&Arc<PipelineBundle<B>>> {
        self.pipeline.as_ref()
    }

    /// Range last bound to `slot`.
    pub fn resource_table(&self, slot: u32) -> Option<DescriptorRange> {
        self.tables.get(slot as usize).copied().flatten()
    }

    /// Commands recorded so far.
    pub fn recorded(&self) -> &[Command<B>] {
        match &self.allocator {
            Some(allocator) => allocator.recorded(),
            None => &[],
        }
    }

    // ── Recording ──────────────────────────────────────────────────────────

    /// Binds a compute pipeline for subsequent dispatches.
    pub fn bind_pipeline(&mut self, bundle: &Arc<PipelineBundle<B>>) -> Result<()> {
        self.ensure_open("bind_pipeline")?;
        self.ensure_compute("bind_pipeline")?;

        self.pipeline = Some(Arc::clone(bundle));
        self.record(Command::SetPipeline(Arc::clone(bundle)));
        Ok(())
    }

    /// Binds a descriptor range to a resource table slot. Last write wins.
    pub fn bind_resource_table(&mut self, slot: u32, range: DescriptorRange) -> Result<()> {
        self.ensure_open("bind_resource_table")?;
        self.ensure_compute("bind_resource_table")?;

        if slot >= MAX_TABLE_SLOTS {
            return Err(GpuError::SlotOutOfRange {
                slot,
                max: MAX_TABLE_SLOTS,
            });
        }

        if let Some(heap) = &self.heap {
            if range.end().is_none_or(|end| end > heap.capacity()) {
                return Err(GpuError::DescriptorOutOfRange {
                    index: range.start.saturating_add(range.count),
                    capacity: heap.capacity(),
                });
            }
        }

        self.tables[slot as usize] = Some(range);
        self.record(Command::SetResourceTable { slot, range });
        Ok(())
    }

    /// Copies `size` bytes from `src[src_offset..]` to `dst[dst_offset..]`.
    pub fn copy_region(
        &mut self,
        src: &B::Buffer,
        src_offset: u64,
        dst: &B::Buffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.ensure_open("copy_region")?;

        let fits = |offset: u64, len: u64| offset.checked_add(size).is_some_and(|end| end <= len);
        if !fits(src_offset, src.size()) || !fits(dst_offset, dst.size()) {
            return Err(GpuError::CopyOutOfBounds {
                src_offset,
                src_len: src.size(),
                dst_offset,
                dst_len: dst.size(),
                size,
            });
        }

        self.record(Command::CopyRegion {
            src: src.clone(),
            src_offset,
            dst: dst.clone(),
            dst_offset,
            size,
        });
        Ok(())
    }

    /// Dispatches the bound pipeline over `x * y * z` work groups.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.ensure_open("dispatch")?;
        self.ensure_compute("dispatch")?;

        if self.pipeline.is_none() {
            return Err(GpuError::NoPipelineBound {
                list: self.id,
                category: self.category,
            });
        }

        self.record(Command::Dispatch { groups: [x, y, z] });
        Ok(())
    }

    // ── Submission ─────────────────────────────────────────────────────────

    /// Ends recording without submitting.
    pub fn close(&mut self) -> Result<()> {
        self.ensure_open("close")?;
        self.state = ListState::Closed;
        Ok(())
    }

    /// Submits the list and blocks until the queue has finished it.
    ///
    /// Returns the fence value signalled by the submission; it is reached when
    /// this returns.
    pub fn execute_and_wait(&mut self) -> Result<FenceValue> {
        self.ensure_open("execute_and_wait")?;

        let device = self.device;
        let value = device.execute(std::slice::from_mut(self))?;
        device.wait_until(value)?;
        Ok(value)
    }

    pub(crate) fn belongs_to(&self, device: &Device<B>) -> bool {
        std::ptr::eq(self.device, device)
    }

    pub(crate) fn ensure_submittable(&self) -> Result<()> {
        match self.state {
            ListState::Open | ListState::Closed => Ok(()),
            ListState::Submitted => Err(self.invalid_state("submit")),
        }
    }

    /// Closes the list and freezes its recording for the queue.
    pub(crate) fn freeze(&mut self) -> Result<Arc<CommandStream<B>>> {
        self.ensure_submittable()?;
        self.state = ListState::Closed;
        self.allocator
            .as_mut()
            .map(CommandAllocator::freeze)
            .ok_or_else(|| self.invalid_state("submit"))
    }

    pub(crate) fn mark_submitted(&mut self, value: FenceValue) {
        self.state = ListState::Submitted;
        self.submitted = Some(value);
    }

    fn record(&mut self, command: Command<B>) {
        log::trace!("list {} records {}", self.id, command.name());
        if let Some(allocator) = self.allocator.as_mut() {
            allocator.record(command);
        }
    }

    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        if self.state == ListState::Open {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }

    fn ensure_compute(&self, operation: &'static str) -> Result<()> {
        if self.category == CommandCategory::Compute {
            Ok(())
        } else {
            Err(GpuError::UnsupportedOperation {
                list: self.id,
                category: self.category,
                operation,
            })
        }
    }

    fn invalid_state(&self, operation: &'static str) -> GpuError {
        GpuError::InvalidState {
            list: self.id,
            category: self.category,
            state: self.state,
            operation,
        }
    }
}

impl<B: Backend> Drop for CommandList<'_, B> {
    fn drop(&mut self) {
        let Some(allocator) = self.allocator.take() else {
            return;
        };

        let stamp = match self.submitted {
            Some(value) => value,
            None => {
                log::trace!("list {} discarded while {}", self.id, self.state);
                self.prior_stamp
            }
        };

        self.device.retire_list(allocator, stamp);
    }
}

impl<B: Backend> fmt::Debug for CommandList<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandList")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("state", &self.state)
            .field("allocator", &self.allocator_id)
            .field("submitted", &self.submitted)
            .finish()
    }
}
