use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::backend::{Backend, Submission};
use crate::binding::DescriptorHeap;
use crate::command::{AllocatorPool, CommandAllocator, CommandCategory, CommandList, ListId};
use crate::error::{GpuError, Result};
use crate::pipeline::PipelineLibrary;
use crate::sync::{Fence, FenceValue};

use super::{DeviceInit, DeviceStats, PoolStats};

/// Owns the queue (through its backend), the fence, one allocator pool per
/// category, the shared descriptor heap and the pipeline library.
///
/// `Device` is `Sync`: any number of threads may open command lists on it at
/// once. Command lists borrow the device, so it cannot be dropped while one is
/// alive.
pub struct Device<B: Backend> {
    init: DeviceInit,

    /// Completion timeline of the queue.
    fence: Arc<Fence>,

    /// Indexed by `CommandCategory::index`.
    pools: [AllocatorPool<B>; 2],

    heap: Arc<DescriptorHeap<B>>,
    pipelines: PipelineLibrary<B>,

    /// Serializes fence reservation with queue submission so values enter the
    /// queue in increasing order.
    submit_lock: Mutex<()>,

    next_list: AtomicU64,
    live_lists: AtomicUsize,
    submissions: AtomicU64,

    /// Native queue. Dropped last so teardown can drain it first.
    backend: B,
}

impl<B: Backend> Device<B> {
    pub fn new(backend: B, init: DeviceInit) -> Result<Self> {
        let pool = |category| {
            AllocatorPool::new(
                category,
                init.max_allocators_per_category,
                init.initial_command_capacity,
            )
        };
        let pools = [pool(CommandCategory::Compute), pool(CommandCategory::Copy)];
        for pool in &pools {
            pool.prewarm(init.prewarm_allocators)?;
        }
        let heap = Arc::new(DescriptorHeap::new(init.descriptor_heap_capacity));

        log::info!(
            "{}: device ready on '{}' backend ({} descriptors)",
            init.label,
            backend.name(),
            init.descriptor_heap_capacity
        );

        Ok(Self {
            init,
            fence: Arc::new(Fence::new()),
            pools,
            heap,
            pipelines: PipelineLibrary::new(),
            submit_lock: Mutex::new(()),
            next_list: AtomicU64::new(0),
            live_lists: AtomicUsize::new(0),
            submissions: AtomicU64::new(0),
            backend,
        })
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.init.label
    }

    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Last fence value handed to the queue.
    #[inline]
    pub fn last_issued(&self) -> FenceValue {
        self.fence.last_issued()
    }

    /// Last fence value the queue reported as finished.
    #[inline]
    pub fn completed_value(&self) -> FenceValue {
        self.fence.completed_value()
    }

    #[inline]
    pub fn descriptor_heap(&self) -> &Arc<DescriptorHeap<B>> {
        &self.heap
    }

    #[inline]
    pub fn pipelines(&self) -> &PipelineLibrary<B> {
        &self.pipelines
    }

    #[inline]
    pub fn pool(&self, category: CommandCategory) -> &AllocatorPool<B> {
        &self.pools[category.index()]
    }

    /// Opens a recording session backed by an allocator from `category`'s pool.
    pub fn create_command_list(&self, category: CommandCategory) -> Result<CommandList<'_, B>> {
        let allocator = self.pool(category).acquire(&self.fence)?;
        let id = ListId(self.next_list.fetch_add(1, Ordering::Relaxed) + 1);
        let heap = category
            .uses_descriptor_heap()
            .then(|| Arc::clone(&self.heap));

        self.live_lists.fetch_add(1, Ordering::AcqRel);
        log::trace!("opened {category} list {id} on allocator {}", allocator.id());

        Ok(CommandList::open(self, id, category, allocator, heap))
    }

    /// Submits `lists` as one queue entry and returns its fence value.
    ///
    /// Lists run in slice order, after everything submitted earlier and before
    /// anything submitted later. One fence value covers the whole batch; every
    /// list's allocator is stamped with it. Does not block; use
    /// [`wait_until`](Self::wait_until) or [`reached`](Self::reached) on the
    /// returned value.
    ///
    /// Each list must be open or closed and must come from this device.
    pub fn execute(&self, lists: &mut [CommandList<'_, B>]) -> Result<FenceValue> {
        for list in lists.iter() {
            if !list.belongs_to(self) {
                return Err(GpuError::ForeignCommandList { list: list.id() });
            }
            list.ensure_submittable()?;
        }

        let streams = lists
            .iter_mut()
            .map(CommandList::freeze)
            .collect::<Result<Vec<_>>>()?;

        let value = {
            let _queue = self.submit_lock.lock();
            let value = self.fence.signal_next();
            let submission = Submission {
                signal: value,
                fence: Arc::clone(&self.fence),
                heap: Arc::clone(&self.heap),
                streams,
            };
            let commands = submission.command_count();

            if let Err(err) = self.backend.submit(submission) {
                // Nothing was queued; hand the value back so the timeline stays
                // gap-free.
                self.fence.cancel(value);
                log::error!("{}: submission at fence {value} rejected: {err}", self.init.label);
                return Err(err);
            }

            log::debug!(
                "{}: submitted {} list(s), {commands} command(s), fence {value}",
                self.init.label,
                lists.len()
            );
            value
        };

        for list in lists.iter_mut() {
            list.mark_submitted(value);
        }
        self.submissions.fetch_add(1, Ordering::Relaxed);

        Ok(value)
    }

    /// Non-blocking completion query.
    pub fn reached(&self, value: FenceValue) -> Result<bool> {
        self.fence.reached(value)
    }

    /// Blocks until the queue has finished all work up to `value`.
    pub fn wait_until(&self, value: FenceValue) -> Result<()> {
        self.fence.wait_until(value)
    }

    /// Blocks until everything submitted so far has finished.
    pub fn wait_idle(&self) -> Result<()> {
        self.fence.wait_until(self.settled_last_issued())
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            submissions: self.submissions.load(Ordering::Relaxed),
            live_lists: self.live_lists.load(Ordering::Acquire),
            last_issued: self.fence.last_issued(),
            completed: self.fence.completed_value(),
            descriptors_allocated: self.heap.allocated(),
            pools: CommandCategory::ALL.map(|category| {
                let pool = self.pool(category);
                PoolStats {
                    category,
                    live: pool.live_count(),
                    available: pool.available_count(),
                }
            }),
        }
    }

    /// Last issued value with no submission in progress, so a reservation that
    /// is about to be cancelled is never observed.
    fn settled_last_issued(&self) -> FenceValue {
        let _queue = self.submit_lock.lock();
        self.fence.last_issued()
    }

    /// Returns a dropped list's allocator to its pool.
    pub(crate) fn retire_list(&self, allocator: CommandAllocator<B>, stamp: FenceValue) {
        self.pool(allocator.category()).release(allocator, stamp);
        self.live_lists.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<B: Backend> Drop for Device<B> {
    fn drop(&mut self) {
        let last = self.settled_last_issued();
        match self.fence.wait_timeout(last, self.init.teardown_timeout) {
            Ok(true) => log::debug!("{}: queue idle at fence {last}", self.init.label),
            Ok(false) => log::error!(
                "{}: queue still busy after {:?} (completed {}, last issued {last})",
                self.init.label,
                self.init.teardown_timeout,
                self.fence.completed_value()
            ),
            Err(err) => log::error!("{}: teardown wait failed: {err}", self.init.label),
        }
    }
}
