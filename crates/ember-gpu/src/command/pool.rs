use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::backend::Backend;
use crate::error::{GpuError, Result};
use crate::sync::{Fence, FenceValue};

use super::{AllocatorId, CommandAllocator, CommandCategory};

/// Snapshot of one pooled allocator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PooledAllocator {
    pub id: AllocatorId,
    pub stamp: FenceValue,
}

/// Pool of reusable allocators for one command category.
///
/// # Memory strategy
///
/// - Allocators are created on demand when no pooled allocator is eligible.
/// - They are never destroyed while the pool lives; released allocators go back
///   to the free queue stamped with the fence value of their last submission.
/// - An allocator is eligible once its stamp is reached. Any eligible allocator
///   may be returned, not only the oldest.
///
/// # Thread safety
///
/// `acquire` and `release` serialize on one mutex. An allocator is removed from
/// the queue under the lock, so two callers can never receive the same one.
pub struct AllocatorPool<B: Backend> {
    category: CommandCategory,
    free: Mutex<VecDeque<CommandAllocator<B>>>,
    live: AtomicUsize,
    next_serial: AtomicU32,
    limit: Option<usize>,
    initial_capacity: usize,
}

impl<B: Backend> AllocatorPool<B> {
    pub fn new(category: CommandCategory, limit: Option<usize>, initial_capacity: usize) -> Self {
        Self {
            category,
            free: Mutex::new(VecDeque::new()),
            live: AtomicUsize::new(0),
            next_serial: AtomicU32::new(0),
            limit,
            initial_capacity,
        }
    }

    #[inline]
    pub fn category(&self) -> CommandCategory {
        self.category
    }

    /// Number of allocators created by this pool (pooled + checked out).
    #[inline]
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn available_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Pooled allocators in queue order.
    pub fn available(&self) -> Vec<PooledAllocator> {
        self.free
            .lock()
            .iter()
            .map(|a| PooledAllocator {
                id: a.id(),
                stamp: a.stamp(),
            })
            .collect()
    }

    /// Creates `count` allocators up front and pools them.
    pub fn prewarm(&self, count: usize) -> Result<()> {
        for _ in 0..count {
            let allocator = self.create()?;
            self.free.lock().push_back(allocator);
        }
        Ok(())
    }

    /// Returns an allocator whose stamp is reached, creating one on miss.
    pub fn acquire(&self, fence: &Fence) -> Result<CommandAllocator<B>> {
        let reusable = {
            let mut free = self.free.lock();
            let completed = fence.completed_value();
            free.iter()
                .position(|a| a.stamp() <= completed)
                .and_then(|index| free.remove(index))
        };

        match reusable {
            Some(mut allocator) => {
                if let Err(err) = allocator.reset() {
                    log::error!("{err}; keeping it pooled");
                    self.free.lock().push_back(allocator);
                    return Err(err);
                }
                log::trace!(
                    "reusing allocator {} (stamp {})",
                    allocator.id(),
                    allocator.stamp()
                );
                Ok(allocator)
            }
            None => self.create(),
        }
    }

    /// Returns an allocator to the pool, stamped with `stamp`.
    pub fn release(&self, mut allocator: CommandAllocator<B>, stamp: FenceValue) {
        debug_assert_eq!(allocator.category(), self.category);
        allocator.set_stamp(stamp);
        // Drop recorded pipelines and buffers now rather than on the next
        // acquire. A stream the queue still holds is reclaimed later.
        if allocator.reset().is_err() {
            log::trace!("allocator {} still in flight at release", allocator.id());
        }
        log::trace!("released allocator {} at stamp {stamp}", allocator.id());
        self.free.lock().push_back(allocator);
    }

    fn create(&self) -> Result<CommandAllocator<B>> {
        let limit = self.limit;
        let live = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| match limit {
                Some(max) if live >= max => None,
                _ => Some(live + 1),
            })
            .map_err(|live| GpuError::ResourceExhausted {
                category: self.category,
                live,
                reason: "allocator limit reached and no pooled allocator is idle".to_owned(),
            })?;

        let id = AllocatorId {
            category: self.category,
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
        };

        match CommandAllocator::new(id, self.initial_capacity) {
            Ok(allocator) => {
                log::debug!("created allocator {id} ({} live)", live + 1);
                Ok(allocator)
            }
            Err(err) => {
                self.live.fetch_sub(1, Ordering::AcqRel);
                Err(GpuError::ResourceExhausted {
                    category: self.category,
                    live,
                    reason: err.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;
    use crate::backend::soft::{KernelContext, SoftBackend, SoftKernel, SoftLayout};
    use crate::command::Command;
    use crate::pipeline::PipelineBundle;

    fn pool(limit: Option<usize>) -> AllocatorPool<SoftBackend> {
        AllocatorPool::new(CommandCategory::Compute, limit, 8)
    }

    #[test]
    fn empty_pool_creates_allocators() {
        let pool = pool(None);
        let fence = Fence::new();

        let a = pool.acquire(&fence).unwrap();
        let b = pool.acquire(&fence).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.live_count(), 2);
        assert_eq!(pool.available_count(), 0);
    }

    #[test]
    fn released_allocator_is_reused_once_reached() {
        let pool = pool(None);
        let fence = Fence::new();
        let value = fence.signal_next();

        let a = pool.acquire(&fence).unwrap();
        let id = a.id();
        pool.release(a, value);

        // Not reached yet: a fresh allocator is created instead.
        let b = pool.acquire(&fence).unwrap();
        assert_ne!(b.id(), id);
        pool.release(b, FenceValue::ZERO);

        fence.complete(value);
        let ids: Vec<_> = (0..2).map(|_| pool.acquire(&fence).unwrap().id()).collect();
        assert!(ids.contains(&id));
        assert_eq!(pool.live_count(), 2);
    }

    #[test]
    fn any_reached_allocator_is_eligible() {
        let pool = pool(None);
        let fence = Fence::new();
        let first = fence.signal_next();
        let second = fence.signal_next();

        let a = pool.acquire(&fence).unwrap();
        let b = pool.acquire(&fence).unwrap();
        let b_id = b.id();
        pool.release(a, second);
        pool.release(b, first);

        fence.complete(first);
        let reused = pool.acquire(&fence).unwrap();
        assert_eq!(reused.id(), b_id);
    }

    #[test]
    fn limit_reports_resource_exhaustion() {
        let pool = pool(Some(1));
        let fence = Fence::new();
        let value = fence.signal_next();

        let a = pool.acquire(&fence).unwrap();
        pool.release(a, value);

        let err = pool.acquire(&fence).unwrap_err();
        assert!(matches!(
            err,
            GpuError::ResourceExhausted { category: CommandCategory::Compute, live: 1, .. }
        ));

        fence.complete(value);
        assert!(pool.acquire(&fence).is_ok());
    }

    #[test]
    fn release_drops_recorded_references() {
        let pool = pool(None);
        let fence = Fence::new();
        let bundle = Arc::new(PipelineBundle::new(
            "noop",
            SoftLayout::new(0),
            SoftKernel::new(|_: &KernelContext<'_>| {}),
        ));

        let mut a = pool.acquire(&fence).unwrap();
        a.record(Command::SetPipeline(Arc::clone(&bundle)));
        assert_eq!(Arc::strong_count(&bundle), 2);

        pool.release(a, FenceValue::ZERO);
        assert_eq!(Arc::strong_count(&bundle), 1);
    }

    #[test]
    fn release_keeps_streams_the_queue_still_holds() {
        let pool = pool(None);
        let fence = Fence::new();
        let value = fence.signal_next();

        let mut a = pool.acquire(&fence).unwrap();
        a.record(Command::Dispatch { groups: [1, 1, 1] });
        let queued = a.freeze();
        pool.release(a, value);
        assert_eq!(queued.len(), 1);

        drop(queued);
        fence.complete(value);
        let reused = pool.acquire(&fence).unwrap();
        assert!(reused.recorded().is_empty());
    }

    #[test]
    fn prewarm_fills_the_free_queue() {
        let pool = pool(Some(4));
        pool.prewarm(3).unwrap();
        assert_eq!(pool.available_count(), 3);
        assert_eq!(pool.live_count(), 3);

        assert!(pool.prewarm(2).is_err());
        assert_eq!(pool.live_count(), 4);
    }

    #[test]
    fn available_reports_stamps() {
        let pool = pool(None);
        let fence = Fence::new();
        let value = fence.signal_next();

        let a = pool.acquire(&fence).unwrap();
        let id = a.id();
        pool.release(a, value);

        assert_eq!(pool.available(), vec![PooledAllocator { id, stamp: value }]);
    }

    #[test]
    fn concurrent_acquire_never_duplicates() {
        const THREADS: usize = 8;
        let pool = pool(None);
        let fence = Fence::new();

        // Seed a few reusable allocators so threads race on both paths.
        let seeded: Vec<_> = (0..3).map(|_| pool.acquire(&fence).unwrap()).collect();
        for a in seeded {
            pool.release(a, FenceValue::ZERO);
        }

        let barrier = Barrier::new(THREADS);
        let ids: Vec<AllocatorId> = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        pool.acquire(&fence).unwrap()
                    })
                })
                .collect();
            // Hold every allocator until all threads have one.
            let held: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            held.iter().map(CommandAllocator::id).collect()
        });

        let unique: HashSet<_> = ids.iter().copied().collect();
        assert_eq!(unique.len(), THREADS);
        assert_eq!(pool.live_count(), THREADS);
    }
}
