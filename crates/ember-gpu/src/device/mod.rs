//! Queue-owning device.
//!
//! This module is responsible for:
//! - owning the backend, the fence and one allocator pool per category
//! - handing out command lists to recording threads
//! - submitting closed lists in fence order and waiting on completion

mod gpu;
mod init;

pub use gpu::Device;
pub use init::DeviceInit;

use crate::command::CommandCategory;
use crate::sync::FenceValue;

/// Allocator counts for one category.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub category: CommandCategory,
    /// Allocators created so far (pooled + held by open lists).
    pub live: usize,
    /// Allocators sitting in the pool.
    pub available: usize,
}

/// Point-in-time snapshot of a device's bookkeeping.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceStats {
    /// Queue entries accepted by the backend.
    pub submissions: u64,
    /// Command lists not yet dropped.
    pub live_lists: usize,
    pub last_issued: FenceValue,
    pub completed: FenceValue,
    pub descriptors_allocated: u32,
    /// Indexed like [`CommandCategory::ALL`].
    pub pools: [PoolStats; 2],
}

impl DeviceStats {
    pub fn pool(&self, category: CommandCategory) -> &PoolStats {
        &self.pools[category.index()]
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;

    use super::*;
    use crate::backend::soft::{SoftBackend, SoftBuffer, SoftInit, SoftKernel, SoftLayout};
    use crate::backend::{Backend, Submission};
    use crate::command::ListState;
    use crate::error::{FaultKind, GpuError, Result};
    use crate::pipeline::PipelineBundle;

    /// Rejects its first `rejections` submissions. Accepted work is completed
    /// immediately without running it.
    #[derive(Default)]
    struct FlakyBackend {
        rejections: AtomicU32,
        /// Addresses of the streams handed to `submit`, per outcome.
        rejected: Mutex<Vec<usize>>,
        accepted: Mutex<Vec<usize>>,
    }

    impl Backend for FlakyBackend {
        type Buffer = SoftBuffer;
        type BindingLayout = SoftLayout;
        type Pipeline = SoftKernel;

        fn name(&self) -> &str {
            "flaky"
        }

        fn submit(&self, submission: Submission<Self>) -> Result<()> {
            let streams: Vec<usize> = submission
                .streams
                .iter()
                .map(|stream| Arc::as_ptr(stream) as usize)
                .collect();

            let reject = self
                .rejections
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
            if reject {
                self.rejected.lock().extend(streams);
                return Err(GpuError::Backend("queue full".to_owned()));
            }

            self.accepted.lock().extend(streams);
            let Submission { signal, fence, streams, .. } = submission;
            drop(streams);
            fence.complete(signal);
            Ok(())
        }
    }

    fn flaky_device(rejections: u32) -> Device<FlakyBackend> {
        let backend = FlakyBackend {
            rejections: AtomicU32::new(rejections),
            ..FlakyBackend::default()
        };
        Device::new(backend, DeviceInit::default()).unwrap()
    }

    fn device() -> Device<SoftBackend> {
        let soft = SoftBackend::new(SoftInit::default()).unwrap();
        Device::new(soft, DeviceInit::default()).unwrap()
    }

    fn slow_device() -> Device<SoftBackend> {
        let soft = SoftBackend::new(SoftInit {
            latency: Some(Duration::from_millis(30)),
            ..SoftInit::default()
        })
        .unwrap();
        Device::new(soft, DeviceInit::default()).unwrap()
    }

    fn noop_bundle() -> Arc<PipelineBundle<SoftBackend>> {
        Arc::new(PipelineBundle::new(
            "noop",
            SoftLayout::new(1),
            SoftKernel::new(|_| {}),
        ))
    }

    // ── Lists ──────────────────────────────────────────────────────────────

    #[test]
    fn copy_lists_have_no_heap() {
        let device = device();
        let copy = device.create_command_list(CommandCategory::Copy).unwrap();
        let compute = device.create_command_list(CommandCategory::Compute).unwrap();

        assert!(copy.descriptor_heap().is_none());
        assert!(Arc::ptr_eq(
            compute.descriptor_heap().unwrap(),
            device.descriptor_heap()
        ));
    }

    #[test]
    fn open_lists_hold_distinct_allocators() {
        let device = device();
        let a = device.create_command_list(CommandCategory::Compute).unwrap();
        let b = device.create_command_list(CommandCategory::Compute).unwrap();

        assert_ne!(a.allocator_id(), b.allocator_id());
        assert_eq!(device.stats().live_lists, 2);
    }

    #[test]
    fn discarded_list_is_reusable_without_queue_entry() {
        let device = device();
        let id = {
            let mut list = device.create_command_list(CommandCategory::Compute).unwrap();
            list.bind_pipeline(&noop_bundle()).unwrap();
            list.allocator_id()
        };

        let stats = device.stats();
        assert_eq!(stats.submissions, 0);
        assert_eq!(stats.last_issued, FenceValue::ZERO);
        assert_eq!(stats.live_lists, 0);

        let again = device.create_command_list(CommandCategory::Compute).unwrap();
        assert_eq!(again.allocator_id(), id);
        assert!(again.recorded().is_empty());
    }

    #[test]
    fn submitted_list_rejects_recording() {
        let device = device();
        let mut list = device.create_command_list(CommandCategory::Compute).unwrap();
        list.execute_and_wait().unwrap();

        assert_eq!(list.state(), ListState::Submitted);
        let err = list.bind_pipeline(&noop_bundle()).unwrap_err();
        assert!(err.is_invalid_state());
        assert!(list.execute_and_wait().unwrap_err().is_invalid_state());
    }

    #[test]
    fn closed_list_rejects_recording_but_can_be_executed() {
        let device = device();
        let mut list = device.create_command_list(CommandCategory::Copy).unwrap();
        list.close().unwrap();

        let buffer = SoftBuffer::zeroed(4);
        assert!(matches!(
            list.copy_region(&buffer, 0, &buffer, 0, 4),
            Err(GpuError::InvalidState { state: ListState::Closed, .. })
        ));

        let value = device.execute(std::slice::from_mut(&mut list)).unwrap();
        device.wait_until(value).unwrap();
        assert_eq!(list.submitted_value(), Some(value));
    }

    // ── Submission ─────────────────────────────────────────────────────────

    #[test]
    fn execute_batches_lists_under_one_fence_value() {
        let device = device();
        let src = SoftBuffer::from_bytes(&[7; 8]);
        let mid = SoftBuffer::zeroed(8);
        let dst = SoftBuffer::zeroed(8);

        let mut first = device.create_command_list(CommandCategory::Copy).unwrap();
        first.copy_region(&src, 0, &mid, 0, 8).unwrap();
        let mut second = device.create_command_list(CommandCategory::Copy).unwrap();
        second.copy_region(&mid, 0, &dst, 0, 8).unwrap();

        let mut lists = [first, second];
        let value = device.execute(&mut lists).unwrap();
        device.wait_until(value).unwrap();

        // Slice order is execution order.
        assert_eq!(dst.to_vec(), vec![7; 8]);
        assert!(lists.iter().all(|l| l.submitted_value() == Some(value)));
        assert_eq!(device.stats().submissions, 1);
        assert_eq!(device.backend().submissions(), 1);
    }

    #[test]
    fn foreign_lists_are_rejected() {
        let a = device();
        let b = device();
        let mut list = b.create_command_list(CommandCategory::Copy).unwrap();

        let err = a.execute(std::slice::from_mut(&mut list)).unwrap_err();
        assert!(matches!(err, GpuError::ForeignCommandList { .. }));
        assert_eq!(list.state(), ListState::Open);
    }

    #[test]
    fn allocator_is_not_reused_before_its_fence_value() {
        let device = slow_device();

        let mut list = device.create_command_list(CommandCategory::Compute).unwrap();
        let first = list.allocator_id();
        let value = device.execute(std::slice::from_mut(&mut list)).unwrap();
        drop(list);

        if !device.reached(value).unwrap() {
            let other = device.create_command_list(CommandCategory::Compute).unwrap();
            assert_ne!(other.allocator_id(), first);
        }

        device.wait_until(value).unwrap();
        let pooled = device.pool(CommandCategory::Compute).available();
        assert!(pooled.iter().any(|a| a.id == first && a.stamp == value));
    }

    #[test]
    fn wait_idle_drains_everything() {
        let device = slow_device();
        for _ in 0..3 {
            let mut list = device.create_command_list(CommandCategory::Copy).unwrap();
            device.execute(std::slice::from_mut(&mut list)).unwrap();
        }

        device.wait_idle().unwrap();
        let stats = device.stats();
        assert_eq!(stats.completed, FenceValue(3));
        assert_eq!(stats.completed, stats.last_issued);
    }

    #[test]
    fn rejected_submission_can_be_resubmitted() {
        let device = flaky_device(1);
        let buffer = SoftBuffer::zeroed(8);
        let mut list = device.create_command_list(CommandCategory::Copy).unwrap();
        list.copy_region(&buffer, 0, &buffer, 4, 4).unwrap();

        let err = device.execute(std::slice::from_mut(&mut list)).unwrap_err();
        assert_eq!(err.kind(), FaultKind::Backend);
        assert_eq!(list.state(), ListState::Closed);
        assert_eq!(device.last_issued(), FenceValue::ZERO);
        assert_eq!(device.stats().submissions, 0);

        // The cancelled value is handed out again, with the same frozen stream.
        let value = device.execute(std::slice::from_mut(&mut list)).unwrap();
        assert_eq!(value, FenceValue(1));
        assert_eq!(list.state(), ListState::Submitted);
        assert_eq!(list.recorded().len(), 1);

        let backend = device.backend();
        assert_eq!(backend.rejected.lock().len(), 1);
        assert_eq!(*backend.rejected.lock(), *backend.accepted.lock());
    }

    #[test]
    fn wait_idle_never_waits_on_a_cancelled_value() {
        const ROUNDS: usize = 200;
        let device = flaky_device(u32::MAX);

        thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    let mut list = device.create_command_list(CommandCategory::Copy).unwrap();
                    assert!(device.execute(std::slice::from_mut(&mut list)).is_err());
                }
            });
            for _ in 0..ROUNDS {
                device.wait_idle().unwrap();
            }
        });

        assert_eq!(device.last_issued(), FenceValue::ZERO);
        assert_eq!(device.completed_value(), FenceValue::ZERO);
    }

    #[test]
    fn fence_only_advances_through_submissions() {
        let device = device();
        assert_eq!(device.last_issued(), FenceValue::ZERO);
        device.wait_idle().unwrap();

        for _ in 0..2 {
            let mut list = device.create_command_list(CommandCategory::Copy).unwrap();
            list.execute_and_wait().unwrap();
        }
        assert_eq!(device.last_issued(), FenceValue(2));
        assert_eq!(device.completed_value(), FenceValue(2));
        assert_eq!(device.backend().submissions(), 2);
    }

    #[test]
    fn idle_device_drops_without_waiting() {
        let init = DeviceInit {
            teardown_timeout: Duration::from_secs(2),
            ..DeviceInit::default()
        };
        let device = Device::new(SoftBackend::new(SoftInit::default()).unwrap(), init).unwrap();

        let started = Instant::now();
        drop(device);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn teardown_drains_in_flight_work() {
        let soft = SoftBackend::new(SoftInit {
            latency: Some(Duration::from_millis(100)),
            ..SoftInit::default()
        })
        .unwrap();
        let device = Device::new(soft, DeviceInit::default()).unwrap();
        let src = SoftBuffer::from_bytes(&[9; 4]);
        let dst = SoftBuffer::zeroed(4);

        let value = {
            let mut list = device.create_command_list(CommandCategory::Copy).unwrap();
            list.copy_region(&src, 0, &dst, 0, 4).unwrap();
            device.execute(std::slice::from_mut(&mut list)).unwrap()
        };
        assert!(!device.reached(value).unwrap());

        drop(device);
        assert_eq!(dst.to_vec(), vec![9; 4]);
    }

    #[test]
    fn unissued_values_are_misuse() {
        let device = device();
        assert!(matches!(
            device.reached(FenceValue(1)),
            Err(GpuError::FenceNotIssued { .. })
        ));
        assert!(device.wait_until(FenceValue(4)).is_err());
    }

    // ── Pools ──────────────────────────────────────────────────────────────

    #[test]
    fn allocator_limit_surfaces_as_resource_exhaustion() {
        let init = DeviceInit {
            max_allocators_per_category: Some(1),
            ..DeviceInit::default()
        };
        let device = Device::new(SoftBackend::new(SoftInit::default()).unwrap(), init).unwrap();

        let _held = device.create_command_list(CommandCategory::Copy).unwrap();
        let err = device.create_command_list(CommandCategory::Copy).unwrap_err();
        assert!(matches!(
            err,
            GpuError::ResourceExhausted { category: CommandCategory::Copy, .. }
        ));

        // Categories have separate pools.
        assert!(device.create_command_list(CommandCategory::Compute).is_ok());
    }

    #[test]
    fn prewarm_populates_both_pools() {
        let init = DeviceInit {
            prewarm_allocators: 2,
            ..DeviceInit::default()
        };
        let device = Device::new(SoftBackend::new(SoftInit::default()).unwrap(), init).unwrap();

        let stats = device.stats();
        for category in CommandCategory::ALL {
            assert_eq!(stats.pool(category).live, 2);
            assert_eq!(stats.pool(category).available, 2);
        }
    }
}
