use std::time::Duration;

/// Initialization parameters for a [`Device`](super::Device).
///
/// Keep this structure small. Add knobs only when a concrete workload needs
/// them.
#[derive(Debug, Clone)]
pub struct DeviceInit {
    /// Label used in logs.
    pub label: String,

    /// Number of descriptors in the shared binding heap.
    pub descriptor_heap_capacity: u32,

    /// Upper bound on allocators per category.
    ///
    /// `None` lets pools grow without limit. Allocators are never destroyed
    /// before teardown, so the bound is also the steady-state footprint.
    pub max_allocators_per_category: Option<usize>,

    /// Allocators created per category when the device starts.
    pub prewarm_allocators: usize,

    /// Commands reserved up front in every new allocator.
    pub initial_command_capacity: usize,

    /// How long teardown waits for the queue to drain before giving up.
    pub teardown_timeout: Duration,
}

impl Default for DeviceInit {
    fn default() -> Self {
        Self {
            label: "ember device".to_owned(),
            descriptor_heap_capacity: 1024,
            max_allocators_per_category: Some(64),
            prewarm_allocators: 0,
            initial_command_capacity: 64,
            teardown_timeout: Duration::from_secs(5),
        }
    }
}
