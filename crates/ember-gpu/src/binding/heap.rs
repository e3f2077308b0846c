use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::backend::Backend;
use crate::error::{GpuError, Result};

/// Contiguous range of descriptors in a [`DescriptorHeap`].
///
/// This is the GPU-visible handle bound to a resource table slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    pub start: u32,
    pub count: u32,
}

impl DescriptorRange {
    #[inline]
    pub fn new(start: u32, count: u32) -> Self {
        Self { start, count }
    }

    /// One past the last index, or `None` if the range overflows `u32`.
    #[inline]
    pub fn end(self) -> Option<u32> {
        self.start.checked_add(self.count)
    }

    /// Heap indices covered by the range, clamped to `u32::MAX`.
    #[inline]
    pub fn indices(self) -> std::ops::Range<u32> {
        self.start..self.start.saturating_add(self.count)
    }
}

impl fmt::Display for DescriptorRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end() {
            Some(end) => write!(f, "[{}..{end})", self.start),
            None => write!(f, "[{}..+{})", self.start, self.count),
        }
    }
}

/// Fixed-capacity table of resource-binding slots shared by all compute lists.
///
/// Each descriptor is written once and never changes afterwards, so readers
/// (recording threads and the queue) access it without locking. Ranges are
/// handed out by an atomic bump cursor; the heap never reclaims them.
pub struct DescriptorHeap<B: Backend> {
    slots: Box<[OnceLock<B::Buffer>]>,
    cursor: AtomicU32,
}

impl<B: Backend> DescriptorHeap<B> {
    pub fn new(capacity: u32) -> Self {
        let slots = (0..capacity).map(|_| OnceLock::new()).collect();
        Self {
            slots,
            cursor: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Number of descriptors handed out so far.
    #[inline]
    pub fn allocated(&self) -> u32 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Reserves `count` contiguous descriptors.
    pub fn allocate(&self, count: u32) -> Result<DescriptorRange> {
        let capacity = self.capacity();
        let start = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(count).filter(|&end| end <= capacity)
            })
            .map_err(|used| GpuError::HeapExhausted {
                requested: count,
                used,
                capacity,
            })?;

        Ok(DescriptorRange::new(start, count))
    }

    /// Publishes `buffer` at `index`.
    pub fn write(&self, index: u32, buffer: B::Buffer) -> Result<()> {
        let slot = self.slot(index)?;
        slot.set(buffer)
            .map_err(|_| GpuError::DescriptorAlreadyWritten { index })
    }

    /// Allocates a range and writes `buffers` into it in order.
    pub fn publish(&self, buffers: &[B::Buffer]) -> Result<DescriptorRange> {
        let range = self.allocate(buffers.len() as u32)?;
        for (index, buffer) in range.indices().zip(buffers) {
            self.write(index, buffer.clone())?;
        }
        log::trace!("published {} descriptors at {range}", buffers.len());
        Ok(range)
    }

    /// Returns the descriptor at `index`, if written.
    pub fn get(&self, index: u32) -> Option<&B::Buffer> {
        self.slots.get(index as usize).and_then(OnceLock::get)
    }

    /// Returns the buffers of a range in order.
    ///
    /// Unwritten or out-of-range descriptors are reported.
    pub fn resolve(&self, range: DescriptorRange) -> Result<Vec<&B::Buffer>> {
        if range.end().is_none() {
            return Err(GpuError::DescriptorOutOfRange {
                index: u32::MAX,
                capacity: self.capacity(),
            });
        }
        range
            .indices()
            .map(|index| {
                self.slot(index)?
                    .get()
                    .ok_or(GpuError::DescriptorUnwritten { index })
            })
            .collect()
    }

    fn slot(&self, index: u32) -> Result<&OnceLock<B::Buffer>> {
        self.slots
            .get(index as usize)
            .ok_or(GpuError::DescriptorOutOfRange {
                index,
                capacity: self.capacity(),
            })
    }
}

impl<B: Backend> fmt::Debug for DescriptorHeap<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorHeap")
            .field("capacity", &self.capacity())
            .field("allocated", &self.allocated())
            .finish()
    }
}
