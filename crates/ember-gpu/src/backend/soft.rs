//! CPU reference queue.
//!
//! Runs submissions on a dedicated worker thread, one at a time, in the order
//! they were submitted. Buffers are shared byte vectors and kernels are plain
//! Rust closures invoked once per work group, which makes the backend usable in
//! tests and on machines without a GPU.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytemuck::Pod;
use parking_lot::Mutex;

use crate::binding::{DescriptorHeap, DescriptorRange, MAX_TABLE_SLOTS};
use crate::command::{Command, CommandStream};
use crate::error::{GpuError, Result};
use crate::pipeline::PipelineBundle;

use super::{Backend, GpuBuffer, Submission};

/// Initialization parameters for [`SoftBackend`].
#[derive(Debug, Clone)]
pub struct SoftInit {
    /// Queue name; also names the worker thread.
    pub label: String,

    /// Artificial execution time added to every submission.
    ///
    /// `None` completes work as fast as the worker can run it.
    pub latency: Option<Duration>,
}

impl Default for SoftInit {
    fn default() -> Self {
        Self {
            label: "soft-queue".to_owned(),
            latency: None,
        }
    }
}

// ── Resources ──────────────────────────────────────────────────────────────

/// Host-memory buffer. Clones share storage.
#[derive(Clone)]
pub struct SoftBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
    size: u64,
}

impl SoftBuffer {
    pub fn zeroed(size: usize) -> Self {
        Self::from_vec(vec![0; size])
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_vec(bytes.to_vec())
    }

    pub fn from_slice<T: Pod>(values: &[T]) -> Self {
        Self::from_bytes(bytemuck::cast_slice(values))
    }

    fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            size: bytes.len() as u64,
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copies the contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Copies the contents out as `T`s. Trailing bytes that do not fill a
    /// whole `T` are ignored.
    pub fn read_as<T: Pod>(&self) -> Vec<T> {
        let width = size_of::<T>();
        if width == 0 {
            return Vec::new();
        }
        let bytes = self.bytes.lock();
        let whole = bytes.len() - bytes.len() % width;
        bytemuck::pod_collect_to_vec(&bytes[..whole])
    }

    /// Overwrites `values.len()` elements starting at byte `offset`.
    pub fn write<T: Pod>(&self, offset: u64, values: &[T]) -> Result<()> {
        let data: &[u8] = bytemuck::cast_slice(values);
        let size = data.len() as u64;
        let end = offset.checked_add(size).filter(|&end| end <= self.size);
        let Some(end) = end else {
            return Err(GpuError::CopyOutOfBounds {
                src_offset: 0,
                src_len: size,
                dst_offset: offset,
                dst_len: self.size,
                size,
            });
        };

        self.bytes.lock()[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    /// Whether both handles refer to the same storage.
    pub fn same_buffer(&self, other: &SoftBuffer) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

impl GpuBuffer for SoftBuffer {
    #[inline]
    fn size(&self) -> u64 {
        self.size
    }
}

impl fmt::Debug for SoftBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftBuffer")
            .field("size", &self.size)
            .field("storage", &Arc::as_ptr(&self.bytes))
            .finish()
    }
}

/// Binding layout of a soft kernel: how many resource tables it reads.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SoftLayout {
    table_slots: u32,
}

impl SoftLayout {
    pub fn new(table_slots: u32) -> Self {
        Self {
            table_slots: table_slots.min(MAX_TABLE_SLOTS),
        }
    }

    #[inline]
    pub fn table_slots(&self) -> u32 {
        self.table_slots
    }
}

type KernelFn = dyn Fn(&KernelContext<'_>) + Send + Sync;

/// Compute kernel run on the CPU, once per work group.
#[derive(Clone)]
pub struct SoftKernel(Arc<KernelFn>);

impl SoftKernel {
    pub fn new(kernel: impl Fn(&KernelContext<'_>) + Send + Sync + 'static) -> Self {
        Self(Arc::new(kernel))
    }
}

impl fmt::Debug for SoftKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SoftKernel")
    }
}

/// What a kernel invocation sees.
pub struct KernelContext<'a> {
    group: [u32; 3],
    groups: [u32; 3],
    tables: &'a [Vec<SoftBuffer>],
}

impl KernelContext<'_> {
    /// Work group being executed.
    #[inline]
    pub fn group_id(&self) -> [u32; 3] {
        self.group
    }

    /// Dispatch size.
    #[inline]
    pub fn group_count(&self) -> [u32; 3] {
        self.groups
    }

    /// Work group index in x-major order.
    pub fn linear_group(&self) -> u64 {
        let [x, y, z] = self.group.map(u64::from);
        let [w, h, _] = self.groups.map(u64::from);
        x + w * (y + h * z)
    }

    /// Buffers bound to `slot`; empty when nothing is bound there.
    pub fn table(&self, slot: u32) -> &[SoftBuffer] {
        match self.tables.get(slot as usize) {
            Some(buffers) => buffers,
            None => &[],
        }
    }
}

// ── Queue ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct QueueCounters {
    submitted: AtomicU64,
    executed: AtomicU64,
    faults: AtomicU64,
}

/// CPU queue backend.
pub struct SoftBackend {
    label: String,
    sender: Option<flume::Sender<Submission<SoftBackend>>>,
    worker: Option<JoinHandle<()>>,
    counters: Arc<QueueCounters>,
}

impl SoftBackend {
    /// Starts the worker thread.
    pub fn new(init: SoftInit) -> Result<Self> {
        let (sender, receiver) = flume::unbounded::<Submission<SoftBackend>>();
        let counters = Arc::new(QueueCounters::default());

        let worker = {
            let counters = Arc::clone(&counters);
            let latency = init.latency;
            thread::Builder::new()
                .name(init.label.clone())
                .spawn(move || {
                    while let Ok(submission) = receiver.recv() {
                        run_submission(submission, latency, &counters);
                    }
                    log::trace!("soft queue worker exiting");
                })
                .map_err(|err| GpuError::Backend(format!("failed to start soft queue: {err}")))?
        };

        log::debug!("soft queue '{}' started (latency {:?})", init.label, init.latency);

        Ok(Self {
            label: init.label,
            sender: Some(sender),
            worker: Some(worker),
            counters,
        })
    }

    /// Queue entries accepted so far.
    pub fn submissions(&self) -> u64 {
        self.counters.submitted.load(Ordering::Acquire)
    }

    /// Queue entries fully executed so far.
    pub fn executed(&self) -> u64 {
        self.counters.executed.load(Ordering::Acquire)
    }

    /// Commands that failed on the queue (unwritten descriptors, kernel panics).
    pub fn faults(&self) -> u64 {
        self.counters.faults.load(Ordering::Acquire)
    }
}

impl Backend for SoftBackend {
    type Buffer = SoftBuffer;
    type BindingLayout = SoftLayout;
    type Pipeline = SoftKernel;

    fn name(&self) -> &str {
        &self.label
    }

    fn submit(&self, submission: Submission<Self>) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| GpuError::QueueClosed(self.label.clone()))?;

        sender
            .send(submission)
            .map_err(|_| GpuError::QueueClosed(self.label.clone()))?;
        self.counters.submitted.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl Drop for SoftBackend {
    fn drop(&mut self) {
        // Disconnecting lets the worker drain what is queued, then exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("soft queue '{}' worker panicked", self.label);
            }
        }
    }
}

impl fmt::Debug for SoftBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftBackend")
            .field("label", &self.label)
            .field("submissions", &self.submissions())
            .finish()
    }
}

fn run_submission(
    submission: Submission<SoftBackend>,
    latency: Option<Duration>,
    counters: &QueueCounters,
) {
    if let Some(latency) = latency {
        thread::sleep(latency);
    }

    let Submission {
        signal,
        fence,
        heap,
        streams,
    } = submission;

    for stream in &streams {
        let faults = execute_stream(stream, &heap);
        if faults > 0 {
            counters.faults.fetch_add(faults, Ordering::AcqRel);
        }
    }

    // Allocators stamped with `signal` reclaim their storage as soon as the
    // fence says so.
    drop(streams);
    counters.executed.fetch_add(1, Ordering::AcqRel);
    fence.complete(signal);
    log::trace!("soft queue completed fence {signal}");
}

/// Runs one command list. Binding state does not carry over between lists.
fn execute_stream(stream: &CommandStream<SoftBackend>, heap: &DescriptorHeap<SoftBackend>) -> u64 {
    let mut faults = 0;
    let mut pipeline: Option<&PipelineBundle<SoftBackend>> = None;
    let mut tables: [Option<DescriptorRange>; MAX_TABLE_SLOTS as usize] = Default::default();

    for command in stream.commands() {
        let outcome = match command {
            Command::SetPipeline(bundle) => {
                pipeline = Some(&**bundle);
                Ok(())
            }
            Command::SetResourceTable { slot, range } => {
                tables[*slot as usize] = Some(*range);
                Ok(())
            }
            Command::CopyRegion {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                copy(src, *src_offset, dst, *dst_offset, *size);
                Ok(())
            }
            Command::Dispatch { groups } => match pipeline {
                Some(bundle) => dispatch(bundle, &tables, heap, *groups),
                None => Err("dispatch without pipeline".to_owned()),
            },
        };

        if let Err(reason) = outcome {
            log::error!("soft queue: {} failed: {reason}", command.name());
            faults += 1;
        }
    }

    faults
}

fn copy(src: &SoftBuffer, src_offset: u64, dst: &SoftBuffer, dst_offset: u64, size: u64) {
    let (src_offset, dst_offset, size) = (src_offset as usize, dst_offset as usize, size as usize);

    if src.same_buffer(dst) {
        src.bytes
            .lock()
            .copy_within(src_offset..src_offset + size, dst_offset);
        return;
    }

    let src = src.bytes.lock();
    let mut dst = dst.bytes.lock();
    dst[dst_offset..dst_offset + size].copy_from_slice(&src[src_offset..src_offset + size]);
}

fn dispatch(
    bundle: &PipelineBundle<SoftBackend>,
    tables: &[Option<DescriptorRange>],
    heap: &DescriptorHeap<SoftBackend>,
    groups: [u32; 3],
) -> std::result::Result<(), String> {
    let bound = tables
        .iter()
        .take(bundle.layout().table_slots() as usize)
        .map(|range| match range {
            Some(range) => heap
                .resolve(*range)
                .map(|buffers| buffers.into_iter().cloned().collect()),
            None => Ok(Vec::new()),
        })
        .collect::<Result<Vec<Vec<SoftBuffer>>>>()
        .map_err(|err| err.to_string())?;

    let kernel: &KernelFn = &*bundle.pipeline().0;
    let [gx, gy, gz] = groups;
    for z in 0..gz {
        for y in 0..gy {
            for x in 0..gx {
                let context = KernelContext {
                    group: [x, y, z],
                    groups,
                    tables: &bound,
                };
                panic::catch_unwind(AssertUnwindSafe(|| kernel(&context))).map_err(|_| {
                    format!("kernel '{}' panicked in group {:?}", bundle.kernel(), [x, y, z])
                })?;
            }
        }
    }

    Ok(())
}
