//! wgpu queue backend.
//!
//! Recorded streams are encoded into one `wgpu::CommandEncoder` per submission
//! and handed to the `wgpu::Queue`. Completion is reported through
//! `Queue::on_submitted_work_done`; a poller thread drives `Device::poll` so
//! the callbacks fire without anyone calling into wgpu.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result as AnyResult};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use wgpu::util::DeviceExt;

use crate::binding::{DescriptorHeap, DescriptorRange, MAX_TABLE_SLOTS};
use crate::command::{Command, CommandStream};
use crate::error::{GpuError, Result};
use crate::pipeline::{KernelId, PipelineBundle};

use super::{Backend, GpuBuffer, Submission};

/// Initialization parameters for [`WgpuBackend`].
///
/// Keep this structure minimal. Add flags only when a concrete platform
/// requirement exists.
#[derive(Debug, Clone)]
pub struct WgpuInit {
    /// Label used for the wgpu device and in logs.
    pub label: String,

    pub power_preference: wgpu::PowerPreference,

    /// Use a software adapter even when hardware is present.
    pub force_fallback_adapter: bool,

    /// Required wgpu features.
    ///
    /// Favor an empty set for portability unless a feature is strictly necessary.
    pub required_features: wgpu::Features,

    /// Limits requested from the adapter/device.
    pub required_limits: wgpu::Limits,
}

impl Default for WgpuInit {
    fn default() -> Self {
        Self {
            label: "ember wgpu queue".to_owned(),
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
        }
    }
}

impl GpuBuffer for wgpu::Buffer {
    #[inline]
    fn size(&self) -> u64 {
        wgpu::Buffer::size(self)
    }
}

/// Bind groups are cached per kernel, slot and descriptor range. Descriptors
/// never change after publication, so an entry never goes stale.
type BindGroupKey = (KernelId, u32, DescriptorRange);

/// Queue backend over a wgpu device.
pub struct WgpuBackend {
    label: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    bind_groups: Mutex<FxHashMap<BindGroupKey, wgpu::BindGroup>>,
    poll_requests: Option<flume::Sender<()>>,
    poller: Option<JoinHandle<()>>,
}

impl WgpuBackend {
    /// Acquires an adapter and device.
    ///
    /// Adapter/device acquisition is asynchronous under wgpu.
    pub async fn new(init: WgpuInit) -> AnyResult<Self> {
        // Use all backends to allow wgpu to select the optimal platform backend.
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: init.power_preference,
                compatible_surface: None,
                force_fallback_adapter: init.force_fallback_adapter,
            })
            .await
            .context("failed to find a suitable GPU adapter")?;

        log::info!("{}: using adapter {:?}", init.label, adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some(&init.label),
                required_features: init.required_features,
                required_limits: init.required_limits,
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .context("failed to create wgpu device/queue")?;

        Self::from_device(init.label, device, queue)
    }

    /// Blocking variant of [`new`](Self::new).
    pub fn request(init: WgpuInit) -> AnyResult<Self> {
        pollster::block_on(Self::new(init))
    }

    /// Wraps an existing device, e.g. one shared with a renderer.
    pub fn from_device(
        label: impl Into<String>,
        device: wgpu::Device,
        queue: wgpu::Queue,
    ) -> AnyResult<Self> {
        let label = label.into();
        let (poll_requests, pending) = flume::unbounded::<()>();

        let poller = {
            let device = device.clone();
            thread::Builder::new()
                .name(format!("{label}-poll"))
                .spawn(move || {
                    while pending.recv().is_ok() {
                        if let Err(err) = device.poll(wgpu::PollType::wait_indefinitely()) {
                            log::error!("wgpu poll failed: {err}");
                        }
                    }
                })
                .context("failed to start wgpu poller thread")?
        };

        Ok(Self {
            label,
            device,
            queue,
            bind_groups: Mutex::new(FxHashMap::default()),
            poll_requests: Some(poll_requests),
            poller: Some(poller),
        })
    }

    #[inline]
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    #[inline]
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Compiles a WGSL compute entry point into a pipeline bundle.
    ///
    /// The binding layout is derived from the shader; group `i` is the layout
    /// of resource table slot `i`.
    pub fn compile_wgsl(
        &self,
        kernel: impl Into<KernelId>,
        source: &str,
        entry_point: &str,
        table_slots: u32,
    ) -> PipelineBundle<Self> {
        let kernel = kernel.into();
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(kernel.as_str()),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });

        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(kernel.as_str()),
                layout: None,
                module: &module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            });

        let layouts = (0..table_slots.min(MAX_TABLE_SLOTS))
            .map(|slot| pipeline.get_bind_group_layout(slot))
            .collect();

        log::debug!("{}: compiled kernel '{kernel}' ({table_slots} tables)", self.label);
        PipelineBundle::new(kernel, layouts, pipeline)
    }

    /// Creates a storage buffer initialized with `contents`.
    pub fn create_storage_buffer(&self, label: &str, contents: &[u8]) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
            })
    }

    /// Creates a host-readable buffer to copy results into.
    pub fn create_readback_buffer(&self, label: &str, size: u64) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Maps a `MAP_READ` buffer and copies its contents out.
    ///
    /// Blocks until the map completes. Wait on the fence of the copy that
    /// filled the buffer first.
    pub fn read_back(&self, buffer: &wgpu::Buffer) -> AnyResult<Vec<u8>> {
        let slice = buffer.slice(..);
        let (sender, receiver) = flume::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });

        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .context("failed to poll wgpu device")?;
        receiver
            .recv()
            .context("buffer map callback never ran")?
            .context("failed to map buffer for reading")?;

        let bytes = slice.get_mapped_range().to_vec();
        buffer.unmap();
        Ok(bytes)
    }

    fn encode(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        stream: &CommandStream<Self>,
        heap: &DescriptorHeap<Self>,
    ) -> Result<()> {
        let mut pipeline: Option<&Arc<PipelineBundle<Self>>> = None;
        let mut tables: [Option<DescriptorRange>; MAX_TABLE_SLOTS as usize] = Default::default();

        for command in stream.commands() {
            match command {
                Command::SetPipeline(bundle) => pipeline = Some(bundle),
                Command::SetResourceTable { slot, range } => tables[*slot as usize] = Some(*range),
                Command::CopyRegion {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => encoder.copy_buffer_to_buffer(src, *src_offset, dst, *dst_offset, *size),
                Command::Dispatch { groups } => {
                    let Some(bundle) = pipeline else {
                        return Err(GpuError::Backend("dispatch without pipeline".to_owned()));
                    };

                    let bind_groups = self.bind_groups_for(bundle, &tables, heap)?;
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some(bundle.kernel().as_str()),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(bundle.pipeline());
                    for (slot, group) in &bind_groups {
                        pass.set_bind_group(*slot, group, &[]);
                    }
                    let [x, y, z] = *groups;
                    pass.dispatch_workgroups(x, y, z);
                }
            }
        }

        Ok(())
    }

    /// Resolves the bound tables into bind groups for `bundle`'s layout.
    fn bind_groups_for(
        &self,
        bundle: &PipelineBundle<Self>,
        tables: &[Option<DescriptorRange>],
        heap: &DescriptorHeap<Self>,
    ) -> Result<Vec<(u32, wgpu::BindGroup)>> {
        let mut cache = self.bind_groups.lock();
        let mut groups = Vec::with_capacity(bundle.layout().len());

        for (slot, layout) in bundle.layout().iter().enumerate() {
            let slot = slot as u32;
            let Some(range) = tables.get(slot as usize).copied().flatten() else {
                continue;
            };

            let key = (bundle.kernel().clone(), slot, range);
            if let Some(group) = cache.get(&key) {
                groups.push((slot, group.clone()));
                continue;
            }

            let buffers = heap.resolve(range)?;
            let entries: Vec<_> = buffers
                .iter()
                .enumerate()
                .map(|(binding, buffer)| wgpu::BindGroupEntry {
                    binding: binding as u32,
                    resource: buffer.as_entire_binding(),
                })
                .collect();

            let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(bundle.kernel().as_str()),
                layout,
                entries: &entries,
            });
            log::trace!("created bind group for '{}' slot {slot} {range}", bundle.kernel());

            cache.insert(key, group.clone());
            groups.push((slot, group));
        }

        Ok(groups)
    }
}

impl Backend for WgpuBackend {
    type Buffer = wgpu::Buffer;
    /// One bind group layout per resource table slot.
    type BindingLayout = Vec<wgpu::BindGroupLayout>;
    type Pipeline = wgpu::ComputePipeline;

    fn name(&self) -> &str {
        &self.label
    }

    fn submit(&self, submission: Submission<Self>) -> Result<()> {
        let poll_requests = self
            .poll_requests
            .as_ref()
            .ok_or_else(|| GpuError::QueueClosed(self.label.clone()))?;

        let Submission {
            signal,
            fence,
            heap,
            streams,
        } = submission;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&self.label),
            });
        for stream in &streams {
            self.encode(&mut encoder, stream, &heap)?;
        }

        // The encoder keeps the referenced resources alive.
        drop(streams);

        self.queue.submit([encoder.finish()]);
        self.queue
            .on_submitted_work_done(move || fence.complete(signal));

        poll_requests
            .send(())
            .map_err(|_| GpuError::QueueClosed(self.label.clone()))
    }
}

impl Drop for WgpuBackend {
    fn drop(&mut self) {
        self.poll_requests.take();
        if let Some(poller) = self.poller.take() {
            if poller.join().is_err() {
                log::error!("{}: wgpu poller thread panicked", self.label);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandCategory;
    use crate::device::{Device, DeviceInit};

    const DOUBLE: &str = r#"
@group(0) @binding(0) var<storage, read_write> data: array<u32>;

@compute @workgroup_size(1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    data[id.x] = data[id.x] * 2u;
}
"#;

    #[test]
    #[ignore = "needs a GPU adapter"]
    fn doubles_buffer_on_hardware_queue() {
        let backend = WgpuBackend::request(WgpuInit::default()).unwrap();
        let bundle = backend.compile_wgsl("double", DOUBLE, "main", 1);
        let data = backend.create_storage_buffer("data", bytemuck::cast_slice(&[1u32, 2, 3, 4]));
        let readback = backend.create_readback_buffer("readback", 16);

        let device = Device::new(backend, DeviceInit::default()).unwrap();
        let bundle = device.pipelines().register(bundle).unwrap();
        let range = device
            .descriptor_heap()
            .publish(std::slice::from_ref(&data))
            .unwrap();

        let mut compute = device.create_command_list(CommandCategory::Compute).unwrap();
        compute.bind_pipeline(&bundle).unwrap();
        compute.bind_resource_table(0, range).unwrap();
        compute.dispatch(4, 1, 1).unwrap();
        let mut copy = device.create_command_list(CommandCategory::Copy).unwrap();
        copy.copy_region(&data, 0, &readback, 0, 16).unwrap();

        let value = device.execute(&mut [compute, copy]).unwrap();
        device.wait_until(value).unwrap();

        let bytes = device.backend().read_back(&readback).unwrap();
        assert_eq!(bytemuck::pod_collect_to_vec::<u8, u32>(&bytes), vec![2, 4, 6, 8]);
    }
}
