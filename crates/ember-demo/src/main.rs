use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytemuck::{Pod, Zeroable};
use clap::Parser;

use ember_gpu::backend::GpuBuffer;
use ember_gpu::backend::soft::{
    KernelContext, SoftBackend, SoftBuffer, SoftInit, SoftKernel, SoftLayout,
};
use ember_gpu::backend::webgpu::{WgpuBackend, WgpuInit};
use ember_gpu::command::CommandCategory;
use ember_gpu::device::{Device, DeviceInit};
use ember_gpu::logging::{LoggingConfig, init_logging};
use ember_gpu::pipeline::PipelineBundle;

const PARTICLES_PER_BATCH: usize = 64;
const RECORDING_THREADS: usize = 4;
const DT: f32 = 1.0 / 60.0;

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct Particle {
    position: [f32; 2],
    velocity: [f32; 2],
}

#[derive(Parser, Debug)]
#[command(
    name = "ember-demo",
    about = "Record command lists on several threads and submit them to one queue."
)]
struct Args {
    /// Frames to simulate on the CPU queue
    #[arg(long, value_name = "N", default_value_t = 8)]
    frames: u32,

    /// Run a single compute pass on a wgpu adapter instead
    #[arg(long, action = clap::ArgAction::SetTrue)]
    wgpu: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(LoggingConfig::default());

    if args.wgpu {
        run_wgpu()
    } else {
        run_soft(args.frames)
    }
}

/// Integrates one particle per work group.
fn integrate_kernel() -> PipelineBundle<SoftBackend> {
    PipelineBundle::new(
        "integrate",
        SoftLayout::new(1),
        SoftKernel::new(|ctx: &KernelContext<'_>| {
            let Some(buffer) = ctx.table(0).first() else {
                return;
            };
            let index = ctx.linear_group() as usize;
            let Some(mut particle) = buffer.read_as::<Particle>().get(index).copied() else {
                return;
            };

            particle.velocity[1] -= 9.81 * DT;
            particle.position[0] += particle.velocity[0] * DT;
            particle.position[1] += particle.velocity[1] * DT;

            let offset = (index * size_of::<Particle>()) as u64;
            if let Err(err) = buffer.write(offset, &[particle]) {
                log::error!("integrate: {err}");
            }
        }),
    )
}

/// Frame loop on the CPU queue. Every frame, several threads record and submit
/// compute lists concurrently, then a copy list snapshots the first batch for
/// inspection.
fn run_soft(frames: u32) -> Result<()> {
    let backend = SoftBackend::new(SoftInit {
        label: "demo-queue".to_owned(),
        latency: Some(Duration::from_millis(2)),
    })?;
    let device = Device::new(
        backend,
        DeviceInit {
            label: "demo".to_owned(),
            prewarm_allocators: RECORDING_THREADS,
            ..DeviceInit::default()
        },
    )?;

    let bundle = device.pipelines().register(integrate_kernel())?;

    let batches: Vec<SoftBuffer> = (0..RECORDING_THREADS)
        .map(|batch| {
            let particles: Vec<Particle> = (0..PARTICLES_PER_BATCH)
                .map(|i| Particle {
                    position: [i as f32, 10.0 * batch as f32],
                    velocity: [1.0, 0.0],
                })
                .collect();
            SoftBuffer::from_slice(&particles)
        })
        .collect();
    let ranges = batches
        .iter()
        .map(|buffer| device.descriptor_heap().publish(std::slice::from_ref(buffer)))
        .collect::<ember_gpu::Result<Vec<_>>>()?;
    let snapshot = SoftBuffer::zeroed(batches[0].size() as usize);

    let started = Instant::now();
    for frame in 0..frames {
        // Lists are confined to the thread that records them; only the
        // recorded work is shared, through the queue.
        thread::scope(|s| -> Result<()> {
            let workers: Vec<_> = ranges
                .iter()
                .map(|&range| {
                    let (device, bundle) = (&device, &bundle);
                    s.spawn(move || -> Result<()> {
                        let mut list = device.create_command_list(CommandCategory::Compute)?;
                        list.bind_pipeline(bundle)?;
                        list.bind_resource_table(0, range)?;
                        list.dispatch(PARTICLES_PER_BATCH as u32, 1, 1)?;
                        list.execute_and_wait()?;
                        Ok(())
                    })
                })
                .collect();

            for worker in workers {
                worker
                    .join()
                    .map_err(|_| anyhow::anyhow!("recording thread panicked"))??;
            }
            Ok(())
        })?;

        let mut copy = device.create_command_list(CommandCategory::Copy)?;
        copy.copy_region(&batches[0], 0, &snapshot, 0, snapshot.size())?;
        let value = device.execute(std::slice::from_mut(&mut copy))?;
        device.wait_until(value)?;

        let first = snapshot.read_as::<Particle>()[0];
        log::info!(
            "frame {frame}: fence {value}, particle 0 at ({:.3}, {:.3})",
            first.position[0],
            first.position[1]
        );
    }

    device.wait_idle()?;
    let stats = device.stats();
    log::info!(
        "{frames} frame(s) in {:?}: {} submissions, fence {}/{}",
        started.elapsed(),
        stats.submissions,
        stats.completed,
        stats.last_issued
    );
    for pool in stats.pools {
        log::info!(
            "{} pool: {} allocator(s), {} idle",
            pool.category,
            pool.live,
            pool.available
        );
    }

    Ok(())
}

const SCALE_WGSL: &str = r#"
@group(0) @binding(0) var<storage, read_write> data: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < arrayLength(&data)) {
        data[id.x] = data[id.x] * 0.5;
    }
}
"#;

/// One compute pass and a readback on a real adapter.
fn run_wgpu() -> Result<()> {
    let backend = WgpuBackend::request(WgpuInit::default())?;

    let values: Vec<f32> = (0..256).map(|i| i as f32).collect();
    let size = (values.len() * size_of::<f32>()) as u64;
    let data = backend.create_storage_buffer("demo data", bytemuck::cast_slice(&values));
    let readback = backend.create_readback_buffer("demo readback", size);
    let bundle = backend.compile_wgsl("scale", SCALE_WGSL, "main", 1);

    let device = Device::new(backend, DeviceInit::default())?;
    let bundle = device.pipelines().register(bundle)?;
    let range = device
        .descriptor_heap()
        .publish(std::slice::from_ref(&data))?;

    let mut compute = device.create_command_list(CommandCategory::Compute)?;
    compute.bind_pipeline(&bundle)?;
    compute.bind_resource_table(0, range)?;
    compute.dispatch((values.len() as u32).div_ceil(64), 1, 1)?;

    let mut copy = device.create_command_list(CommandCategory::Copy)?;
    copy.copy_region(&data, 0, &readback, 0, size)?;

    let value = device.execute(&mut [compute, copy])?;
    device.wait_until(value)?;

    let bytes = device.backend().read_back(&readback)?;
    let scaled: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
    log::info!(
        "scaled {} values on the GPU at fence {value}: {:?}..",
        scaled.len(),
        &scaled[..4]
    );

    Ok(())
}
