//! Headless soak run of the frame pipeline.
//!
//! Spawns and deletes objects every tick against the simulated device,
//! checking pool exclusivity and bounded overlap as it goes.
//!
//! Usage: `kestrel-soak [ticks]` (default 1000).

use anyhow::{bail, Context};
use glam::{Mat4, Vec3};
use kestrel_app::{
    EngineCommand, EngineConfig, FrameContext, FramePipeline, FrameRenderer, TickStatus,
};
use kestrel_core::{DrawObject, MaterialRef, MeshRef, ObjectId, PipelineId};
use kestrel_gpu::{FrequencyClass, GpuDevice, HeadlessDevice, PoolConfig};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const SLOTS: usize = 3;
const SPAWN_PER_TICK: u64 = 4;
/// Ticks an object lives before it is deleted.
const LIFETIME: u64 = 12;

/// Counts draws instead of recording them.
#[derive(Default)]
struct CountingRenderer {
    pipelines: usize,
    draws: u64,
}

impl<D: GpuDevice> FrameRenderer<D> for CountingRenderer {
    type Pipeline = PipelineId;

    fn create_pipeline(
        &mut self,
        _device: &mut D,
        id: PipelineId,
    ) -> kestrel_gpu::Result<PipelineId> {
        self.pipelines += 1;
        debug!("Pipeline {:?} created", id);
        Ok(id)
    }

    fn record(
        &mut self,
        _device: &mut D,
        frame: &FrameContext<'_, PipelineId>,
    ) -> kestrel_gpu::Result<()> {
        self.draws += frame.items.len() as u64;
        Ok(())
    }
}

fn mesh(seed: u64) -> MeshRef {
    let triangles = 12 + (seed % 5) as u32 * 12;
    MeshRef {
        vertex_address: 0x10_0000 + seed * 0x1000,
        vertex_count: triangles * 2,
        vertex_stride: 32,
        index_address: 0x80_0000 + seed * 0x1000,
        index_count: triangles * 3,
        primitive_count: 1 + (seed % 3) as u32,
    }
}

fn object(id: u64) -> DrawObject {
    let offset = Vec3::new((id % 17) as f32, (id % 5) as f32, (id % 11) as f32);
    let mesh = mesh(id);
    let materials = (0..mesh.primitive_count).map(MaterialRef).collect();
    DrawObject::new(ObjectId(id), mesh)
        .with_transform(Mat4::from_translation(offset))
        .with_materials(materials)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let ticks: u64 = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("tick count must be a positive integer")?,
        None => 1000,
    };
    info!("Kestrel soak: {ticks} ticks over {SLOTS} frame slots");

    let config = EngineConfig::new("kestrel-soak")
        .with_raytracing(true)
        .with_pool(
            PoolConfig::default()
                .with_cap(FrequencyClass::PerObject, 128)
                .with_cap(FrequencyClass::PerPrimitive, 384)
                .with_transform_bytes(128 * 256),
        );
    let mut pipeline = FramePipeline::new(
        HeadlessDevice::new(SLOTS),
        CountingRenderer::default(),
        &config,
    )?;
    let sender = pipeline.sender();

    for tick in 0..ticks {
        for i in 0..SPAWN_PER_TICK {
            sender.spawn(object(tick * SPAWN_PER_TICK + i));
        }
        if tick >= LIFETIME {
            for i in 0..SPAWN_PER_TICK {
                sender.delete(ObjectId((tick - LIFETIME) * SPAWN_PER_TICK + i));
            }
        }
        if tick % 50 == 25 {
            sender.enqueue(EngineCommand::ToggleWireframe);
        }
        if tick % 40 == 0 {
            sender.enqueue(EngineCommand::Stencil(ObjectId(tick * SPAWN_PER_TICK)));
        }
        if tick % 200 == 199 {
            sender.enqueue(EngineCommand::RebuildAccelerationStructures);
        }

        if pipeline.tick()? == TickStatus::ShutdownRequested {
            break;
        }
        pipeline.pool().check_exclusivity()?;
        let in_flight = pipeline.device().in_flight();
        if in_flight > SLOTS {
            bail!("{in_flight} submissions in flight with {SLOTS} frame slots");
        }
    }

    let stats = pipeline.device().stats();
    let destroyed = pipeline.objects_destroyed();
    let draws = pipeline.renderer().draws;
    let pipelines = pipeline.renderer().pipelines;
    let device = pipeline.shutdown()?;

    info!("Soak complete:");
    info!("  Frames presented: {}", stats.presents);
    info!("  Max in flight: {}", stats.max_in_flight);
    info!("  Objects destroyed: {destroyed}");
    info!("  Draws recorded: {draws}");
    info!("  Pipelines created: {pipelines}");
    info!("  BLAS builds: {}, compactions: {}", stats.builds, stats.compactions);

    if device.live_buffer_count() != 0 || device.live_structure_count() != 0 {
        bail!(
            "leaked {} buffers and {} acceleration structures",
            device.live_buffer_count(),
            device.live_structure_count()
        );
    }
    Ok(())
}
