//! The frame ring and everything it owns.
//!
//! [`FramePipeline`] keeps one [`FrameSlot`] per presentable image. Each
//! [`FramePipeline::tick`] waits on the slot it is about to reuse, consumes
//! that slot's deferred deletions, applies queued commands, records, submits
//! and presents, then moves to the next slot. The fence wait is the only
//! steady-state stall.
//!
//! Object deletions are pushed onto the slot of the most recent submission.
//! They are consumed only after that slot's fence has been waited on, by
//! which point no submission that could still draw the object is pending.

use std::sync::Arc;

use ash::vk;
use kestrel_core::{
    to_row_major_3x4, DrawObject, MeshRef, ObjectId, ObjectUniforms, PipelineTable,
};
use kestrel_gpu::{
    AccelerationDevice, FrequencyClass, GpuError, PoolHandle, ResourcePool, Result, Retired,
};
use kestrel_rt::{AccelerationStructureBuilder, TopLevelInstance};
use tracing::{debug, info, trace, warn};

use crate::command::{CommandQueue, CommandSender, EngineCommand};
use crate::config::EngineConfig;
use crate::error::CommandError;
use crate::frame::{DrawItem, FrameContext, FrameSlot, SlotState};
use crate::renderer::FrameRenderer;
use crate::scene::{Scene, SceneEntry, SlotResources};

/// Bytes of transform data each object holds in every frame slot.
const UNIFORM_SIZE: u64 = std::mem::size_of::<ObjectUniforms>() as u64;

/// Outcome of a successful [`FramePipeline::tick`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickStatus {
    Presented,
    /// A `Shutdown` command was applied. Nothing was recorded.
    ShutdownRequested,
}

/// Owner of the frame ring, scene, resource pool and acceleration structures.
pub struct FramePipeline<D: AccelerationDevice, R: FrameRenderer<D>> {
    device: D,
    renderer: R,
    slots: Vec<FrameSlot>,
    /// Ring index of the slot the next tick records.
    current: usize,
    frame_number: u64,
    queue: Arc<CommandQueue>,
    scene: Scene,
    pool: ResourcePool,
    /// Low-frequency set of each slot.
    frame_sets: Vec<Option<PoolHandle>>,
    builder: AccelerationStructureBuilder,
    pipelines: PipelineTable<R::Pipeline>,
    raytracing: bool,
    wireframe: bool,
    shutdown_requested: bool,
    objects_destroyed: u64,
    /// Set by the first error out of a tick; synchronization state is lost.
    failed: Option<String>,
}

impl<D: AccelerationDevice, R: FrameRenderer<D>> FramePipeline<D, R> {
    /// Reserve the pool and create one slot per presentable image.
    pub fn new(mut device: D, renderer: R, config: &EngineConfig) -> Result<Self> {
        let slot_count = device.image_count();
        if slot_count == 0 {
            return Err(GpuError::InvalidState(
                "device presents no images".to_string(),
            ));
        }

        let mut pool = ResourcePool::new(&mut device, slot_count, &config.pool)?;
        let mut frame_sets = Vec::with_capacity(slot_count);
        for frame in 0..slot_count {
            let set = if config.pool.cap(FrequencyClass::LowFrequency) > 0 {
                pool.reserve(frame, FrequencyClass::LowFrequency, 1)?
                    .into_iter()
                    .next()
            } else {
                None
            };
            frame_sets.push(set);
        }

        let mut slots = Vec::with_capacity(slot_count);
        for index in 0..slot_count {
            match FrameSlot::new(&mut device, index) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in slots {
                        slot.destroy(&mut device);
                    }
                    if let Err(destroy_err) = pool.destroy(&mut device) {
                        warn!("Failed to release resource pool: {destroy_err}");
                    }
                    return Err(e);
                }
            }
        }

        let raytracing = if config.raytracing && !device.supports_acceleration_structures() {
            warn!("Ray tracing requested but acceleration structures are unsupported");
            false
        } else {
            config.raytracing
        };

        info!(
            "Frame pipeline ready: {} frame slots, ray tracing {}",
            slot_count,
            if raytracing { "on" } else { "off" }
        );

        Ok(Self {
            device,
            renderer,
            slots,
            current: 0,
            frame_number: 0,
            queue: Arc::new(CommandQueue::new()),
            scene: Scene::new(),
            pool,
            frame_sets,
            builder: AccelerationStructureBuilder::new(config.acceleration.clone()),
            pipelines: PipelineTable::new(),
            raytracing,
            wireframe: false,
            shutdown_requested: false,
            objects_destroyed: 0,
            failed: None,
        })
    }

    /// Handle for producer threads.
    pub fn sender(&self) -> CommandSender {
        CommandSender::new(Arc::clone(&self.queue))
    }

    /// Run one frame.
    ///
    /// Any error poisons the pipeline: later ticks fail with
    /// [`GpuError::InvalidState`] and the caller should go to [`Self::shutdown`].
    pub fn tick(&mut self) -> Result<TickStatus> {
        self.ensure_healthy()?;
        if self.shutdown_requested {
            return Ok(TickStatus::ShutdownRequested);
        }
        let result = self.run_tick();
        if let Err(e) = &result {
            self.failed = Some(e.to_string());
        }
        result
    }

    fn ensure_healthy(&self) -> Result<()> {
        match &self.failed {
            Some(reason) => Err(GpuError::InvalidState(format!(
                "frame pipeline stopped after an earlier error: {reason}"
            ))),
            None => Ok(()),
        }
    }

    fn run_tick(&mut self) -> Result<TickStatus> {
        let index = self.current;

        self.slots[index].sync.wait(&mut self.device)?;
        let slot = &mut self.slots[index];
        if slot.state() == SlotState::Presenting {
            slot.transition(SlotState::Idle)?;
        }
        self.drain_deletions(index)?;

        self.apply_commands()?;
        if self.shutdown_requested {
            info!("Shutdown requested at frame {}", self.frame_number);
            return Ok(TickStatus::ShutdownRequested);
        }

        if self.raytracing {
            self.build_bottom_levels()?;
        }

        let slot = &mut self.slots[index];
        slot.transition(SlotState::Recording)?;
        let cmd = slot.command_buffer;
        self.device.begin_command_buffer(cmd)?;
        self.record(index, cmd)?;
        self.device.end_command_buffer(cmd)?;

        let sync = self.slots[index].sync;
        let image_index = self.device.acquire_next_image(sync.image_available)?;
        if image_index as usize != index {
            return Err(GpuError::InvariantViolation(format!(
                "acquired image {image_index} while recording frame slot {index}"
            )));
        }

        sync.reset(&mut self.device)?;
        self.device
            .submit(cmd, sync.image_available, sync.render_finished, sync.in_flight)?;
        let slot = &mut self.slots[index];
        slot.mark_submitted(self.frame_number)?;
        slot.transition(SlotState::Presenting)?;
        self.device.present(image_index, sync.render_finished)?;

        trace!("Frame {} presented from slot {}", self.frame_number, index);
        self.current = (self.current + 1) % self.slots.len();
        self.frame_number += 1;
        Ok(TickStatus::Presented)
    }

    /// Consume a slot's deletions. Its fence must already be signaled.
    fn drain_deletions(&mut self, index: usize) -> Result<()> {
        if !self.slots[index].sync.is_complete(&self.device)? {
            return Err(GpuError::InvariantViolation(format!(
                "deletion queue of frame slot {index} drained while the slot is in flight"
            )));
        }
        self.consume_deletions(index)
    }

    fn consume_deletions(&mut self, index: usize) -> Result<()> {
        let pending = self.slots[index].deletions.drain();
        if !pending.is_empty() {
            debug!(
                "Frame slot {}: releasing {} deferred deletions",
                index,
                pending.len()
            );
        }
        for deletion in pending {
            match deletion.target {
                Retired::Object(id) => self.destroy_object(id)?,
                Retired::Buffer(buffer) => self.device.destroy_buffer(buffer)?,
                Retired::Structure(structure) => {
                    self.device.destroy_acceleration_structure(structure)?;
                }
            }
        }
        Ok(())
    }

    fn destroy_object(&mut self, id: ObjectId) -> Result<()> {
        let entry = self.scene.remove(id).ok_or_else(|| {
            GpuError::InvariantViolation(format!("deferred deletion of {id} missing from scene"))
        })?;
        for resources in &entry.slots {
            self.pool.release(&resources.pool_handles())?;
            self.pool.release_region(&resources.region)?;
        }
        if let Some(structure) = self.builder.remove(id) {
            self.device.destroy_acceleration_structure(structure)?;
        }
        self.objects_destroyed += 1;
        trace!("Destroyed {}", id);
        Ok(())
    }

    /// Queue `id` for deletion and stop drawing it.
    ///
    /// Returns `false` for unknown objects and objects already queued.
    pub fn mark_for_delete(&mut self, id: ObjectId) -> bool {
        let previous = self.previous_slot();
        let Some(entry) = self.scene.get_mut(id) else {
            return false;
        };
        if entry.marked {
            return false;
        }
        if !self.slots[previous]
            .deletions
            .push(Retired::Object(id), self.frame_number)
        {
            return false;
        }
        entry.marked = true;
        trace!("{} queued for deletion on frame slot {}", id, previous);
        true
    }

    /// Slot of the most recent submission.
    fn previous_slot(&self) -> usize {
        (self.current + self.slots.len() - 1) % self.slots.len()
    }

    /// Hand resources the last submission may still read to deferred deletion.
    fn retire(&mut self, retired: Vec<Retired>) {
        let previous = self.previous_slot();
        for target in retired {
            self.slots[previous].deletions.push(target, self.frame_number);
        }
    }

    /// Turn per-tick acceleration structure builds on or off.
    pub fn set_raytracing_enabled(&mut self, enabled: bool) -> Result<()> {
        if enabled && !self.device.supports_acceleration_structures() {
            return Err(GpuError::MissingCapability(
                "acceleration structures".to_string(),
            ));
        }
        if self.raytracing == enabled {
            return Ok(());
        }
        self.raytracing = enabled;
        if !enabled {
            let retired = self.builder.take_top_level();
            self.retire(retired);
        }
        info!("Ray tracing {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    fn apply_commands(&mut self) -> Result<()> {
        let commands = self.queue.drain();
        if commands.is_empty() {
            return Ok(());
        }
        debug!("Applying {} commands", commands.len());

        let total = commands.len();
        for (applied, command) in commands.into_iter().enumerate() {
            if let Err(e) = self.apply(command) {
                let rejected = e.into_gpu()?;
                warn!("Command rejected: {rejected}");
            }
            if self.shutdown_requested {
                let dropped = total - applied - 1;
                if dropped > 0 {
                    debug!("Dropping {dropped} commands queued after shutdown");
                }
                break;
            }
        }
        Ok(())
    }

    fn apply(&mut self, command: EngineCommand) -> std::result::Result<(), CommandError> {
        match command {
            EngineCommand::Spawn(object) => self.spawn(object)?,
            EngineCommand::Delete(id) => {
                if !self.mark_for_delete(id) {
                    return Err(CommandError::Rejected(format!(
                        "delete of unknown or already deleted {id}"
                    )));
                }
            }
            EngineCommand::UpdateTransform { id, transform } => {
                if !transform.is_finite() {
                    return Err(CommandError::Rejected(format!(
                        "non-finite transform for {id}"
                    )));
                }
                self.scene.live_mut(id)?.object.transform = transform;
            }
            EngineCommand::SetVisible { id, visible } => {
                self.scene.live_mut(id)?.object.visible = visible;
            }
            EngineCommand::UpdateGeometry { id, mesh } => self.update_geometry(id, mesh)?,
            EngineCommand::ToggleWireframe => {
                self.wireframe = !self.wireframe;
                debug!("Wireframe {}", if self.wireframe { "on" } else { "off" });
            }
            EngineCommand::SetRayTracing(enabled) => self.set_raytracing_enabled(enabled)?,
            EngineCommand::Stencil(id) => self.scene.live_mut(id)?.stenciled = true,
            EngineCommand::Unstencil(id) => self.scene.live_mut(id)?.stenciled = false,
            EngineCommand::RebuildAccelerationStructures => {
                for entry in self.scene.iter_mut().filter(|e| !e.marked) {
                    entry.geometry_dirty = true;
                }
                debug!("All bottom-level structures scheduled for rebuild");
            }
            EngineCommand::Shutdown => self.shutdown_requested = true,
        }
        Ok(())
    }

    fn spawn(&mut self, object: DrawObject) -> std::result::Result<(), CommandError> {
        let id = object.id;
        if self.scene.contains(id) {
            return Err(kestrel_core::Error::DuplicateObject(id).into());
        }
        object.validate()?;

        let primitives = object.primitive_count() as usize;
        let mut slots = Vec::with_capacity(self.slots.len());
        for frame in 0..self.pool.frame_count() {
            match reserve_object(&mut self.pool, frame, primitives) {
                Ok(resources) => slots.push(resources),
                Err(e) => {
                    for resources in &slots {
                        self.pool.release(&resources.pool_handles())?;
                        self.pool.release_region(&resources.region)?;
                    }
                    return Err(e.into());
                }
            }
        }

        trace!("Spawned {} with {} primitives", id, primitives);
        self.scene.insert(SceneEntry::new(object, slots))?;
        Ok(())
    }

    fn update_geometry(
        &mut self,
        id: ObjectId,
        mesh: MeshRef,
    ) -> std::result::Result<(), CommandError> {
        let entry = self.scene.live_mut(id)?;
        let mut updated = entry.object.clone();
        updated.mesh = mesh;
        updated.validate()?;
        let required = updated.primitive_count() as usize;
        if required > entry.primitive_capacity() {
            return Err(CommandError::Rejected(format!(
                "{id} reserved {} primitives, new geometry needs {required}",
                entry.primitive_capacity()
            )));
        }
        entry.object = updated;
        entry.geometry_dirty = true;
        Ok(())
    }

    fn build_bottom_levels(&mut self) -> Result<()> {
        let dirty: Vec<(ObjectId, MeshRef)> = self
            .scene
            .iter()
            .filter(|e| e.geometry_dirty && !e.marked)
            .map(|e| (e.object.id, e.object.mesh))
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }

        let mut requests = Vec::with_capacity(dirty.len());
        let mut stale = Vec::new();
        for (id, mesh) in dirty {
            if let Some(entry) = self.scene.get_mut(id) {
                entry.geometry_dirty = false;
            }
            if !mesh.is_traceable() {
                trace!("{} has no traceable geometry", id);
                stale.extend(self.builder.remove(id).map(Retired::Structure));
                continue;
            }
            requests.push(self.builder.request(&self.device, id, &mesh)?);
        }

        let replaced = self.builder.build_bottom_level(&mut self.device, &requests)?;
        stale.extend(replaced.into_iter().map(Retired::Structure));
        self.retire(stale);
        Ok(())
    }

    fn record(&mut self, index: usize, cmd: vk::CommandBuffer) -> Result<()> {
        for entry in self.scene.drawable() {
            let resources = slot_resources(entry, index)?;
            let uniforms = ObjectUniforms::new(&entry.object.transform, entry.stenciled);
            self.pool
                .write_region(&mut self.device, &resources.region, bytemuck::bytes_of(&uniforms))?;
        }

        if self.raytracing {
            let instances: Vec<TopLevelInstance> = self
                .scene
                .drawable()
                .filter(|e| self.builder.contains(e.object.id))
                .map(|e| TopLevelInstance {
                    object: e.object.id,
                    transform: to_row_major_3x4(&e.object.transform),
                })
                .collect();
            let retired = self
                .builder
                .build_top_level(&mut self.device, cmd, &instances)?;
            self.retire(retired);
        }

        let wireframe = self.wireframe;
        let mut items = Vec::with_capacity(self.scene.len());
        for entry in self.scene.drawable() {
            let resources = slot_resources(entry, index)?;
            items.push(DrawItem {
                object: entry.object.id,
                pipeline: entry.pipeline_id(wireframe),
                object_set: resources.object_set,
                primitive_sets: resources.primitive_sets.clone(),
                transform_offset: resources.region.offset,
                mesh: entry.object.mesh,
                materials: entry.object.materials.clone(),
            });
        }

        for item in &items {
            let device = &mut self.device;
            let renderer = &mut self.renderer;
            self.pipelines
                .get_or_try_insert_with(item.pipeline, |id| {
                    debug!("Creating pipeline {:?}", id);
                    renderer.create_pipeline(device, id)
                })?;
        }
        let pipelines = items
            .iter()
            .map(|item| {
                self.pipelines.get(item.pipeline).ok_or_else(|| {
                    GpuError::InvariantViolation(format!("pipeline {:?} not cached", item.pipeline))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let image_index = u32::try_from(index)
            .map_err(|_| GpuError::InvariantViolation(format!("frame slot {index} out of range")))?;
        let frame = FrameContext {
            command_buffer: cmd,
            slot: index,
            image_index,
            frame_number: self.frame_number,
            items: &items,
            pipelines: &pipelines,
            frame_set: self.frame_sets[index],
            transform_buffer: self.pool.transform_buffer(index),
            top_level: if self.raytracing {
                self.builder.top_level()
            } else {
                None
            },
            wireframe,
        };
        trace!("Recording {} draws into slot {}", items.len(), index);
        self.renderer.record(&mut self.device, &frame)
    }

    /// Rebuild presentation after the surface changed size.
    ///
    /// Waits for the device, consumes every slot's deletions and restarts the
    /// ring at slot zero. A zero-sized surface is ignored.
    pub fn handle_resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.ensure_healthy()?;
        if width == 0 || height == 0 {
            return Ok(());
        }
        let result = self.resize(width, height);
        if let Err(e) = &result {
            self.failed = Some(e.to_string());
        }
        result
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.device.wait_idle()?;
        for index in 0..self.slots.len() {
            self.drain_deletions(index)?;
        }
        self.device.resize(width, height)?;
        for slot in &mut self.slots {
            slot.force_idle();
        }
        self.current = 0;
        info!("Resized to {}x{}", width, height);
        Ok(())
    }

    /// Tear everything down and hand back the device.
    ///
    /// Waits for the device once, then releases as much as it can, returning
    /// the first failure if anything could not be released.
    pub fn shutdown(mut self) -> Result<D> {
        info!(
            "Shutting down frame pipeline after {} frames, {} objects destroyed",
            self.frame_number, self.objects_destroyed
        );
        if let Err(e) = self.device.wait_idle() {
            warn!("Failed to wait idle: {e}");
        }

        let mut first_error = None;
        for index in 0..self.slots.len() {
            keep_first(&mut first_error, self.consume_deletions(index));
        }

        let Self {
            mut device,
            mut renderer,
            slots,
            pool,
            builder,
            mut pipelines,
            ..
        } = self;

        keep_first(&mut first_error, builder.destroy(&mut device));
        for (_, pipeline) in pipelines.drain() {
            renderer.destroy_pipeline(&mut device, pipeline);
        }
        for slot in slots {
            slot.destroy(&mut device);
        }
        keep_first(&mut first_error, pool.destroy(&mut device));

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Frame pipeline shut down");
                Ok(device)
            }
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    pub fn builder(&self) -> &AccelerationStructureBuilder {
        &self.builder
    }

    /// Frames presented so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Ring index the next tick records into.
    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn raytracing_enabled(&self) -> bool {
        self.raytracing
    }

    pub fn wireframe(&self) -> bool {
        self.wireframe
    }

    /// Objects whose resources have been released. Game code can reclaim
    /// its side of an object once this count covers it.
    pub fn objects_destroyed(&self) -> u64 {
        self.objects_destroyed
    }

    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }
}

/// Check out one object's descriptor sets and transform region in `frame`.
fn reserve_object(
    pool: &mut ResourcePool,
    frame: usize,
    primitives: usize,
) -> Result<SlotResources> {
    let mut sets = pool.reserve(frame, FrequencyClass::PerObject, 1)?;
    match pool.reserve(frame, FrequencyClass::PerPrimitive, primitives) {
        Ok(primitive_sets) => sets.extend(primitive_sets),
        Err(e) => {
            pool.release(&sets)?;
            return Err(e);
        }
    }
    let region = match pool.reserve_region(frame, UNIFORM_SIZE) {
        Ok(region) => region,
        Err(e) => {
            pool.release(&sets)?;
            return Err(e);
        }
    };
    let object_set = sets.remove(0);
    Ok(SlotResources {
        object_set,
        primitive_sets: sets,
        region,
    })
}

fn slot_resources(entry: &SceneEntry, index: usize) -> Result<&SlotResources> {
    entry.slots.get(index).ok_or_else(|| {
        GpuError::InvariantViolation(format!(
            "{} holds no resources in frame slot {index}",
            entry.object.id
        ))
    })
}

fn keep_first(first: &mut Option<GpuError>, result: Result<()>) {
    if let Err(e) = result {
        warn!("Shutdown step failed: {e}");
        first.get_or_insert(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Mat4, Vec3};
    use kestrel_core::{PipelineId, PipelineKind, PipelineModifier};
    use kestrel_gpu::{GpuDevice, HeadlessDevice, HeadlessEvent, PoolConfig};
    use kestrel_rt::AccelerationConfig;

    #[derive(Debug)]
    struct RecordedFrame {
        slot: usize,
        objects: Vec<ObjectId>,
        pipelines: Vec<PipelineId>,
        top_level: bool,
    }

    #[derive(Default)]
    struct RecordingRenderer {
        created: Vec<PipelineId>,
        frames: Vec<RecordedFrame>,
    }

    impl<D: GpuDevice> FrameRenderer<D> for RecordingRenderer {
        type Pipeline = PipelineId;

        fn create_pipeline(&mut self, _device: &mut D, id: PipelineId) -> Result<PipelineId> {
            self.created.push(id);
            Ok(id)
        }

        fn record(&mut self, _device: &mut D, frame: &FrameContext<'_, PipelineId>) -> Result<()> {
            self.frames.push(RecordedFrame {
                slot: frame.slot,
                objects: frame.items.iter().map(|i| i.object).collect(),
                pipelines: frame.draws().map(|(_, p)| *p).collect(),
                top_level: frame.top_level.is_some(),
            });
            Ok(())
        }
    }

    type TestPipeline = FramePipeline<HeadlessDevice, RecordingRenderer>;

    fn mesh() -> MeshRef {
        MeshRef {
            vertex_address: 0x1000,
            vertex_count: 24,
            vertex_stride: 32,
            index_address: 0x2000,
            index_count: 36,
            primitive_count: 1,
        }
    }

    fn object(id: u64) -> DrawObject {
        DrawObject::new(ObjectId(id), mesh())
    }

    fn config() -> EngineConfig {
        EngineConfig::default().with_pool(
            PoolConfig::default()
                .with_cap(FrequencyClass::PerObject, 16)
                .with_cap(FrequencyClass::PerPrimitive, 32)
                .with_transform_bytes(16 * 256),
        )
    }

    fn pipeline(device: HeadlessDevice, config: &EngineConfig) -> TestPipeline {
        FramePipeline::new(device, RecordingRenderer::default(), config).unwrap()
    }

    fn tick_n(pipeline: &mut TestPipeline, n: usize) {
        for _ in 0..n {
            assert_eq!(pipeline.tick().unwrap(), TickStatus::Presented);
        }
    }

    fn last_frame(pipeline: &TestPipeline) -> &RecordedFrame {
        pipeline.renderer().frames.last().unwrap()
    }

    fn reserved_objects(pipeline: &TestPipeline) -> usize {
        (0..pipeline.slot_count())
            .map(|frame| pipeline.pool().reserved(frame, FrequencyClass::PerObject))
            .sum()
    }

    #[test]
    fn overlap_is_bounded_by_slot_count() {
        let mut pipeline = pipeline(HeadlessDevice::new(3), &config());
        let sender = pipeline.sender();
        for id in 0..4 {
            sender.spawn(object(id));
        }

        for _ in 0..20 {
            pipeline.tick().unwrap();
            assert!(pipeline.device().in_flight() <= 3);
            assert!(pipeline.device().unsignaled_fences() <= 3);
        }
        assert_eq!(pipeline.device().stats().max_in_flight, 3);
        assert_eq!(pipeline.device().stats().presents, 20);
        assert_eq!(pipeline.frame_number(), 20);

        let slots: Vec<usize> = pipeline.renderer().frames.iter().map(|f| f.slot).collect();
        assert_eq!(&slots[..4], &[0, 1, 2, 0]);
    }

    #[test]
    fn deletion_after_tick_five_is_released_at_tick_eight() {
        let mut pipeline = pipeline(HeadlessDevice::new(3), &config());
        pipeline.sender().spawn(object(1));
        tick_n(&mut pipeline, 5);
        assert_eq!(last_frame(&pipeline).objects, vec![ObjectId(1)]);

        assert!(pipeline.mark_for_delete(ObjectId(1)));
        assert!(!pipeline.mark_for_delete(ObjectId(1)));

        // Tick 5 recorded in slot 1; its fence guards the deletion.
        let fence = pipeline.slot(1).unwrap().sync.in_flight;
        let waits_before = pipeline.device().wait_count(fence);

        tick_n(&mut pipeline, 2);
        assert!(last_frame(&pipeline).objects.is_empty());
        assert!(pipeline.scene().contains(ObjectId(1)));
        assert_eq!(reserved_objects(&pipeline), 3);
        assert_eq!(pipeline.objects_destroyed(), 0);
        assert_eq!(pipeline.device().wait_count(fence), waits_before);

        tick_n(&mut pipeline, 1);
        assert_eq!(pipeline.device().wait_count(fence), waits_before + 1);
        assert!(!pipeline.scene().contains(ObjectId(1)));
        assert_eq!(reserved_objects(&pipeline), 0);
        assert_eq!(pipeline.objects_destroyed(), 1);
        pipeline.pool().check_exclusivity().unwrap();
    }

    #[test]
    fn delete_command_during_tick_five_releases_at_tick_seven() {
        let mut pipeline = pipeline(HeadlessDevice::new(3), &config());
        let sender = pipeline.sender();
        sender.spawn(object(1));
        tick_n(&mut pipeline, 4);

        sender.delete(ObjectId(1));
        tick_n(&mut pipeline, 1);
        assert!(last_frame(&pipeline).objects.is_empty());

        tick_n(&mut pipeline, 1);
        assert!(pipeline.scene().contains(ObjectId(1)));

        tick_n(&mut pipeline, 1);
        assert!(!pipeline.scene().contains(ObjectId(1)));
        assert_eq!(pipeline.objects_destroyed(), 1);
    }

    #[test]
    fn unknown_objects_cannot_be_marked() {
        let mut pipeline = pipeline(HeadlessDevice::new(2), &config());
        assert!(!pipeline.mark_for_delete(ObjectId(42)));
        pipeline.sender().delete(ObjectId(42));
        tick_n(&mut pipeline, 1);
        assert_eq!(pipeline.objects_destroyed(), 0);
    }

    #[test]
    fn image_index_mismatch_poisons_the_pipeline() {
        let mut pipeline = pipeline(HeadlessDevice::new(3), &config());
        tick_n(&mut pipeline, 1);

        pipeline.device_mut().force_next_image(2);
        assert!(matches!(
            pipeline.tick(),
            Err(GpuError::InvariantViolation(_))
        ));
        assert!(pipeline.is_failed());
        assert!(matches!(pipeline.tick(), Err(GpuError::InvalidState(_))));
        assert!(matches!(
            pipeline.handle_resize(800, 600),
            Err(GpuError::InvalidState(_))
        ));

        let device = pipeline.shutdown().unwrap();
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn submit_failure_is_returned_unchanged() {
        let mut pipeline = pipeline(HeadlessDevice::new(2), &config());
        pipeline
            .device_mut()
            .fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(
            pipeline.tick(),
            Err(GpuError::SubmitFailed(vk::Result::ERROR_DEVICE_LOST))
        ));
        assert_eq!(pipeline.device().stats().submissions, 0);
        assert!(pipeline.tick().is_err());
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn present_failure_is_returned_unchanged() {
        let mut pipeline = pipeline(HeadlessDevice::new(2), &config());
        pipeline
            .device_mut()
            .fail_next_present(vk::Result::ERROR_SURFACE_LOST_KHR);
        assert!(matches!(
            pipeline.tick(),
            Err(GpuError::PresentFailed(vk::Result::ERROR_SURFACE_LOST_KHR))
        ));
        assert_eq!(pipeline.device().stats().submissions, 1);
        assert_eq!(pipeline.device().stats().presents, 0);
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn pool_stays_exclusive_under_churn() {
        let mut pipeline = pipeline(HeadlessDevice::new(3), &config());
        let sender = pipeline.sender();

        for t in 0..30u64 {
            sender.spawn(object(2 * t));
            sender.spawn(object(2 * t + 1));
            if t >= 2 {
                sender.delete(ObjectId(2 * (t - 2)));
                sender.delete(ObjectId(2 * (t - 2) + 1));
            }
            tick_n(&mut pipeline, 1);
            pipeline.pool().check_exclusivity().unwrap();
        }
        assert_eq!(pipeline.scene().iter().filter(|e| !e.marked).count(), 4);

        for id in 0..60 {
            sender.delete(ObjectId(id));
        }
        tick_n(&mut pipeline, 3);
        pipeline.pool().check_exclusivity().unwrap();
        assert!(pipeline.scene().is_empty());
        assert_eq!(pipeline.objects_destroyed(), 60);
        assert_eq!(reserved_objects(&pipeline), 0);
        for frame in 0..3 {
            assert_eq!(pipeline.pool().region_count(frame), 0);
            assert_eq!(
                pipeline.pool().reserved(frame, FrequencyClass::PerPrimitive),
                0
            );
        }
    }

    #[test]
    fn spawn_beyond_pool_capacity_fails_the_tick() {
        let config = EngineConfig::default()
            .with_pool(PoolConfig::default().with_cap(FrequencyClass::PerObject, 2));
        let mut pipeline = pipeline(HeadlessDevice::new(3), &config);
        let sender = pipeline.sender();
        for id in 0..3 {
            sender.spawn(object(id));
        }
        let err = pipeline.tick().unwrap_err();
        assert!(matches!(
            err,
            GpuError::PoolExhausted {
                class: FrequencyClass::PerObject,
                frame: 0,
                requested: 1,
                available: 0,
            }
        ));
        assert!(pipeline.is_failed());
        assert!(matches!(pipeline.tick(), Err(GpuError::InvalidState(_))));

        assert_eq!(pipeline.scene().len(), 2);
        assert!(!pipeline.scene().contains(ObjectId(2)));
        for frame in 0..3 {
            assert_eq!(pipeline.pool().reserved(frame, FrequencyClass::PerObject), 2);
            assert_eq!(pipeline.pool().reserved(frame, FrequencyClass::PerPrimitive), 2);
            assert_eq!(pipeline.pool().region_count(frame), 2);
        }
        pipeline.pool().check_exclusivity().unwrap();

        let device = pipeline.shutdown().unwrap();
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn freed_pool_space_is_reused_without_growth() {
        let config = EngineConfig::default()
            .with_pool(PoolConfig::default().with_cap(FrequencyClass::PerObject, 2));
        let mut pipeline = pipeline(HeadlessDevice::new(3), &config);
        let sender = pipeline.sender();
        sender.spawn(object(0));
        sender.spawn(object(1));
        tick_n(&mut pipeline, 1);

        assert!(pipeline.mark_for_delete(ObjectId(0)));
        tick_n(&mut pipeline, 3);
        sender.spawn(object(2));
        tick_n(&mut pipeline, 1);
        assert!(pipeline.scene().contains(ObjectId(2)));
        assert_eq!(pipeline.pool().capacity(FrequencyClass::PerObject), 2);
        pipeline.pool().check_exclusivity().unwrap();
    }

    #[test]
    fn bottom_level_over_scratch_budget_fails_the_tick() {
        let config = config()
            .with_raytracing(true)
            .with_acceleration(AccelerationConfig::default().with_scratch_budget(16));
        let mut pipeline = pipeline(HeadlessDevice::new(3), &config);
        pipeline.sender().spawn(object(1));

        let err = pipeline.tick().unwrap_err();
        assert!(matches!(
            err,
            GpuError::ScratchBudgetExceeded { budget: 16, .. }
        ));
        assert!(pipeline.builder().is_empty());
        assert_eq!(pipeline.device().stats().submissions, 0);

        let device = pipeline.shutdown().unwrap();
        assert_eq!(device.live_structure_count(), 0);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn geometry_update_must_fit_the_reservation() {
        let mut pipeline = pipeline(HeadlessDevice::new(2), &config());
        let sender = pipeline.sender();
        sender.spawn(object(1));
        tick_n(&mut pipeline, 1);

        let mut larger = mesh();
        larger.primitive_count = 3;
        sender.enqueue(EngineCommand::UpdateGeometry {
            id: ObjectId(1),
            mesh: larger,
        });
        tick_n(&mut pipeline, 1);
        assert_eq!(
            pipeline.scene().get(ObjectId(1)).unwrap().object.mesh.primitive_count,
            1
        );

        let mut denser = mesh();
        denser.index_count = 72;
        sender.enqueue(EngineCommand::UpdateGeometry {
            id: ObjectId(1),
            mesh: denser,
        });
        tick_n(&mut pipeline, 1);
        let entry = pipeline.scene().get(ObjectId(1)).unwrap();
        assert_eq!(entry.object.mesh.index_count, 72);
        assert!(entry.geometry_dirty);
    }

    #[test]
    fn stencil_and_wireframe_select_pipeline_variants() {
        let mut pipeline = pipeline(HeadlessDevice::new(2), &config());
        let sender = pipeline.sender();
        sender.spawn(object(1));
        sender.spawn(object(2));
        tick_n(&mut pipeline, 1);
        let plain = PipelineId::plain(PipelineKind::Color);
        assert_eq!(last_frame(&pipeline).pipelines, vec![plain, plain]);

        sender.enqueue(EngineCommand::Stencil(ObjectId(1)));
        sender.enqueue(EngineCommand::ToggleWireframe);
        tick_n(&mut pipeline, 1);
        assert!(pipeline.wireframe());
        assert_eq!(
            last_frame(&pipeline).pipelines,
            vec![
                plain.with_modifier(PipelineModifier::Stencil),
                plain.with_modifier(PipelineModifier::Wireframe),
            ]
        );

        sender.enqueue(EngineCommand::Unstencil(ObjectId(1)));
        tick_n(&mut pipeline, 2);
        assert_eq!(
            last_frame(&pipeline).pipelines,
            vec![plain.with_modifier(PipelineModifier::Wireframe); 2]
        );
        // Each variant was created once and then served from the table.
        assert_eq!(pipeline.renderer().created.len(), 3);
    }

    #[test]
    fn hidden_objects_are_not_drawn() {
        let mut pipeline = pipeline(HeadlessDevice::new(2), &config());
        let sender = pipeline.sender();
        sender.spawn(object(1));
        sender.spawn(object(2));
        sender.enqueue(EngineCommand::SetVisible {
            id: ObjectId(2),
            visible: false,
        });
        tick_n(&mut pipeline, 1);
        assert_eq!(last_frame(&pipeline).objects, vec![ObjectId(1)]);
    }

    #[test]
    fn transforms_are_written_into_the_slot_region() {
        let mut pipeline = pipeline(HeadlessDevice::new(2), &config());
        let sender = pipeline.sender();
        sender.spawn(object(1));
        tick_n(&mut pipeline, 1);

        let moved = Mat4::from_translation(Vec3::new(3.0, -2.0, 7.5));
        sender.enqueue(EngineCommand::UpdateTransform {
            id: ObjectId(1),
            transform: moved,
        });
        tick_n(&mut pipeline, 1);

        let region = pipeline.scene().get(ObjectId(1)).unwrap().slots[1].region;
        let buffer = pipeline.pool().transform_buffer(1).unwrap();
        let bytes = pipeline.device().buffer_contents(buffer).unwrap();
        let start = region.offset as usize;
        let uniforms: ObjectUniforms =
            bytemuck::pod_read_unaligned(&bytes[start..start + UNIFORM_SIZE as usize]);
        assert_eq!(uniforms.model[3], [3.0, -2.0, 7.5, 1.0]);
        assert_eq!(uniforms.flags[0], 0);
    }

    #[test]
    fn raytracing_builds_once_and_releases_everything() {
        let config = config().with_raytracing(true);
        let mut pipeline = pipeline(HeadlessDevice::new(3), &config);
        let sender = pipeline.sender();
        for id in 0..3 {
            sender.spawn(object(id));
        }
        tick_n(&mut pipeline, 1);
        assert!(last_frame(&pipeline).top_level);
        assert_eq!(pipeline.builder().len(), 3);
        assert_eq!(pipeline.builder().instance_count(), 3);
        assert_eq!(pipeline.device().stats().compactions, 3);

        tick_n(&mut pipeline, 9);
        // Bottom-level structures are built once; only the top level repeats.
        assert_eq!(pipeline.device().stats().compactions, 3);
        assert!(pipeline.device().live_structure_count() <= 3 + 3);

        sender.enqueue(EngineCommand::RebuildAccelerationStructures);
        tick_n(&mut pipeline, 1);
        assert_eq!(pipeline.device().stats().compactions, 6);

        pipeline.set_raytracing_enabled(false).unwrap();
        tick_n(&mut pipeline, 3);
        assert!(pipeline.builder().top_level().is_none());
        assert!(!last_frame(&pipeline).top_level);
        assert_eq!(pipeline.device().live_structure_count(), 3);

        let device = pipeline.shutdown().unwrap();
        assert_eq!(device.live_structure_count(), 0);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn deleting_a_traced_object_destroys_its_structure() {
        let config = config().with_raytracing(true);
        let mut pipeline = pipeline(HeadlessDevice::new(2), &config);
        pipeline.sender().spawn(object(7));
        tick_n(&mut pipeline, 1);
        let blas = pipeline.builder().bottom_level(ObjectId(7)).unwrap().handle;

        assert!(pipeline.mark_for_delete(ObjectId(7)));
        tick_n(&mut pipeline, 1);
        assert_eq!(pipeline.builder().instance_count(), 0);
        assert!(pipeline.device().is_structure_live(blas));

        tick_n(&mut pipeline, 1);
        assert!(!pipeline.device().is_structure_live(blas));
        assert!(!pipeline.builder().contains(ObjectId(7)));
    }

    #[test]
    fn raytracing_requires_acceleration_support() {
        let config = config().with_raytracing(true);
        let mut pipeline = pipeline(HeadlessDevice::new(2).without_acceleration(), &config);
        assert!(!pipeline.raytracing_enabled());
        assert!(matches!(
            pipeline.set_raytracing_enabled(true),
            Err(GpuError::MissingCapability(_))
        ));

        pipeline.sender().enqueue(EngineCommand::SetRayTracing(true));
        assert!(matches!(
            pipeline.tick(),
            Err(GpuError::MissingCapability(_))
        ));
        assert!(!pipeline.raytracing_enabled());
        assert!(pipeline.is_failed());
    }

    #[test]
    fn shutdown_command_stops_before_recording() {
        let mut pipeline = pipeline(HeadlessDevice::new(2), &config());
        let sender = pipeline.sender();
        sender.shutdown();
        sender.spawn(object(1));
        assert_eq!(pipeline.tick().unwrap(), TickStatus::ShutdownRequested);
        assert_eq!(pipeline.tick().unwrap(), TickStatus::ShutdownRequested);
        assert_eq!(pipeline.device().stats().submissions, 0);
        assert!(pipeline.scene().is_empty());

        let device = pipeline.shutdown().unwrap();
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn resize_drains_every_slot_and_restarts_the_ring() {
        let mut pipeline = pipeline(HeadlessDevice::new(3), &config());
        pipeline.sender().spawn(object(1));
        tick_n(&mut pipeline, 2);
        assert!(pipeline.mark_for_delete(ObjectId(1)));

        pipeline.handle_resize(800, 600).unwrap();
        assert!(!pipeline.scene().contains(ObjectId(1)));
        assert_eq!(pipeline.current_slot(), 0);
        assert!(pipeline
            .device()
            .events()
            .contains(&HeadlessEvent::Resized {
                width: 800,
                height: 600
            }));

        // Minimized windows are ignored.
        pipeline.handle_resize(0, 600).unwrap();
        tick_n(&mut pipeline, 4);
        assert_eq!(last_frame(&pipeline).slot, 0);
    }
}
