//! Bottom-level batching and compaction, per-tick top-level rebuild.

use std::ops::Range;

use ash::vk;
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;
use kestrel_core::{MeshRef, ObjectId};
use kestrel_gpu::{
    AccelerationDevice, AccelerationGeometry, AccelerationKind, AccelerationStructure, BuildFlags,
    BuildSizes, DeviceBuffer, GpuError, InstanceRecord, Result, Retired, TriangleGeometry,
};
use tracing::{debug, trace, warn};

use crate::config::AccelerationConfig;

/// One bottom-level build, with its sizes already queried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuildRequest {
    pub object: ObjectId,
    pub geometry: TriangleGeometry,
    pub flags: BuildFlags,
    pub sizes: BuildSizes,
}

impl BuildRequest {
    /// Describe a build of `mesh` and query its memory requirements.
    pub fn new<D: AccelerationDevice + ?Sized>(
        device: &D,
        object: ObjectId,
        mesh: &MeshRef,
        flags: BuildFlags,
    ) -> Result<Self> {
        if !mesh.is_traceable() {
            return Err(GpuError::InvalidState(format!(
                "{object} has no traceable geometry"
            )));
        }
        let geometry = TriangleGeometry::from_mesh(mesh);
        let sizes =
            device.acceleration_build_sizes(&AccelerationGeometry::Triangles(geometry), flags)?;
        Ok(Self {
            object,
            geometry,
            flags,
            sizes,
        })
    }

    pub const fn compacted(&self) -> bool {
        self.flags.contains(BuildFlags::ALLOW_COMPACTION)
    }
}

/// Split `requests` into consecutive batches whose summed scratch size
/// stays within `budget`.
pub fn plan_batches(requests: &[BuildRequest], budget: u64) -> Result<Vec<Range<usize>>> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut used = 0u64;

    for (i, request) in requests.iter().enumerate() {
        let scratch = request.sizes.scratch_size;
        if scratch > budget {
            return Err(GpuError::ScratchBudgetExceeded {
                required: scratch,
                budget,
            });
        }
        if i > start && used + scratch > budget {
            batches.push(start..i);
            start = i;
            used = 0;
        }
        used += scratch;
    }
    if start < requests.len() {
        batches.push(start..requests.len());
    }
    Ok(batches)
}

/// An object placed in the top-level structure.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TopLevelInstance {
    pub object: ObjectId,
    /// Row-major 3x4 object to world transform.
    pub transform: [f32; 12],
}

#[derive(Clone, Copy, Debug)]
struct TopLevel {
    structure: AccelerationStructure,
    instances: DeviceBuffer,
    scratch: DeviceBuffer,
    instance_count: u32,
}

impl TopLevel {
    const fn retired(self) -> [Retired; 3] {
        [
            Retired::Structure(self.structure),
            Retired::Buffer(self.instances),
            Retired::Buffer(self.scratch),
        ]
    }
}

/// Owns every bottom-level structure and the current top-level structure.
pub struct AccelerationStructureBuilder {
    config: AccelerationConfig,
    bottom: HashMap<ObjectId, AccelerationStructure>,
    top: Option<TopLevel>,
}

impl AccelerationStructureBuilder {
    pub fn new(config: AccelerationConfig) -> Self {
        Self {
            config,
            bottom: HashMap::new(),
            top: None,
        }
    }

    pub fn config(&self) -> &AccelerationConfig {
        &self.config
    }

    /// Flags every bottom-level build uses under the current config.
    pub fn bottom_level_flags(&self) -> BuildFlags {
        if self.config.compact {
            BuildFlags::PREFER_FAST_TRACE | BuildFlags::ALLOW_COMPACTION
        } else {
            BuildFlags::PREFER_FAST_TRACE
        }
    }

    /// Build request for `object` under the current config.
    pub fn request<D: AccelerationDevice + ?Sized>(
        &self,
        device: &D,
        object: ObjectId,
        mesh: &MeshRef,
    ) -> Result<BuildRequest> {
        BuildRequest::new(device, object, mesh, self.bottom_level_flags())
    }

    /// Build bottom-level structures for `requests` and wait for them.
    ///
    /// Returns the structures that were replaced. They may still be
    /// referenced by frames in flight and must go through deferred deletion.
    pub fn build_bottom_level<D: AccelerationDevice + ?Sized>(
        &mut self,
        device: &mut D,
        requests: &[BuildRequest],
    ) -> Result<Vec<AccelerationStructure>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        if !device.supports_acceleration_structures() {
            return Err(GpuError::MissingCapability(
                "acceleration structures".to_string(),
            ));
        }

        let batches = plan_batches(requests, self.config.scratch_budget)?;
        debug!(
            "Building {} bottom-level structures in {} batches",
            requests.len(),
            batches.len()
        );

        let mut replaced = Vec::new();
        for range in batches {
            let batch = &requests[range];
            let built = build_batch(device, batch)?;
            for (request, structure) in batch.iter().zip(built) {
                trace!(
                    "BLAS for {}: {} bytes at {:#x}",
                    request.object,
                    structure.size,
                    structure.device_address
                );
                if let Some(old) = self.bottom.insert(request.object, structure) {
                    replaced.push(old);
                }
            }
        }
        Ok(replaced)
    }

    /// Record a top-level build over `instances` into `cmd`.
    ///
    /// Instances without a bottom-level structure are skipped. Returns the
    /// previous top-level structure's resources for deferred deletion. On
    /// error the previous structure stays current and anything created for
    /// the new one is destroyed; none of it was submitted.
    pub fn build_top_level<D: AccelerationDevice + ?Sized>(
        &mut self,
        device: &mut D,
        cmd: vk::CommandBuffer,
        instances: &[TopLevelInstance],
    ) -> Result<Vec<Retired>> {
        let mut records = Vec::with_capacity(instances.len());
        for instance in instances {
            let Some(blas) = self.bottom.get(&instance.object) else {
                continue;
            };
            let custom_index = u32::try_from(records.len())
                .unwrap_or(InstanceRecord::MAX_CUSTOM_INDEX)
                .min(InstanceRecord::MAX_CUSTOM_INDEX);
            records.push(InstanceRecord::new(
                instance.transform,
                custom_index,
                blas.device_address,
            ));
        }
        if records.is_empty() {
            trace!("No ray traced instances this tick");
            return Ok(self.take_top_level());
        }

        let mut created = Vec::with_capacity(3);
        match record_top_level(device, cmd, &records, &mut created) {
            Ok(top) => {
                trace!("TLAS over {} instances", top.instance_count);
                let retired = self.take_top_level();
                self.top = Some(top);
                Ok(retired)
            }
            Err(e) => {
                destroy_retired(device, created);
                Err(e)
            }
        }
    }

    /// Detach the current top-level structure, returning its resources.
    pub fn take_top_level(&mut self) -> Vec<Retired> {
        self.top
            .take()
            .into_iter()
            .flat_map(TopLevel::retired)
            .collect()
    }

    pub fn top_level(&self) -> Option<&AccelerationStructure> {
        self.top.as_ref().map(|top| &top.structure)
    }

    /// Instance buffer of the current top-level structure.
    pub fn instance_buffer(&self) -> Option<&DeviceBuffer> {
        self.top.as_ref().map(|top| &top.instances)
    }

    pub fn instance_count(&self) -> u32 {
        self.top.as_ref().map_or(0, |top| top.instance_count)
    }

    pub fn bottom_level(&self, object: ObjectId) -> Option<&AccelerationStructure> {
        self.bottom.get(&object)
    }

    /// Forget `object`'s bottom-level structure, handing it to the caller.
    pub fn remove(&mut self, object: ObjectId) -> Option<AccelerationStructure> {
        self.bottom.remove(&object)
    }

    pub fn contains(&self, object: ObjectId) -> bool {
        self.bottom.contains_key(&object)
    }

    /// Number of bottom-level structures.
    pub fn len(&self) -> usize {
        self.bottom.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bottom.is_empty()
    }

    /// Destroy everything. The device must be idle.
    pub fn destroy<D: AccelerationDevice + ?Sized>(mut self, device: &mut D) -> Result<()> {
        for retired in self.take_top_level() {
            match retired {
                Retired::Structure(structure) => device.destroy_acceleration_structure(structure)?,
                Retired::Buffer(buffer) => device.destroy_buffer(buffer)?,
                Retired::Object(_) => {}
            }
        }
        for (_, structure) in self.bottom.drain() {
            device.destroy_acceleration_structure(structure)?;
        }
        Ok(())
    }
}

fn build_batch<D: AccelerationDevice + ?Sized>(
    device: &mut D,
    batch: &[BuildRequest],
) -> Result<Vec<AccelerationStructure>> {
    let compact = batch.first().is_some_and(BuildRequest::compacted);
    if batch.iter().any(|r| r.compacted() != compact) {
        return Err(GpuError::MixedCompaction);
    }

    let mut structures = Vec::with_capacity(batch.len());
    for request in batch {
        match device.create_acceleration_structure(
            AccelerationKind::BottomLevel,
            request.sizes.structure_size,
            "blas",
        ) {
            Ok(structure) => structures.push(structure),
            Err(e) => {
                destroy_all(device, structures);
                return Err(e);
            }
        }
    }

    // Builds run one after another, so the largest request bounds the scratch.
    let scratch_size = batch
        .iter()
        .map(|r| r.sizes.scratch_size)
        .max()
        .unwrap_or(0);
    let scratch = match device.create_buffer(
        scratch_size,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
        "blas_scratch",
    ) {
        Ok(scratch) => scratch,
        Err(e) => {
            destroy_all(device, structures);
            return Err(e);
        }
    };

    let submitted = submit_builds(device, batch, &structures, scratch.device_address, compact);
    // The one-time submission has completed, so the scratch is free again.
    let freed = device.destroy_buffer(scratch);
    let query_pool = match submitted.and_then(|pool| freed.map(|()| pool)) {
        Ok(pool) => pool,
        Err(e) => {
            destroy_all(device, structures);
            return Err(e);
        }
    };

    match query_pool {
        Some(pool) => compact_batch(device, structures, pool),
        None => Ok(structures),
    }
}

fn submit_builds<D: AccelerationDevice + ?Sized>(
    device: &mut D,
    batch: &[BuildRequest],
    structures: &[AccelerationStructure],
    scratch_address: u64,
    compact: bool,
) -> Result<Option<vk::QueryPool>> {
    let query_pool = if compact {
        let count = u32::try_from(structures.len())
            .map_err(|_| GpuError::Other("build batch too large".to_string()))?;
        Some(device.create_compaction_query_pool(count)?)
    } else {
        None
    };

    let recorded = device.begin_one_time().and_then(|cmd| {
        for (i, (request, structure)) in batch.iter().zip(structures).enumerate() {
            if i > 0 {
                // Every build in the batch shares one scratch buffer.
                device.cmd_acceleration_build_barrier(cmd);
            }
            if let Err(e) = device.cmd_build_acceleration_structure(
                cmd,
                structure,
                &AccelerationGeometry::Triangles(request.geometry),
                request.flags,
                scratch_address,
            ) {
                device.free_command_buffer(cmd);
                return Err(e);
            }
        }
        if let Some(pool) = query_pool {
            device.cmd_acceleration_build_barrier(cmd);
            device.cmd_write_compacted_sizes(cmd, structures, pool);
        }
        device.submit_one_time(cmd)
    });

    match recorded {
        Ok(()) => Ok(query_pool),
        Err(e) => {
            if let Some(pool) = query_pool {
                device.destroy_query_pool(pool);
            }
            Err(e)
        }
    }
}

fn compact_batch<D: AccelerationDevice + ?Sized>(
    device: &mut D,
    originals: Vec<AccelerationStructure>,
    pool: vk::QueryPool,
) -> Result<Vec<AccelerationStructure>> {
    let count = u32::try_from(originals.len())
        .map_err(|_| GpuError::Other("build batch too large".to_string()))?;
    let sizes = device.compacted_sizes(pool, count);
    device.destroy_query_pool(pool);
    let sizes = match sizes {
        Ok(sizes) => sizes,
        Err(e) => {
            destroy_all(device, originals);
            return Err(e);
        }
    };

    if let Some((original, size)) = originals
        .iter()
        .zip(&sizes)
        .find(|(original, size)| **size == 0 || **size > original.size)
    {
        let err = GpuError::InvariantViolation(format!(
            "compacted size {size} of {:?} exceeds original size {}",
            original.handle, original.size
        ));
        destroy_all(device, originals);
        return Err(err);
    }

    let mut compacted = Vec::with_capacity(originals.len());
    for &size in &sizes {
        match device.create_acceleration_structure(
            AccelerationKind::BottomLevel,
            size,
            "blas_compacted",
        ) {
            Ok(structure) => compacted.push(structure),
            Err(e) => {
                destroy_all(device, compacted);
                destroy_all(device, originals);
                return Err(e);
            }
        }
    }

    let copied = device.begin_one_time().and_then(|cmd| {
        for (src, dst) in originals.iter().zip(&compacted) {
            device.cmd_copy_compact(cmd, src, dst);
        }
        device.submit_one_time(cmd)
    });
    if let Err(e) = copied {
        destroy_all(device, compacted);
        destroy_all(device, originals);
        return Err(e);
    }

    let before: u64 = originals.iter().map(|s| s.size).sum();
    let after: u64 = compacted.iter().map(|s| s.size).sum();
    debug!(
        "Compacted {} bottom-level structures from {before} to {after} bytes",
        compacted.len()
    );

    for original in originals {
        device.destroy_acceleration_structure(original)?;
    }
    Ok(compacted)
}

/// Create and record one top-level structure over `records`.
///
/// Every resource is pushed onto `created` as soon as it exists.
fn record_top_level<D: AccelerationDevice + ?Sized>(
    device: &mut D,
    cmd: vk::CommandBuffer,
    records: &[InstanceRecord],
    created: &mut Vec<Retired>,
) -> Result<TopLevel> {
    let instance_count = u32::try_from(records.len())
        .map_err(|_| GpuError::Other("too many top-level instances".to_string()))?;
    let bytes: &[u8] = bytemuck::cast_slice(records);
    let instances = device.create_buffer(
        bytes.len() as u64,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::CpuToGpu,
        "tlas_instances",
    )?;
    created.push(Retired::Buffer(instances));
    device.write_buffer(&instances, 0, bytes)?;

    let geometry = AccelerationGeometry::Instances {
        address: instances.device_address,
        count: instance_count,
    };
    let flags = BuildFlags::PREFER_FAST_BUILD;
    let sizes = device.acceleration_build_sizes(&geometry, flags)?;
    let structure = device.create_acceleration_structure(
        AccelerationKind::TopLevel,
        sizes.structure_size,
        "tlas",
    )?;
    created.push(Retired::Structure(structure));
    let scratch = device.create_buffer(
        sizes.scratch_size,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
        "tlas_scratch",
    )?;
    created.push(Retired::Buffer(scratch));

    device.cmd_build_acceleration_structure(
        cmd,
        &structure,
        &geometry,
        flags,
        scratch.device_address,
    )?;
    device.cmd_acceleration_build_barrier(cmd);

    Ok(TopLevel {
        structure,
        instances,
        scratch,
        instance_count,
    })
}

/// Best-effort destruction of resources that never reached the GPU.
fn destroy_retired<D: AccelerationDevice + ?Sized>(device: &mut D, retired: Vec<Retired>) {
    for item in retired {
        let result = match item {
            Retired::Structure(structure) => device.destroy_acceleration_structure(structure),
            Retired::Buffer(buffer) => device.destroy_buffer(buffer),
            Retired::Object(_) => Ok(()),
        };
        if let Err(e) = result {
            warn!("Failed to destroy top-level resource: {e}");
        }
    }
}

/// Best-effort cleanup on an error path.
fn destroy_all<D: AccelerationDevice + ?Sized>(
    device: &mut D,
    structures: impl IntoIterator<Item = AccelerationStructure>,
) {
    for structure in structures {
        if let Err(e) = device.destroy_acceleration_structure(structure) {
            warn!("Failed to destroy acceleration structure: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_gpu::{GpuDevice, HeadlessDevice, HeadlessEvent};

    fn mesh(triangles: u32) -> MeshRef {
        MeshRef {
            vertex_address: 0x1000,
            vertex_count: triangles * 3,
            vertex_stride: 12,
            index_address: 0x2000,
            index_count: triangles * 3,
            primitive_count: 1,
        }
    }

    fn requests(
        builder: &AccelerationStructureBuilder,
        device: &HeadlessDevice,
        count: u64,
    ) -> Vec<BuildRequest> {
        (1..=count)
            .map(|id| builder.request(device, ObjectId(id), &mesh(8)).unwrap())
            .collect()
    }

    #[test]
    fn batches_respect_scratch_budget() {
        let device = HeadlessDevice::new(3);
        let builder = AccelerationStructureBuilder::new(AccelerationConfig::default());
        let requests = requests(&builder, &device, 5);
        // 8 triangles need 768 bytes of simulated scratch.
        assert_eq!(requests[0].sizes.scratch_size, 768);

        let budget = 2000;
        let batches = plan_batches(&requests, budget).unwrap();
        assert_eq!(batches, vec![0..2, 2..4, 4..5]);
        for batch in &batches {
            let used: u64 = requests[batch.clone()]
                .iter()
                .map(|r| r.sizes.scratch_size)
                .sum();
            assert!(used <= budget);
        }
    }

    #[test]
    fn single_request_over_budget_is_rejected() {
        let device = HeadlessDevice::new(3);
        let builder = AccelerationStructureBuilder::new(AccelerationConfig::default());
        let requests = requests(&builder, &device, 1);
        let err = plan_batches(&requests, 500).unwrap_err();
        assert!(matches!(
            err,
            GpuError::ScratchBudgetExceeded {
                required: 768,
                budget: 500
            }
        ));
        assert!(plan_batches(&[], 500).unwrap().is_empty());
    }

    #[test]
    fn compaction_shrinks_and_frees_originals() {
        let mut device = HeadlessDevice::new(3);
        let mut builder = AccelerationStructureBuilder::new(AccelerationConfig::default());
        let requests = requests(&builder, &device, 3);
        assert!(requests.iter().all(BuildRequest::compacted));

        let replaced = builder.build_bottom_level(&mut device, &requests).unwrap();
        assert!(replaced.is_empty());
        assert_eq!(builder.len(), 3);
        for request in &requests {
            let blas = builder.bottom_level(request.object).unwrap();
            assert!(blas.size < request.sizes.structure_size);
            assert!(device.is_structure_live(blas.handle));
        }

        // Only the compacted structures and their buffers remain.
        assert_eq!(device.live_structure_count(), 3);
        assert_eq!(device.live_buffer_count(), 3);
        let stats = device.stats();
        assert_eq!(stats.builds, 3);
        assert_eq!(stats.compactions, 3);
        assert_eq!(stats.one_time_submissions, 2);

        let barriers = device
            .events()
            .iter()
            .filter(|e| matches!(e, HeadlessEvent::BarrierRecorded(_)))
            .count();
        assert_eq!(barriers, 3);
    }

    #[test]
    fn compaction_growth_is_an_invariant_violation() {
        let mut device = HeadlessDevice::new(3);
        device.set_compaction_percent(150);
        let mut builder = AccelerationStructureBuilder::new(AccelerationConfig::default());
        let requests = requests(&builder, &device, 2);

        let err = builder.build_bottom_level(&mut device, &requests).unwrap_err();
        assert!(matches!(err, GpuError::InvariantViolation(_)));
        assert!(builder.is_empty());
        assert_eq!(device.live_structure_count(), 0);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn uncompacted_builds_keep_reported_size() {
        let mut device = HeadlessDevice::new(3);
        let mut builder =
            AccelerationStructureBuilder::new(AccelerationConfig::default().with_compaction(false));
        let requests = requests(&builder, &device, 2);
        builder.build_bottom_level(&mut device, &requests).unwrap();

        let blas = builder.bottom_level(ObjectId(1)).unwrap();
        assert_eq!(blas.size, requests[0].sizes.structure_size);
        assert_eq!(device.stats().compactions, 0);
        assert_eq!(device.stats().one_time_submissions, 1);
    }

    #[test]
    fn mixed_compaction_batch_is_rejected() {
        let mut device = HeadlessDevice::new(3);
        let mut builder = AccelerationStructureBuilder::new(AccelerationConfig::default());
        let mut requests = requests(&builder, &device, 2);
        requests[1].flags = BuildFlags::PREFER_FAST_TRACE;

        let err = builder.build_bottom_level(&mut device, &requests).unwrap_err();
        assert!(matches!(err, GpuError::MixedCompaction));
        assert!(!err.is_fatal());
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn rebuild_hands_back_replaced_structure() {
        let mut device = HeadlessDevice::new(3);
        let mut builder = AccelerationStructureBuilder::new(AccelerationConfig::default());
        let first = requests(&builder, &device, 1);
        builder.build_bottom_level(&mut device, &first).unwrap();
        let old = *builder.bottom_level(ObjectId(1)).unwrap();

        let second = vec![builder.request(&device, ObjectId(1), &mesh(32)).unwrap()];
        let replaced = builder.build_bottom_level(&mut device, &second).unwrap();
        assert_eq!(replaced, vec![old]);
        assert_ne!(builder.bottom_level(ObjectId(1)).unwrap().handle, old.handle);
        assert!(device.is_structure_live(old.handle));
        device.destroy_acceleration_structure(old).unwrap();
    }

    #[test]
    fn missing_support_is_reported() {
        let mut device = HeadlessDevice::new(3).without_acceleration();
        let mut builder = AccelerationStructureBuilder::new(AccelerationConfig::default());
        let err = builder.request(&device, ObjectId(1), &mesh(4)).unwrap_err();
        assert!(matches!(err, GpuError::MissingCapability(_)));

        let request = BuildRequest {
            object: ObjectId(1),
            geometry: TriangleGeometry::from_mesh(&mesh(4)),
            flags: BuildFlags::PREFER_FAST_TRACE,
            sizes: BuildSizes {
                structure_size: 1024,
                scratch_size: 512,
            },
        };
        let err = builder.build_bottom_level(&mut device, &[request]).unwrap_err();
        assert!(matches!(err, GpuError::MissingCapability(_)));
    }

    #[test]
    fn untraceable_mesh_is_rejected() {
        let device = HeadlessDevice::new(3);
        let builder = AccelerationStructureBuilder::new(AccelerationConfig::default());
        let empty = MeshRef::default();
        assert!(builder.request(&device, ObjectId(1), &empty).is_err());
    }

    #[test]
    fn top_level_rebuild_retires_previous() {
        let mut device = HeadlessDevice::new(3);
        let mut builder = AccelerationStructureBuilder::new(AccelerationConfig::default());
        let requests = requests(&builder, &device, 2);
        builder.build_bottom_level(&mut device, &requests).unwrap();

        let cmd = device.allocate_command_buffer().unwrap();
        device.begin_command_buffer(cmd).unwrap();

        let mut transform = [0.0; 12];
        transform[0] = 1.0;
        transform[5] = 1.0;
        transform[10] = 1.0;
        transform[3] = 4.0;
        let instances = [
            TopLevelInstance {
                object: ObjectId(1),
                transform,
            },
            TopLevelInstance {
                object: ObjectId(99),
                transform,
            },
            TopLevelInstance {
                object: ObjectId(2),
                transform,
            },
        ];

        let retired = builder
            .build_top_level(&mut device, cmd, &instances)
            .unwrap();
        assert!(retired.is_empty());
        assert_eq!(builder.instance_count(), 2);

        let bytes = device
            .buffer_contents(builder.instance_buffer().unwrap())
            .unwrap()
            .to_vec();
        let second: InstanceRecord = bytemuck::pod_read_unaligned(&bytes[64..128]);
        assert_eq!(second.custom_index(), 1);
        assert_eq!(
            second.blas_address,
            builder.bottom_level(ObjectId(2)).unwrap().device_address
        );
        assert!((second.transform[3] - 4.0).abs() < f32::EPSILON);

        let previous = *builder.top_level().unwrap();
        let retired = builder
            .build_top_level(&mut device, cmd, &instances)
            .unwrap();
        assert_eq!(retired.len(), 3);
        assert_eq!(retired[0], Retired::Structure(previous));

        for item in retired {
            match item {
                Retired::Structure(s) => device.destroy_acceleration_structure(s).unwrap(),
                Retired::Buffer(b) => device.destroy_buffer(b).unwrap(),
                Retired::Object(_) => unreachable!(),
            }
        }
        builder.destroy(&mut device).unwrap();
        assert_eq!(device.live_structure_count(), 0);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn failed_top_level_build_keeps_previous_and_leaks_nothing() {
        let mut device = HeadlessDevice::new(3);
        let mut builder = AccelerationStructureBuilder::new(AccelerationConfig::default());
        let requests = requests(&builder, &device, 1);
        builder.build_bottom_level(&mut device, &requests).unwrap();

        let cmd = device.allocate_command_buffer().unwrap();
        device.begin_command_buffer(cmd).unwrap();
        let instances = [TopLevelInstance {
            object: ObjectId(1),
            transform: [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0],
        }];
        builder
            .build_top_level(&mut device, cmd, &instances)
            .unwrap();
        let previous = *builder.top_level().unwrap();
        let buffers = device.live_buffer_count();
        let structures = device.live_structure_count();

        device.end_command_buffer(cmd).unwrap();
        let err = builder
            .build_top_level(&mut device, cmd, &instances)
            .unwrap_err();
        assert!(matches!(err, GpuError::InvariantViolation(_)));
        assert_eq!(builder.top_level(), Some(&previous));
        assert_eq!(device.live_buffer_count(), buffers);
        assert_eq!(device.live_structure_count(), structures);

        builder.destroy(&mut device).unwrap();
        assert_eq!(device.live_structure_count(), 0);
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn empty_top_level_builds_nothing() {
        let mut device = HeadlessDevice::new(3);
        let mut builder = AccelerationStructureBuilder::new(AccelerationConfig::default());
        let cmd = device.allocate_command_buffer().unwrap();
        device.begin_command_buffer(cmd).unwrap();
        let retired = builder.build_top_level(&mut device, cmd, &[]).unwrap();
        assert!(retired.is_empty());
        assert!(builder.top_level().is_none());
        assert_eq!(device.live_buffer_count(), 0);
    }
}
