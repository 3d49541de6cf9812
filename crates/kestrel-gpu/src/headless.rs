//! Simulated device for tests and soak runs.
//!
//! The headless device fabricates handles and keeps just enough state to
//! check the frame core's synchronization contract:
//!
//! - submissions stay pending until a fence wait (or an idle wait) retires
//!   them, in submission order, like a single in-order queue;
//! - re-recording a command buffer that is still pending is rejected;
//! - every lifecycle step is appended to an event log tests can inspect.
//!
//! Build sizes and compaction ratios are deterministic so batching and
//! compaction decisions can be asserted exactly.

use std::collections::VecDeque;

use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use hashbrown::{HashMap, HashSet};

use crate::acceleration::{
    AccelerationGeometry, AccelerationKind, AccelerationStructure, BuildFlags, BuildSizes,
};
use crate::device::{AccelerationDevice, DeviceBuffer, GpuDevice};
use crate::error::{GpuError, Result};
use crate::pool::FrequencyClass;
use crate::region::align_up;

/// Granularity of simulated sizes and addresses.
const SIZE_ALIGNMENT: u64 = 256;
const ADDRESS_BASE: u64 = 0x1_0000_0000;

/// Lifecycle event recorded by [`HeadlessDevice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeadlessEvent {
    Submitted { cmd: vk::CommandBuffer, fence: vk::Fence },
    FenceWaited(vk::Fence),
    /// A pending submission finished and signaled its fence.
    Completed(vk::Fence),
    FenceReset(vk::Fence),
    Acquired(u32),
    Presented(u32),
    OneTimeSubmitted(vk::CommandBuffer),
    BufferCreated(vk::Buffer),
    BufferDestroyed(vk::Buffer),
    StructureCreated(vk::AccelerationStructureKHR),
    StructureDestroyed(vk::AccelerationStructureKHR),
    BuildRecorded {
        cmd: vk::CommandBuffer,
        dst: vk::AccelerationStructureKHR,
        scratch_address: u64,
    },
    BarrierRecorded(vk::CommandBuffer),
    CompactCopied {
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
    },
    Resized { width: u32, height: u32 },
    IdleWait,
}

#[derive(Debug)]
struct Submission {
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
}

#[derive(Debug)]
struct BufferRecord {
    data: Vec<u8>,
    host_visible: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CommandState {
    Initial,
    Recording,
    Executable,
    Pending,
}

/// Counters collected by [`HeadlessDevice`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub submissions: u64,
    pub one_time_submissions: u64,
    pub fence_waits: u64,
    pub presents: u64,
    /// Highest number of simultaneously pending frame submissions.
    pub max_in_flight: usize,
    pub builds: u64,
    pub compactions: u64,
}

/// A device that runs nothing but enforces the submission contract.
pub struct HeadlessDevice {
    image_count: usize,
    next_raw: u64,
    next_address: u64,

    fences: HashMap<vk::Fence, bool>,
    semaphores: HashSet<vk::Semaphore>,
    commands: HashMap<vk::CommandBuffer, CommandState>,
    pending: VecDeque<Submission>,
    one_time: HashSet<vk::CommandBuffer>,

    buffers: HashMap<vk::Buffer, BufferRecord>,
    structures: HashMap<vk::AccelerationStructureKHR, AccelerationStructure>,
    query_pools: HashMap<vk::QueryPool, Vec<u64>>,

    next_image: u32,
    forced_image: Option<u32>,
    fail_submit: Option<vk::Result>,
    fail_present: Option<vk::Result>,
    acceleration_supported: bool,
    /// Compacted size as a fraction of the original, in percent.
    compaction_percent: u64,

    events: Vec<HeadlessEvent>,
    stats: HeadlessStats,
}

impl HeadlessDevice {
    /// Create a device presenting `image_count` images.
    pub fn new(image_count: usize) -> Self {
        Self {
            image_count,
            next_raw: 1,
            next_address: ADDRESS_BASE,
            fences: HashMap::new(),
            semaphores: HashSet::new(),
            commands: HashMap::new(),
            pending: VecDeque::new(),
            one_time: HashSet::new(),
            buffers: HashMap::new(),
            structures: HashMap::new(),
            query_pools: HashMap::new(),
            next_image: 0,
            forced_image: None,
            fail_submit: None,
            fail_present: None,
            acceleration_supported: true,
            compaction_percent: 50,
            events: Vec::new(),
            stats: HeadlessStats::default(),
        }
    }

    /// Report no acceleration structure support.
    #[must_use]
    pub fn without_acceleration(mut self) -> Self {
        self.acceleration_supported = false;
        self
    }

    /// Set the compacted size ratio in percent. Above 100 simulates a
    /// misbehaving driver.
    pub fn set_compaction_percent(&mut self, percent: u64) {
        self.compaction_percent = percent;
    }

    /// Make the next acquire return `index`.
    pub fn force_next_image(&mut self, index: u32) {
        self.forced_image = Some(index);
    }

    /// Make the next submission fail with `result`.
    pub fn fail_next_submit(&mut self, result: vk::Result) {
        self.fail_submit = Some(result);
    }

    /// Make the next present fail with `result`.
    pub fn fail_next_present(&mut self, result: vk::Result) {
        self.fail_present = Some(result);
    }

    /// Retire every pending submission, as if the GPU caught up.
    pub fn complete_all(&mut self) {
        while let Some(submission) = self.pending.pop_front() {
            self.retire(&submission);
        }
    }

    pub fn events(&self) -> &[HeadlessEvent] {
        &self.events
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    pub fn stats(&self) -> HeadlessStats {
        self.stats
    }

    /// Frame submissions not yet retired.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Fences that are created and unsignaled.
    pub fn unsignaled_fences(&self) -> usize {
        self.fences.values().filter(|signaled| !**signaled).count()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_structure_count(&self) -> usize {
        self.structures.len()
    }

    pub fn is_buffer_live(&self, buffer: vk::Buffer) -> bool {
        self.buffers.contains_key(&buffer)
    }

    pub fn is_structure_live(&self, handle: vk::AccelerationStructureKHR) -> bool {
        self.structures.contains_key(&handle)
    }

    /// Bytes written to a host-visible buffer.
    pub fn buffer_contents(&self, buffer: &DeviceBuffer) -> Option<&[u8]> {
        self.buffers.get(&buffer.handle).map(|b| b.data.as_slice())
    }

    /// Number of times `fence` was waited on.
    pub fn wait_count(&self, fence: vk::Fence) -> usize {
        self.events
            .iter()
            .filter(|e| **e == HeadlessEvent::FenceWaited(fence))
            .count()
    }

    fn handle<H: Handle>(&mut self) -> H {
        let raw = self.next_raw;
        self.next_raw += 1;
        H::from_raw(raw)
    }

    fn address(&mut self, size: u64) -> u64 {
        let address = self.next_address;
        self.next_address += align_up(size.max(1), SIZE_ALIGNMENT);
        address
    }

    fn retire(&mut self, submission: &Submission) {
        if let Some(state) = self.commands.get_mut(&submission.cmd) {
            *state = CommandState::Executable;
        }
        if let Some(signaled) = self.fences.get_mut(&submission.fence) {
            *signaled = true;
        }
        self.events.push(HeadlessEvent::Completed(submission.fence));
    }

    fn command_state(&self, cmd: vk::CommandBuffer) -> Result<CommandState> {
        self.commands
            .get(&cmd)
            .copied()
            .ok_or_else(|| GpuError::invariant(format!("unknown command buffer {cmd:?}")))
    }

    fn expect_recording(&self, cmd: vk::CommandBuffer) -> Result<()> {
        match self.command_state(cmd)? {
            CommandState::Recording => Ok(()),
            state => Err(GpuError::invariant(format!(
                "command buffer {cmd:?} is {state:?}, not recording"
            ))),
        }
    }

    fn simulated_sizes(geometry: &AccelerationGeometry) -> BuildSizes {
        let primitives = u64::from(geometry.primitive_count());
        match geometry {
            AccelerationGeometry::Triangles(_) => BuildSizes {
                structure_size: align_up(1024 + primitives * 64, SIZE_ALIGNMENT),
                scratch_size: align_up(512 + primitives * 32, SIZE_ALIGNMENT),
            },
            AccelerationGeometry::Instances { .. } => BuildSizes {
                structure_size: align_up(1024 + primitives * 128, SIZE_ALIGNMENT),
                scratch_size: align_up(512 + primitives * 64, SIZE_ALIGNMENT),
            },
        }
    }
}

impl GpuDevice for HeadlessDevice {
    fn image_count(&self) -> usize {
        self.image_count
    }

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence> {
        let fence = self.handle();
        self.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn create_semaphore(&mut self) -> Result<vk::Semaphore> {
        let semaphore = self.handle();
        self.semaphores.insert(semaphore);
        Ok(semaphore)
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        self.fences.remove(&fence);
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        self.semaphores.remove(&semaphore);
    }

    fn wait_for_fence(&mut self, fence: vk::Fence) -> Result<()> {
        let signaled = *self
            .fences
            .get(&fence)
            .ok_or_else(|| GpuError::invariant(format!("wait on unknown fence {fence:?}")))?;
        self.stats.fence_waits += 1;
        self.events.push(HeadlessEvent::FenceWaited(fence));
        if signaled {
            return Ok(());
        }

        let Some(position) = self.pending.iter().position(|s| s.fence == fence) else {
            return Err(GpuError::invariant(format!(
                "wait on fence {fence:?} that no submission will signal"
            )));
        };
        for submission in self.pending.drain(..=position).collect::<Vec<_>>() {
            self.retire(&submission);
        }
        Ok(())
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        if self.pending.iter().any(|s| s.fence == fence) {
            return Err(GpuError::invariant(format!(
                "reset of fence {fence:?} owned by a pending submission"
            )));
        }
        let signaled = self
            .fences
            .get_mut(&fence)
            .ok_or_else(|| GpuError::invariant(format!("reset of unknown fence {fence:?}")))?;
        *signaled = false;
        self.events.push(HeadlessEvent::FenceReset(fence));
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        self.fences
            .get(&fence)
            .copied()
            .ok_or_else(|| GpuError::invariant(format!("query of unknown fence {fence:?}")))
    }

    fn allocate_command_buffer(&mut self) -> Result<vk::CommandBuffer> {
        let cmd = self.handle();
        self.commands.insert(cmd, CommandState::Initial);
        Ok(cmd)
    }

    fn free_command_buffer(&mut self, cmd: vk::CommandBuffer) {
        self.commands.remove(&cmd);
    }

    fn begin_command_buffer(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        if self.command_state(cmd)? == CommandState::Pending {
            return Err(GpuError::invariant(format!(
                "command buffer {cmd:?} re-recorded while still pending"
            )));
        }
        self.commands.insert(cmd, CommandState::Recording);
        Ok(())
    }

    fn end_command_buffer(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        self.expect_recording(cmd)?;
        self.commands.insert(cmd, CommandState::Executable);
        Ok(())
    }

    fn submit(
        &mut self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        if let Some(result) = self.fail_submit.take() {
            return Err(GpuError::SubmitFailed(result));
        }
        if self.command_state(cmd)? != CommandState::Executable {
            return Err(GpuError::invariant(format!(
                "submit of command buffer {cmd:?} that is not executable"
            )));
        }
        if !self.semaphores.contains(&wait) || !self.semaphores.contains(&signal) {
            return Err(GpuError::invariant("submit with unknown semaphore"));
        }
        match self.fences.get(&fence) {
            Some(false) => {}
            Some(true) => {
                return Err(GpuError::invariant(format!(
                    "submit with fence {fence:?} that was not reset"
                )))
            }
            None => return Err(GpuError::invariant(format!("submit with unknown fence {fence:?}"))),
        }

        self.commands.insert(cmd, CommandState::Pending);
        self.pending.push_back(Submission { cmd, fence });
        self.stats.submissions += 1;
        self.stats.max_in_flight = self.stats.max_in_flight.max(self.pending.len());
        self.events.push(HeadlessEvent::Submitted { cmd, fence });
        Ok(())
    }

    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> Result<u32> {
        if !self.semaphores.contains(&signal) {
            return Err(GpuError::invariant("acquire with unknown semaphore"));
        }
        let index = self.forced_image.take().unwrap_or(self.next_image);
        self.next_image = (index + 1) % self.image_count as u32;
        self.events.push(HeadlessEvent::Acquired(index));
        Ok(index)
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<()> {
        if let Some(result) = self.fail_present.take() {
            return Err(GpuError::PresentFailed(result));
        }
        if image_index as usize >= self.image_count || !self.semaphores.contains(&wait) {
            return Err(GpuError::invariant(format!(
                "present of image {image_index} with invalid arguments"
            )));
        }
        self.stats.presents += 1;
        self.events.push(HeadlessEvent::Presented(image_index));
        Ok(())
    }

    fn begin_one_time(&mut self) -> Result<vk::CommandBuffer> {
        let cmd = self.allocate_command_buffer()?;
        self.begin_command_buffer(cmd)?;
        self.one_time.insert(cmd);
        Ok(cmd)
    }

    fn submit_one_time(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        if !self.one_time.remove(&cmd) {
            return Err(GpuError::invariant(format!(
                "{cmd:?} was not begun as a one-time command buffer"
            )));
        }
        if let Some(result) = self.fail_submit.take() {
            return Err(GpuError::SubmitFailed(result));
        }
        self.end_command_buffer(cmd)?;
        // Waiting for the queue to go idle also retires earlier frames.
        self.complete_all();
        self.free_command_buffer(cmd);
        self.stats.one_time_submissions += 1;
        self.events.push(HeadlessEvent::OneTimeSubmitted(cmd));
        Ok(())
    }

    fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        _name: &str,
    ) -> Result<DeviceBuffer> {
        if size == 0 {
            return Err(GpuError::AllocationFailed("zero-sized buffer".to_string()));
        }
        let handle = self.handle();
        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            self.address(size)
        } else {
            0
        };
        let host_visible = !matches!(location, MemoryLocation::GpuOnly);
        let len = usize::try_from(size)
            .map_err(|_| GpuError::AllocationFailed(format!("{size} bytes")))?;
        self.buffers.insert(
            handle,
            BufferRecord {
                data: if host_visible { vec![0; len] } else { Vec::new() },
                host_visible,
            },
        );
        self.events.push(HeadlessEvent::BufferCreated(handle));
        Ok(DeviceBuffer {
            handle,
            size,
            device_address,
        })
    }

    fn destroy_buffer(&mut self, buffer: DeviceBuffer) -> Result<()> {
        if self.buffers.remove(&buffer.handle).is_none() {
            return Err(GpuError::invariant(format!(
                "destroy of unknown buffer {:?}",
                buffer.handle
            )));
        }
        self.events.push(HeadlessEvent::BufferDestroyed(buffer.handle));
        Ok(())
    }

    fn write_buffer(&mut self, buffer: &DeviceBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let record = self
            .buffers
            .get_mut(&buffer.handle)
            .ok_or_else(|| GpuError::invariant("write to unknown buffer"))?;
        if !record.host_visible {
            return Err(GpuError::InvalidState("Buffer not mapped".to_string()));
        }
        let start = usize::try_from(offset)
            .map_err(|_| GpuError::InvalidState("Offset overflow".to_string()))?;
        let end = start
            .checked_add(data.len())
            .filter(|end| *end <= record.data.len())
            .ok_or_else(|| GpuError::InvalidState("Data range too large for buffer".to_string()))?;
        record.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn allocate_descriptor_sets(
        &mut self,
        _class: FrequencyClass,
        count: u32,
    ) -> Result<Vec<vk::DescriptorSet>> {
        Ok((0..count).map(|_| self.handle()).collect())
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if !self.pending.is_empty() {
            return Err(GpuError::invariant("resize while submissions are pending"));
        }
        self.next_image = 0;
        self.events.push(HeadlessEvent::Resized { width, height });
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.complete_all();
        self.events.push(HeadlessEvent::IdleWait);
        Ok(())
    }
}

impl AccelerationDevice for HeadlessDevice {
    fn supports_acceleration_structures(&self) -> bool {
        self.acceleration_supported
    }

    fn acceleration_build_sizes(
        &self,
        geometry: &AccelerationGeometry,
        _flags: BuildFlags,
    ) -> Result<BuildSizes> {
        if !self.acceleration_supported {
            return Err(GpuError::MissingCapability(
                "acceleration structures".to_string(),
            ));
        }
        Ok(Self::simulated_sizes(geometry))
    }

    fn create_acceleration_structure(
        &mut self,
        kind: AccelerationKind,
        size: u64,
        name: &str,
    ) -> Result<AccelerationStructure> {
        if !self.acceleration_supported {
            return Err(GpuError::MissingCapability(
                "acceleration structures".to_string(),
            ));
        }
        let buffer = self.create_buffer(
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            name,
        )?;
        let structure = AccelerationStructure {
            handle: self.handle(),
            kind,
            buffer,
            size,
            device_address: buffer.device_address,
        };
        self.structures.insert(structure.handle, structure);
        self.events
            .push(HeadlessEvent::StructureCreated(structure.handle));
        Ok(structure)
    }

    fn destroy_acceleration_structure(&mut self, structure: AccelerationStructure) -> Result<()> {
        if self.structures.remove(&structure.handle).is_none() {
            return Err(GpuError::invariant(format!(
                "destroy of unknown acceleration structure {:?}",
                structure.handle
            )));
        }
        self.events
            .push(HeadlessEvent::StructureDestroyed(structure.handle));
        self.destroy_buffer(structure.buffer)
    }

    fn cmd_build_acceleration_structure(
        &mut self,
        cmd: vk::CommandBuffer,
        dst: &AccelerationStructure,
        geometry: &AccelerationGeometry,
        _flags: BuildFlags,
        scratch_address: u64,
    ) -> Result<()> {
        self.expect_recording(cmd)?;
        if !self.structures.contains_key(&dst.handle) {
            return Err(GpuError::invariant("build into unknown acceleration structure"));
        }
        if geometry.kind() != dst.kind {
            return Err(GpuError::invariant(format!(
                "{:?} geometry built into a {:?} structure",
                geometry.kind(),
                dst.kind
            )));
        }
        if Self::simulated_sizes(geometry).structure_size > dst.size {
            return Err(GpuError::invariant("acceleration structure too small for build"));
        }
        if scratch_address == 0 {
            return Err(GpuError::invariant("build without scratch memory"));
        }
        self.stats.builds += 1;
        self.events.push(HeadlessEvent::BuildRecorded {
            cmd,
            dst: dst.handle,
            scratch_address,
        });
        Ok(())
    }

    fn cmd_acceleration_build_barrier(&mut self, cmd: vk::CommandBuffer) {
        self.events.push(HeadlessEvent::BarrierRecorded(cmd));
    }

    fn create_compaction_query_pool(&mut self, count: u32) -> Result<vk::QueryPool> {
        let pool = self.handle();
        self.query_pools.insert(pool, vec![0; count as usize]);
        Ok(pool)
    }

    fn destroy_query_pool(&mut self, pool: vk::QueryPool) {
        self.query_pools.remove(&pool);
    }

    fn cmd_write_compacted_sizes(
        &mut self,
        _cmd: vk::CommandBuffer,
        structures: &[AccelerationStructure],
        pool: vk::QueryPool,
    ) {
        let percent = self.compaction_percent;
        if let Some(results) = self.query_pools.get_mut(&pool) {
            for (slot, structure) in results.iter_mut().zip(structures) {
                *slot = align_up(structure.size * percent / 100, SIZE_ALIGNMENT);
            }
        }
    }

    fn compacted_sizes(&mut self, pool: vk::QueryPool, count: u32) -> Result<Vec<u64>> {
        let results = self
            .query_pools
            .get(&pool)
            .ok_or_else(|| GpuError::invariant("read of unknown query pool"))?;
        Ok(results.iter().take(count as usize).copied().collect())
    }

    fn cmd_copy_compact(
        &mut self,
        _cmd: vk::CommandBuffer,
        src: &AccelerationStructure,
        dst: &AccelerationStructure,
    ) {
        self.stats.compactions += 1;
        self.events.push(HeadlessEvent::CompactCopied {
            src: src.handle,
            dst: dst.handle,
        });
    }
}
