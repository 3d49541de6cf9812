//! Backend seam between the frame core and a GPU API.
//!
//! The frame core only ever talks to a device through [`GpuDevice`] and
//! [`AccelerationDevice`]. Handles are plain Vulkan handle types so the
//! Vulkan backend passes them straight through; other backends fabricate
//! them.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::acceleration::{
    AccelerationGeometry, AccelerationKind, AccelerationStructure, BuildFlags, BuildSizes,
};
use crate::error::Result;
use crate::pool::FrequencyClass;

/// A device buffer as seen by the frame core.
///
/// The owning device keeps the memory allocation; this is a copyable view
/// that must be handed back to [`GpuDevice::destroy_buffer`] exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceBuffer {
    pub handle: vk::Buffer,
    pub size: u64,
    /// Zero when the buffer was created without `SHADER_DEVICE_ADDRESS`.
    pub device_address: u64,
}

/// Device operations needed to drive frames.
pub trait GpuDevice {
    /// Number of presentable images. The frame ring has this many slots.
    fn image_count(&self) -> usize;

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence>;
    fn create_semaphore(&mut self) -> Result<vk::Semaphore>;
    fn destroy_fence(&mut self, fence: vk::Fence);
    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore);

    /// Block until `fence` is signaled. No timeout.
    fn wait_for_fence(&mut self, fence: vk::Fence) -> Result<()>;
    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()>;
    /// Non-blocking fence status.
    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool>;

    /// Allocate a resettable primary command buffer.
    fn allocate_command_buffer(&mut self) -> Result<vk::CommandBuffer>;
    fn free_command_buffer(&mut self, cmd: vk::CommandBuffer);
    /// Reset and begin recording.
    fn begin_command_buffer(&mut self, cmd: vk::CommandBuffer) -> Result<()>;
    fn end_command_buffer(&mut self, cmd: vk::CommandBuffer) -> Result<()>;

    /// Submit `cmd`, waiting on `wait` and signaling `signal` and `fence`.
    fn submit(
        &mut self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()>;

    /// Acquire the next presentable image, signaling `signal` when it is ready.
    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> Result<u32>;
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<()>;

    /// Begin a command buffer that will be submitted with
    /// [`GpuDevice::submit_one_time`].
    fn begin_one_time(&mut self) -> Result<vk::CommandBuffer>;
    /// End, submit and block until the queue is idle, then free `cmd`.
    fn submit_one_time(&mut self, cmd: vk::CommandBuffer) -> Result<()>;

    fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<DeviceBuffer>;
    fn destroy_buffer(&mut self, buffer: DeviceBuffer) -> Result<()>;
    /// Write into a host-visible buffer.
    fn write_buffer(&mut self, buffer: &DeviceBuffer, offset: u64, data: &[u8]) -> Result<()>;

    /// Allocate `count` descriptor sets with the layout of `class`.
    fn allocate_descriptor_sets(
        &mut self,
        class: FrequencyClass,
        count: u32,
    ) -> Result<Vec<vk::DescriptorSet>>;

    /// Rebuild presentation for a new surface size. The device must be idle.
    fn resize(&mut self, width: u32, height: u32) -> Result<()>;

    fn wait_idle(&mut self) -> Result<()>;
}

/// Ray tracing acceleration structure operations.
pub trait AccelerationDevice: GpuDevice {
    /// Whether acceleration structures can be built at all.
    fn supports_acceleration_structures(&self) -> bool;

    fn acceleration_build_sizes(
        &self,
        geometry: &AccelerationGeometry,
        flags: BuildFlags,
    ) -> Result<BuildSizes>;

    /// Create a structure of `size` bytes together with its backing buffer.
    fn create_acceleration_structure(
        &mut self,
        kind: AccelerationKind,
        size: u64,
        name: &str,
    ) -> Result<AccelerationStructure>;
    /// Destroy the structure and its backing buffer.
    fn destroy_acceleration_structure(&mut self, structure: AccelerationStructure) -> Result<()>;

    fn cmd_build_acceleration_structure(
        &mut self,
        cmd: vk::CommandBuffer,
        dst: &AccelerationStructure,
        geometry: &AccelerationGeometry,
        flags: BuildFlags,
        scratch_address: u64,
    ) -> Result<()>;

    /// Make prior build writes visible to following builds, copies and queries.
    fn cmd_acceleration_build_barrier(&mut self, cmd: vk::CommandBuffer);

    fn create_compaction_query_pool(&mut self, count: u32) -> Result<vk::QueryPool>;
    fn destroy_query_pool(&mut self, pool: vk::QueryPool);
    /// Reset the pool and write compacted sizes of `structures`, one query each.
    fn cmd_write_compacted_sizes(
        &mut self,
        cmd: vk::CommandBuffer,
        structures: &[AccelerationStructure],
        pool: vk::QueryPool,
    );
    /// Read back `count` compacted sizes after the writing submission completed.
    fn compacted_sizes(&mut self, pool: vk::QueryPool, count: u32) -> Result<Vec<u64>>;

    fn cmd_copy_compact(
        &mut self,
        cmd: vk::CommandBuffer,
        src: &AccelerationStructure,
        dst: &AccelerationStructure,
    );
}
