//! [`GpuDevice`] and [`AccelerationDevice`] over Vulkan.

use ash::vk;
use gpu_allocator::MemoryLocation;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use super::barrier::image_transition;
use super::context::GpuContext;
use super::descriptors::ClassDescriptors;
use super::surface::SurfaceContext;
use super::swapchain::{PresentStatus, Swapchain};
use crate::acceleration::{
    AccelerationGeometry, AccelerationKind, AccelerationStructure, BuildFlags, BuildSizes,
};
use crate::device::{AccelerationDevice, DeviceBuffer, GpuDevice};
use crate::error::{GpuError, Result};
use crate::pool::{FrequencyClass, PoolConfig};

/// A windowed Vulkan device driving one swapchain.
pub struct VulkanDevice {
    surface: SurfaceContext,
    swapchain: Swapchain,
    vsync: bool,
    command_pool: vk::CommandPool,
    descriptors: ClassDescriptors,
    as_loader: Option<ash::khr::acceleration_structure::Device>,
    /// Set when acquire or present reported the swapchain as stale.
    swapchain_stale: bool,
    // Dropped last; its Drop destroys the device.
    context: GpuContext,
}

impl VulkanDevice {
    /// Create the surface, swapchain and pools for `window`.
    ///
    /// Descriptor pools are sized for `pool` across every swapchain image.
    ///
    /// # Safety
    /// The window must outlive the device.
    pub unsafe fn new<W>(
        context: GpuContext,
        window: &W,
        width: u32,
        height: u32,
        vsync: bool,
        pool: &PoolConfig,
    ) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let surface = unsafe { SurfaceContext::from_window(&context, window) }?;
        let swapchain =
            match unsafe { Swapchain::new(&context, &surface, width, height, vsync, None) } {
                Ok(swapchain) => swapchain,
                Err(e) => {
                    unsafe { surface.destroy() };
                    return Err(e);
                }
            };

        let device = context.device();
        let release_surface = || unsafe {
            swapchain.destroy(device, &surface.swapchain_loader);
            surface.destroy();
        };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(context.queue_family())
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(command_pool) => command_pool,
            Err(e) => {
                release_surface();
                return Err(e.into());
            }
        };

        let descriptors = u32::try_from(swapchain.image_count())
            .map_err(|_| GpuError::SwapchainCreation("image count overflow".to_string()))
            .and_then(|frames| unsafe {
                ClassDescriptors::new(device, pool, frames, context.ray_tracing_enabled())
            });
        let descriptors = match descriptors {
            Ok(descriptors) => descriptors,
            Err(e) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                release_surface();
                return Err(e);
            }
        };

        let as_loader = context
            .ray_tracing_enabled()
            .then(|| ash::khr::acceleration_structure::Device::new(context.instance(), device));

        tracing::info!(
            "Vulkan device ready: {} swapchain images, ray tracing {}",
            swapchain.image_count(),
            if as_loader.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            surface,
            swapchain,
            vsync,
            command_pool,
            descriptors,
            as_loader,
            swapchain_stale: false,
            context,
        })
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn format(&self) -> vk::Format {
        self.swapchain.format
    }

    /// Whether the surface changed under the swapchain since the last resize.
    pub fn swapchain_stale(&self) -> bool {
        self.swapchain_stale
    }

    pub fn descriptor_set_layout(&self, class: FrequencyClass) -> vk::DescriptorSetLayout {
        self.descriptors.layout(class)
    }

    fn raw(&self) -> &ash::Device {
        self.context.device()
    }

    fn loader(&self) -> Result<&ash::khr::acceleration_structure::Device> {
        self.as_loader.as_ref().ok_or_else(|| {
            GpuError::MissingCapability("VK_KHR_acceleration_structure".to_string())
        })
    }

    /// Record a layout transition of swapchain image `image_index`.
    pub fn cmd_transition_swapchain_image(
        &self,
        cmd: vk::CommandBuffer,
        image_index: u32,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    ) -> Result<()> {
        let image = self.swapchain_image(image_index)?;
        let barrier = image_transition(image, from, to, vk::ImageAspectFlags::COLOR)?;
        let dependency_info =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.raw().cmd_pipeline_barrier2(cmd, &dependency_info) };
        Ok(())
    }

    /// Clear swapchain image `image_index` and leave it ready to present.
    pub fn cmd_clear_swapchain_image(
        &self,
        cmd: vk::CommandBuffer,
        image_index: u32,
        color: [f32; 4],
    ) -> Result<()> {
        self.cmd_transition_swapchain_image(
            cmd,
            image_index,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        let image = self.swapchain_image(image_index)?;
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .level_count(1)
            .layer_count(1);
        unsafe {
            self.raw().cmd_clear_color_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue { float32: color },
                std::slice::from_ref(&range),
            );
        }
        self.cmd_transition_swapchain_image(
            cmd,
            image_index,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
    }

    fn swapchain_image(&self, image_index: u32) -> Result<vk::Image> {
        self.swapchain
            .images
            .get(image_index as usize)
            .copied()
            .ok_or_else(|| GpuError::invariant(format!("no swapchain image {image_index}")))
    }

    fn allocate_primary(&self) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.raw().allocate_command_buffers(&alloc_info)? };
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::Other("driver returned no command buffer".to_string()))
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let device = self.context.device();
            let _ = device.device_wait_idle();
            self.descriptors.destroy(device);
            device.destroy_command_pool(self.command_pool, None);
            self.swapchain.destroy(device, &self.surface.swapchain_loader);
            self.surface.destroy();
        }
    }
}

/// Vulkan geometry description for `geometry`.
fn vk_geometry(geometry: &AccelerationGeometry) -> vk::AccelerationStructureGeometryKHR<'static> {
    match geometry {
        AccelerationGeometry::Triangles(triangles) => {
            let data = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: triangles.vertex_address,
                })
                .vertex_stride(triangles.vertex_stride)
                .max_vertex(triangles.max_vertex)
                .index_type(vk::IndexType::UINT32)
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: triangles.index_address,
                });
            let flags = if triangles.opaque {
                vk::GeometryFlagsKHR::OPAQUE
            } else {
                vk::GeometryFlagsKHR::empty()
            };
            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .flags(flags)
                .geometry(vk::AccelerationStructureGeometryDataKHR { triangles: data })
        }
        AccelerationGeometry::Instances { address, .. } => {
            let data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: *address,
                });
            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .flags(vk::GeometryFlagsKHR::OPAQUE)
                .geometry(vk::AccelerationStructureGeometryDataKHR { instances: data })
        }
    }
}

const fn vk_structure_type(kind: AccelerationKind) -> vk::AccelerationStructureTypeKHR {
    match kind {
        AccelerationKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelerationKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

impl GpuDevice for VulkanDevice {
    fn image_count(&self) -> usize {
        self.swapchain.image_count()
    }

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.raw().create_fence(&info, None)? })
    }

    fn create_semaphore(&mut self) -> Result<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.raw().create_semaphore(&info, None)? })
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        unsafe { self.raw().destroy_fence(fence, None) };
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        unsafe { self.raw().destroy_semaphore(semaphore, None) };
    }

    fn wait_for_fence(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe { self.raw().wait_for_fences(&[fence], true, u64::MAX)? };
        Ok(())
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe { self.raw().reset_fences(&[fence])? };
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        Ok(unsafe { self.raw().get_fence_status(fence)? })
    }

    fn allocate_command_buffer(&mut self) -> Result<vk::CommandBuffer> {
        self.allocate_primary()
    }

    fn free_command_buffer(&mut self, cmd: vk::CommandBuffer) {
        unsafe { self.raw().free_command_buffers(self.command_pool, &[cmd]) };
    }

    fn begin_command_buffer(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.raw()
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            self.raw().begin_command_buffer(cmd, &begin_info)?;
        }
        Ok(())
    }

    fn end_command_buffer(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.raw().end_command_buffer(cmd)? };
        Ok(())
    }

    fn submit(
        &mut self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_semaphores = [wait];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::TRANSFER];
        let command_buffers = [cmd];
        let signal_semaphores = [signal];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.raw()
                .queue_submit(self.context.queue(), &[submit_info], fence)
                .map_err(GpuError::SubmitFailed)
        }
    }

    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> Result<u32> {
        let (index, status) = unsafe {
            self.swapchain
                .acquire_next_image(&self.surface.swapchain_loader, signal)?
        };
        if status == PresentStatus::Suboptimal {
            self.swapchain_stale = true;
        }
        Ok(index)
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<()> {
        let status = unsafe {
            self.swapchain.present(
                &self.surface.swapchain_loader,
                self.context.queue(),
                image_index,
                wait,
            )?
        };
        if status == PresentStatus::Suboptimal {
            tracing::debug!("Swapchain suboptimal after present");
            self.swapchain_stale = true;
        }
        Ok(())
    }

    fn begin_one_time(&mut self) -> Result<vk::CommandBuffer> {
        let cmd = self.allocate_primary()?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(e) = unsafe { self.raw().begin_command_buffer(cmd, &begin_info) } {
            self.free_command_buffer(cmd);
            return Err(e.into());
        }
        Ok(cmd)
    }

    fn submit_one_time(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        let result = unsafe {
            self.raw().end_command_buffer(cmd).map_err(GpuError::from).and_then(|()| {
                let command_buffers = [cmd];
                let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
                self.raw()
                    .queue_submit(self.context.queue(), &[submit_info], vk::Fence::null())
                    .map_err(GpuError::SubmitFailed)?;
                self.raw().queue_wait_idle(self.context.queue())?;
                Ok(())
            })
        };
        self.free_command_buffer(cmd);
        result
    }

    fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<DeviceBuffer> {
        self.context
            .allocator()
            .lock()
            .create_buffer(size, usage, location, name)
    }

    fn destroy_buffer(&mut self, buffer: DeviceBuffer) -> Result<()> {
        self.context.allocator().lock().free_buffer(buffer)
    }

    fn write_buffer(&mut self, buffer: &DeviceBuffer, offset: u64, data: &[u8]) -> Result<()> {
        self.context.allocator().lock().write_bytes(buffer, offset, data)
    }

    fn allocate_descriptor_sets(
        &mut self,
        class: FrequencyClass,
        count: u32,
    ) -> Result<Vec<vk::DescriptorSet>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        unsafe { self.descriptors.allocate(self.context.device(), class, count) }
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        let previous = self.swapchain.image_count();
        let swapchain = unsafe {
            Swapchain::new(
                &self.context,
                &self.surface,
                width,
                height,
                self.vsync,
                Some(self.swapchain.swapchain),
            )?
        };
        let old = std::mem::replace(&mut self.swapchain, swapchain);
        unsafe { old.destroy(self.context.device(), &self.surface.swapchain_loader) };
        self.swapchain_stale = false;

        if self.swapchain.image_count() != previous {
            return Err(GpuError::invariant(format!(
                "swapchain image count changed from {previous} to {}",
                self.swapchain.image_count()
            )));
        }
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.context.wait_idle()
    }
}

impl AccelerationDevice for VulkanDevice {
    fn supports_acceleration_structures(&self) -> bool {
        self.as_loader.is_some()
    }

    fn acceleration_build_sizes(
        &self,
        geometry: &AccelerationGeometry,
        flags: BuildFlags,
    ) -> Result<BuildSizes> {
        let loader = self.loader()?;
        let vk_geo = vk_geometry(geometry);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk_structure_type(geometry.kind()))
            .flags(flags.to_vk())
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&vk_geo));

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[geometry.primitive_count()],
                &mut sizes,
            );
        }

        let alignment = u64::from(self.context.capabilities().min_scratch_alignment.max(1));
        Ok(BuildSizes {
            structure_size: sizes.acceleration_structure_size,
            // Room to align the scratch address inside its buffer.
            scratch_size: sizes.build_scratch_size + alignment,
        })
    }

    fn create_acceleration_structure(
        &mut self,
        kind: AccelerationKind,
        size: u64,
        name: &str,
    ) -> Result<AccelerationStructure> {
        self.loader()?;
        let buffer = self.create_buffer(
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            name,
        )?;

        let loader = self.loader()?;
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.handle)
            .size(size)
            .ty(vk_structure_type(kind));
        let handle = match unsafe { loader.create_acceleration_structure(&create_info, None) } {
            Ok(handle) => handle,
            Err(e) => {
                self.destroy_buffer(buffer)?;
                return Err(e.into());
            }
        };

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        let device_address = unsafe { loader.get_acceleration_structure_device_address(&address_info) };

        Ok(AccelerationStructure {
            handle,
            kind,
            buffer,
            size,
            device_address,
        })
    }

    fn destroy_acceleration_structure(&mut self, structure: AccelerationStructure) -> Result<()> {
        unsafe {
            self.loader()?
                .destroy_acceleration_structure(structure.handle, None);
        }
        self.destroy_buffer(structure.buffer)
    }

    fn cmd_build_acceleration_structure(
        &mut self,
        cmd: vk::CommandBuffer,
        dst: &AccelerationStructure,
        geometry: &AccelerationGeometry,
        flags: BuildFlags,
        scratch_address: u64,
    ) -> Result<()> {
        let loader = self.loader()?;
        let alignment = u64::from(self.context.capabilities().min_scratch_alignment.max(1));
        let vk_geo = vk_geometry(geometry);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk_structure_type(dst.kind))
            .flags(flags.to_vk())
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(dst.handle)
            .geometries(std::slice::from_ref(&vk_geo))
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address.next_multiple_of(alignment),
            });
        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(geometry.primitive_count());

        unsafe {
            loader.cmd_build_acceleration_structures(
                cmd,
                std::slice::from_ref(&build_info),
                &[std::slice::from_ref(&build_range)],
            );
        }
        Ok(())
    }

    fn cmd_acceleration_build_barrier(&mut self, cmd: vk::CommandBuffer) {
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
                    | vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_COPY_KHR,
            )
            .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_stage_mask(
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
                    | vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_COPY_KHR,
            )
            .dst_access_mask(
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
                    | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
            );
        let dependency_info =
            vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
        unsafe { self.raw().cmd_pipeline_barrier2(cmd, &dependency_info) };
    }

    fn create_compaction_query_pool(&mut self, count: u32) -> Result<vk::QueryPool> {
        self.loader()?;
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(count);
        Ok(unsafe { self.raw().create_query_pool(&info, None)? })
    }

    fn destroy_query_pool(&mut self, pool: vk::QueryPool) {
        unsafe { self.raw().destroy_query_pool(pool, None) };
    }

    fn cmd_write_compacted_sizes(
        &mut self,
        cmd: vk::CommandBuffer,
        structures: &[AccelerationStructure],
        pool: vk::QueryPool,
    ) {
        let Some(loader) = self.as_loader.as_ref() else {
            return;
        };
        let handles: Vec<_> = structures.iter().map(|s| s.handle).collect();
        let count = u32::try_from(handles.len()).unwrap_or(u32::MAX);
        unsafe {
            self.context.device().cmd_reset_query_pool(cmd, pool, 0, count);
            loader.cmd_write_acceleration_structures_properties(
                cmd,
                &handles,
                vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                pool,
                0,
            );
        }
    }

    fn compacted_sizes(&mut self, pool: vk::QueryPool, count: u32) -> Result<Vec<u64>> {
        let mut sizes = vec![0u64; count as usize];
        unsafe {
            self.raw().get_query_pool_results(
                pool,
                0,
                &mut sizes,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )?;
        }
        Ok(sizes)
    }

    fn cmd_copy_compact(
        &mut self,
        cmd: vk::CommandBuffer,
        src: &AccelerationStructure,
        dst: &AccelerationStructure,
    ) {
        let Some(loader) = self.as_loader.as_ref() else {
            return;
        };
        let info = vk::CopyAccelerationStructureInfoKHR::default()
            .src(src.handle)
            .dst(dst.handle)
            .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);
        unsafe { loader.cmd_copy_acceleration_structure(cmd, &info) };
    }
}
