//! Buffer memory management over gpu-allocator.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;

use crate::device::DeviceBuffer;
use crate::error::{GpuError, Result};

/// Owns every buffer allocation handed out as a [`DeviceBuffer`].
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
    allocations: HashMap<vk::Buffer, Allocation>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
            allocations: HashMap::new(),
        })
    }

    fn allocator_mut(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))
    }

    /// Create a buffer and bind fresh memory to it.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<DeviceBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocator_mut().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(|e| GpuError::AllocationFailed(format!("{name}: {e}")))
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }

        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
            unsafe { self.device.get_buffer_device_address(&info) }
        } else {
            0
        };

        self.allocations.insert(buffer, allocation);
        Ok(DeviceBuffer {
            handle: buffer,
            size,
            device_address,
        })
    }

    /// Destroy a buffer and free its memory.
    pub fn free_buffer(&mut self, buffer: DeviceBuffer) -> Result<()> {
        let allocation = self.allocations.remove(&buffer.handle).ok_or_else(|| {
            GpuError::InvalidState(format!("Buffer {:?} not owned by allocator", buffer.handle))
        })?;
        self.allocator_mut()?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        unsafe { self.device.destroy_buffer(buffer.handle, None) };
        Ok(())
    }

    /// Write raw bytes at `offset` into a host-visible buffer.
    pub fn write_bytes(&self, buffer: &DeviceBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .allocations
            .get(&buffer.handle)
            .and_then(Allocation::mapped_ptr)
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > buffer.size {
            return Err(GpuError::InvalidState(
                "Data range too large for buffer".to_string(),
            ));
        }
        let offset = usize::try_from(offset)
            .map_err(|_| GpuError::InvalidState("Offset overflow".to_string()))?;

        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                ptr.as_ptr().cast::<u8>().add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    /// Number of live buffers.
    pub fn live_buffers(&self) -> usize {
        self.allocations.len()
    }

    /// Free every remaining allocation and drop the allocator.
    ///
    /// Must run before the Vulkan device is destroyed. Leftover buffers are
    /// logged as leaks.
    pub fn shutdown(&mut self) {
        if !self.allocations.is_empty() {
            tracing::warn!("{} buffers leaked at shutdown", self.allocations.len());
        }
        let leaked: Vec<_> = self.allocations.drain().collect();
        if let Some(allocator) = self.allocator.as_mut() {
            for (buffer, allocation) in leaked {
                let _ = allocator.free(allocation);
                unsafe { self.device.destroy_buffer(buffer, None) };
            }
        }
        self.allocator = None;
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
