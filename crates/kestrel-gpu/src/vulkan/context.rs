//! Instance, logical device and allocator ownership.

use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::capabilities::{GpuCapabilities, RAY_TRACING_EXTENSIONS};
use super::instance::{create_instance, select_physical_device};
use super::memory::GpuAllocator;
use crate::error::{GpuError, Result};

/// Main GPU context holding Vulkan resources.
///
/// Every submission goes through the single graphics queue, so GPU work
/// completes in submission order.
pub struct GpuContext {
    // Keeps the loader alive for the lifetime of the context.
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Mutex<GpuAllocator>,
    pub(crate) queue_family: u32,
    pub(crate) queue: vk::Queue,
    pub(crate) ray_tracing: bool,
}

impl GpuContext {
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Whether the acceleration structure extensions were enabled.
    pub fn ray_tracing_enabled(&self) -> bool {
        self.ray_tracing
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            // Allocator memory must go before the device.
            self.allocator.lock().shutdown();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    ray_tracing: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Kestrel".to_string(),
            enable_validation: cfg!(debug_assertions),
            ray_tracing: false,
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Request acceleration structure support.
    ///
    /// When the selected device lacks it, the context is still created and
    /// [`GpuContext::ray_tracing_enabled`] reports `false`.
    pub fn ray_tracing(mut self, enable: bool) -> Self {
        self.ray_tracing = enable;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;
        let physical_device = unsafe { select_physical_device(&instance, self.ray_tracing) }?;
        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };

        if !capabilities.meets_requirements() {
            return Err(GpuError::NoSuitableDevice);
        }
        tracing::info!("Selected GPU: {}", capabilities.summary());

        let ray_tracing = if self.ray_tracing {
            match capabilities.require_ray_tracing() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Ray tracing unavailable: {e}");
                    false
                }
            }
        } else {
            false
        };

        let queue_family = unsafe { find_graphics_queue_family(&instance, physical_device) }?;
        let device = unsafe { create_device(&instance, physical_device, queue_family, ray_tracing)? };
        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let device = Arc::new(device);

        let allocator = unsafe { GpuAllocator::new(&instance, device.clone(), physical_device) }?;

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            allocator: Mutex::new(allocator),
            queue_family,
            queue,
            ray_tracing,
        })
    }
}

/// First queue family with graphics support.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    unsafe { instance.get_physical_device_queue_family_properties(physical_device) }
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .and_then(|i| u32::try_from(i).ok())
        .ok_or(GpuError::NoSuitableDevice)
}

/// Create the logical device with the Vulkan 1.2/1.3 feature chain.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    ray_tracing: bool,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority));

    let mut extensions: Vec<&CStr> = vec![ash::khr::swapchain::NAME];
    if ray_tracing {
        extensions.extend(RAY_TRACING_EXTENSIONS);
    }
    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true)
        .maintenance4(true);
    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .descriptor_indexing(true)
        .scalar_block_layout(true)
        .runtime_descriptor_array(true);
    let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
        .acceleration_structure(true);
    let mut ray_query_features = vk::PhysicalDeviceRayQueryFeaturesKHR::default().ray_query(true);

    let features = vk::PhysicalDeviceFeatures::default()
        .shader_int64(true)
        .fill_mode_non_solid(true);
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);
    if ray_tracing {
        features2 = features2
            .push_next(&mut as_features)
            .push_next(&mut ray_query_features);
    }

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_info))
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    Ok(unsafe { instance.create_device(physical_device, &create_info, None) }?)
}
