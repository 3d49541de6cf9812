//! Physical device capability detection.

use std::ffi::CStr;

use ash::vk;
use hashbrown::HashSet;

use crate::error::{GpuError, Result};

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Device extensions required to build and trace acceleration structures.
pub const RAY_TRACING_EXTENSIONS: [&CStr; 3] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::deferred_host_operations::NAME,
    ash::khr::ray_query::NAME,
];

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub api_version: u32,
    pub driver_version: u32,
    pub supports_synchronization2: bool,
    pub supports_buffer_device_address: bool,
    pub supports_acceleration_structures: bool,
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Required alignment of scratch buffer addresses for builds.
    pub min_scratch_alignment: u32,
    pub max_bound_descriptor_sets: u32,
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .unwrap_or_default();
        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                ext.extension_name_as_c_str()
                    .ok()
                    .and_then(|name| name.to_str().ok())
                    .map(String::from)
            })
            .collect();

        let supports_acceleration_structures = RAY_TRACING_EXTENSIONS.iter().all(|name| {
            name.to_str()
                .is_ok_and(|name| available_extensions.contains(name))
        });

        let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default();
        if supports_acceleration_structures {
            properties2 = properties2.push_next(&mut as_properties);
        }
        unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
        let properties = properties2.properties;

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let api_version = properties.api_version;
        let has_vulkan_1_3 = vk::api_version_major(api_version) >= 1
            && vk::api_version_minor(api_version) >= 3;

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name: properties
                .device_name_as_c_str()
                .map_or_else(|_| "unknown".to_string(), |name| name.to_string_lossy().into_owned()),
            api_version,
            driver_version: properties.driver_version,
            supports_synchronization2: has_vulkan_1_3,
            supports_buffer_device_address: has_vulkan_1_3
                || available_extensions.contains("VK_KHR_buffer_device_address"),
            supports_acceleration_structures,
            device_local_memory_mb,
            min_scratch_alignment: as_properties
                .min_acceleration_structure_scratch_offset_alignment
                .max(1),
            max_bound_descriptor_sets: properties.limits.max_bound_descriptor_sets,
            available_extensions,
        }
    }

    /// Check the baseline the frame core needs.
    pub fn meets_requirements(&self) -> bool {
        let major = vk::api_version_major(self.api_version);
        let minor = vk::api_version_minor(self.api_version);
        if major < 1 || (major == 1 && minor < 3) {
            return false;
        }
        // Low, per-object and per-primitive sets are bound together.
        self.supports_buffer_device_address
            && self.supports_synchronization2
            && self.max_bound_descriptor_sets >= 3
    }

    /// Fail with [`GpuError::MissingCapability`] unless ray tracing is usable.
    pub fn require_ray_tracing(&self) -> Result<()> {
        if self.supports_acceleration_structures {
            return Ok(());
        }
        let missing: Vec<String> = RAY_TRACING_EXTENSIONS
            .iter()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !self.available_extensions.contains(name))
            .collect();
        Err(GpuError::MissingCapability(missing.join(", ")))
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM{}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            if self.supports_acceleration_structures {
                " - ray tracing"
            } else {
                ""
            },
        )
    }
}
