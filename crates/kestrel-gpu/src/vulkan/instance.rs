//! Vulkan instance creation and physical device selection.

use std::ffi::{c_char, CStr, CString};

use ash::vk;

use crate::error::{GpuError, Result};

const ENGINE_NAME: &CStr = c"Kestrel";
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance extensions needed to present to a window on this platform.
pub fn surface_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

/// Create a Vulkan 1.3 instance.
///
/// A missing validation layer is logged and skipped rather than failing.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(ENGINE_NAME)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let extension_names: Vec<*const c_char> =
        surface_extensions().iter().map(|ext| ext.as_ptr()).collect();

    let mut layer_names: Vec<*const c_char> = Vec::new();
    if enable_validation {
        let available = unsafe { entry.enumerate_instance_layer_properties() }?;
        let found = available
            .iter()
            .any(|props| props.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
        if found {
            layer_names.push(VALIDATION_LAYER.as_ptr());
        } else {
            tracing::warn!(
                "Validation layer {} not available",
                VALIDATION_LAYER.to_string_lossy()
            );
        }
    }

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    Ok(unsafe { entry.create_instance(&create_info, None) }?)
}

/// Pick the highest scoring physical device.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    want_ray_tracing: bool,
) -> Result<vk::PhysicalDevice> {
    unsafe { instance.enumerate_physical_devices() }?
        .into_iter()
        .map(|device| {
            let score = unsafe { score_physical_device(instance, device, want_ray_tracing) };
            (score, device)
        })
        .filter(|(score, _)| *score > 0)
        .max_by_key(|(score, _)| *score)
        .map(|(_, device)| device)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Score a device; non-positive scores are unusable.
unsafe fn score_physical_device(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    want_ray_tracing: bool,
) -> i64 {
    let properties = unsafe { instance.get_physical_device_properties(device) };

    let api = properties.api_version;
    if vk::api_version_major(api) < 1
        || (vk::api_version_major(api) == 1 && vk::api_version_minor(api) < 3)
    {
        return -1;
    }

    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 1,
    };

    let memory = unsafe { instance.get_physical_device_memory_properties(device) };
    let vram_gb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size >> 30)
        .sum();
    score += i64::try_from(vram_gb).unwrap_or(0);

    if want_ray_tracing {
        let extensions =
            unsafe { instance.enumerate_device_extension_properties(device) }.unwrap_or_default();
        let has_as = extensions
            .iter()
            .any(|ext| ext.extension_name_as_c_str() == Ok(ash::khr::acceleration_structure::NAME));
        if has_as {
            score += 500;
        }
    }

    score
}
