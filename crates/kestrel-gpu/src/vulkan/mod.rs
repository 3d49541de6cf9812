//! Vulkan backend.

mod barrier;
mod capabilities;
mod context;
mod descriptors;
mod device;
mod instance;
mod memory;
mod surface;
mod swapchain;

pub use barrier::{image_transition, transition_scopes, BarrierScope};
pub use capabilities::{GpuCapabilities, GpuVendor, RAY_TRACING_EXTENSIONS};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{class_layout, pool_sizes, ClassDescriptors, DescriptorSetLayoutBuilder};
pub use device::VulkanDevice;
pub use instance::{create_instance, select_physical_device, surface_extensions};
pub use memory::GpuAllocator;
pub use surface::{SurfaceContext, SurfaceSupport};
pub use swapchain::{PresentStatus, Swapchain};
