//! GPU layer of the Kestrel frame core.
//!
//! This crate provides:
//! - The [`GpuDevice`] / [`AccelerationDevice`] backend seam
//! - A Vulkan backend over `ash` and `gpu-allocator`
//! - The fixed-capacity [`ResourcePool`] and its [`RegionAllocator`]
//! - Frame synchronization and deferred deletion
//! - A simulated headless device (`headless` feature)

pub mod acceleration;
pub mod deferred;
pub mod device;
pub mod error;
#[cfg(any(test, feature = "headless"))]
pub mod headless;
pub mod pool;
pub mod region;
pub mod sync;
pub mod vulkan;

pub use acceleration::{
    AccelerationGeometry, AccelerationKind, AccelerationStructure, BuildFlags, BuildSizes,
    InstanceRecord, TriangleGeometry,
};
pub use deferred::{DeferredDeletionQueue, PendingDeletion, Retired};
pub use device::{AccelerationDevice, DeviceBuffer, GpuDevice};
pub use error::{ErrorCategory, GpuError, Result};
#[cfg(any(test, feature = "headless"))]
pub use headless::{HeadlessDevice, HeadlessEvent, HeadlessStats};
pub use pool::{FrequencyClass, PoolConfig, PoolHandle, RegionHandle, ResourcePool};
pub use region::{align_up, checked_align_up, Region, RegionAllocator};
pub use sync::FrameSync;
pub use vulkan::{GpuCapabilities, GpuContext, GpuContextBuilder, VulkanDevice};

// Downstream crates name these in their own signatures.
pub use ash::vk;
pub use gpu_allocator::MemoryLocation;
