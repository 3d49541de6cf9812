//! Synchronization primitives.

use ash::vk;

use crate::device::GpuDevice;
use crate::error::Result;

/// Frame synchronization resources.
#[derive(Clone, Copy, Debug)]
pub struct FrameSync {
    /// Semaphore signaled when image is available
    pub image_available: vk::Semaphore,
    /// Semaphore signaled when rendering is complete
    pub render_finished: vk::Semaphore,
    /// Fence to wait for frame completion
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// Create frame synchronization resources.
    ///
    /// The fence starts signaled so the first wait on a fresh slot returns
    /// immediately.
    pub fn new<D: GpuDevice + ?Sized>(device: &mut D) -> Result<Self> {
        Ok(Self {
            image_available: device.create_semaphore()?,
            render_finished: device.create_semaphore()?,
            in_flight: device.create_fence(true)?,
        })
    }

    /// Wait for this frame to be available.
    pub fn wait<D: GpuDevice + ?Sized>(&self, device: &mut D) -> Result<()> {
        device.wait_for_fence(self.in_flight)
    }

    /// Reset the fence for the next submission.
    pub fn reset<D: GpuDevice + ?Sized>(&self, device: &mut D) -> Result<()> {
        device.reset_fence(self.in_flight)
    }

    /// Whether the last submission using this slot has completed.
    pub fn is_complete<D: GpuDevice + ?Sized>(&self, device: &D) -> Result<bool> {
        device.fence_signaled(self.in_flight)
    }

    /// Destroy synchronization resources.
    ///
    /// The resources must not be in use.
    pub fn destroy<D: GpuDevice + ?Sized>(&self, device: &mut D) {
        device.destroy_semaphore(self.image_available);
        device.destroy_semaphore(self.render_finished);
        device.destroy_fence(self.in_flight);
    }
}
