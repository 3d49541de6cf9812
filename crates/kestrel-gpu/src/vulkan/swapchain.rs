//! Swapchain management.

use ash::vk;

use super::context::GpuContext;
use super::surface::{
    calculate_extent, desired_image_count, select_present_mode, select_surface_format,
    SurfaceContext,
};
use crate::error::{GpuError, Result};

/// Outcome of an acquire or present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    /// The image was used but the swapchain should be recreated.
    Suboptimal,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain, retiring `old` if given.
    ///
    /// # Safety
    /// `old` must not be in use by the GPU.
    pub unsafe fn new(
        gpu: &GpuContext,
        surface: &SurfaceContext,
        width: u32,
        height: u32,
        vsync: bool,
        old: Option<vk::SwapchainKHR>,
    ) -> Result<Self> {
        let support = surface.support(gpu)?;
        let surface_format = select_surface_format(&support.formats)?;
        let present_mode = select_present_mode(&support.present_modes, vsync);
        let extent = calculate_extent(&support.capabilities, width, height);

        let queue_families = [gpu.queue_family()];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.surface)
            .min_image_count(desired_image_count(&support.capabilities))
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.unwrap_or_default());

        let loader = &surface.swapchain_loader;
        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;
        let images = match unsafe { loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(e.into());
            }
        };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1),
                );
            match unsafe { gpu.device().create_image_view(&view_info, None) } {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    unsafe {
                        for view in image_views {
                            gpu.device().destroy_image_view(view, None);
                        }
                        loader.destroy_swapchain(swapchain, None);
                    }
                    return Err(e.into());
                }
            }
        }

        tracing::debug!(
            "Swapchain {}x{} with {} images ({:?})",
            extent.width,
            extent.height,
            images.len(),
            present_mode
        );

        Ok(Self {
            swapchain,
            images,
            image_views,
            format: surface_format.format,
            extent,
        })
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire the next image, signaling `semaphore`.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn acquire_next_image(
        &self,
        loader: &ash::khr::swapchain::Device,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, PresentStatus)> {
        // OUT_OF_DATE acquires nothing and comes back as an error.
        let (index, suboptimal) = unsafe {
            loader.acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        }?;
        Ok((index, status(suboptimal)))
    }

    /// Present `image_index` once `wait` is signaled.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn present(
        &self,
        loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentStatus> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => Ok(status(suboptimal)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::Suboptimal),
            Err(e) => Err(GpuError::PresentFailed(e)),
        }
    }

    /// Destroy the views and the swapchain.
    ///
    /// # Safety
    /// The swapchain must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device, loader: &ash::khr::swapchain::Device) {
        unsafe {
            for &view in &self.image_views {
                device.destroy_image_view(view, None);
            }
            loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

const fn status(suboptimal: bool) -> PresentStatus {
    if suboptimal {
        PresentStatus::Suboptimal
    } else {
        PresentStatus::Optimal
    }
}
