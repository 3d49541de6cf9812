//! Seam between the frame pipeline and whatever records draw commands.

use kestrel_core::PipelineId;
use kestrel_gpu::{GpuDevice, Result, VulkanDevice};

use crate::frame::FrameContext;

/// Records one frame's draw commands for the pipeline.
///
/// Pipelines are created lazily, once per [`PipelineId`], the first time a
/// draw item needs them, and cached by the frame pipeline until shutdown.
pub trait FrameRenderer<D: GpuDevice> {
    type Pipeline;

    fn create_pipeline(&mut self, device: &mut D, id: PipelineId) -> Result<Self::Pipeline>;

    /// Record into `frame.command_buffer`, which is already begun.
    fn record(&mut self, device: &mut D, frame: &FrameContext<'_, Self::Pipeline>) -> Result<()>;

    /// Called at shutdown with the device idle.
    #[allow(unused_variables)]
    fn destroy_pipeline(&mut self, device: &mut D, pipeline: Self::Pipeline) {}
}

/// Clears the swapchain image to a solid color.
///
/// Stand-in until a real renderer is plugged in; it records no draws.
#[derive(Clone, Copy, Debug)]
pub struct ClearRenderer {
    pub color: [f32; 4],
}

impl Default for ClearRenderer {
    fn default() -> Self {
        Self {
            color: [0.05, 0.05, 0.08, 1.0],
        }
    }
}

impl FrameRenderer<VulkanDevice> for ClearRenderer {
    type Pipeline = ();

    fn create_pipeline(&mut self, _device: &mut VulkanDevice, id: PipelineId) -> Result<()> {
        tracing::debug!("Clear renderer ignores pipeline {:?}", id);
        Ok(())
    }

    fn record(&mut self, device: &mut VulkanDevice, frame: &FrameContext<'_, ()>) -> Result<()> {
        device.cmd_clear_swapchain_image(frame.command_buffer, frame.image_index, self.color)
    }
}
