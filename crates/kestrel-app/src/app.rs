//! `KestrelApp` trait definition.

use kestrel_gpu::VulkanDevice;
use winit::event::WindowEvent;

use crate::command::CommandSender;
use crate::config::EngineConfig;
use crate::renderer::FrameRenderer;

/// A windowed application driven by [`crate::run_app`].
///
/// The runner owns the window, the device and the frame pipeline. The
/// application talks to the pipeline only through the [`CommandSender`]
/// handed to [`KestrelApp::started`], which it may clone onto other threads.
pub trait KestrelApp: Sized {
    type Renderer: FrameRenderer<VulkanDevice>;

    /// Create the application and its renderer once the device exists.
    fn init(config: &EngineConfig, device: &mut VulkanDevice)
        -> anyhow::Result<(Self, Self::Renderer)>;

    /// The frame pipeline is running and accepts commands.
    #[allow(unused_variables)]
    fn started(&mut self, sender: CommandSender) {}

    /// Called every frame before the pipeline ticks.
    fn update(&mut self, dt: f32);

    /// Return `true` if the event was handled and should not be processed further.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Called after the swapchain was rebuilt for a new size.
    #[allow(unused_variables)]
    fn on_resize(&mut self, width: u32, height: u32) {}

    /// Called before the pipeline shuts down.
    fn cleanup(&mut self) {}
}
