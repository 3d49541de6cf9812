//! Frame pipeline and application runner for the Kestrel frame core.
//!
//! This crate provides:
//! - [`FramePipeline`], the ring of frame slots that waits, records, submits
//!   and presents, and defers every deletion until the GPU is done with it
//! - [`CommandQueue`] / [`CommandSender`] for structural changes from any thread
//! - The [`Scene`] registry of live draw objects and their pool resources
//! - A winit runner for windowed [`KestrelApp`]s
//!
//! # Example
//!
//! ```no_run
//! use kestrel_app::{run_app, ClearRenderer, EngineConfig, KestrelApp};
//! use kestrel_gpu::VulkanDevice;
//!
//! struct Blank;
//!
//! impl KestrelApp for Blank {
//!     type Renderer = ClearRenderer;
//!
//!     fn init(
//!         _config: &EngineConfig,
//!         _device: &mut VulkanDevice,
//!     ) -> anyhow::Result<(Self, ClearRenderer)> {
//!         Ok((Blank, ClearRenderer::default()))
//!     }
//!
//!     fn update(&mut self, _dt: f32) {}
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<Blank>(EngineConfig::new("blank"))
//! }
//! ```

mod app;
pub mod command;
pub mod config;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod renderer;
mod runner;
pub mod scene;

pub use app::KestrelApp;
pub use command::{CommandQueue, CommandSender, EngineCommand};
pub use config::EngineConfig;
pub use error::CommandError;
pub use frame::{DrawItem, FrameContext, FrameSlot, SlotState};
pub use pipeline::{FramePipeline, TickStatus};
pub use renderer::{ClearRenderer, FrameRenderer};
pub use runner::run_app;
pub use scene::{Scene, SceneEntry, SlotResources};

pub use winit::event::WindowEvent;
