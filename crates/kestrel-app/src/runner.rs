//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kestrel_gpu::{GpuContextBuilder, VulkanDevice};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::KestrelApp;
use crate::config::EngineConfig;
use crate::pipeline::{FramePipeline, TickStatus};

/// Run a [`KestrelApp`] until its window closes, it requests shutdown, or a
/// frame fails.
///
/// Initializes logging from `RUST_LOG` (default `info`).
pub fn run_app<A: KestrelApp + 'static>(config: EngineConfig) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        failure: None,
    };
    event_loop.run_app(&mut runner)?;

    match runner.failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct AppRunner<A: KestrelApp> {
    config: EngineConfig,
    state: Option<AppState<A>>,
    failure: Option<anyhow::Error>,
}

struct AppState<A: KestrelApp> {
    // Declared before the window: the surface must go first.
    pipeline: Option<FramePipeline<VulkanDevice, A::Renderer>>,
    window: Arc<Window>,
    app: A,
    target_frame_time: Option<Duration>,
    last_frame_time: Instant,
    frames: u64,
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: KestrelApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.failure = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.stop(event_loop, None);
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                match state.render_frame() {
                    Ok(TickStatus::Presented) => state.window.request_redraw(),
                    Ok(TickStatus::ShutdownRequested) => self.stop(event_loop, None),
                    Err(e) => {
                        error!("Render error: {e:#}");
                        self.stop(event_loop, Some(e));
                    }
                }
            }
            WindowEvent::Resized(size) => {
                let Some(state) = &mut self.state else {
                    return;
                };
                if let Err(e) = state.handle_resize(size.width, size.height) {
                    error!("Resize error: {e:#}");
                    self.stop(event_loop, Some(e));
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}

impl<A: KestrelApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let gpu = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .ray_tracing(self.config.raytracing)
            .build()?;
        info!("GPU: {}", gpu.capabilities().summary());

        let size = window.inner_size();
        let mut device = unsafe {
            VulkanDevice::new(
                gpu,
                window.as_ref(),
                size.width,
                size.height,
                self.config.vsync,
                &self.config.pool,
            )?
        };

        let (mut app, renderer) = A::init(&self.config, &mut device)?;
        let pipeline = FramePipeline::new(device, renderer, &self.config)?;
        app.started(pipeline.sender());

        let target_frame_time = self
            .config
            .target_fps
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps.max(1))));

        Ok(AppState {
            pipeline: Some(pipeline),
            window,
            app,
            target_frame_time,
            last_frame_time: Instant::now(),
            frames: 0,
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        })
    }

    fn stop(&mut self, event_loop: &ActiveEventLoop, failure: Option<anyhow::Error>) {
        if let Some(mut state) = self.state.take() {
            state.cleanup();
        }
        if failure.is_some() {
            self.failure = failure;
        }
        event_loop.exit();
    }
}

impl<A: KestrelApp> AppState<A> {
    fn pipeline(&mut self) -> anyhow::Result<&mut FramePipeline<VulkanDevice, A::Renderer>> {
        self.pipeline
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("frame pipeline already shut down"))
    }

    fn render_frame(&mut self) -> anyhow::Result<TickStatus> {
        let frame_start = Instant::now();

        let dt = frame_start
            .duration_since(self.last_frame_time)
            .as_secs_f32();
        self.last_frame_time = frame_start;
        if dt > 0.0 {
            let fps = 1.0 / f64::from(dt);
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
        }

        self.app.update(dt);

        let size = self.window.inner_size();
        let pipeline = self.pipeline()?;
        if pipeline.device().swapchain_stale() {
            pipeline.handle_resize(size.width, size.height)?;
        }
        let status = pipeline.tick()?;
        if status == TickStatus::Presented {
            self.frames += 1;
        }

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }

        Ok(status)
    }

    fn handle_resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.pipeline()?.handle_resize(width, height)?;
        self.app.on_resize(width, height);
        Ok(())
    }

    fn cleanup(&mut self) {
        if self.frames > 0 {
            let avg_fps = self.fps_sum / self.frames as f64;
            info!("FPS Statistics:");
            info!("  Min: {:.1}", self.min_fps);
            info!("  Max: {:.1}", self.max_fps);
            info!("  Avg: {:.1}", avg_fps);
            info!("  Total frames: {}", self.frames);
        }

        info!("Starting cleanup...");
        self.app.cleanup();
        if let Some(pipeline) = self.pipeline.take() {
            match pipeline.shutdown() {
                // Dropping the device destroys the swapchain, surface and context.
                Ok(device) => drop(device),
                Err(e) => error!("Failed to shut down frame pipeline: {e}"),
            }
        }
        info!("Cleanup complete");
    }
}
