//! Engine configuration.

use kestrel_gpu::PoolConfig;
use kestrel_rt::AccelerationConfig;
use serde::{Deserialize, Serialize};

/// Engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Per-frame-slot resource capacities.
    pub pool: PoolConfig,
    pub acceleration: AccelerationConfig,
    /// Build acceleration structures every tick.
    pub raytracing: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            title: "Kestrel".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: false,
            validation: cfg!(debug_assertions),
            pool: PoolConfig::default(),
            acceleration: AccelerationConfig::default(),
            raytracing: false,
        }
    }
}

impl EngineConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_acceleration(mut self, acceleration: AccelerationConfig) -> Self {
        self.acceleration = acceleration;
        self
    }

    pub fn with_raytracing(mut self, enabled: bool) -> Self {
        self.raytracing = enabled;
        self
    }
}
