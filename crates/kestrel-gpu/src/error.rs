//! GPU error types.

use ash::vk;
use thiserror::Error;

use crate::pool::FrequencyClass;

/// Broad classification of a [`GpuError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Fixed misconfiguration detected at the call site.
    Configuration,
    /// Driver or device failure.
    Device,
    /// Broken internal invariant. Indicates a bug in the frame core.
    Invariant,
}

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required device capability is absent.
    #[error("Missing device capability: {0}")]
    MissingCapability(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// A fixed-capacity free list cannot satisfy a request.
    #[error(
        "{class:?} pool exhausted for frame slot {frame}: requested {requested}, available {available}"
    )]
    PoolExhausted {
        class: FrequencyClass,
        frame: usize,
        requested: usize,
        available: usize,
    },

    /// A single build needs more scratch memory than one batch may use.
    #[error("Acceleration structure scratch of {required} bytes exceeds budget of {budget} bytes")]
    ScratchBudgetExceeded { required: u64, budget: u64 },

    /// A build batch mixes compacted and non-compacted requests.
    #[error("Build batch mixes compacted and non-compacted requests")]
    MixedCompaction,

    /// Image layout transition that has no known barrier.
    #[error("Unsupported layout transition: {from:?} -> {to:?}")]
    UnsupportedTransition {
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },

    /// Queue submission failed.
    #[error("Queue submission failed: {0}")]
    SubmitFailed(vk::Result),

    /// Presentation failed.
    #[error("Presentation failed: {0}")]
    PresentFailed(vk::Result),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Internal invariant does not hold.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Classify the error.
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::NoSuitableDevice
            | Self::MissingCapability(_)
            | Self::PoolExhausted { .. }
            | Self::ScratchBudgetExceeded { .. }
            | Self::MixedCompaction
            | Self::UnsupportedTransition { .. }
            | Self::PipelineCreation(_) => ErrorCategory::Configuration,
            Self::InvalidState(_) | Self::InvariantViolation(_) => ErrorCategory::Invariant,
            Self::Vulkan(_)
            | Self::AllocationFailed(_)
            | Self::SurfaceCreation(_)
            | Self::SwapchainCreation(_)
            | Self::SubmitFailed(_)
            | Self::PresentFailed(_)
            | Self::Other(_) => ErrorCategory::Device,
        }
    }

    /// Whether CPU/GPU synchronization state can no longer be trusted.
    ///
    /// Fatal errors must go straight to teardown without recording or
    /// submitting anything else.
    pub const fn is_fatal(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Configuration)
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_is_configuration() {
        let err = GpuError::PoolExhausted {
            class: FrequencyClass::PerObject,
            frame: 0,
            requested: 1001,
            available: 1000,
        };
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("requested 1001"));
    }

    #[test]
    fn submit_and_invariant_errors_are_fatal() {
        assert!(GpuError::SubmitFailed(vk::Result::ERROR_DEVICE_LOST).is_fatal());
        assert!(GpuError::invariant("image index mismatch").is_fatal());
        assert_eq!(
            GpuError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).category(),
            ErrorCategory::Device
        );
    }
}
