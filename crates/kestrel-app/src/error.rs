//! Why an engine command was not applied.

use kestrel_gpu::GpuError;
use thiserror::Error;

/// Failure applying one [`crate::EngineCommand`].
///
/// Scene errors and rejections drop the single command and leave the
/// pipeline running. Every [`GpuError`] fails the tick.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Scene(#[from] kestrel_core::Error),

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error("{0}")]
    Rejected(String),
}

impl CommandError {
    /// Split off the error that must leave the tick.
    ///
    /// `Ok` holds a rejection the caller may log and skip.
    pub fn into_gpu(self) -> Result<Self, GpuError> {
        match self {
            Self::Gpu(e) => Err(e),
            other => Ok(other),
        }
    }
}
