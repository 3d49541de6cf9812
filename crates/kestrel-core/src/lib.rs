//! Core types for the Kestrel frame core.
//!
//! This crate provides:
//! - Object identifiers shared between the game layer and the renderer
//! - The draw-object feed (`DrawObject`, `MeshRef`, `MaterialRef`)
//! - Transform packing for GPU upload
//! - Pipeline identifiers and the pipeline cache table

pub mod draw;
pub mod error;
pub mod id;
pub mod pipeline_id;
pub mod transform;

pub use draw::{DrawObject, MaterialRef, MeshRef};
pub use error::{Error, Result};
pub use id::ObjectId;
pub use pipeline_id::{PipelineId, PipelineKind, PipelineModifier, PipelineTable};
pub use transform::{to_row_major_3x4, ObjectUniforms};
