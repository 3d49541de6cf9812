//! Hardware ray tracing acceleration structures for the Kestrel frame core.
//!
//! Bottom-level structures are built per object when its geometry changes,
//! in scratch-budgeted batches with optional compaction. One top-level
//! structure over every live bottom-level structure is rebuilt each tick
//! inside the frame's command stream.

pub mod builder;
pub mod config;

pub use builder::{plan_batches, AccelerationStructureBuilder, BuildRequest, TopLevelInstance};
pub use config::AccelerationConfig;
