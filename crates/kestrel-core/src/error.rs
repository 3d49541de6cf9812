//! Error types shared by the Kestrel crates.

use thiserror::Error;

use crate::id::ObjectId;

/// Core error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid data error
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Object id not present in the scene
    #[error("Unknown object: {0}")]
    UnknownObject(ObjectId),

    /// Object id already in use
    #[error("Object already exists: {0}")]
    DuplicateObject(ObjectId),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
