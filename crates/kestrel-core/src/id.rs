//! Object identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a drawable object.
///
/// Ids are assigned by the game layer and are stable for the lifetime of
/// the object. The renderer never invents ids on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Create an id from its raw value.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value of the id.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

impl From<u64> for ObjectId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_raw() {
        let id = ObjectId::new(42);
        assert_eq!(id.raw(), 42);
        assert_eq!(id.to_string(), "obj#42");
        assert_eq!(ObjectId::from(42), id);
    }

    #[test]
    fn ordering_follows_raw_value() {
        assert!(ObjectId(1) < ObjectId(2));
    }
}
