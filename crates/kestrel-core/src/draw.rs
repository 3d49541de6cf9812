//! Draw-object feed types.
//!
//! The gameplay layer describes what should be drawn through these types.
//! The buffers they point at are owned by the asset layer; the frame core
//! only reads device addresses and counts from them.

use glam::Mat4;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::ObjectId;
use crate::pipeline_id::PipelineKind;

/// Reference to uploaded mesh geometry.
///
/// Vertex positions are expected as three `f32` at offset 0 of each vertex,
/// indices as `u32`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshRef {
    /// Device address of the first vertex.
    pub vertex_address: u64,
    /// Number of vertices.
    pub vertex_count: u32,
    /// Stride between vertices in bytes.
    pub vertex_stride: u32,
    /// Device address of the first index.
    pub index_address: u64,
    /// Number of indices (three per triangle).
    pub index_count: u32,
    /// Number of primitives (material groups) the mesh is split into.
    pub primitive_count: u32,
}

impl MeshRef {
    /// Number of triangles described by the index buffer.
    #[inline]
    pub const fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }

    /// Whether the mesh can be fed to an acceleration structure build.
    pub const fn is_traceable(&self) -> bool {
        self.vertex_address != 0
            && self.index_address != 0
            && self.vertex_count > 0
            && self.index_count >= 3
            && self.vertex_stride >= 12
    }
}

/// Opaque reference to a material owned by the material collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MaterialRef(pub u32);

/// One entry of the draw-object feed.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawObject {
    /// Stable object id.
    pub id: ObjectId,
    /// Geometry to draw.
    pub mesh: MeshRef,
    /// Materials, one per primitive.
    pub materials: Vec<MaterialRef>,
    /// Object to world transform.
    pub transform: Mat4,
    /// Whether the object is drawn this frame.
    pub visible: bool,
    /// Primary pipeline used to draw the object.
    pub kind: PipelineKind,
}

impl DrawObject {
    /// Create a visible object with an identity transform.
    pub fn new(id: ObjectId, mesh: MeshRef) -> Self {
        Self {
            id,
            mesh,
            materials: Vec::new(),
            transform: Mat4::IDENTITY,
            visible: true,
            kind: PipelineKind::Color,
        }
    }

    /// Set the transform.
    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    /// Set the materials.
    pub fn with_materials(mut self, materials: Vec<MaterialRef>) -> Self {
        self.materials = materials;
        self
    }

    /// Set the primary pipeline kind.
    pub fn with_kind(mut self, kind: PipelineKind) -> Self {
        self.kind = kind;
        self
    }

    /// Check that the object can be handed to the renderer.
    pub fn validate(&self) -> Result<()> {
        if !self.transform.is_finite() {
            return Err(Error::InvalidData(format!(
                "{} has a non-finite transform",
                self.id
            )));
        }
        if self.mesh.primitive_count > 0 && self.materials.len() > self.mesh.primitive_count as usize
        {
            return Err(Error::InvalidData(format!(
                "{} has {} materials for {} primitives",
                self.id,
                self.materials.len(),
                self.mesh.primitive_count
            )));
        }
        Ok(())
    }

    /// Number of per-primitive descriptor sets the object needs per frame.
    ///
    /// Every object has at least one primitive even if the mesh does not say so.
    pub fn primitive_count(&self) -> u32 {
        self.mesh
            .primitive_count
            .max(self.materials.len() as u32)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh() -> MeshRef {
        MeshRef {
            vertex_address: 0x1000,
            vertex_count: 24,
            vertex_stride: 32,
            index_address: 0x2000,
            index_count: 36,
            primitive_count: 0,
        }
    }

    #[test]
    fn triangle_count() {
        assert_eq!(mesh().triangle_count(), 12);
    }

    #[test]
    fn traceable_requires_addresses() {
        assert!(mesh().is_traceable());
        let mut m = mesh();
        m.index_address = 0;
        assert!(!m.is_traceable());
        let mut m = mesh();
        m.vertex_stride = 8;
        assert!(!m.is_traceable());
    }

    #[test]
    fn validate_rejects_nan_transform() {
        let obj = DrawObject::new(ObjectId(7), mesh()).with_transform(Mat4::from_cols_array(&[f32::NAN; 16]));
        assert!(matches!(obj.validate(), Err(Error::InvalidData(_))));
    }

    #[test]
    fn validate_rejects_extra_materials() {
        let mut m = mesh();
        m.primitive_count = 1;
        let obj = DrawObject::new(ObjectId(7), m).with_materials(vec![MaterialRef(0), MaterialRef(1)]);
        assert!(obj.validate().is_err());
        assert!(DrawObject::new(ObjectId(8), mesh()).validate().is_ok());
    }

    #[test]
    fn primitive_count_is_at_least_one() {
        let obj = DrawObject::new(ObjectId(1), mesh());
        assert_eq!(obj.primitive_count(), 1);

        let obj = obj.with_materials(vec![MaterialRef(0), MaterialRef(1), MaterialRef(2)]);
        assert_eq!(obj.primitive_count(), 3);
    }
}
