//! Acceleration structure types shared by every backend.

use ash::vk;
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use kestrel_core::MeshRef;

use crate::device::DeviceBuffer;

/// Level of an acceleration structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccelerationKind {
    /// Triangles of a single mesh.
    BottomLevel,
    /// Instances of bottom-level structures.
    TopLevel,
}

bitflags! {
    /// Build flags, mirrored onto `vk::BuildAccelerationStructureFlagsKHR`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BuildFlags: u32 {
        const ALLOW_UPDATE = 1 << 0;
        const ALLOW_COMPACTION = 1 << 1;
        const PREFER_FAST_TRACE = 1 << 2;
        const PREFER_FAST_BUILD = 1 << 3;
    }
}

impl BuildFlags {
    /// Equivalent Vulkan flags.
    pub fn to_vk(self) -> vk::BuildAccelerationStructureFlagsKHR {
        let mut flags = vk::BuildAccelerationStructureFlagsKHR::empty();
        if self.contains(Self::ALLOW_UPDATE) {
            flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
        }
        if self.contains(Self::ALLOW_COMPACTION) {
            flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
        }
        if self.contains(Self::PREFER_FAST_TRACE) {
            flags |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
        }
        if self.contains(Self::PREFER_FAST_BUILD) {
            flags |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD;
        }
        flags
    }
}

/// Memory requirements reported for a build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuildSizes {
    /// Bytes for the structure itself.
    pub structure_size: u64,
    /// Bytes of scratch memory for a full build.
    pub scratch_size: u64,
}

/// Triangle geometry read from device addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_address: u64,
    pub vertex_stride: u64,
    pub max_vertex: u32,
    pub index_address: u64,
    pub triangle_count: u32,
    pub opaque: bool,
}

impl TriangleGeometry {
    /// Geometry for a whole mesh. Vertex positions are `R32G32B32_SFLOAT`.
    pub fn from_mesh(mesh: &MeshRef) -> Self {
        Self {
            vertex_address: mesh.vertex_address,
            vertex_stride: u64::from(mesh.vertex_stride),
            max_vertex: mesh.vertex_count.saturating_sub(1),
            index_address: mesh.index_address,
            triangle_count: mesh.triangle_count(),
            opaque: true,
        }
    }
}

/// Geometry of one build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccelerationGeometry {
    Triangles(TriangleGeometry),
    /// Tightly packed [`InstanceRecord`]s.
    Instances { address: u64, count: u32 },
}

impl AccelerationGeometry {
    /// Structure level this geometry builds.
    pub const fn kind(&self) -> AccelerationKind {
        match self {
            Self::Triangles(_) => AccelerationKind::BottomLevel,
            Self::Instances { .. } => AccelerationKind::TopLevel,
        }
    }

    /// Primitive count passed to the build range.
    pub const fn primitive_count(&self) -> u32 {
        match self {
            Self::Triangles(t) => t.triangle_count,
            Self::Instances { count, .. } => *count,
        }
    }
}

/// A created acceleration structure and its backing storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub kind: AccelerationKind,
    pub buffer: DeviceBuffer,
    pub size: u64,
    pub device_address: u64,
}

/// One entry of a top-level instance buffer (64 bytes).
///
/// Binary compatible with `VkAccelerationStructureInstanceKHR`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    /// Row-major 3x4 object to world transform.
    pub transform: [f32; 12],
    /// Custom index in the low 24 bits, visibility mask in the high 8.
    pub custom_index_and_mask: u32,
    /// Hit group offset in the low 24 bits, instance flags in the high 8.
    pub sbt_offset_and_flags: u32,
    /// Device address of the bottom-level structure.
    pub blas_address: u64,
}

impl InstanceRecord {
    /// Largest custom index that fits the packed field.
    pub const MAX_CUSTOM_INDEX: u32 = (1 << 24) - 1;

    /// Build a record with full visibility and back-face culling disabled.
    pub fn new(transform: [f32; 12], custom_index: u32, blas_address: u64) -> Self {
        let flags = vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8;
        Self {
            transform,
            custom_index_and_mask: (custom_index & Self::MAX_CUSTOM_INDEX) | (0xFF << 24),
            sbt_offset_and_flags: u32::from(flags) << 24,
            blas_address,
        }
    }

    /// Custom index stored in the record.
    pub const fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & Self::MAX_CUSTOM_INDEX
    }

    /// Visibility mask stored in the record.
    pub const fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_record_matches_vulkan_layout() {
        assert_eq!(
            std::mem::size_of::<InstanceRecord>(),
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()
        );
        assert_eq!(std::mem::size_of::<InstanceRecord>(), 64);
    }

    #[test]
    fn instance_record_packs_like_packed24_8() {
        let record = InstanceRecord::new([0.0; 12], 17, 0xdead_0000);
        let packed = vk::Packed24_8::new(17, 0xFF);
        assert_eq!(record.custom_index(), packed.low_24());
        assert_eq!(record.mask(), packed.high_8());
        assert_eq!(record.custom_index(), 17);
    }

    #[test]
    fn custom_index_is_truncated_to_24_bits() {
        let record = InstanceRecord::new([0.0; 12], 0x0100_0002, 0);
        assert_eq!(record.custom_index(), 2);
    }

    #[test]
    fn geometry_from_mesh() {
        let mesh = MeshRef {
            vertex_address: 0x100,
            vertex_count: 8,
            vertex_stride: 24,
            index_address: 0x200,
            index_count: 36,
            primitive_count: 1,
        };
        let geo = TriangleGeometry::from_mesh(&mesh);
        assert_eq!(geo.max_vertex, 7);
        assert_eq!(geo.triangle_count, 12);
        assert_eq!(AccelerationGeometry::Triangles(geo).primitive_count(), 12);
        assert_eq!(
            AccelerationGeometry::Triangles(geo).kind(),
            AccelerationKind::BottomLevel
        );
    }

    #[test]
    fn flags_map_to_vulkan() {
        let flags = (BuildFlags::ALLOW_COMPACTION | BuildFlags::PREFER_FAST_TRACE).to_vk();
        assert!(flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION));
        assert!(flags.contains(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE));
        assert!(!flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE));
    }
}
