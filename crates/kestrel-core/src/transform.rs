//! Transform packing for GPU upload.

use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4};

/// Pack a column-major `Mat4` into the row-major 3x4 layout used by
/// acceleration structure instances. The projective row is dropped.
pub fn to_row_major_3x4(m: &Mat4) -> [f32; 12] {
    let r0 = m.row(0);
    let r1 = m.row(1);
    let r2 = m.row(2);
    [
        r0.x, r0.y, r0.z, r0.w, //
        r1.x, r1.y, r1.z, r1.w, //
        r2.x, r2.y, r2.z, r2.w,
    ]
}

/// Per-object data written into the transform arena every frame (144 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ObjectUniforms {
    /// Object to world matrix (column-major).
    pub model: [[f32; 4]; 4],
    /// Inverse-transpose of the upper 3x3, padded to 3 columns of vec4.
    pub normal: [[f32; 4]; 3],
    /// Flags: bit 0 = stenciled.
    pub flags: [u32; 4],
}

impl ObjectUniforms {
    /// Build uniforms from an object transform.
    ///
    /// A singular transform (zero scale on some axis) gets an identity
    /// normal matrix.
    pub fn new(model: &Mat4, stenciled: bool) -> Self {
        let linear = Mat3::from_mat4(*model);
        let det = linear.determinant();
        let normal = if det.is_finite() && det.abs() >= f32::MIN_POSITIVE {
            linear.inverse().transpose()
        } else {
            Mat3::IDENTITY
        };
        Self {
            model: model.to_cols_array_2d(),
            normal: [
                normal.x_axis.extend(0.0).to_array(),
                normal.y_axis.extend(0.0).to_array(),
                normal.z_axis.extend(0.0).to_array(),
            ],
            flags: [u32::from(stenciled), 0, 0, 0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec3;

    #[test]
    fn identity_packs_to_identity_rows() {
        let packed = to_row_major_3x4(&Mat4::IDENTITY);
        assert_eq!(
            packed,
            [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        );
    }

    #[test]
    fn translation_lands_in_last_column() {
        let m = Mat4::from_translation(Vec3::new(3.0, -2.0, 7.5));
        let packed = to_row_major_3x4(&m);
        assert_relative_eq!(packed[3], 3.0);
        assert_relative_eq!(packed[7], -2.0);
        assert_relative_eq!(packed[11], 7.5);
    }

    #[test]
    fn uniforms_size() {
        assert_eq!(std::mem::size_of::<ObjectUniforms>(), 144);
    }

    #[test]
    fn uniforms_flags() {
        let u = ObjectUniforms::new(&Mat4::IDENTITY, true);
        assert_eq!(u.flags[0], 1);
        assert_relative_eq!(u.normal[0][0], 1.0);
    }

    #[test]
    fn zero_scale_keeps_normals_finite() {
        let m = Mat4::from_scale(Vec3::ZERO);
        let u = ObjectUniforms::new(&m, false);
        assert!(u.normal.iter().flatten().all(|v| v.is_finite()));
        assert_relative_eq!(u.normal[1][1], 1.0);
    }

    #[test]
    fn non_uniform_scale_inverts_normals() {
        let m = Mat4::from_scale(Vec3::new(2.0, 4.0, 1.0));
        let u = ObjectUniforms::new(&m, false);
        assert_relative_eq!(u.normal[0][0], 0.5);
        assert_relative_eq!(u.normal[1][1], 0.25);
        assert_relative_eq!(u.normal[2][2], 1.0);
        assert_relative_eq!(u.normal[0][3], 0.0);
    }
}
