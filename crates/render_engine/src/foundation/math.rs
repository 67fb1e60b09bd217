//! Math utilities and types
//!
//! Provides fundamental math types for 3D rendering.

pub use nalgebra::{Matrix3, Matrix4, Quaternion, Unit, Vector2, Vector3, Vector4};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 3x3 matrix type
pub type Mat3 = Matrix3<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// 3D point type
pub type Point3 = nalgebra::Point3<f32>;

/// Quaternion type for rotations
pub type Quat = Unit<Quaternion<f32>>;

/// Convert a matrix into the column-major array layout constant buffers use.
#[must_use]
pub fn to_columns(m: &Mat4) -> [[f32; 4]; 4] {
    (*m).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_columns_identity() {
        let cols = to_columns(&Mat4::identity());
        for (c, col) in cols.iter().enumerate() {
            for (r, v) in col.iter().enumerate() {
                assert_eq!(*v, if r == c { 1.0 } else { 0.0 });
            }
        }
    }
}
