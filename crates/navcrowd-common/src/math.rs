//! Vector math on `[f32; 3]` positions
//!
//! Positions and velocities are passed around as plain arrays. The XZ plane is the ground
//! plane and Y points up.

use glam::Vec3;

/// Square a value (x²)
#[inline]
pub fn sqr<T: std::ops::Mul<Output = T> + Copy>(x: T) -> T {
    x * x
}

/// Linear interpolation between two scalars
#[inline]
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[inline]
pub fn vadd(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

#[inline]
pub fn vsub(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vscale(v: &[f32; 3], s: f32) -> [f32; 3] {
    [v[0] * s, v[1] * s, v[2] * s]
}

/// Returns `a + b * s`
#[inline]
pub fn vmad(a: &[f32; 3], b: &[f32; 3], s: f32) -> [f32; 3] {
    [a[0] + b[0] * s, a[1] + b[1] * s, a[2] + b[2] * s]
}

#[inline]
pub fn vlerp(a: &[f32; 3], b: &[f32; 3], t: f32) -> [f32; 3] {
    [lerp(a[0], b[0], t), lerp(a[1], b[1], t), lerp(a[2], b[2], t)]
}

#[inline]
pub fn vdot(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn vlen_sqr(v: &[f32; 3]) -> f32 {
    vdot(v, v)
}

#[inline]
pub fn vlen(v: &[f32; 3]) -> f32 {
    vlen_sqr(v).sqrt()
}

#[inline]
pub fn vdist_sqr(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    vlen_sqr(&vsub(b, a))
}

#[inline]
pub fn vdist(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    vdist_sqr(a, b).sqrt()
}

/// Length on the XZ plane
#[inline]
pub fn vlen_2d(v: &[f32; 3]) -> f32 {
    (v[0] * v[0] + v[2] * v[2]).sqrt()
}

#[inline]
pub fn vdot_2d(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    a[0] * b[0] + a[2] * b[2]
}

/// Returns the vector scaled to unit length. Zero vectors are returned unchanged.
#[inline]
pub fn vnormalize(v: &[f32; 3]) -> [f32; 3] {
    let len = vlen(v);
    if len > f32::EPSILON {
        vscale(v, 1.0 / len)
    } else {
        *v
    }
}

/// Normalizes on the XZ plane, dropping the Y component.
#[inline]
pub fn vnormalize_2d(v: &[f32; 3]) -> [f32; 3] {
    let len = vlen_2d(v);
    if len > f32::EPSILON {
        [v[0] / len, 0.0, v[2] / len]
    } else {
        [0.0, 0.0, 0.0]
    }
}

/// Rotates a vector around the Y axis on the XZ plane.
#[inline]
pub fn vrotate_2d(v: &[f32; 3], ang: f32) -> [f32; 3] {
    let (s, c) = ang.sin_cos();
    [v[0] * c - v[2] * s, v[1], v[0] * s + v[2] * c]
}

/// Returns true if the points are within 1/16384 of each other.
#[inline]
pub fn vequal(a: &[f32; 3], b: &[f32; 3]) -> bool {
    const THR: f32 = 1.0 / 16384.0;
    vdist_sqr(a, b) < THR * THR
}

#[inline]
pub fn vmin(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0].min(b[0]), a[1].min(b[1]), a[2].min(b[2])]
}

#[inline]
pub fn vmax(a: &[f32; 3], b: &[f32; 3]) -> [f32; 3] {
    [a[0].max(b[0]), a[1].max(b[1]), a[2].max(b[2])]
}

#[inline]
pub fn to_vec3(v: &[f32; 3]) -> Vec3 {
    Vec3::from_array(*v)
}

/// Height of the point `p` projected onto the triangle `abc` along Y.
///
/// Returns `None` if the point lies outside the triangle on the XZ plane.
pub fn closest_height_point_triangle(
    p: &[f32; 3],
    a: &[f32; 3],
    b: &[f32; 3],
    c: &[f32; 3],
) -> Option<f32> {
    const EPS: f32 = 1e-6;

    let (p, a, b, c) = (to_vec3(p), to_vec3(a), to_vec3(b), to_vec3(c));
    let v0 = c - a;
    let v1 = b - a;
    let v2 = p - a;

    // Barycentric coordinates on the XZ plane
    let mut denom = v0.x * v1.z - v0.z * v1.x;
    if denom.abs() < EPS {
        return None;
    }

    let mut u = v1.z * v2.x - v1.x * v2.z;
    let mut v = v0.x * v2.z - v0.z * v2.x;

    if denom < 0.0 {
        denom = -denom;
        u = -u;
        v = -v;
    }

    if u >= -EPS * denom && v >= -EPS * denom && (u + v) <= denom * (1.0 + EPS) {
        Some(a.y + (v0.y * u + v1.y * v) / denom)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_ops() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 6.0, 3.0];
        assert_eq!(vsub(&b, &a), [3.0, 4.0, 0.0]);
        assert_eq!(vdist(&a, &b), 5.0);
        assert_eq!(vmad(&a, &b, 0.5), [3.0, 5.0, 4.5]);
        assert_eq!(vlerp(&a, &b, 0.0), a);
        assert_eq!(vlerp(&a, &b, 1.0), b);
    }

    #[test]
    fn test_normalize_2d_drops_y() {
        let n = vnormalize_2d(&[3.0, 10.0, 4.0]);
        assert!((n[0] - 0.6).abs() < 1e-6);
        assert_eq!(n[1], 0.0);
        assert!((n[2] - 0.8).abs() < 1e-6);
        assert_eq!(vnormalize_2d(&[0.0, 1.0, 0.0]), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_rotate_2d_quarter_turn() {
        let r = vrotate_2d(&[1.0, 0.0, 0.0], std::f32::consts::FRAC_PI_2);
        assert!(r[0].abs() < 1e-6);
        assert!((r[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_closest_height_on_sloped_triangle() {
        let a = [0.0, 0.0, 0.0];
        let b = [0.0, 1.0, 1.0];
        let c = [1.0, 0.0, 0.0];
        let h = closest_height_point_triangle(&[0.25, 5.0, 0.5], &a, &b, &c);
        assert!(h.is_some_and(|h| (h - 0.5).abs() < 1e-5));
        assert!(closest_height_point_triangle(&[2.0, 0.0, 2.0], &a, &b, &c).is_none());
    }
}
