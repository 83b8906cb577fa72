//! 2D geometry operations on the XZ plane
//!
//! Polygons are wound so that `tri_area_2d` of consecutive vertices is positive
//! (clockwise when looking down the Y axis).

/// Calculate twice the signed area of a 2D triangle on the XZ plane.
///
/// The sign indicates the winding order:
/// - Positive: clockwise (when looking down Y axis)
/// - Negative: counter-clockwise (when looking down Y axis)
/// - Zero: degenerate (collinear points)
#[inline]
pub fn tri_area_2d(a: &[f32; 3], b: &[f32; 3], c: &[f32; 3]) -> f32 {
    let abx = b[0] - a[0];
    let abz = b[2] - a[2];
    let acx = c[0] - a[0];
    let acz = c[2] - a[2];
    acx * abz - abx * acz
}

/// 2D perp-dot product of `u` and `v` on the XZ plane
#[inline]
pub fn perp_2d(u: &[f32; 3], v: &[f32; 3]) -> f32 {
    u[2] * v[0] - u[0] * v[2]
}

#[inline]
pub fn dist_sqr_2d(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    let dx = b[0] - a[0];
    let dz = b[2] - a[2];
    dx * dx + dz * dz
}

#[inline]
pub fn dist_2d(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    dist_sqr_2d(a, b).sqrt()
}

/// Check if two 2D axis-aligned bounding boxes overlap (on XZ plane).
#[inline]
pub fn overlap_bounds_2d(amin: &[f32; 3], amax: &[f32; 3], bmin: &[f32; 3], bmax: &[f32; 3]) -> bool {
    amin[0] <= bmax[0] && amax[0] >= bmin[0] && amin[2] <= bmax[2] && amax[2] >= bmin[2]
}

/// Squared distance from a point to a segment on the XZ plane, along with the
/// parameter `t` of the closest point on the segment.
pub fn dist_point_segment_sqr_2d(p: &[f32; 3], a: &[f32; 3], b: &[f32; 3]) -> (f32, f32) {
    let pqx = b[0] - a[0];
    let pqz = b[2] - a[2];
    let dx = p[0] - a[0];
    let dz = p[2] - a[2];
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    let t = t.clamp(0.0, 1.0);

    let dx = a[0] + t * pqx - p[0];
    let dz = a[2] + t * pqz - p[2];
    (dx * dx + dz * dz, t)
}

/// Crossing-number point in polygon test on the XZ plane.
pub fn point_in_polygon_2d(pt: &[f32; 3], verts: &[[f32; 3]]) -> bool {
    let mut inside = false;
    let n = verts.len();
    let mut j = n.wrapping_sub(1);
    for i in 0..n {
        let vi = &verts[i];
        let vj = &verts[j];
        if ((vi[2] > pt[2]) != (vj[2] > pt[2]))
            && (pt[0] < (vj[0] - vi[0]) * (pt[2] - vi[2]) / (vj[2] - vi[2]) + vi[0])
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Distance from a point to each edge of a polygon.
///
/// Returns whether the point is inside the polygon, the squared distance to every
/// edge and the segment parameter of the closest point on that edge. Edge `j` runs
/// from vertex `j` to vertex `j + 1`.
pub fn distance_pt_poly_edges_sqr(pt: &[f32; 3], verts: &[[f32; 3]]) -> (bool, Vec<(f32, f32)>) {
    let n = verts.len();
    let edges = (0..n)
        .map(|j| dist_point_segment_sqr_2d(pt, &verts[j], &verts[(j + 1) % n]))
        .collect();
    (point_in_polygon_2d(pt, verts), edges)
}

/// Segment/convex polygon intersection on the XZ plane.
///
/// Returns `(tmin, tmax, seg_min, seg_max)` where `seg_min`/`seg_max` are the indices of
/// the edges through which the segment enters and leaves. `None` marks an endpoint that
/// lies inside the polygon.
pub fn intersect_segment_poly_2d(
    p0: &[f32; 3],
    p1: &[f32; 3],
    verts: &[[f32; 3]],
) -> Option<(f32, f32, Option<usize>, Option<usize>)> {
    const EPS: f32 = 0.000_000_01;

    let mut tmin = 0.0;
    let mut tmax = 1.0;
    let mut seg_min = None;
    let mut seg_max = None;

    let dir = [p1[0] - p0[0], 0.0, p1[2] - p0[2]];
    let n = verts.len();

    for i in 0..n {
        let j = if i == 0 { n - 1 } else { i - 1 };
        let edge = [verts[i][0] - verts[j][0], 0.0, verts[i][2] - verts[j][2]];
        let diff = [p0[0] - verts[j][0], 0.0, p0[2] - verts[j][2]];
        let num = perp_2d(&edge, &diff);
        let den = perp_2d(&dir, &edge);

        if den.abs() < EPS {
            // Parallel to the edge
            if num < 0.0 {
                return None;
            }
            continue;
        }

        let t = num / den;
        if den < 0.0 {
            if t > tmin {
                tmin = t;
                seg_min = Some(j);
                if tmin > tmax {
                    return None;
                }
            }
        } else if t < tmax {
            tmax = t;
            seg_max = Some(j);
            if tmax < tmin {
                return None;
            }
        }
    }

    Some((tmin, tmax, seg_min, seg_max))
}

/// Intersection of two segments on the XZ plane. Returns the parameters along `ap..aq`
/// and `bp..bq`.
pub fn intersect_segments_2d(
    ap: &[f32; 3],
    aq: &[f32; 3],
    bp: &[f32; 3],
    bq: &[f32; 3],
) -> Option<(f32, f32)> {
    let u = [aq[0] - ap[0], 0.0, aq[2] - ap[2]];
    let v = [bq[0] - bp[0], 0.0, bq[2] - bp[2]];
    let w = [ap[0] - bp[0], 0.0, ap[2] - bp[2]];
    let d = perp_2d(&u, &v);
    if d.abs() < 1e-6 {
        return None;
    }
    Some((perp_2d(&v, &w) / d, perp_2d(&u, &w) / d))
}

/// Signed area of a polygon outline on the XZ plane, positive for the library's winding.
pub fn poly_area_2d(verts: &[[f32; 3]]) -> f32 {
    let mut area = 0.0;
    for i in 2..verts.len() {
        area += tri_area_2d(&verts[0], &verts[i - 1], &verts[i]);
    }
    area * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<[f32; 3]> {
        vec![
            [0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 0.0, 1.0],
            [1.0, 0.0, 0.0],
        ]
    }

    #[test]
    fn test_square_winding_is_positive() {
        assert!(poly_area_2d(&square()) > 0.0);
        assert!((poly_area_2d(&square()) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_point_in_polygon() {
        assert!(point_in_polygon_2d(&[0.5, 0.0, 0.5], &square()));
        assert!(!point_in_polygon_2d(&[1.5, 0.0, 0.5], &square()));
    }

    #[test]
    fn test_segment_exits_through_right_edge() {
        let (tmin, tmax, seg_min, seg_max) =
            intersect_segment_poly_2d(&[0.5, 0.0, 0.5], &[2.5, 0.0, 0.5], &square()).unwrap();
        assert_eq!(tmin, 0.0);
        assert!((tmax - 0.25).abs() < 1e-6);
        assert_eq!(seg_min, None);
        // Edge 2 runs from (1,1) to (1,0)
        assert_eq!(seg_max, Some(2));
    }

    #[test]
    fn test_segment_inside_has_no_exit() {
        let hit = intersect_segment_poly_2d(&[0.2, 0.0, 0.2], &[0.8, 0.0, 0.8], &square()).unwrap();
        assert_eq!(hit.3, None);
    }

    #[test]
    fn test_dist_point_segment() {
        let (d, t) = dist_point_segment_sqr_2d(&[0.5, 3.0, 1.0], &[0.0, 0.0, 0.0], &[1.0, 0.0, 0.0]);
        assert!((d - 1.0).abs() < 1e-6);
        assert!((t - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_intersect_segments() {
        let (s, t) = intersect_segments_2d(
            &[0.0, 0.0, 0.0],
            &[2.0, 0.0, 0.0],
            &[1.0, 0.0, -1.0],
            &[1.0, 0.0, 1.0],
        )
        .unwrap();
        assert!((s - 0.5).abs() < 1e-6);
        assert!((t - 0.5).abs() < 1e-6);
    }
}
