//! Cached wall segments around an agent

use navcrowd_common::{dist_point_segment_sqr_2d, sqr, Result};
use navcrowd_mesh::{NavMeshQuery, PolyRef, QueryFilter};

const MAX_LOCAL_SEGS: usize = 8;
const MAX_LOCAL_POLYS: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Segment {
    /// Segment start and end as `[ax, ay, az, bx, by, bz]`
    s: [f32; 6],
    /// Squared distance from the update centre, used for pruning
    d: f32,
}

/// Nearby navmesh walls, refreshed when the agent moves away from the last update centre.
#[derive(Debug, Clone)]
pub struct LocalBoundary {
    center: [f32; 3],
    segs: Vec<Segment>,
    polys: Vec<PolyRef>,
}

impl Default for LocalBoundary {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBoundary {
    pub fn new() -> Self {
        Self {
            center: [f32::MAX; 3],
            segs: Vec::with_capacity(MAX_LOCAL_SEGS),
            polys: Vec::with_capacity(MAX_LOCAL_POLYS),
        }
    }

    pub fn reset(&mut self) {
        self.center = [f32::MAX; 3];
        self.segs.clear();
        self.polys.clear();
    }

    /// Collects the walls of the polygons around `pos` that lie within
    /// `collision_query_range`. The closest segments are kept.
    pub fn update(
        &mut self,
        poly_ref: PolyRef,
        pos: &[f32; 3],
        collision_query_range: f32,
        nav_query: &NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<()> {
        if !poly_ref.is_valid() {
            self.reset();
            return Ok(());
        }

        self.center = *pos;
        self.segs.clear();

        self.polys = nav_query.find_local_neighbourhood(
            poly_ref,
            pos,
            collision_query_range,
            filter,
            MAX_LOCAL_POLYS,
        )?;

        let range_sqr = sqr(collision_query_range);
        for &r in &self.polys {
            for s in nav_query.poly_wall_segments(r, filter)? {
                let (dist_sqr, _) = dist_point_segment_sqr_2d(pos, &[s[0], s[1], s[2]], &[s[3], s[4], s[5]]);
                if dist_sqr > range_sqr {
                    continue;
                }
                insert_segment(&mut self.segs, Segment { s, d: dist_sqr });
            }
        }

        Ok(())
    }

    /// False when the boundary was never updated or one of its polygons no longer
    /// passes the filter.
    pub fn is_valid(&self, nav_query: &NavMeshQuery, filter: &QueryFilter) -> bool {
        if self.polys.is_empty() {
            return false;
        }
        self.polys.iter().all(|&r| nav_query.is_valid_poly_ref(r, filter))
    }

    pub fn get_center(&self) -> &[f32; 3] {
        &self.center
    }

    pub fn get_segment_count(&self) -> usize {
        self.segs.len()
    }

    pub fn get_segment(&self, i: usize) -> Option<&[f32; 6]> {
        self.segs.get(i).map(|seg| &seg.s)
    }
}

/// Sorted insert, closest first, dropping whatever falls past the capacity.
fn insert_segment(segs: &mut Vec<Segment>, seg: Segment) {
    let idx = segs.iter().position(|s| seg.d <= s.d).unwrap_or(segs.len());
    if idx >= MAX_LOCAL_SEGS {
        return;
    }
    segs.insert(idx, seg);
    segs.truncate(MAX_LOCAL_SEGS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::create_grid_mesh;

    #[test]
    fn test_update_collects_sorted_walls() -> Result<()> {
        let mesh = create_grid_mesh(3, 3, 1.0);
        let query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let mut boundary = LocalBoundary::new();

        // Near the left border of the middle row
        let pos = [0.2, 0.0, 1.5];
        boundary.update(PolyRef::new(4), &pos, 1.0, &query, &filter)?;
        assert_eq!(boundary.get_center(), &pos);
        assert!(boundary.get_segment_count() > 0);
        assert!(boundary.get_segment_count() <= MAX_LOCAL_SEGS);
        assert!(boundary.is_valid(&query, &filter));

        let first = boundary.get_segment(0).unwrap();
        // Closest wall is the x = 0 border
        assert_eq!(first[0], 0.0);
        assert_eq!(first[3], 0.0);

        let mut last = 0.0;
        for i in 0..boundary.get_segment_count() {
            let s = boundary.get_segment(i).unwrap();
            let (d, _) = dist_point_segment_sqr_2d(&pos, &[s[0], s[1], s[2]], &[s[3], s[4], s[5]]);
            assert!(d >= last);
            last = d;
        }
        Ok(())
    }

    #[test]
    fn test_segment_capacity() {
        let mut segs = Vec::new();
        for i in (0..12).rev() {
            insert_segment(
                &mut segs,
                Segment {
                    s: [i as f32; 6],
                    d: i as f32,
                },
            );
        }
        assert_eq!(segs.len(), MAX_LOCAL_SEGS);
        assert_eq!(segs[0].d, 0.0);
        assert_eq!(segs[MAX_LOCAL_SEGS - 1].d, 7.0);
    }

    #[test]
    fn test_reset_invalidates() -> Result<()> {
        let mesh = create_grid_mesh(2, 2, 1.0);
        let query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let mut boundary = LocalBoundary::new();
        assert!(!boundary.is_valid(&query, &filter));

        boundary.update(PolyRef::new(1), &[0.5, 0.0, 0.5], 2.0, &query, &filter)?;
        assert!(boundary.is_valid(&query, &filter));

        boundary.reset();
        assert!(!boundary.is_valid(&query, &filter));
        assert_eq!(boundary.get_segment_count(), 0);
        assert_eq!(boundary.get_center()[0], f32::MAX);
        Ok(())
    }

    #[test]
    fn test_excluded_polys_invalidate() -> Result<()> {
        let mesh = create_grid_mesh(2, 1, 1.0);
        let query = NavMeshQuery::new(&mesh);
        let mut filter = QueryFilter::default();
        let mut boundary = LocalBoundary::new();
        boundary.update(PolyRef::new(1), &[0.9, 0.0, 0.5], 2.0, &query, &filter)?;
        assert!(boundary.is_valid(&query, &filter));

        filter.set_exclude_flags(filter.include_flags());
        assert!(!boundary.is_valid(&query, &filter));
        Ok(())
    }
}
