//! Path corridor for agent path following
//!
//! A corridor is the polygon path an agent follows plus its current position and target.
//! Movement of either end is merged back into the path so the corridor stays connected
//! without replanning.

use navcrowd_common::{dist_2d, dist_sqr_2d, sqr, vmad, vsub, Error, Result};
use navcrowd_mesh::{NavMesh, NavMeshQuery, PolyRef, QueryFilter, StraightPathFlags, StraightPathPoint};

/// Steering corner, a straight path vertex with its flags and entered polygon
pub type Corner = StraightPathPoint;

/// Corners closer than this to the agent are skipped
const MIN_TARGET_DIST: f32 = 0.01;

/// Polygons visited by a single surface move
const MAX_VISITED: usize = 16;

/// Polygons returned by a raycast or local search used to shortcut the corridor
const MAX_RES: usize = 32;

const MAX_TOPOLOGY_ITER: usize = 32;

#[derive(Debug, Clone)]
pub struct PathCorridor {
    pos: [f32; 3],
    target: [f32; 3],
    path: Vec<PolyRef>,
    max_path: usize,
}

impl Default for PathCorridor {
    fn default() -> Self {
        Self::new(256)
    }
}

impl PathCorridor {
    /// Creates an empty corridor holding at most `max_path` polygons
    pub fn new(max_path: usize) -> Self {
        let max_path = max_path.max(1);
        Self {
            pos: [0.0; 3],
            target: [0.0; 3],
            path: Vec::with_capacity(max_path),
            max_path,
        }
    }

    /// Resets the corridor to a single polygon at `pos`. A null reference leaves the
    /// path empty.
    pub fn reset(&mut self, poly_ref: PolyRef, pos: [f32; 3]) {
        self.pos = pos;
        self.target = pos;
        self.path.clear();
        if poly_ref.is_valid() {
            self.path.push(poly_ref);
        }
    }

    /// Loads a new path and target. The path must start at the agent's current polygon.
    pub fn set_corridor(&mut self, target: &[f32; 3], path: &[PolyRef]) {
        self.target = *target;
        self.path.clear();
        self.path
            .extend_from_slice(&path[..path.len().min(self.max_path)]);
    }

    /// Finds the next `max_corners` steering corners.
    ///
    /// Corners lying on the agent are dropped and the list ends at the first off-mesh
    /// connection.
    pub fn find_corners(
        &self,
        max_corners: usize,
        nav_query: &NavMeshQuery,
        _filter: &QueryFilter,
    ) -> Result<Vec<Corner>> {
        self.require_path("find_corners")?;
        if max_corners == 0 {
            return Ok(Vec::new());
        }

        let mut corners =
            nav_query.find_straight_path(&self.pos, &self.target, &self.path, max_corners + 1)?;

        let first = corners
            .iter()
            .position(|c| {
                c.flags.contains(StraightPathFlags::OFF_MESH_CONNECTION)
                    || dist_sqr_2d(&c.pos, &self.pos) > sqr(MIN_TARGET_DIST)
            })
            .unwrap_or(corners.len());
        corners.drain(..first);

        if let Some(i) = corners
            .iter()
            .position(|c| c.flags.contains(StraightPathFlags::OFF_MESH_CONNECTION))
        {
            corners.truncate(i + 1);
        }
        corners.truncate(max_corners);

        Ok(corners)
    }

    /// Shortcuts the start of the corridor when `next` is directly visible.
    ///
    /// The ray is cast from the current position towards `next`, extended to
    /// `path_optimization_range`.
    pub fn optimize_path_visibility(
        &mut self,
        next: &[f32; 3],
        path_optimization_range: f32,
        nav_query: &NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<()> {
        self.require_path("optimize_path_visibility")?;

        let dist = dist_2d(&self.pos, next);
        // Too close to optimize
        if dist < 0.01 {
            return Ok(());
        }
        let dist = (dist + 0.01).min(path_optimization_range);

        let delta = vsub(next, &self.pos);
        let goal = vmad(&self.pos, &delta, path_optimization_range / dist);

        let hit = nav_query.raycast(self.path[0], &self.pos, &goal, filter, MAX_RES)?;
        if hit.path.len() > 1 && hit.t > 0.99 {
            merge_corridor_start_shortcut(&mut self.path, self.max_path, &hit.path);
        }

        Ok(())
    }

    /// Runs a short local search towards the target and shortcuts the corridor with the
    /// result. Returns true when the corridor was updated.
    pub fn optimize_path_topology(
        &mut self,
        nav_query: &mut NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<bool> {
        self.require_path("optimize_path_topology")?;
        if self.path.len() < 3 {
            return Ok(false);
        }

        let last = self.get_last_poly();
        nav_query.init_sliced_find_path(self.path[0], last, &self.pos, &self.target, filter)?;
        nav_query.update_sliced_find_path(MAX_TOPOLOGY_ITER)?;
        let res = nav_query.finalize_sliced_find_path_partial(&self.path, MAX_RES)?;

        if res.is_empty() {
            return Ok(false);
        }
        merge_corridor_start_shortcut(&mut self.path, self.max_path, &res);
        Ok(true)
    }

    /// Advances the corridor past the off-mesh connection `con_ref`.
    ///
    /// Returns the connection's start and end points, ordered for the direction of
    /// travel, and moves the corridor position to the end point. `None` when the
    /// connection is not followed by another polygon in the path.
    pub fn move_over_off_mesh_connection(
        &mut self,
        con_ref: PolyRef,
        nav_mesh: &NavMesh,
    ) -> Result<Option<([f32; 3], [f32; 3])>> {
        self.require_path("move_over_off_mesh_connection")?;

        let Some(idx) = self.path.iter().position(|&r| r == con_ref) else {
            return Ok(None);
        };
        if idx + 1 >= self.path.len() {
            return Ok(None);
        }

        let prev_ref = if idx > 0 { self.path[idx - 1] } else { PolyRef::NULL };
        let (start, end) = nav_mesh.off_mesh_connection_end_points(prev_ref, con_ref)?;

        self.path.drain(..=idx);
        self.pos = end;
        Ok(Some((start, end)))
    }

    /// Replaces the first polygon after the agent was snapped back onto the mesh.
    pub fn fix_path_start(&mut self, safe_ref: PolyRef, safe_pos: &[f32; 3]) -> bool {
        self.pos = *safe_pos;
        match self.path.first_mut() {
            Some(first) => *first = safe_ref,
            None => self.path.push(safe_ref),
        }
        true
    }

    /// Cuts the path at the first polygon rejected by the filter and clamps the target
    /// into the last remaining polygon.
    pub fn trim_invalid_path(
        &mut self,
        safe_ref: PolyRef,
        safe_pos: &[f32; 3],
        nav_query: &NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<bool> {
        let n = self
            .path
            .iter()
            .take_while(|&&r| nav_query.is_valid_poly_ref(r, filter))
            .count();

        if n == 0 {
            self.pos = *safe_pos;
            self.path.clear();
            self.path.push(safe_ref);
        } else {
            self.path.truncate(n);
        }

        let last = self.get_last_poly();
        self.target = nav_query.closest_point_on_poly_boundary(last, &self.target)?;
        Ok(true)
    }

    /// Checks the first `max_look_ahead` polygons against the filter.
    pub fn is_valid(&self, max_look_ahead: usize, nav_query: &NavMeshQuery, filter: &QueryFilter) -> bool {
        self.path
            .iter()
            .take(max_look_ahead)
            .all(|&r| nav_query.is_valid_poly_ref(r, filter))
    }

    /// Moves the corridor position towards `npos` along the surface and merges the
    /// visited polygons into the start of the path.
    pub fn move_position(
        &mut self,
        npos: &[f32; 3],
        nav_query: &mut NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<bool> {
        self.require_path("move_position")?;

        let (result, visited) =
            nav_query.move_along_surface(self.path[0], &self.pos, npos, filter, MAX_VISITED)?;
        merge_corridor_start_moved(&mut self.path, self.max_path, &visited);

        let h = nav_query.poly_height(self.path[0], &result).unwrap_or(result[1]);
        self.pos = [result[0], h, result[2]];
        Ok(true)
    }

    /// Moves the target towards `npos` along the surface and merges the visited
    /// polygons into the end of the path.
    pub fn move_target_position(
        &mut self,
        npos: &[f32; 3],
        nav_query: &mut NavMeshQuery,
        filter: &QueryFilter,
    ) -> Result<bool> {
        self.require_path("move_target_position")?;

        let last = self.get_last_poly();
        let (result, visited) =
            nav_query.move_along_surface(last, &self.target, npos, filter, MAX_VISITED)?;
        merge_corridor_end_moved(&mut self.path, self.max_path, &visited);

        self.target = result;
        Ok(true)
    }

    pub fn get_pos(&self) -> &[f32; 3] {
        &self.pos
    }

    pub fn get_target(&self) -> &[f32; 3] {
        &self.target
    }

    pub fn get_path(&self) -> &[PolyRef] {
        &self.path
    }

    pub fn get_path_count(&self) -> usize {
        self.path.len()
    }

    pub fn get_max_path(&self) -> usize {
        self.max_path
    }

    pub fn get_first_poly(&self) -> PolyRef {
        self.path.first().copied().unwrap_or(PolyRef::NULL)
    }

    pub fn get_last_poly(&self) -> PolyRef {
        self.path.last().copied().unwrap_or(PolyRef::NULL)
    }

    fn require_path(&self, op: &str) -> Result<()> {
        if self.path.is_empty() {
            return Err(Error::Invariant(format!("{op} called on an empty corridor")));
        }
        Ok(())
    }
}

/// Furthest path polygon (scanning from the end) that also appears in `visited`,
/// paired with its earliest index in `visited`.
fn furthest_common_from_end(path: &[PolyRef], visited: &[PolyRef]) -> Option<(usize, usize)> {
    path.iter()
        .enumerate()
        .rev()
        .find_map(|(i, r)| visited.iter().position(|v| v == r).map(|j| (i, j)))
}

/// Merges a surface move from the start of the corridor. `visited` is in travel order
/// starting at the old first polygon. Returns the new path length.
pub fn merge_corridor_start_moved(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) -> usize {
    let Some((furthest_path, furthest_visited)) = furthest_common_from_end(path, visited) else {
        return path.len();
    };

    let mut merged: Vec<PolyRef> = visited[furthest_visited..].iter().rev().copied().collect();
    merged.extend_from_slice(&path[(furthest_path + 1).min(path.len())..]);
    merged.truncate(max_path);
    *path = merged;
    path.len()
}

/// Merges a surface move from the end of the corridor. Returns the new path length.
pub fn merge_corridor_end_moved(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) -> usize {
    let common = path
        .iter()
        .enumerate()
        .find_map(|(i, r)| visited.iter().position(|v| v == r).map(|j| (i, j)));
    let Some((furthest_path, furthest_visited)) = common else {
        return path.len();
    };

    path.truncate(furthest_path + 1);
    path.extend_from_slice(&visited[furthest_visited + 1..]);
    path.truncate(max_path);
    path.len()
}

/// Replaces the start of the corridor with a shortcut found by a raycast or local
/// search. Returns the new path length.
pub fn merge_corridor_start_shortcut(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) -> usize {
    let Some((furthest_path, furthest_visited)) = furthest_common_from_end(path, visited) else {
        return path.len();
    };
    if furthest_visited == 0 {
        return path.len();
    }

    let mut merged = visited[..furthest_visited].to_vec();
    merged.extend_from_slice(&path[furthest_path..]);
    merged.truncate(max_path);
    *path = merged;
    path.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::{create_grid_mesh, create_l_mesh, create_off_mesh_test_mesh};
    use navcrowd_mesh::PolyFlags;

    fn refs(ids: &[u32]) -> Vec<PolyRef> {
        ids.iter().map(|&i| PolyRef::new(i)).collect()
    }

    #[test]
    fn test_reset_corridor() {
        let mut corridor = PathCorridor::new(16);
        corridor.reset(PolyRef::new(42), [10.0, 5.0, 10.0]);
        assert_eq!(corridor.get_pos(), &[10.0, 5.0, 10.0]);
        assert_eq!(corridor.get_target(), &[10.0, 5.0, 10.0]);
        assert_eq!(corridor.get_path(), &refs(&[42])[..]);
        assert_eq!(corridor.get_first_poly(), corridor.get_last_poly());

        corridor.reset(PolyRef::NULL, [0.0; 3]);
        assert_eq!(corridor.get_path_count(), 0);
        assert_eq!(corridor.get_first_poly(), PolyRef::NULL);
    }

    #[test]
    fn test_empty_corridor_is_an_invariant_error() {
        let mesh = create_grid_mesh(1, 1, 1.0);
        let query = NavMeshQuery::new(&mesh);
        let corridor = PathCorridor::new(16);
        let err = corridor
            .find_corners(4, &query, &QueryFilter::default())
            .unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[test]
    fn test_merge_start_moved() {
        let mut path = refs(&[1, 2, 3, 4]);
        assert_eq!(merge_corridor_start_moved(&mut path, 16, &refs(&[1, 2, 3])), 2);
        assert_eq!(path, refs(&[3, 4]));

        // Moving backwards out of the corridor prepends the visited polygon
        let mut path = refs(&[2, 3]);
        merge_corridor_start_moved(&mut path, 16, &refs(&[2, 1]));
        assert_eq!(path, refs(&[1, 2, 3]));

        let mut path = refs(&[2, 3]);
        merge_corridor_start_moved(&mut path, 16, &refs(&[7, 8]));
        assert_eq!(path, refs(&[2, 3]));

        let mut path = refs(&[2, 3, 4]);
        merge_corridor_start_moved(&mut path, 2, &refs(&[2, 1]));
        assert_eq!(path, refs(&[1, 2]));
    }

    #[test]
    fn test_merge_end_moved() {
        let mut path = refs(&[1, 2, 3]);
        assert_eq!(merge_corridor_end_moved(&mut path, 16, &refs(&[3, 4, 5])), 5);
        assert_eq!(path, refs(&[1, 2, 3, 4, 5]));

        // Target moved back into the corridor
        let mut path = refs(&[1, 2, 3]);
        merge_corridor_end_moved(&mut path, 16, &refs(&[3, 2]));
        assert_eq!(path, refs(&[1, 2]));

        let mut path = refs(&[1, 2]);
        merge_corridor_end_moved(&mut path, 16, &refs(&[8, 9]));
        assert_eq!(path, refs(&[1, 2]));
    }

    #[test]
    fn test_merge_start_shortcut() {
        let mut path = refs(&[1, 2, 3, 4, 5]);
        assert_eq!(merge_corridor_start_shortcut(&mut path, 16, &refs(&[1, 6, 4])), 4);
        assert_eq!(path, refs(&[1, 6, 4, 5]));

        // Shortcut that only touches the first polygon changes nothing
        let mut path = refs(&[1, 2, 3]);
        merge_corridor_start_shortcut(&mut path, 16, &refs(&[3]));
        assert_eq!(path, refs(&[1, 2, 3]));
    }

    #[test]
    fn test_find_corners_around_corner() -> Result<()> {
        let mesh = create_l_mesh();
        let query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let mut corridor = PathCorridor::new(16);
        corridor.reset(PolyRef::new(1), [0.5, 0.0, 0.5]);
        corridor.set_corridor(&[1.2, 0.0, 1.8], &refs(&[1, 2, 3]));

        let corners = corridor.find_corners(4, &query, &filter)?;
        assert_eq!(corners.len(), 2);
        assert_eq!(corners[0].pos, [1.0, 0.0, 1.0]);
        assert!(corners[1].flags.contains(StraightPathFlags::END));

        let corners = corridor.find_corners(1, &query, &filter)?;
        assert_eq!(corners.len(), 1);
        Ok(())
    }

    #[test]
    fn test_corners_stop_at_off_mesh_connection_and_traverse() -> Result<()> {
        let mesh = create_off_mesh_test_mesh();
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();
        let start = [1.0, 0.0, 2.0];
        let end = [9.0, 0.0, 2.0];
        let path = query.find_path(PolyRef::new(1), PolyRef::new(2), &start, &end, &filter, 16)?;
        let con = path[1];

        let mut corridor = PathCorridor::new(16);
        corridor.reset(PolyRef::new(1), start);
        corridor.set_corridor(&end, &path);

        let corners = corridor.find_corners(4, &query, &filter)?;
        assert_eq!(corners.len(), 1);
        assert!(corners[0].flags.contains(StraightPathFlags::OFF_MESH_CONNECTION));
        assert_eq!(corners[0].poly, con);

        let (from, to) = corridor.move_over_off_mesh_connection(con, &mesh)?.unwrap();
        assert!((from[0] - 3.5).abs() < 1e-4);
        assert!((to[0] - 6.5).abs() < 1e-4);
        assert_eq!(corridor.get_path(), &refs(&[2])[..]);
        assert_eq!(corridor.get_pos(), &to);

        // Already past the connection
        assert!(corridor.move_over_off_mesh_connection(con, &mesh)?.is_none());
        Ok(())
    }

    #[test]
    fn test_move_position_advances_corridor() -> Result<()> {
        let mesh = create_grid_mesh(3, 1, 1.0);
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let mut corridor = PathCorridor::new(16);
        corridor.reset(PolyRef::new(1), [0.5, 0.0, 0.5]);
        corridor.set_corridor(&[2.5, 0.0, 0.5], &refs(&[1, 2, 3]));

        assert!(corridor.move_position(&[1.5, 0.0, 0.5], &mut query, &filter)?);
        assert_eq!(corridor.get_path(), &refs(&[2, 3])[..]);
        assert_eq!(corridor.get_pos(), &[1.5, 0.0, 0.5]);

        // Pushing into a wall slides along it
        corridor.move_position(&[1.5, 0.0, -1.0], &mut query, &filter)?;
        assert!(corridor.get_pos()[2].abs() < 1e-5);
        assert_eq!(corridor.get_first_poly(), PolyRef::new(2));
        Ok(())
    }

    #[test]
    fn test_move_target_position_extends_corridor() -> Result<()> {
        let mesh = create_grid_mesh(3, 1, 1.0);
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let mut corridor = PathCorridor::new(16);
        corridor.reset(PolyRef::new(1), [0.5, 0.0, 0.5]);
        corridor.set_corridor(&[1.5, 0.0, 0.5], &refs(&[1, 2]));

        corridor.move_target_position(&[2.5, 0.0, 0.5], &mut query, &filter)?;
        assert_eq!(corridor.get_path(), &refs(&[1, 2, 3])[..]);
        assert_eq!(corridor.get_target(), &[2.5, 0.0, 0.5]);
        Ok(())
    }

    #[test]
    fn test_fix_path_start() {
        let mut corridor = PathCorridor::new(16);
        corridor.set_corridor(&[3.0, 0.0, 0.0], &refs(&[1, 2, 3]));
        assert!(corridor.fix_path_start(PolyRef::new(9), &[0.2, 0.0, 0.2]));
        assert_eq!(corridor.get_path(), &refs(&[9, 2, 3])[..]);
        assert_eq!(corridor.get_pos(), &[0.2, 0.0, 0.2]);

        let mut empty = PathCorridor::new(16);
        empty.fix_path_start(PolyRef::new(4), &[0.0; 3]);
        assert_eq!(empty.get_path(), &refs(&[4])[..]);
    }

    #[test]
    fn test_trim_invalid_path() -> Result<()> {
        let mut mesh = create_grid_mesh(3, 1, 1.0);
        mesh.set_poly_flags(PolyRef::new(2), PolyFlags::DISABLED)?;
        let query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let mut corridor = PathCorridor::new(16);
        corridor.reset(PolyRef::new(1), [0.5, 0.0, 0.5]);
        corridor.set_corridor(&[2.5, 0.0, 0.5], &refs(&[1, 2, 3]));
        assert!(!corridor.is_valid(10, &query, &filter));
        assert!(corridor.is_valid(1, &query, &filter));

        corridor.trim_invalid_path(PolyRef::new(1), &[0.5, 0.0, 0.5], &query, &filter)?;
        assert_eq!(corridor.get_path(), &refs(&[1])[..]);
        assert!((corridor.get_target()[0] - 1.0).abs() < 1e-5);
        assert!(corridor.is_valid(10, &query, &filter));
        Ok(())
    }

    #[test]
    fn test_trim_fully_invalid_path_uses_safe_poly() -> Result<()> {
        let mut mesh = create_grid_mesh(3, 1, 1.0);
        mesh.set_poly_flags(PolyRef::new(1), PolyFlags::DISABLED)?;
        mesh.set_poly_flags(PolyRef::new(2), PolyFlags::DISABLED)?;
        let query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let mut corridor = PathCorridor::new(16);
        corridor.reset(PolyRef::new(1), [0.5, 0.0, 0.5]);
        corridor.set_corridor(&[2.5, 0.0, 0.5], &refs(&[1, 2, 3]));

        corridor.trim_invalid_path(PolyRef::new(3), &[2.2, 0.0, 0.5], &query, &filter)?;
        assert_eq!(corridor.get_path(), &refs(&[3])[..]);
        assert_eq!(corridor.get_pos(), &[2.2, 0.0, 0.5]);
        assert_eq!(corridor.get_target(), &[2.5, 0.0, 0.5]);
        Ok(())
    }

    #[test]
    fn test_optimize_visibility_removes_detour() -> Result<()> {
        // 3x2 grid, corridor loops through the upper row
        let mesh = create_grid_mesh(3, 2, 1.0);
        let query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let mut corridor = PathCorridor::new(16);
        corridor.reset(PolyRef::new(1), [0.5, 0.0, 0.5]);
        corridor.set_corridor(&[2.5, 0.0, 0.5], &refs(&[1, 4, 5, 2, 3]));

        corridor.optimize_path_visibility(&[2.5, 0.0, 0.5], 2.0, &query, &filter)?;
        assert_eq!(corridor.get_path(), &refs(&[1, 2, 3])[..]);
        Ok(())
    }

    #[test]
    fn test_optimize_topology_removes_detour() -> Result<()> {
        let mesh = create_grid_mesh(3, 2, 1.0);
        let mut query = NavMeshQuery::new(&mesh);
        let filter = QueryFilter::default();

        let mut corridor = PathCorridor::new(16);
        corridor.reset(PolyRef::new(1), [0.5, 0.0, 0.5]);
        corridor.set_corridor(&[2.5, 0.0, 0.5], &refs(&[1, 4, 5, 2, 3]));

        assert!(corridor.optimize_path_topology(&mut query, &filter)?);
        assert_eq!(corridor.get_path(), &refs(&[1, 2, 3])[..]);

        // Nothing to optimize on short corridors
        corridor.set_corridor(&[1.5, 0.0, 0.5], &refs(&[1, 2]));
        assert!(!corridor.optimize_path_topology(&mut query, &filter)?);
        Ok(())
    }
}
