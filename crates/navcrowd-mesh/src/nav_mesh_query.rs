//! Navigation mesh queries
//!
//! `NavMeshQuery` performs point location, sliced A* searches, string pulling,
//! surface-constrained movement and raycasts against a [`NavMesh`]. The query owns
//! a node pool, so each thread or subsystem that searches needs its own instance.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};

use bitflags::bitflags;
use navcrowd_common::{
    dist_point_segment_sqr_2d, intersect_segment_poly_2d, overlap_bounds_2d, point_in_polygon_2d,
    sqr, tri_area_2d, vdist, vequal, vlen_sqr, vlerp, vsub, Error, Result,
};

use crate::nav_mesh::{closest_on_edges, Poly, MAX_AREAS, OFF_MESH_LINK_EDGE};
use crate::node_pool::{NodeFlags, NodePool};
use crate::{NavMesh, PolyFlags, PolyRef, PolyType, SlicedPathState, Status};

/// Default number of nodes in the search pool
pub const DEFAULT_MAX_NODES: usize = 2048;

const TINY_NODE_POOL_SIZE: usize = 64;

/// Heuristic scale, slightly below 1 to keep A* admissible with float error
const H_SCALE: f32 = 0.999;

/// Polygon filter and traversal costs used by queries
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    area_cost: [f32; MAX_AREAS],
    include_flags: PolyFlags,
    exclude_flags: PolyFlags,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            area_cost: [1.0; MAX_AREAS],
            include_flags: PolyFlags::all(),
            exclude_flags: PolyFlags::DISABLED,
        }
    }
}

impl QueryFilter {
    pub fn pass_filter(&self, poly: &Poly) -> bool {
        poly.flags.intersects(self.include_flags) && !poly.flags.intersects(self.exclude_flags)
    }

    /// Cost of moving from `pa` to `pb` across `poly`
    pub fn cost(&self, pa: &[f32; 3], pb: &[f32; 3], poly: &Poly) -> f32 {
        vdist(pa, pb) * self.area_cost[poly.area as usize % MAX_AREAS]
    }

    pub fn area_cost(&self, area: u8) -> f32 {
        self.area_cost[area as usize % MAX_AREAS]
    }

    pub fn set_area_cost(&mut self, area: u8, cost: f32) {
        self.area_cost[area as usize % MAX_AREAS] = cost;
    }

    pub fn include_flags(&self) -> PolyFlags {
        self.include_flags
    }

    pub fn set_include_flags(&mut self, flags: PolyFlags) {
        self.include_flags = flags;
    }

    pub fn exclude_flags(&self) -> PolyFlags {
        self.exclude_flags
    }

    pub fn set_exclude_flags(&mut self, flags: PolyFlags) {
        self.exclude_flags = flags;
    }
}

bitflags! {
    /// Vertex flags returned by [`NavMeshQuery::find_straight_path`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StraightPathFlags: u8 {
        /// The vertex is the start position
        const START = 0x01;
        /// The vertex is the end position
        const END = 0x02;
        /// The vertex is the start of an off-mesh connection
        const OFF_MESH_CONNECTION = 0x04;
    }
}

/// A vertex of a straight path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StraightPathPoint {
    pub pos: [f32; 3],
    pub flags: StraightPathFlags,
    /// Polygon entered at this vertex. Null for the end point.
    pub poly: PolyRef,
}

/// Result of [`NavMeshQuery::raycast`]
#[derive(Debug, Clone, PartialEq)]
pub struct RaycastHit {
    /// Hit parameter along the segment. `f32::MAX` if the ray reached its end.
    pub t: f32,
    pub hit_normal: [f32; 3],
    /// Polygons visited by the ray
    pub path: Vec<PolyRef>,
}

/// Node wrapper for the binary heap (priority queue)
#[derive(Debug, Clone, Copy)]
struct HeapNode {
    index: usize,
    f: f32,
}

impl PartialEq for HeapNode {
    fn eq(&self, other: &Self) -> bool {
        self.f == other.f
    }
}

impl Eq for HeapNode {}

impl PartialOrd for HeapNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapNode {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for a min-heap on f
        other.f.total_cmp(&self.f)
    }
}

#[derive(Debug, Clone)]
struct SlicedQuery {
    state: Option<SlicedPathState>,
    start_ref: PolyRef,
    end_ref: PolyRef,
    start_pos: [f32; 3],
    end_pos: [f32; 3],
    filter: QueryFilter,
    last_best_node: usize,
    last_best_cost: f32,
    out_of_nodes: bool,
}

impl Default for SlicedQuery {
    fn default() -> Self {
        Self {
            state: None,
            start_ref: PolyRef::NULL,
            end_ref: PolyRef::NULL,
            start_pos: [0.0; 3],
            end_pos: [0.0; 3],
            filter: QueryFilter::default(),
            last_best_node: 0,
            last_best_cost: f32::MAX,
            out_of_nodes: false,
        }
    }
}

/// Navigation mesh query structure
#[derive(Debug, Clone)]
pub struct NavMeshQuery<'a> {
    nav_mesh: &'a NavMesh,
    node_pool: NodePool,
    /// Small pool for local searches that must not disturb a sliced query
    tiny_node_pool: NodePool,
    open_list: BinaryHeap<HeapNode>,
    sliced: SlicedQuery,
}

impl<'a> NavMeshQuery<'a> {
    pub fn new(nav_mesh: &'a NavMesh) -> Self {
        Self::with_max_nodes(nav_mesh, DEFAULT_MAX_NODES)
    }

    pub fn with_max_nodes(nav_mesh: &'a NavMesh, max_nodes: usize) -> Self {
        Self {
            nav_mesh,
            node_pool: NodePool::new(max_nodes.max(1)),
            tiny_node_pool: NodePool::new(TINY_NODE_POOL_SIZE),
            open_list: BinaryHeap::new(),
            sliced: SlicedQuery::default(),
        }
    }

    pub fn nav_mesh(&self) -> &'a NavMesh {
        self.nav_mesh
    }

    pub fn is_valid_poly_ref(&self, poly_ref: PolyRef, filter: &QueryFilter) -> bool {
        self.nav_mesh
            .poly(poly_ref)
            .is_some_and(|p| filter.pass_filter(p))
    }

    /// Ground polygons whose bounds overlap the query box and pass the filter
    pub fn query_polygons(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &QueryFilter,
    ) -> Vec<PolyRef> {
        let qmin = vsub(center, half_extents);
        let qmax = [
            center[0] + half_extents[0],
            center[1] + half_extents[1],
            center[2] + half_extents[2],
        ];

        self.nav_mesh
            .poly_refs()
            .filter(|&r| {
                let Some(poly) = self.nav_mesh.poly(r) else {
                    return false;
                };
                let Some((bmin, bmax)) = self.nav_mesh.poly_bounds(r) else {
                    return false;
                };
                poly.poly_type == PolyType::Ground
                    && overlap_bounds_2d(&qmin, &qmax, &bmin, &bmax)
                    && bmin[1] <= qmax[1]
                    && bmax[1] >= qmin[1]
                    && filter.pass_filter(poly)
            })
            .collect()
    }

    /// Finds the polygon nearest to `center` within the query box.
    ///
    /// Returns a null reference and `center` when no polygon is found.
    pub fn find_nearest_poly(
        &self,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &QueryFilter,
    ) -> Result<(PolyRef, [f32; 3])> {
        let mut nearest = PolyRef::NULL;
        let mut nearest_pt = *center;
        let mut nearest_dist = f32::MAX;

        for r in self.query_polygons(center, half_extents, filter) {
            let (pt, over_poly) = self.nav_mesh.closest_point_on_poly(r, center)?;
            // Favour polygons directly under the point
            let d = if over_poly {
                sqr(center[1] - pt[1])
            } else {
                vlen_sqr(&vsub(center, &pt))
            };
            if d < nearest_dist {
                nearest_dist = d;
                nearest = r;
                nearest_pt = pt;
            }
        }

        Ok((nearest, nearest_pt))
    }

    pub fn closest_point_on_poly(&self, poly_ref: PolyRef, pos: &[f32; 3]) -> Result<([f32; 3], bool)> {
        self.nav_mesh.closest_point_on_poly(poly_ref, pos)
    }

    /// Like `closest_point_on_poly`, but returns `pos` unchanged when it is inside the
    /// polygon and ignores surface height.
    pub fn closest_point_on_poly_boundary(&self, poly_ref: PolyRef, pos: &[f32; 3]) -> Result<[f32; 3]> {
        let verts = self
            .nav_mesh
            .poly_vertices(poly_ref)
            .ok_or_else(|| Error::NavMesh(Status::InvalidParam.to_string()))?;

        if verts.len() >= 3 && point_in_polygon_2d(pos, &verts) {
            return Ok(*pos);
        }

        let n = verts.len();
        let edges: Vec<(f32, f32)> = (0..n)
            .map(|j| dist_point_segment_sqr_2d(pos, &verts[j], &verts[(j + 1) % n]))
            .collect();
        Ok(closest_on_edges(&verts, &edges))
    }

    pub fn poly_height(&self, poly_ref: PolyRef, pos: &[f32; 3]) -> Option<f32> {
        self.nav_mesh.poly_height(poly_ref, pos)
    }

    /// Left and right portal points between two adjacent polygons, plus their types.
    pub fn portal_points(
        &self,
        from: PolyRef,
        to: PolyRef,
    ) -> Result<([f32; 3], [f32; 3], PolyType, PolyType)> {
        let from_poly = self.nav_mesh.poly_or_err(from)?;
        let to_poly = self.nav_mesh.poly_or_err(to)?;
        let link = from_poly
            .links
            .iter()
            .find(|l| l.reference == to)
            .ok_or_else(|| Error::NavMesh(Status::InvalidParam.to_string()))?;
        let verts = &self.nav_mesh.verts;

        if from_poly.poly_type == PolyType::OffMeshConnection {
            let v = verts[from_poly.verts[link.edge as usize]];
            return Ok((v, v, from_poly.poly_type, to_poly.poly_type));
        }

        if to_poly.poly_type == PolyType::OffMeshConnection {
            let back = to_poly
                .links
                .iter()
                .find(|l| l.reference == from)
                .ok_or_else(|| Error::NavMesh(Status::InvalidParam.to_string()))?;
            let v = verts[to_poly.verts[back.edge as usize]];
            return Ok((v, v, from_poly.poly_type, to_poly.poly_type));
        }

        let edge = link.edge as usize;
        let n = from_poly.verts.len();
        let left = verts[from_poly.verts[edge]];
        let right = verts[from_poly.verts[(edge + 1) % n]];
        Ok((left, right, from_poly.poly_type, to_poly.poly_type))
    }

    fn edge_mid_point(&self, from: PolyRef, to: PolyRef) -> Result<[f32; 3]> {
        let (left, right, _, _) = self.portal_points(from, to)?;
        Ok(vlerp(&left, &right, 0.5))
    }

    /// Finds a polygon path in one call
    pub fn find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
        max_path: usize,
    ) -> Result<Vec<PolyRef>> {
        self.init_sliced_find_path(start_ref, end_ref, start_pos, end_pos, filter)?;
        self.update_sliced_find_path(usize::MAX)?;
        self.finalize_sliced_find_path(max_path)
    }

    /// Starts a sliced path search. The search is advanced with
    /// [`update_sliced_find_path`](Self::update_sliced_find_path).
    pub fn init_sliced_find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
    ) -> Result<Status> {
        self.sliced = SlicedQuery::default();

        if !self.nav_mesh.is_valid_poly_ref(start_ref) || !self.nav_mesh.is_valid_poly_ref(end_ref) {
            return Err(Error::NavMesh(Status::InvalidParam.to_string()));
        }

        self.sliced.start_ref = start_ref;
        self.sliced.end_ref = end_ref;
        self.sliced.start_pos = *start_pos;
        self.sliced.end_pos = *end_pos;
        self.sliced.filter = filter.clone();

        if start_ref == end_ref {
            self.sliced.state = Some(SlicedPathState::Success);
            return Ok(Status::Success);
        }

        self.node_pool.clear();
        self.open_list.clear();

        let start = self
            .node_pool
            .get_node(start_ref)
            .ok_or_else(|| Error::NavMesh(Status::OutOfNodes.to_string()))?;
        let h = vdist(start_pos, end_pos) * H_SCALE;
        let node = self.node_pool.node_mut(start);
        node.pos = *start_pos;
        node.cost = 0.0;
        node.total = h;
        node.parent = None;
        node.flags = NodeFlags::OPEN;
        self.open_list.push(HeapNode { index: start, f: h });

        self.sliced.last_best_node = start;
        self.sliced.last_best_cost = h;
        self.sliced.state = Some(SlicedPathState::InProgress);
        Ok(Status::InProgress)
    }

    /// Runs up to `max_iter` search iterations. Returns the number of iterations done
    /// and the resulting state.
    pub fn update_sliced_find_path(&mut self, max_iter: usize) -> Result<(usize, SlicedPathState)> {
        let Some(state) = self.sliced.state else {
            return Err(Error::NavMesh(Status::InvalidParam.to_string()));
        };
        if state != SlicedPathState::InProgress {
            return Ok((0, state));
        }

        let end_ref = self.sliced.end_ref;
        if !self.nav_mesh.is_valid_poly_ref(self.sliced.start_ref)
            || !self.nav_mesh.is_valid_poly_ref(end_ref)
        {
            self.sliced.state = Some(SlicedPathState::Failed);
            return Ok((0, SlicedPathState::Failed));
        }

        let mut iter = 0;
        while iter < max_iter {
            let Some(HeapNode { index: best, f }) = self.open_list.pop() else {
                break;
            };
            {
                let node = self.node_pool.node(best);
                if node.flags.contains(NodeFlags::CLOSED) || f > node.total {
                    continue;
                }
            }
            iter += 1;

            let best_node = self.node_pool.node_mut(best);
            best_node.flags.remove(NodeFlags::OPEN);
            best_node.flags.insert(NodeFlags::CLOSED);
            let best_ref = best_node.poly;
            let best_pos = best_node.pos;
            let best_cost = best_node.cost;
            let parent_ref = best_node.parent.map(|p| self.node_pool.node(p).poly);

            if best_ref == end_ref {
                self.sliced.last_best_node = best;
                self.sliced.state = Some(SlicedPathState::Success);
                return Ok((iter, SlicedPathState::Success));
            }

            let best_poly = self.nav_mesh.poly_or_err(best_ref)?;
            for link in &best_poly.links {
                let neighbour_ref = link.reference;
                if Some(neighbour_ref) == parent_ref {
                    continue;
                }
                let Some(neighbour_poly) = self.nav_mesh.poly(neighbour_ref) else {
                    continue;
                };
                if !self.sliced.filter.pass_filter(neighbour_poly) {
                    continue;
                }

                let Some(ni) = self.node_pool.get_node(neighbour_ref) else {
                    self.sliced.out_of_nodes = true;
                    continue;
                };

                if self.node_pool.node(ni).flags.is_empty() {
                    let pos = self.edge_mid_point(best_ref, neighbour_ref)?;
                    self.node_pool.node_mut(ni).pos = pos;
                }
                let neighbour_pos = self.node_pool.node(ni).pos;

                let (cost, heuristic) = if neighbour_ref == end_ref {
                    let cur = self.sliced.filter.cost(&best_pos, &neighbour_pos, best_poly);
                    let end = self
                        .sliced
                        .filter
                        .cost(&neighbour_pos, &self.sliced.end_pos, neighbour_poly);
                    (best_cost + cur + end, 0.0)
                } else {
                    let cur = self.sliced.filter.cost(&best_pos, &neighbour_pos, best_poly);
                    (
                        best_cost + cur,
                        vdist(&neighbour_pos, &self.sliced.end_pos) * H_SCALE,
                    )
                };
                let total = cost + heuristic;

                let node = self.node_pool.node_mut(ni);
                if !node.flags.is_empty() && total >= node.total {
                    continue;
                }

                node.parent = Some(best);
                node.cost = cost;
                node.total = total;
                node.flags.remove(NodeFlags::CLOSED);
                node.flags.insert(NodeFlags::OPEN);
                self.open_list.push(HeapNode { index: ni, f: total });

                if heuristic < self.sliced.last_best_cost {
                    self.sliced.last_best_cost = heuristic;
                    self.sliced.last_best_node = ni;
                }
            }
        }

        if self.open_list.is_empty() {
            // Exhausted the reachable polygons without reaching the goal
            self.sliced.state = Some(SlicedPathState::PartialPath);
        }

        let state = self.sliced.state.unwrap_or(SlicedPathState::Failed);
        Ok((iter, state))
    }

    /// Finishes the current sliced search and returns its path. While the search is still
    /// in progress this returns the path to the most promising node found so far.
    pub fn finalize_sliced_find_path(&mut self, max_path: usize) -> Result<Vec<PolyRef>> {
        let state = self.take_sliced_state()?;
        if state == SlicedPathState::Failed {
            return Err(Error::Pathfinding(Status::Failure.to_string()));
        }

        let mut path = if self.sliced.start_ref == self.sliced.end_ref {
            vec![self.sliced.start_ref]
        } else {
            self.node_pool.path_to(self.sliced.last_best_node)
        };

        if self.sliced.out_of_nodes {
            log::debug!("Path search ran out of nodes, returning partial path");
        }
        path.truncate(max_path);
        Ok(path)
    }

    /// Finishes the current sliced search, ending the path at the furthest polygon of
    /// `existing` that the search visited.
    pub fn finalize_sliced_find_path_partial(
        &mut self,
        existing: &[PolyRef],
        max_path: usize,
    ) -> Result<Vec<PolyRef>> {
        if existing.is_empty() || max_path == 0 {
            self.sliced = SlicedQuery::default();
            return Err(Error::NavMesh(Status::InvalidParam.to_string()));
        }

        let state = self.take_sliced_state()?;
        if state == SlicedPathState::Failed {
            return Err(Error::Pathfinding(Status::Failure.to_string()));
        }

        let mut path = if self.sliced.start_ref == self.sliced.end_ref {
            vec![self.sliced.start_ref]
        } else {
            let node = existing
                .iter()
                .rev()
                .find_map(|&r| {
                    self.node_pool
                        .find_node(r)
                        .filter(|&i| !self.node_pool.node(i).flags.is_empty())
                })
                .unwrap_or(self.sliced.last_best_node);
            self.node_pool.path_to(node)
        };

        path.truncate(max_path);
        Ok(path)
    }

    pub fn sliced_path_state(&self) -> Option<SlicedPathState> {
        self.sliced.state
    }

    fn take_sliced_state(&mut self) -> Result<SlicedPathState> {
        self.sliced
            .state
            .take()
            .ok_or_else(|| Error::NavMesh(Status::InvalidParam.to_string()))
    }

    /// String-pulls a polygon corridor into a list of straight path vertices.
    pub fn find_straight_path(
        &self,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        path: &[PolyRef],
        max_points: usize,
    ) -> Result<Vec<StraightPathPoint>> {
        let (Some(&first), Some(&last)) = (path.first(), path.last()) else {
            return Err(Error::NavMesh(Status::InvalidParam.to_string()));
        };
        if max_points == 0 {
            return Err(Error::NavMesh(Status::InvalidParam.to_string()));
        }

        let closest_start = self.closest_point_on_poly_boundary(first, start_pos)?;
        let closest_end = self.closest_point_on_poly_boundary(last, end_pos)?;

        let mut out = Vec::with_capacity(max_points);
        if append_vertex(&mut out, closest_start, StraightPathFlags::START, first, max_points) {
            return Ok(out);
        }

        if path.len() > 1 {
            let mut apex = closest_start;
            let mut left = apex;
            let mut right = apex;
            let mut apex_index = 0;
            let mut left_index = 0;
            let mut right_index = 0;
            let mut left_type = PolyType::Ground;
            let mut right_type = PolyType::Ground;
            let mut left_ref = first;
            let mut right_ref = first;

            let mut i = 0;
            while i < path.len() {
                let (portal_left, portal_right, to_type) = if i + 1 < path.len() {
                    match self.portal_points(path[i], path[i + 1]) {
                        Ok((l, r, _, to_type)) => (l, r, to_type),
                        Err(_) => {
                            // Corridor is broken: stop at the closest point in the last good poly
                            let end = self.closest_point_on_poly_boundary(path[i], end_pos)?;
                            append_vertex(&mut out, end, StraightPathFlags::empty(), path[i], max_points);
                            return Ok(out);
                        }
                    }
                } else {
                    (closest_end, closest_end, PolyType::Ground)
                };

                if i == 0 {
                    let (d, _) = dist_point_segment_sqr_2d(&apex, &portal_left, &portal_right);
                    if d < sqr(0.001) {
                        i += 1;
                        continue;
                    }
                }

                let next_ref = path.get(i + 1).copied().unwrap_or(PolyRef::NULL);

                // Right vertex
                if tri_area_2d(&apex, &right, &portal_right) <= 0.0 {
                    if vequal(&apex, &right) || tri_area_2d(&apex, &left, &portal_right) > 0.0 {
                        right = portal_right;
                        right_ref = next_ref;
                        right_type = to_type;
                        right_index = i;
                    } else {
                        // Right over left, left becomes the new apex
                        apex = left;
                        apex_index = left_index;
                        if append_vertex(&mut out, apex, corner_flags(left_type), left_ref, max_points) {
                            return Ok(out);
                        }
                        right = apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                // Left vertex
                if tri_area_2d(&apex, &left, &portal_left) >= 0.0 {
                    if vequal(&apex, &left) || tri_area_2d(&apex, &right, &portal_left) < 0.0 {
                        left = portal_left;
                        left_ref = next_ref;
                        left_type = to_type;
                        left_index = i;
                    } else {
                        // Left over right, right becomes the new apex
                        apex = right;
                        apex_index = right_index;
                        if append_vertex(&mut out, apex, corner_flags(right_type), right_ref, max_points) {
                            return Ok(out);
                        }
                        left = apex;
                        left_index = apex_index;
                        right_index = apex_index;
                        i = apex_index + 1;
                        continue;
                    }
                }

                i += 1;
            }
        }

        append_vertex(&mut out, closest_end, StraightPathFlags::END, PolyRef::NULL, max_points);
        Ok(out)
    }

    /// Moves from `start_pos` towards `end_pos` while staying on the surface.
    ///
    /// Returns the reached position and the visited polygons in travel order. At most
    /// `max_visited` polygons are returned.
    pub fn move_along_surface(
        &mut self,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
        max_visited: usize,
    ) -> Result<([f32; 3], Vec<PolyRef>)> {
        const MAX_STACK: usize = 48;

        if !self.nav_mesh.is_valid_poly_ref(start_ref) {
            return Err(Error::NavMesh(Status::InvalidParam.to_string()));
        }

        self.tiny_node_pool.clear();
        let start = self
            .tiny_node_pool
            .get_node(start_ref)
            .ok_or_else(|| Error::NavMesh(Status::OutOfNodes.to_string()))?;
        self.tiny_node_pool.node_mut(start).flags = NodeFlags::CLOSED;

        let mut stack = VecDeque::with_capacity(MAX_STACK);
        stack.push_back(start);

        let mut best_pos = *start_pos;
        let mut best_dist = f32::MAX;
        let mut best_node = start;

        let search_pos = vlerp(start_pos, end_pos, 0.5);
        let search_rad_sqr = sqr(vdist(start_pos, end_pos) / 2.0 + 0.001);

        while let Some(cur) = stack.pop_front() {
            let cur_ref = self.tiny_node_pool.node(cur).poly;
            let poly = self.nav_mesh.poly_or_err(cur_ref)?;
            let verts: Vec<[f32; 3]> = poly.verts.iter().map(|&v| self.nav_mesh.verts[v]).collect();

            if point_in_polygon_2d(end_pos, &verts) {
                best_node = cur;
                best_pos = *end_pos;
                break;
            }

            let n = verts.len();
            for j in 0..n {
                let vj = &verts[j];
                let vi = &verts[(j + 1) % n];
                let neighbour = poly
                    .neighbour(j)
                    .filter(|&r| self.nav_mesh.poly(r).is_some_and(|p| filter.pass_filter(p)));

                let Some(neighbour) = neighbour else {
                    // Wall edge
                    let (d, t) = dist_point_segment_sqr_2d(end_pos, vj, vi);
                    if d < best_dist {
                        best_pos = vlerp(vj, vi, t);
                        best_dist = d;
                        best_node = cur;
                    }
                    continue;
                };

                let Some(ni) = self.tiny_node_pool.get_node(neighbour) else {
                    continue;
                };
                if self.tiny_node_pool.node(ni).flags.contains(NodeFlags::CLOSED) {
                    continue;
                }
                let (d, _) = dist_point_segment_sqr_2d(&search_pos, vj, vi);
                if d > search_rad_sqr {
                    continue;
                }
                if stack.len() < MAX_STACK {
                    let node = self.tiny_node_pool.node_mut(ni);
                    node.parent = Some(cur);
                    node.flags.insert(NodeFlags::CLOSED);
                    stack.push_back(ni);
                }
            }
        }

        let mut visited = self.tiny_node_pool.path_to(best_node);
        visited.truncate(max_visited);
        Ok((best_pos, visited))
    }

    /// Casts a ray along the surface from `start_pos` towards `end_pos`.
    pub fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &QueryFilter,
        max_path: usize,
    ) -> Result<RaycastHit> {
        if !self.nav_mesh.is_valid_poly_ref(start_ref) {
            return Err(Error::NavMesh(Status::InvalidParam.to_string()));
        }

        let mut hit = RaycastHit {
            t: 0.0,
            hit_normal: [0.0; 3],
            path: Vec::new(),
        };

        let mut cur_ref = start_ref;
        while cur_ref.is_valid() {
            let poly = self.nav_mesh.poly_or_err(cur_ref)?;
            let verts: Vec<[f32; 3]> = poly.verts.iter().map(|&v| self.nav_mesh.verts[v]).collect();

            let Some((_, tmax, _, seg_max)) = intersect_segment_poly_2d(start_pos, end_pos, &verts)
            else {
                // Could not hit the polygon, keep the old t and report a hit
                return Ok(hit);
            };

            if tmax > hit.t {
                hit.t = tmax;
            }
            if hit.path.len() < max_path {
                hit.path.push(cur_ref);
            }

            let Some(seg) = seg_max else {
                // Ray end is inside the polygon
                hit.t = f32::MAX;
                return Ok(hit);
            };

            let next = poly.neighbour(seg).filter(|&r| {
                self.nav_mesh
                    .poly(r)
                    .is_some_and(|p| p.poly_type == PolyType::Ground && filter.pass_filter(p))
            });

            match next {
                Some(next) => cur_ref = next,
                None => {
                    let va = &verts[seg];
                    let vb = &verts[(seg + 1) % verts.len()];
                    let dx = vb[0] - va[0];
                    let dz = vb[2] - va[2];
                    let len = (dx * dx + dz * dz).sqrt();
                    if len > 0.0 {
                        hit.hit_normal = [dz / len, 0.0, -dx / len];
                    }
                    return Ok(hit);
                }
            }
        }

        Ok(hit)
    }

    /// Collects ground polygons around `center` reachable through edges that come within
    /// `radius`, starting at `start_ref`.
    pub fn find_local_neighbourhood(
        &self,
        start_ref: PolyRef,
        center: &[f32; 3],
        radius: f32,
        filter: &QueryFilter,
        max_result: usize,
    ) -> Result<Vec<PolyRef>> {
        if !self.nav_mesh.is_valid_poly_ref(start_ref) || max_result == 0 {
            return Err(Error::NavMesh(Status::InvalidParam.to_string()));
        }

        let radius_sqr = sqr(radius);
        let mut result = vec![start_ref];
        let mut visited = HashSet::from([start_ref]);
        let mut queue = VecDeque::from([start_ref]);

        while let Some(cur_ref) = queue.pop_front() {
            let poly = self.nav_mesh.poly_or_err(cur_ref)?;
            for link in &poly.links {
                if link.edge == OFF_MESH_LINK_EDGE || visited.contains(&link.reference) {
                    continue;
                }
                let Some(neighbour) = self.nav_mesh.poly(link.reference) else {
                    continue;
                };
                if neighbour.poly_type != PolyType::Ground || !filter.pass_filter(neighbour) {
                    continue;
                }

                let (va, vb, _, _) = self.portal_points(cur_ref, link.reference)?;
                let (d, _) = dist_point_segment_sqr_2d(center, &va, &vb);
                if d > radius_sqr {
                    continue;
                }

                visited.insert(link.reference);
                if result.len() < max_result {
                    result.push(link.reference);
                    queue.push_back(link.reference);
                }
            }
        }

        Ok(result)
    }

    /// Wall segments of a polygon, as `[ax, ay, az, bx, by, bz]`. Edges leading to
    /// polygons rejected by the filter count as walls.
    pub fn poly_wall_segments(&self, poly_ref: PolyRef, filter: &QueryFilter) -> Result<Vec<[f32; 6]>> {
        let poly = self.nav_mesh.poly_or_err(poly_ref)?;
        if poly.poly_type != PolyType::Ground {
            return Ok(Vec::new());
        }

        let n = poly.verts.len();
        let mut segments = Vec::new();
        for j in 0..n {
            let open = poly
                .neighbour(j)
                .and_then(|r| self.nav_mesh.poly(r))
                .is_some_and(|p| filter.pass_filter(p));
            if open {
                continue;
            }
            let a = self.nav_mesh.verts[poly.verts[j]];
            let b = self.nav_mesh.verts[poly.verts[(j + 1) % n]];
            segments.push([a[0], a[1], a[2], b[0], b[1], b[2]]);
        }
        Ok(segments)
    }
}

fn corner_flags(poly_type: PolyType) -> StraightPathFlags {
    if poly_type == PolyType::OffMeshConnection {
        StraightPathFlags::OFF_MESH_CONNECTION
    } else {
        StraightPathFlags::empty()
    }
}

/// Appends a straight path vertex, merging it with the previous one when they coincide.
/// Returns true when the output is full.
fn append_vertex(
    out: &mut Vec<StraightPathPoint>,
    pos: [f32; 3],
    flags: StraightPathFlags,
    poly: PolyRef,
    max_points: usize,
) -> bool {
    if let Some(last) = out.last_mut() {
        if vequal(&last.pos, &pos) {
            last.flags = flags;
            last.poly = poly;
            return out.len() >= max_points;
        }
    }
    out.push(StraightPathPoint { pos, flags, poly });
    out.len() >= max_points
}
