//! Navigation mesh storage
//!
//! A `NavMesh` is a set of convex polygons connected through shared edges, plus
//! off-mesh connections stored as two-vertex polygons. Meshes are created with
//! [`NavMeshBuilder`](crate::NavMeshBuilder) and are immutable apart from poly flags.

use bitflags::bitflags;
use navcrowd_common::{
    closest_height_point_triangle, dist_point_segment_sqr_2d, distance_pt_poly_edges_sqr, vlerp,
    Error, Result,
};

use crate::Status;

/// Maximum number of vertices per polygon
pub const MAX_VERTS_PER_POLY: usize = 6;

/// Number of area ids a filter can assign costs to
pub const MAX_AREAS: usize = 64;

/// Link edge value used for links to off-mesh connections
pub const OFF_MESH_LINK_EDGE: u8 = 0xff;

/// Reference to a polygon in a navigation mesh. The null reference is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PolyRef(u32);

impl PolyRef {
    pub const NULL: PolyRef = PolyRef(0);

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u32 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32 + 1)
    }

    pub(crate) fn index(&self) -> Option<usize> {
        (self.0 as usize).checked_sub(1)
    }
}

impl std::fmt::Display for PolyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Polygon flags used by query filters
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PolyFlags: u16 {
        /// Ability to walk (ground, grass, road)
        const WALK = 0x01;
        /// Ability to swim (water)
        const SWIM = 0x02;
        /// Ability to move through doors
        const DOOR = 0x04;
        /// Ability to jump
        const JUMP = 0x08;
        /// Disabled polygon
        const DISABLED = 0x10;
    }
}

/// Polygon type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolyType {
    Ground,
    OffMeshConnection,
}

/// Connection from a polygon to a neighbour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    /// Neighbour polygon
    pub reference: PolyRef,
    /// Edge of the owning polygon the link crosses. For off-mesh connection polys this is
    /// 0 for the start vertex and 1 for the end vertex. Ground polys use
    /// [`OFF_MESH_LINK_EDGE`] for links to off-mesh connections.
    pub edge: u8,
}

#[derive(Debug, Clone)]
pub struct Poly {
    /// Vertex indices into the mesh vertex array
    pub verts: Vec<usize>,
    pub links: Vec<Link>,
    pub flags: PolyFlags,
    pub area: u8,
    pub poly_type: PolyType,
}

impl Poly {
    /// Neighbour across the given edge, if any
    pub fn neighbour(&self, edge: usize) -> Option<PolyRef> {
        self.links
            .iter()
            .find(|l| l.edge as usize == edge)
            .map(|l| l.reference)
    }
}

/// An off-mesh connection such as a ladder or a jump
#[derive(Debug, Clone)]
pub struct OffMeshConnection {
    pub start: [f32; 3],
    pub end: [f32; 3],
    pub radius: f32,
    pub bidirectional: bool,
    pub poly: PolyRef,
}

#[derive(Debug, Clone)]
pub struct NavMesh {
    pub(crate) verts: Vec<[f32; 3]>,
    pub(crate) polys: Vec<Poly>,
    pub(crate) poly_bounds: Vec<([f32; 3], [f32; 3])>,
    pub(crate) off_mesh_connections: Vec<OffMeshConnection>,
    pub(crate) bmin: [f32; 3],
    pub(crate) bmax: [f32; 3],
}

impl NavMesh {
    pub fn poly_count(&self) -> usize {
        self.polys.len()
    }

    pub fn bounds(&self) -> ([f32; 3], [f32; 3]) {
        (self.bmin, self.bmax)
    }

    /// Iterates over every polygon reference in the mesh
    pub fn poly_refs(&self) -> impl Iterator<Item = PolyRef> + '_ {
        (0..self.polys.len()).map(PolyRef::from_index)
    }

    pub fn is_valid_poly_ref(&self, poly_ref: PolyRef) -> bool {
        poly_ref.index().is_some_and(|i| i < self.polys.len())
    }

    pub fn poly(&self, poly_ref: PolyRef) -> Option<&Poly> {
        poly_ref.index().and_then(|i| self.polys.get(i))
    }

    pub(crate) fn poly_or_err(&self, poly_ref: PolyRef) -> Result<&Poly> {
        self.poly(poly_ref)
            .ok_or_else(|| Error::NavMesh(Status::InvalidParam.to_string()))
    }

    pub fn poly_bounds(&self, poly_ref: PolyRef) -> Option<([f32; 3], [f32; 3])> {
        poly_ref.index().and_then(|i| self.poly_bounds.get(i).copied())
    }

    /// World positions of a polygon's vertices
    pub fn poly_vertices(&self, poly_ref: PolyRef) -> Option<Vec<[f32; 3]>> {
        self.poly(poly_ref)
            .map(|p| p.verts.iter().map(|&v| self.verts[v]).collect())
    }

    pub fn poly_flags(&self, poly_ref: PolyRef) -> Option<PolyFlags> {
        self.poly(poly_ref).map(|p| p.flags)
    }

    pub fn set_poly_flags(&mut self, poly_ref: PolyRef, flags: PolyFlags) -> Result<()> {
        let idx = poly_ref
            .index()
            .filter(|&i| i < self.polys.len())
            .ok_or_else(|| Error::NavMesh(Status::InvalidParam.to_string()))?;
        self.polys[idx].flags = flags;
        Ok(())
    }

    pub fn off_mesh_connections(&self) -> &[OffMeshConnection] {
        &self.off_mesh_connections
    }

    pub fn off_mesh_connection(&self, poly_ref: PolyRef) -> Option<&OffMeshConnection> {
        self.off_mesh_connections.iter().find(|c| c.poly == poly_ref)
    }

    /// Returns the polygon centroid
    pub fn poly_center(&self, poly_ref: PolyRef) -> Result<[f32; 3]> {
        let poly = self.poly_or_err(poly_ref)?;
        let mut c = [0.0; 3];
        for &v in &poly.verts {
            let p = self.verts[v];
            c[0] += p[0];
            c[1] += p[1];
            c[2] += p[2];
        }
        let s = 1.0 / poly.verts.len() as f32;
        Ok([c[0] * s, c[1] * s, c[2] * s])
    }

    /// Height of the polygon surface below or above `pos`.
    ///
    /// Returns `None` when `pos` is outside the polygon on the XZ plane.
    pub fn poly_height(&self, poly_ref: PolyRef, pos: &[f32; 3]) -> Option<f32> {
        let poly = self.poly(poly_ref)?;
        if poly.poly_type == PolyType::OffMeshConnection {
            let a = self.verts[poly.verts[0]];
            let b = self.verts[poly.verts[1]];
            let (_, t) = dist_point_segment_sqr_2d(pos, &a, &b);
            return Some(a[1] + (b[1] - a[1]) * t);
        }

        let v0 = self.verts[poly.verts[0]];
        for w in poly.verts[1..].windows(2) {
            let h = closest_height_point_triangle(pos, &v0, &self.verts[w[0]], &self.verts[w[1]]);
            if h.is_some() {
                return h;
            }
        }
        None
    }

    /// Closest point on a polygon to `pos`, and whether `pos` was inside it on the XZ plane.
    pub fn closest_point_on_poly(
        &self,
        poly_ref: PolyRef,
        pos: &[f32; 3],
    ) -> Result<([f32; 3], bool)> {
        let poly = self.poly_or_err(poly_ref)?;
        let verts: Vec<[f32; 3]> = poly.verts.iter().map(|&v| self.verts[v]).collect();

        if poly.poly_type == PolyType::OffMeshConnection {
            let (_, t) = dist_point_segment_sqr_2d(pos, &verts[0], &verts[1]);
            return Ok((vlerp(&verts[0], &verts[1], t), false));
        }

        let (inside, edges) = distance_pt_poly_edges_sqr(pos, &verts);
        if inside {
            let h = self.poly_height(poly_ref, pos).unwrap_or(pos[1]);
            return Ok(([pos[0], h, pos[2]], true));
        }

        Ok((closest_on_edges(&verts, &edges), false))
    }

    /// Start and end points of an off-mesh connection, ordered for travel coming from `prev_ref`.
    pub fn off_mesh_connection_end_points(
        &self,
        prev_ref: PolyRef,
        con_ref: PolyRef,
    ) -> Result<([f32; 3], [f32; 3])> {
        let poly = self.poly_or_err(con_ref)?;
        if poly.poly_type != PolyType::OffMeshConnection {
            return Err(Error::NavMesh(Status::InvalidParam.to_string()));
        }

        let mut idx0 = 0;
        let mut idx1 = 1;
        if let Some(link) = poly.links.iter().find(|l| l.edge == 0) {
            if link.reference != prev_ref {
                idx0 = 1;
                idx1 = 0;
            }
        }

        Ok((self.verts[poly.verts[idx0]], self.verts[poly.verts[idx1]]))
    }
}

/// Closest point on a polygon outline given precomputed edge distances.
pub(crate) fn closest_on_edges(verts: &[[f32; 3]], edges: &[(f32, f32)]) -> [f32; 3] {
    let mut imin = 0;
    let mut dmin = f32::MAX;
    for (i, &(d, _)) in edges.iter().enumerate() {
        if d < dmin {
            dmin = d;
            imin = i;
        }
    }
    let va = &verts[imin];
    let vb = &verts[(imin + 1) % verts.len()];
    vlerp(va, vb, edges[imin].1)
}
