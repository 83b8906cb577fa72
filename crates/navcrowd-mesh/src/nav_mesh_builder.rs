//! Navigation mesh construction from authored convex polygons

use std::collections::HashMap;

use navcrowd_common::{poly_area_2d, vmax, vmin, Error, Result};

use crate::nav_mesh::{
    Link, NavMesh, OffMeshConnection, Poly, PolyFlags, PolyRef, PolyType, MAX_AREAS,
    MAX_VERTS_PER_POLY, OFF_MESH_LINK_EDGE,
};

#[derive(Debug, Clone)]
struct PolyDef {
    verts: Vec<usize>,
    flags: PolyFlags,
    area: u8,
}

#[derive(Debug, Clone)]
struct OffMeshDef {
    start: [f32; 3],
    end: [f32; 3],
    radius: f32,
    bidirectional: bool,
    flags: PolyFlags,
    area: u8,
}

/// Builds a [`NavMesh`] from vertices, convex polygons and off-mesh connections.
///
/// Polygons that share an edge must reference the same vertex indices for that edge;
/// the builder links them automatically. Winding is normalized on build.
#[derive(Debug, Clone, Default)]
pub struct NavMeshBuilder {
    verts: Vec<[f32; 3]>,
    polys: Vec<PolyDef>,
    off_mesh: Vec<OffMeshDef>,
}

impl NavMeshBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder holding a flat grid of `cols` x `rows` square cells.
    pub fn grid(origin: [f32; 3], cell_size: f32, cols: usize, rows: usize) -> Self {
        let mut builder = Self::new();
        for z in 0..=rows {
            for x in 0..=cols {
                builder.add_vertex([
                    origin[0] + x as f32 * cell_size,
                    origin[1],
                    origin[2] + z as f32 * cell_size,
                ]);
            }
        }

        let stride = cols + 1;
        for z in 0..rows {
            for x in 0..cols {
                let v = z * stride + x;
                builder.add_polygon(&[v, v + stride, v + stride + 1, v + 1], PolyFlags::WALK, 0);
            }
        }
        builder
    }

    pub fn add_vertex(&mut self, pos: [f32; 3]) -> usize {
        self.verts.push(pos);
        self.verts.len() - 1
    }

    /// Adds a convex polygon and returns its index. Reference ids are `index + 1`.
    pub fn add_polygon(&mut self, verts: &[usize], flags: PolyFlags, area: u8) -> usize {
        self.polys.push(PolyDef {
            verts: verts.to_vec(),
            flags,
            area,
        });
        self.polys.len() - 1
    }

    /// Adds an off-mesh connection. Its endpoints are attached to the nearest polygons
    /// within `radius` when the mesh is built.
    pub fn add_off_mesh_connection(
        &mut self,
        start: [f32; 3],
        end: [f32; 3],
        radius: f32,
        bidirectional: bool,
        flags: PolyFlags,
        area: u8,
    ) -> usize {
        self.off_mesh.push(OffMeshDef {
            start,
            end,
            radius,
            bidirectional,
            flags,
            area,
        });
        self.off_mesh.len() - 1
    }

    pub fn build(self) -> Result<NavMesh> {
        if self.polys.is_empty() {
            return Err(Error::InvalidParam("navigation mesh has no polygons".into()));
        }

        let mut polys = Vec::with_capacity(self.polys.len() + self.off_mesh.len());
        for (i, def) in self.polys.iter().enumerate() {
            polys.push(self.validate_poly(i, def)?);
        }

        link_shared_edges(&mut polys);

        let mut mesh = NavMesh {
            verts: self.verts,
            polys,
            poly_bounds: Vec::new(),
            off_mesh_connections: Vec::new(),
            bmin: [f32::MAX; 3],
            bmax: [f32::MIN; 3],
        };
        mesh.poly_bounds = mesh
            .polys
            .iter()
            .map(|p| poly_bounds(&mesh.verts, &p.verts))
            .collect();

        for def in &self.off_mesh {
            attach_off_mesh_connection(&mut mesh, def)?;
        }

        for (bmin, bmax) in &mesh.poly_bounds {
            mesh.bmin = vmin(&mesh.bmin, bmin);
            mesh.bmax = vmax(&mesh.bmax, bmax);
        }

        log::debug!(
            "Built navigation mesh: {} vertices, {} polygons, {} off-mesh connections",
            mesh.verts.len(),
            mesh.polys.len(),
            mesh.off_mesh_connections.len()
        );

        Ok(mesh)
    }

    fn validate_poly(&self, index: usize, def: &PolyDef) -> Result<Poly> {
        if def.verts.len() < 3 || def.verts.len() > MAX_VERTS_PER_POLY {
            return Err(Error::InvalidParam(format!(
                "polygon {} has {} vertices, expected 3..={}",
                index,
                def.verts.len(),
                MAX_VERTS_PER_POLY
            )));
        }
        if let Some(&bad) = def.verts.iter().find(|&&v| v >= self.verts.len()) {
            return Err(Error::InvalidParam(format!(
                "polygon {} references missing vertex {}",
                index, bad
            )));
        }
        if def.area as usize >= MAX_AREAS {
            return Err(Error::InvalidParam(format!(
                "polygon {} uses area {} (max {})",
                index,
                def.area,
                MAX_AREAS - 1
            )));
        }

        let positions: Vec<[f32; 3]> = def.verts.iter().map(|&v| self.verts[v]).collect();
        let area = poly_area_2d(&positions);
        if area.abs() < 1e-6 {
            return Err(Error::InvalidParam(format!("polygon {} is degenerate", index)));
        }

        let mut verts = def.verts.clone();
        if area < 0.0 {
            verts.reverse();
        }

        Ok(Poly {
            verts,
            links: Vec::new(),
            flags: def.flags,
            area: def.area,
            poly_type: PolyType::Ground,
        })
    }
}

fn link_shared_edges(polys: &mut [Poly]) {
    let mut edges: HashMap<(usize, usize), (usize, usize)> = HashMap::new();
    let mut pairs = Vec::new();

    for (pi, poly) in polys.iter().enumerate() {
        let n = poly.verts.len();
        for e in 0..n {
            let a = poly.verts[e];
            let b = poly.verts[(e + 1) % n];
            let key = (a.min(b), a.max(b));
            match edges.get(&key) {
                Some(&(other, other_edge)) => pairs.push(((pi, e), (other, other_edge))),
                None => {
                    edges.insert(key, (pi, e));
                }
            }
        }
    }

    for ((pa, ea), (pb, eb)) in pairs {
        polys[pa].links.push(Link {
            reference: PolyRef::from_index(pb),
            edge: ea as u8,
        });
        polys[pb].links.push(Link {
            reference: PolyRef::from_index(pa),
            edge: eb as u8,
        });
    }
}

fn poly_bounds(verts: &[[f32; 3]], indices: &[usize]) -> ([f32; 3], [f32; 3]) {
    let mut bmin = [f32::MAX; 3];
    let mut bmax = [f32::MIN; 3];
    for &v in indices {
        bmin = vmin(&bmin, &verts[v]);
        bmax = vmax(&bmax, &verts[v]);
    }
    (bmin, bmax)
}

/// Nearest ground polygon within `radius` of `pos` on the XZ plane.
fn nearest_ground_poly(mesh: &NavMesh, pos: &[f32; 3], radius: f32) -> Option<(PolyRef, [f32; 3])> {
    let mut best = None;
    let mut best_dist = radius * radius;
    for (i, poly) in mesh.polys.iter().enumerate() {
        if poly.poly_type != PolyType::Ground {
            continue;
        }
        let r = PolyRef::from_index(i);
        let Ok((pt, _)) = mesh.closest_point_on_poly(r, pos) else {
            continue;
        };
        let dx = pt[0] - pos[0];
        let dz = pt[2] - pos[2];
        let d = dx * dx + dz * dz;
        if d <= best_dist {
            best_dist = d;
            best = Some((r, pt));
        }
    }
    best
}

fn attach_off_mesh_connection(mesh: &mut NavMesh, def: &OffMeshDef) -> Result<()> {
    let (start_ref, start) = nearest_ground_poly(mesh, &def.start, def.radius).ok_or_else(|| {
        Error::InvalidParam(format!(
            "off-mesh connection start {:?} is not on the navigation mesh",
            def.start
        ))
    })?;
    let (end_ref, end) = nearest_ground_poly(mesh, &def.end, def.radius).ok_or_else(|| {
        Error::InvalidParam(format!(
            "off-mesh connection end {:?} is not on the navigation mesh",
            def.end
        ))
    })?;

    let v0 = mesh.verts.len();
    mesh.verts.push(start);
    mesh.verts.push(end);

    let con_ref = PolyRef::from_index(mesh.polys.len());
    mesh.polys.push(Poly {
        verts: vec![v0, v0 + 1],
        links: vec![
            Link {
                reference: start_ref,
                edge: 0,
            },
            Link {
                reference: end_ref,
                edge: 1,
            },
        ],
        flags: def.flags,
        area: def.area,
        poly_type: PolyType::OffMeshConnection,
    });
    mesh.poly_bounds.push(poly_bounds(&mesh.verts, &[v0, v0 + 1]));

    let link = Link {
        reference: con_ref,
        edge: OFF_MESH_LINK_EDGE,
    };
    if let Some(i) = start_ref.index() {
        mesh.polys[i].links.push(link);
    }
    if def.bidirectional {
        if let Some(i) = end_ref.index() {
            mesh.polys[i].links.push(link);
        }
    }

    mesh.off_mesh_connections.push(OffMeshConnection {
        start,
        end,
        radius: def.radius,
        bidirectional: def.bidirectional,
        poly: con_ref,
    });
    Ok(())
}
