//! Navigation mesh and path queries for the navcrowd crowd simulation
//!
//! This crate provides the polygon navigation mesh that crowd agents move on:
//!
//! - [`NavMesh`]: convex polygons linked through shared edges plus off-mesh connections
//! - [`NavMeshBuilder`]: builds meshes from authored polygons
//! - [`NavMeshQuery`]: point location, sliced A*, string pulling, raycasts and
//!   surface-constrained movement
//! - [`PathQueue`]: time-sliced asynchronous path requests

mod nav_mesh;
mod nav_mesh_builder;
mod nav_mesh_query;
mod node_pool;
mod path_queue;
mod status;

#[cfg(test)]
pub(crate) mod test_mesh_helpers;

pub use nav_mesh::{
    Link, NavMesh, OffMeshConnection, Poly, PolyFlags, PolyRef, PolyType, MAX_AREAS,
    MAX_VERTS_PER_POLY, OFF_MESH_LINK_EDGE,
};
pub use nav_mesh_builder::NavMeshBuilder;
pub use nav_mesh_query::{
    NavMeshQuery, QueryFilter, RaycastHit, StraightPathFlags, StraightPathPoint, DEFAULT_MAX_NODES,
};
pub use path_queue::{PathQueue, PathQueueRef};
pub use status::{SlicedPathState, Status};
