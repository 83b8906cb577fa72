//! Small navigation meshes shared by the unit tests

use crate::{NavMesh, NavMeshBuilder, PolyFlags};

/// Flat grid of `cols` x `rows` square cells at the origin. Cell `(x, z)` has
/// reference id `z * cols + x + 1`.
pub fn create_grid_mesh(cols: usize, rows: usize, cell_size: f32) -> NavMesh {
    NavMeshBuilder::grid([0.0; 3], cell_size, cols, rows)
        .build()
        .expect("grid mesh")
}

/// Two 4x4 squares separated by a 2 unit gap and joined by a bidirectional jump
/// from (3.5, 0, 2) to (6.5, 0, 2).
pub fn create_off_mesh_test_mesh() -> NavMesh {
    let mut b = NavMeshBuilder::new();
    add_square(&mut b, 0.0, 0.0, 4.0);
    add_square(&mut b, 6.0, 0.0, 4.0);
    b.add_off_mesh_connection(
        [3.5, 0.0, 2.0],
        [6.5, 0.0, 2.0],
        0.5,
        true,
        PolyFlags::JUMP,
        0,
    );
    b.build().expect("off-mesh test mesh")
}

/// Three unit cells forming an L: (0,0) -> (1,0) -> (1,1)
pub fn create_l_mesh() -> NavMesh {
    let mut b = NavMeshBuilder::new();
    let v: Vec<usize> = [
        [0.0, 0.0, 0.0],
        [0.0, 0.0, 1.0],
        [1.0, 0.0, 1.0],
        [1.0, 0.0, 0.0],
        [2.0, 0.0, 1.0],
        [2.0, 0.0, 0.0],
        [1.0, 0.0, 2.0],
        [2.0, 0.0, 2.0],
    ]
    .into_iter()
    .map(|p| b.add_vertex(p))
    .collect();
    b.add_polygon(&[v[0], v[1], v[2], v[3]], PolyFlags::WALK, 0);
    b.add_polygon(&[v[3], v[2], v[4], v[5]], PolyFlags::WALK, 0);
    b.add_polygon(&[v[2], v[6], v[7], v[4]], PolyFlags::WALK, 0);
    b.build().expect("L mesh")
}

/// Two connected cells at x in [0, 2] and a separate cell at x in [5, 6]
pub fn create_two_islands_mesh() -> NavMesh {
    let mut b = NavMeshBuilder::grid([0.0; 3], 1.0, 2, 1);
    add_square(&mut b, 5.0, 0.0, 1.0);
    b.build().expect("two islands mesh")
}

fn add_square(b: &mut NavMeshBuilder, x: f32, z: f32, size: f32) {
    let v0 = b.add_vertex([x, 0.0, z]);
    let v1 = b.add_vertex([x, 0.0, z + size]);
    let v2 = b.add_vertex([x + size, 0.0, z + size]);
    let v3 = b.add_vertex([x + size, 0.0, z]);
    b.add_polygon(&[v0, v1, v2, v3], PolyFlags::WALK, 0);
}
