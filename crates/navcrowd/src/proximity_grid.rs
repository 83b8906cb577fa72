//! Proximity grid for neighbour queries in crowd simulation
//!
//! A sparse 2D grid on the XZ plane. Items are registered with an axis-aligned
//! rectangle and stored in every cell the rectangle touches, so a query only has to
//! look at the cells overlapping the query rectangle.

use std::collections::HashMap;

/// Grid cell coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GridCoord {
    x: i32,
    z: i32,
}

/// Proximity grid for efficient spatial queries
#[derive(Debug, Clone)]
pub struct ProximityGrid {
    cell_size: f32,
    inv_cell_size: f32,
    cells: HashMap<GridCoord, Vec<usize>>,
    max_items: usize,
    item_count: usize,
    /// Registered cell range as `[min_x, min_z, max_x, max_z]`
    bounds: Option<[i32; 4]>,
}

impl ProximityGrid {
    /// Creates a grid holding at most `max_items` cell entries
    pub fn new(max_items: usize, cell_size: f32) -> Self {
        let cell_size = cell_size.max(0.01);
        Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            cells: HashMap::new(),
            max_items,
            item_count: 0,
            bounds: None,
        }
    }

    pub fn clear(&mut self) {
        // Cells used since the last clear keep their allocation, the rest are dropped
        self.cells.retain(|_, items| {
            let used = !items.is_empty();
            items.clear();
            used
        });
        self.item_count = 0;
        self.bounds = None;
    }

    /// Registers `id` in every cell overlapping the rectangle. Entries beyond the grid
    /// capacity are dropped.
    pub fn add_item(&mut self, id: usize, min_x: f32, min_z: f32, max_x: f32, max_z: f32) {
        let (imin, imax) = self.cell_range(min_x, min_z, max_x, max_z);

        for z in imin.z..=imax.z {
            for x in imin.x..=imax.x {
                if self.item_count >= self.max_items {
                    log::warn!("Proximity grid is full, dropping item {}", id);
                    return;
                }
                self.cells.entry(GridCoord { x, z }).or_default().push(id);
                self.item_count += 1;
            }
        }

        self.bounds = Some(match self.bounds {
            None => [imin.x, imin.z, imax.x, imax.z],
            Some(b) => [b[0].min(imin.x), b[1].min(imin.z), b[2].max(imax.x), b[3].max(imax.z)],
        });
    }

    /// Collects unique ids registered in cells overlapping the rectangle into `out`.
    ///
    /// Cells are visited row by row, so the output order only depends on the
    /// registration order. Returns the number of ids written, at most `max_ids`.
    pub fn query_items(
        &self,
        min_x: f32,
        min_z: f32,
        max_x: f32,
        max_z: f32,
        out: &mut Vec<usize>,
        max_ids: usize,
    ) -> usize {
        out.clear();
        let (imin, imax) = self.cell_range(min_x, min_z, max_x, max_z);

        for z in imin.z..=imax.z {
            for x in imin.x..=imax.x {
                let Some(items) = self.cells.get(&GridCoord { x, z }) else {
                    continue;
                };
                for &id in items {
                    if out.contains(&id) {
                        continue;
                    }
                    if out.len() >= max_ids {
                        return out.len();
                    }
                    out.push(id);
                }
            }
        }

        out.len()
    }

    /// Number of items registered in the cell containing world position `(x, z)`
    pub fn get_item_count_at(&self, x: f32, z: f32) -> usize {
        let coord = self.coord(x, z);
        self.cells.get(&coord).map_or(0, Vec::len)
    }

    /// Range of cells that hold items, as `[min_x, min_z, max_x, max_z]`
    pub fn get_bounds(&self) -> Option<[i32; 4]> {
        self.bounds
    }

    pub fn get_cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn get_item_count(&self) -> usize {
        self.item_count
    }

    fn coord(&self, x: f32, z: f32) -> GridCoord {
        GridCoord {
            x: (x * self.inv_cell_size).floor() as i32,
            z: (z * self.inv_cell_size).floor() as i32,
        }
    }

    fn cell_range(&self, min_x: f32, min_z: f32, max_x: f32, max_z: f32) -> (GridCoord, GridCoord) {
        (self.coord(min_x, min_z), self.coord(max_x, max_z))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_returns_unique_ids() {
        let mut grid = ProximityGrid::new(64, 1.0);
        // Spans four cells
        grid.add_item(7, 0.5, 0.5, 1.5, 1.5);
        grid.add_item(3, 0.2, 0.2, 0.4, 0.4);

        let mut out = Vec::new();
        let n = grid.query_items(0.0, 0.0, 2.0, 2.0, &mut out, 32);
        assert_eq!(n, 2);
        assert_eq!(out, vec![7, 3]);
    }

    #[test]
    fn test_query_respects_capacity() {
        let mut grid = ProximityGrid::new(64, 1.0);
        for id in 0..10 {
            grid.add_item(id, 0.1, 0.1, 0.2, 0.2);
        }
        let mut out = Vec::new();
        assert_eq!(grid.query_items(0.0, 0.0, 1.0, 1.0, &mut out, 4), 4);
        assert_eq!(out, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_query_outside_is_empty() {
        let mut grid = ProximityGrid::new(64, 2.0);
        grid.add_item(1, -1.0, -1.0, 1.0, 1.0);
        let mut out = Vec::new();
        assert_eq!(grid.query_items(10.0, 10.0, 12.0, 12.0, &mut out, 8), 0);
    }

    #[test]
    fn test_counts_bounds_and_clear() {
        let mut grid = ProximityGrid::new(64, 1.0);
        grid.add_item(1, -0.5, -0.5, 0.5, 0.5);
        assert_eq!(grid.get_item_count(), 4);
        assert_eq!(grid.get_item_count_at(0.2, 0.2), 1);
        assert_eq!(grid.get_item_count_at(-0.2, 0.2), 1);
        assert_eq!(grid.get_item_count_at(5.0, 5.0), 0);
        assert_eq!(grid.get_bounds(), Some([-1, -1, 0, 0]));

        grid.clear();
        assert_eq!(grid.get_item_count(), 0);
        assert_eq!(grid.get_item_count_at(0.2, 0.2), 0);
        assert_eq!(grid.get_bounds(), None);
    }

    #[test]
    fn test_clear_forgets_stale_cells() {
        let mut grid = ProximityGrid::new(64, 1.0);
        // One item walking across a long strip
        for step in 0..100 {
            let x = step as f32 * 1.5;
            grid.clear();
            grid.add_item(1, x, 0.1, x + 0.2, 0.3);
        }
        assert!(grid.cells.len() <= 2, "{} cells kept", grid.cells.len());
        assert_eq!(grid.get_item_count_at(148.6, 0.2), 1);

        grid.clear();
        grid.clear();
        assert!(grid.cells.is_empty());
    }

    #[test]
    fn test_full_grid_drops_items() {
        let mut grid = ProximityGrid::new(2, 1.0);
        grid.add_item(1, 0.1, 0.1, 0.2, 0.2);
        grid.add_item(2, 0.1, 0.1, 0.2, 0.2);
        grid.add_item(3, 0.1, 0.1, 0.2, 0.2);
        let mut out = Vec::new();
        grid.query_items(0.0, 0.0, 0.5, 0.5, &mut out, 8);
        assert_eq!(out, vec![1, 2]);
    }
}
