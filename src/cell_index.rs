use geo::Coord;
use log::{debug, trace};
use std::collections::{BTreeSet, HashMap};

use crate::geometry::{Region, meters_to_lat_delta, meters_to_lon_delta};
use crate::observer::ContainerEvent;
use crate::segments::{ContainerId, SegmentStore};

/// One fixed-size bucket of the working region
#[derive(Debug, Clone)]
pub struct Cell {
    pub column: usize,
    pub row: usize,
    pub bounds: Region,
    /// `bounds` grown by the search buffer
    pub expanded: Region,
    containers: BTreeSet<ContainerId>,
}

impl Cell {
    pub fn containers(&self) -> impl Iterator<Item = &ContainerId> {
        self.containers.iter()
    }
}

/// Grid of cells holding the network containers overlapping them.
///
/// Containers reaching outside the grid are kept on an overflow list that
/// every lookup returns, so the lookup never misses a container a full scan
/// would find.
#[derive(Debug)]
pub struct CellIndex {
    origin: Coord<f64>,
    cell_width: f64,
    cell_height: f64,
    columns: usize,
    rows: usize,
    search_buffer: f64,
    grid: Region,
    cells: Vec<Cell>,
    memberships: HashMap<ContainerId, Vec<usize>>,
    bounds: HashMap<ContainerId, Region>,
    overflow: BTreeSet<ContainerId>,
}

impl CellIndex {
    /// Tiles `bounds`, grown by `search_buffer` meters, into cells of
    /// `cell_size` meters
    pub fn new(bounds: Region, cell_size: f64, search_buffer: f64) -> Self {
        let area = bounds.buffered(search_buffer);
        let lat = area.centroid().y;
        let cell_width = meters_to_lon_delta(cell_size, lat);
        let cell_height = meters_to_lat_delta(cell_size);
        let columns = ((area.width() / cell_width).ceil() as usize).max(1);
        let rows = ((area.height() / cell_height).ceil() as usize).max(1);
        let origin = area.min();

        let edge = |i: usize, start: f64, size: f64| start + i as f64 * size;
        let mut cells = Vec::with_capacity(columns * rows);
        for row in 0..rows {
            for column in 0..columns {
                let cell_bounds = Region::new(
                    Coord {
                        x: edge(column, origin.x, cell_width),
                        y: edge(row, origin.y, cell_height),
                    },
                    Coord {
                        x: edge(column + 1, origin.x, cell_width),
                        y: edge(row + 1, origin.y, cell_height),
                    },
                );
                cells.push(Cell {
                    column,
                    row,
                    bounds: cell_bounds,
                    expanded: cell_bounds.buffered(search_buffer),
                    containers: BTreeSet::new(),
                });
            }
        }
        let grid = Region::new(
            origin,
            Coord {
                x: edge(columns, origin.x, cell_width),
                y: edge(rows, origin.y, cell_height),
            },
        );
        debug!(
            "Cell index with {}x{} cells of {} m over {:?}",
            columns,
            rows,
            cell_size,
            grid.rect()
        );

        Self {
            origin,
            cell_width,
            cell_height,
            columns,
            rows,
            search_buffer,
            grid,
            cells,
            memberships: HashMap::new(),
            bounds: HashMap::new(),
            overflow: BTreeSet::new(),
        }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn grid_bounds(&self) -> Region {
        self.grid
    }

    pub fn contains(&self, id: ContainerId) -> bool {
        self.bounds.contains_key(&id)
    }

    pub fn container_count(&self) -> usize {
        self.bounds.len()
    }

    /// Column/row span of cells that may touch `region`, padded by one cell
    fn span(&self, region: &Region) -> Option<(usize, usize, usize, usize)> {
        let min = region.min();
        let max = region.max();
        let col = |x: f64| ((x - self.origin.x) / self.cell_width).floor() as i64;
        let row = |y: f64| ((y - self.origin.y) / self.cell_height).floor() as i64;
        let (c0, c1) = (col(min.x) - 1, col(max.x) + 1);
        let (r0, r1) = (row(min.y) - 1, row(max.y) + 1);
        let (columns, rows) = (self.columns as i64, self.rows as i64);
        if c1 < 0 || r1 < 0 || c0 >= columns || r0 >= rows {
            return None;
        }
        Some((
            c0.max(0) as usize,
            c1.min(columns - 1) as usize,
            r0.max(0) as usize,
            r1.min(rows - 1) as usize,
        ))
    }

    fn cells_in_span(&self, region: &Region) -> Vec<usize> {
        let Some((c0, c1, r0, r1)) = self.span(region) else {
            return Vec::new();
        };
        let mut indices = Vec::new();
        for row in r0..=r1 {
            for column in c0..=c1 {
                indices.push(row * self.columns + column);
            }
        }
        indices
    }

    pub fn add_container(&mut self, id: ContainerId, bounds: Region) {
        if self.contains(id) {
            self.remove_container(id);
        }
        let members: Vec<usize> = self
            .cells_in_span(&bounds)
            .into_iter()
            .filter(|i| self.cells[*i].bounds.intersects(&bounds))
            .collect();
        for i in &members {
            self.cells[*i].containers.insert(id);
        }
        let inside = self.grid.contains(bounds.min()) && self.grid.contains(bounds.max());
        if !inside {
            self.overflow.insert(id);
        }
        trace!(
            "Container {:?} added to {} cells{}",
            id,
            members.len(),
            if inside { "" } else { " and overflow" }
        );
        self.memberships.insert(id, members);
        self.bounds.insert(id, bounds);
    }

    pub fn remove_container(&mut self, id: ContainerId) -> bool {
        let Some(members) = self.memberships.remove(&id) else {
            return false;
        };
        for i in members {
            self.cells[i].containers.remove(&id);
        }
        self.overflow.remove(&id);
        self.bounds.remove(&id);
        true
    }

    /// Containers of every cell whose expanded box intersects `query`, plus
    /// the overflow list; sorted and de-duplicated
    pub fn candidates(&self, query: &Region) -> Vec<ContainerId> {
        let padded = query.buffered(self.search_buffer);
        let mut found: BTreeSet<ContainerId> = self.overflow.clone();
        for i in self.cells_in_span(&padded) {
            let cell = &self.cells[i];
            if cell.expanded.intersects(query) {
                found.extend(cell.containers.iter().copied());
            }
        }
        found.into_iter().collect()
    }

    /// [`Self::candidates`] narrowed to containers whose own bounds
    /// intersect `query`
    pub fn candidate_containers(&self, query: &Region) -> Vec<ContainerId> {
        self.candidates(query)
            .into_iter()
            .filter(|id| self.bounds.get(id).is_some_and(|b| b.intersects(query)))
            .collect()
    }

    /// Keeps the index in step with container changes
    pub fn handle_event(&mut self, event: &ContainerEvent, store: &SegmentStore) {
        match event {
            ContainerEvent::Split {
                original, results, ..
            } => {
                self.remove_container(*original);
                for id in results {
                    if let Some(container) = store.container(*id) {
                        self.add_container(*id, container.search_bounds());
                    }
                }
            }
            ContainerEvent::NodeInserted { container, .. } => {
                if let Some(c) = store.container(*container) {
                    self.add_container(*container, c.search_bounds());
                }
            }
            ContainerEvent::Removed { container, .. } => {
                self.remove_container(*container);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn region(x0: f64, y0: f64, x1: f64, y1: f64) -> Region {
        Region::new(Coord { x: x0, y: y0 }, Coord { x: x1, y: y1 })
    }

    fn random_region(rng: &mut StdRng, extent: f64, max_size: f64) -> Region {
        let x = rng.random_range(-extent..extent);
        let y = rng.random_range(-extent..extent);
        let w = rng.random_range(0.0..max_size);
        let h = rng.random_range(0.0..max_size);
        region(4.0 + x, 50.0 + y, 4.0 + x + w, 50.0 + y + h)
    }

    #[test]
    fn test_lookup_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(7);
        let working = region(3.99, 49.99, 4.01, 50.01);
        let mut index = CellIndex::new(working, 250.0, 20.0);
        assert!(index.cells().len() > 4);

        // part of the ways hang out of the grid
        let ways: Vec<(ContainerId, Region)> = (0..300)
            .map(|i| (ContainerId(i), random_region(&mut rng, 0.012, 0.003)))
            .collect();
        for (id, bounds) in &ways {
            index.add_container(*id, *bounds);
        }
        for (id, _) in ways.iter().step_by(7) {
            index.remove_container(*id);
        }
        let live: Vec<&(ContainerId, Region)> =
            ways.iter().filter(|(id, _)| index.contains(*id)).collect();

        for _ in 0..500 {
            let query = random_region(&mut rng, 0.015, 0.002);
            let mut expected: Vec<ContainerId> = live
                .iter()
                .filter(|(_, b)| b.intersects(&query))
                .map(|(id, _)| *id)
                .collect();
            expected.sort();
            assert_eq!(index.candidate_containers(&query), expected);
        }
    }

    #[test]
    fn test_cells_expand_by_buffer() {
        let index = CellIndex::new(region(4.0, 50.0, 4.01, 50.01), 500.0, 20.0);
        for cell in index.cells() {
            assert!(cell.expanded.width() > cell.bounds.width());
            assert!(cell.expanded.height() > cell.bounds.height());
            assert!(cell.expanded.contains(cell.bounds.min()));
        }
        let grid = index.grid_bounds();
        assert!(grid.contains(Coord { x: 4.0, y: 50.0 }));
        assert!(grid.contains(Coord { x: 4.01, y: 50.01 }));
    }

    #[test]
    fn test_readd_replaces_membership() {
        let mut index = CellIndex::new(region(4.0, 50.0, 4.02, 50.02), 300.0, 10.0);
        let id = ContainerId(1);
        index.add_container(id, region(4.001, 50.001, 4.002, 50.002));
        index.add_container(id, region(4.015, 50.015, 4.016, 50.016));
        assert_eq!(index.container_count(), 1);
        assert!(
            index
                .candidate_containers(&region(4.001, 50.001, 4.002, 50.002))
                .is_empty()
        );
        assert_eq!(
            index.candidate_containers(&region(4.0155, 50.0155, 4.0156, 50.0156)),
            vec![id]
        );
        assert!(index.remove_container(id));
        assert!(!index.remove_container(id));
    }
}
