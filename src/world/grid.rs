use crate::entities::entity::EntityId;
use crate::world::position::Position;
use std::collections::HashMap;

/// Uniform cell index over entity positions. Callers rely only on the
/// distance-query contract; cell geometry is an implementation detail.
#[derive(Debug)]
pub struct SpatialGrid {
    cell_size: f32,
    cells: HashMap<(i32, i32), Vec<EntityId>>,
    positions: HashMap<EntityId, Position>,
}

impl SpatialGrid {
    pub fn new(cell_size: f32) -> Self {
        let cell_size = if cell_size > 0.0 { cell_size } else { 16.0 };
        Self {
            cell_size,
            cells: HashMap::new(),
            positions: HashMap::new(),
        }
    }

    fn cell_of(&self, position: Position) -> (i32, i32) {
        (
            (position.x / self.cell_size).floor() as i32,
            (position.y / self.cell_size).floor() as i32,
        )
    }

    pub fn insert(&mut self, id: EntityId, position: Position) {
        self.remove(id);
        let cell = self.cell_of(position);
        self.cells.entry(cell).or_default().push(id);
        self.positions.insert(id, position);
    }

    pub fn remove(&mut self, id: EntityId) {
        let Some(position) = self.positions.remove(&id) else {
            return;
        };
        let cell = self.cell_of(position);
        if let Some(bucket) = self.cells.get_mut(&cell) {
            bucket.retain(|entry| *entry != id);
            if bucket.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }

    pub fn relocate(&mut self, id: EntityId, position: Position) {
        self.insert(id, position);
    }

    pub fn position_of(&self, id: EntityId) -> Option<Position> {
        self.positions.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// All entities within `radius` of `center`, excluding none. Order is
    /// unspecified.
    pub fn query_range(&self, center: Position, radius: f32) -> Vec<EntityId> {
        let mut found = Vec::new();
        if radius <= 0.0 {
            return found;
        }
        let span = (radius / self.cell_size).ceil() as i32;
        let origin = self.cell_of(center);
        for cx in (origin.0 - span)..=(origin.0 + span) {
            for cy in (origin.1 - span)..=(origin.1 + span) {
                let Some(bucket) = self.cells.get(&(cx, cy)) else {
                    continue;
                };
                for id in bucket {
                    let Some(position) = self.positions.get(id) else {
                        continue;
                    };
                    if center.within_radius(*position, radius) {
                        found.push(*id);
                    }
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_query_finds_only_entities_in_radius() {
        let mut grid = SpatialGrid::new(16.0);
        grid.insert(EntityId(1), Position::new(0.0, 0.0, 0.0));
        grid.insert(EntityId(2), Position::new(10.0, 0.0, 0.0));
        grid.insert(EntityId(3), Position::new(100.0, 0.0, 0.0));

        let mut found = grid.query_range(Position::new(0.0, 0.0, 0.0), 20.0);
        found.sort_by_key(|id| id.0);
        assert_eq!(found, vec![EntityId(1), EntityId(2)]);
    }

    #[test]
    fn relocate_moves_entity_between_cells() {
        let mut grid = SpatialGrid::new(16.0);
        grid.insert(EntityId(1), Position::new(0.0, 0.0, 0.0));
        grid.relocate(EntityId(1), Position::new(200.0, 200.0, 0.0));

        assert!(grid
            .query_range(Position::new(0.0, 0.0, 0.0), 50.0)
            .is_empty());
        let found = grid.query_range(Position::new(200.0, 200.0, 0.0), 1.0);
        assert_eq!(found, vec![EntityId(1)]);
        assert_eq!(grid.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut grid = SpatialGrid::new(16.0);
        grid.insert(EntityId(7), Position::new(5.0, 5.0, 0.0));
        grid.remove(EntityId(7));
        grid.remove(EntityId(7));
        assert!(grid.is_empty());
    }
}
