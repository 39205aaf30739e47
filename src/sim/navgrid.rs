//! Grid navigation mesh for the kinematic backend.
//!
//! Each level is a flat occupancy grid at a fixed height. Paths never leave
//! a level; there are no stairs.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use glam::{Vec2, Vec3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::rng::RngManager;

use super::{Pathfinder, ShortestPath};

/// Points within this vertical distance of a level's height belong to it.
const LEVEL_TOLERANCE: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cell {
    Floor,
    Wall,
    Object(u32),
}

impl Cell {
    pub fn is_walkable(self) -> bool {
        matches!(self, Cell::Floor)
    }
}

#[derive(Debug, Clone)]
pub struct Level {
    pub height: f32,
    /// World (x, z) of the corner of cell (0, 0).
    pub origin: Vec2,
    cols: usize,
    rows: usize,
    cells: Vec<Cell>,
}

impl Level {
    /// Parses an ASCII map: `.` floor, `#` wall, `2`-`9` semantic objects.
    /// Short rows are padded with walls.
    pub fn parse(height: f32, origin: Vec2, map: &str) -> Result<Self, String> {
        let lines: Vec<&str> = map
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .collect();
        let rows = lines.len();
        let cols = lines.iter().map(|line| line.len()).max().unwrap_or(0);
        if rows == 0 || cols == 0 {
            return Err("level map is empty".to_string());
        }

        let mut cells = vec![Cell::Wall; rows * cols];
        for (row, line) in lines.iter().enumerate() {
            for (col, ch) in line.chars().enumerate() {
                let cell = match ch {
                    '.' => Cell::Floor,
                    '#' | ' ' => Cell::Wall,
                    '2'..='9' => Cell::Object(ch as u32 - '0' as u32),
                    other => {
                        return Err(format!(
                            "unexpected map character '{other}' at row {row}, column {col}"
                        ))
                    }
                };
                cells[row * cols + col] = cell;
            }
        }

        Ok(Self {
            height,
            origin,
            cols,
            rows,
            cells,
        })
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cell(&self, col: i64, row: i64) -> Cell {
        if col < 0 || row < 0 || col as usize >= self.cols || row as usize >= self.rows {
            return Cell::Wall;
        }
        self.cells[row as usize * self.cols + col as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub distance: f32,
    pub cell: Cell,
}

pub struct NavGrid {
    cell_size: f32,
    levels: Vec<Level>,
    walkable: Vec<(usize, usize, usize)>,
    rng: ChaCha8Rng,
}

impl NavGrid {
    pub fn new(cell_size: f32, levels: Vec<Level>) -> Result<Self, String> {
        if !cell_size.is_finite() || cell_size <= 0.0 {
            return Err(format!("cell_size must be positive, got {cell_size}"));
        }
        let mut walkable = Vec::new();
        for (index, level) in levels.iter().enumerate() {
            for row in 0..level.rows {
                for col in 0..level.cols {
                    if level.cells[row * level.cols + col].is_walkable() {
                        walkable.push((index, col, row));
                    }
                }
            }
        }
        if walkable.is_empty() {
            return Err("scene has no navigable cells".to_string());
        }
        Ok(Self {
            cell_size,
            levels,
            walkable,
            rng: ChaCha8Rng::seed_from_u64(0),
        })
    }

    pub fn seed(&mut self, seed: u64) {
        self.rng = RngManager::new(seed).fork("navigation");
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn navigable_cell_count(&self) -> usize {
        self.walkable.len()
    }

    /// Index of the level closest in height to `point`, if any is in range.
    pub fn level_of(&self, point: Vec3) -> Option<usize> {
        self.levels
            .iter()
            .enumerate()
            .map(|(index, level)| (index, (level.height - point.y).abs()))
            .filter(|(_, dy)| *dy <= LEVEL_TOLERANCE)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(index, _)| index)
    }

    pub fn cell_coords(&self, level: usize, point: Vec3) -> (i64, i64) {
        let origin = self.levels[level].origin;
        (
            ((point.x - origin.x) / self.cell_size).floor() as i64,
            ((point.z - origin.y) / self.cell_size).floor() as i64,
        )
    }

    pub fn cell_center(&self, level: usize, col: i64, row: i64) -> Vec3 {
        let lvl = &self.levels[level];
        Vec3::new(
            lvl.origin.x + (col as f32 + 0.5) * self.cell_size,
            lvl.height,
            lvl.origin.y + (row as f32 + 0.5) * self.cell_size,
        )
    }

    /// Walks the grid from `origin` along `direction` (both in the x/z plane)
    /// and reports the first non-floor cell within `max_distance`.
    pub fn raycast(
        &self,
        level: usize,
        origin: Vec2,
        direction: Vec2,
        max_distance: f32,
    ) -> Option<RayHit> {
        let lvl = &self.levels[level];
        let dir = direction.normalize_or_zero();
        if dir == Vec2::ZERO {
            return None;
        }
        let gx = (origin.x - lvl.origin.x) / self.cell_size;
        let gz = (origin.y - lvl.origin.y) / self.cell_size;
        let mut col = gx.floor() as i64;
        let mut row = gz.floor() as i64;

        let delta_x = if dir.x == 0.0 { f32::INFINITY } else { (1.0 / dir.x).abs() };
        let delta_z = if dir.y == 0.0 { f32::INFINITY } else { (1.0 / dir.y).abs() };
        let (step_x, mut side_x) = if delta_x.is_infinite() {
            (0, f32::INFINITY)
        } else if dir.x < 0.0 {
            (-1, (gx - col as f32) * delta_x)
        } else {
            (1, (col as f32 + 1.0 - gx) * delta_x)
        };
        let (step_z, mut side_z) = if delta_z.is_infinite() {
            (0, f32::INFINITY)
        } else if dir.y < 0.0 {
            (-1, (gz - row as f32) * delta_z)
        } else {
            (1, (row as f32 + 1.0 - gz) * delta_z)
        };

        let max_cells = max_distance / self.cell_size;
        loop {
            let travelled = if side_x < side_z {
                let t = side_x;
                side_x += delta_x;
                col += step_x;
                t
            } else {
                let t = side_z;
                side_z += delta_z;
                row += step_z;
                t
            };
            if travelled > max_cells {
                return None;
            }
            let cell = lvl.cell(col, row);
            if !cell.is_walkable() {
                return Some(RayHit {
                    distance: travelled * self.cell_size,
                    cell,
                });
            }
        }
    }

    fn astar(&self, level: usize, start: (i64, i64), goal: (i64, i64)) -> Option<Vec<(i64, i64)>> {
        let lvl = &self.levels[level];
        let cols = lvl.cols as i64;
        let index = |(c, r): (i64, i64)| (r * cols + c) as usize;
        let heuristic = |(c, r): (i64, i64)| {
            let dx = (c - goal.0).abs() as f32;
            let dz = (r - goal.1).abs() as f32;
            dx.max(dz) + (std::f32::consts::SQRT_2 - 1.0) * dx.min(dz)
        };

        let mut best = vec![f32::INFINITY; lvl.cells.len()];
        let mut came_from: Vec<Option<(i64, i64)>> = vec![None; lvl.cells.len()];
        let mut open = BinaryHeap::new();
        best[index(start)] = 0.0;
        open.push(OpenNode {
            estimate: heuristic(start),
            cost: 0.0,
            cell: start,
        });

        while let Some(OpenNode { cost, cell, .. }) = open.pop() {
            if cell == goal {
                let mut path = vec![cell];
                let mut cursor = cell;
                while let Some(previous) = came_from[index(cursor)] {
                    path.push(previous);
                    cursor = previous;
                }
                path.reverse();
                return Some(path);
            }
            if cost > best[index(cell)] {
                continue;
            }
            for dc in -1..=1_i64 {
                for dr in -1..=1_i64 {
                    if dc == 0 && dr == 0 {
                        continue;
                    }
                    let next = (cell.0 + dc, cell.1 + dr);
                    if !lvl.cell(next.0, next.1).is_walkable() {
                        continue;
                    }
                    let diagonal = dc != 0 && dr != 0;
                    if diagonal
                        && !(lvl.cell(cell.0 + dc, cell.1).is_walkable()
                            && lvl.cell(cell.0, cell.1 + dr).is_walkable())
                    {
                        continue;
                    }
                    let step = if diagonal { std::f32::consts::SQRT_2 } else { 1.0 };
                    let next_cost = cost + step;
                    if next_cost < best[index(next)] {
                        best[index(next)] = next_cost;
                        came_from[index(next)] = Some(cell);
                        open.push(OpenNode {
                            estimate: next_cost + heuristic(next),
                            cost: next_cost,
                            cell: next,
                        });
                    }
                }
            }
        }
        None
    }
}

impl Pathfinder for NavGrid {
    fn random_navigable_point(&mut self) -> Vec3 {
        let pick = self.rng.gen_range(0..self.walkable.len());
        let (level, col, row) = self.walkable[pick];
        self.cell_center(level, col as i64, row as i64)
    }

    fn find_path(&self, path: &mut ShortestPath) -> bool {
        path.points.clear();
        path.geodesic_distance = f32::INFINITY;

        let (Some(level), Some(end_level)) = (
            self.level_of(path.requested_start),
            self.level_of(path.requested_end),
        ) else {
            return false;
        };
        if level != end_level {
            return false;
        }
        let start = self.cell_coords(level, path.requested_start);
        let goal = self.cell_coords(level, path.requested_end);
        let lvl = &self.levels[level];
        if !lvl.cell(start.0, start.1).is_walkable() || !lvl.cell(goal.0, goal.1).is_walkable() {
            return false;
        }
        let Some(cells) = self.astar(level, start, goal) else {
            return false;
        };

        let mut points = Vec::with_capacity(cells.len() + 1);
        points.push(path.requested_start);
        if cells.len() > 2 {
            for &(col, row) in &cells[1..cells.len() - 1] {
                points.push(self.cell_center(level, col, row));
            }
        }
        points.push(path.requested_end);
        path.geodesic_distance = points
            .windows(2)
            .map(|pair| pair[0].distance(pair[1]))
            .sum();
        path.points = points;
        true
    }

    fn is_navigable(&self, point: Vec3) -> bool {
        let Some(level) = self.level_of(point) else {
            return false;
        };
        let (col, row) = self.cell_coords(level, point);
        self.levels[level].cell(col, row).is_walkable()
    }
}

struct OpenNode {
    estimate: f32,
    cost: f32,
    cell: (i64, i64),
}

impl PartialEq for OpenNode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OpenNode {}

impl PartialOrd for OpenNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenNode {
    // Reversed so the max-heap pops the lowest estimate first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .estimate
            .total_cmp(&self.estimate)
            .then_with(|| other.cell.cmp(&self.cell))
    }
}
