//! A* search inside a single tile.
use bevy::math::IVec2;
use indexmap::map::Entry::{Occupied, Vacant};
use ndarray::ArrayView2;
use std::collections::BinaryHeap;

use crate::{
    dir::Dir,
    path::Path,
    point::{chebyshev, in_tile},
    FxIndexMap, SmallestCostHolder, BLOCKED,
};

#[inline]
pub(crate) fn cost_at(costs: &ArrayView2<u8>, cell: IVec2) -> u8 {
    costs[[cell.x as usize, cell.y as usize]]
}

/// Movement cost of stepping from `from` in direction `dir`.
///
/// An orthogonal step costs the destination cell's value. A diagonal step adds a
/// quarter of the two cut cells' sum and is refused if either of them is blocked.
/// Returns `None` if the destination is outside the grid or blocked.
pub(crate) fn step_cost(costs: &ArrayView2<u8>, from: IVec2, dir: Dir) -> Option<u32> {
    let (w, h) = costs.dim();
    let to = from + dir.offset();
    if to.x < 0 || to.y < 0 || to.x as usize >= w || to.y as usize >= h {
        return None;
    }

    let dest = cost_at(costs, to);
    if dest == BLOCKED {
        return None;
    }

    match dir.corner_offsets() {
        None => Some(dest as u32),
        Some((a, b)) => {
            let c1 = cost_at(costs, from + a);
            let c2 = cost_at(costs, from + b);
            if c1 == BLOCKED || c2 == BLOCKED {
                return None;
            }
            Some(dest as u32 + (c1 as u32 + c2 as u32) / 4)
        }
    }
}

/// 8-directional A* between two cells of one tile's cost grid.
///
/// Uses the Chebyshev distance as the heuristic, which never overestimates because every
/// step costs at least 1. Returns `None` if the goal is blocked or unreachable.
pub(crate) fn astar_grid(costs: &ArrayView2<u8>, start: IVec2, goal: IVec2) -> Option<Path> {
    let tile_length = costs.dim().0 as i32;
    if !in_tile(start, tile_length) || !in_tile(goal, tile_length) {
        return None;
    }

    if start == goal {
        return Some(Path::new(Vec::new(), 0));
    }

    if cost_at(costs, goal) == BLOCKED {
        return None;
    }

    let mut to_visit = BinaryHeap::with_capacity(costs.len() / 4);
    to_visit.push(SmallestCostHolder {
        estimated_cost: chebyshev(start, goal),
        cost: 0,
        index: 0,
    });

    let mut visited: FxIndexMap<IVec2, (usize, u32)> = FxIndexMap::default();
    visited.insert(start, (usize::MAX, 0));

    while let Some(SmallestCostHolder { cost, index, .. }) = to_visit.pop() {
        let current_pos = {
            let (current_pos, &(_, current_cost)) = visited.get_index(index)?;

            if *current_pos == goal {
                let mut current = index;
                let mut steps = vec![];

                while current != usize::MAX {
                    let (pos, &(parent, _)) = visited.get_index(current)?;
                    if parent != usize::MAX {
                        steps.push(*pos);
                    }
                    current = parent;
                }

                steps.reverse();
                return Some(Path::new(steps, current_cost));
            }

            if cost > current_cost {
                continue;
            }

            *current_pos
        };

        for dir in Dir::all() {
            let Some(step) = step_cost(costs, current_pos, dir) else {
                continue;
            };

            let neighbor = current_pos + dir.offset();
            let new_cost = cost + step;
            let h;
            let n;
            match visited.entry(neighbor) {
                Vacant(e) => {
                    h = chebyshev(neighbor, goal);
                    n = e.index();
                    e.insert((index, new_cost));
                }
                Occupied(mut e) => {
                    if e.get().1 > new_cost {
                        h = chebyshev(neighbor, goal);
                        n = e.index();
                        e.insert((index, new_cost));
                    } else {
                        continue;
                    }
                }
            }

            to_visit.push(SmallestCostHolder {
                estimated_cost: new_cost + h,
                cost: new_cost,
                index: n,
            });
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_astar_open_tile() {
        let grid = Array2::from_elem((10, 10), 1u8);

        let path = astar_grid(&grid.view(), IVec2::new(1, 0), IVec2::new(3, 3)).unwrap();

        assert_eq!(path.cost(), 3);
        assert_eq!(path.len(), 3);
        assert_eq!(path.goal(), Some(IVec2::new(3, 3)));
        assert!(!path.contains(IVec2::new(1, 0)));
    }

    #[test]
    fn test_astar_same_cell() {
        let grid = Array2::from_elem((4, 4), 1u8);
        let path = astar_grid(&grid.view(), IVec2::new(2, 2), IVec2::new(2, 2)).unwrap();
        assert!(path.is_empty());
        assert_eq!(path.cost(), 0);
    }

    #[test]
    fn test_astar_blocked_goal() {
        let mut grid = Array2::from_elem((4, 4), 1u8);
        grid[[3, 3]] = BLOCKED;
        assert!(astar_grid(&grid.view(), IVec2::ZERO, IVec2::new(3, 3)).is_none());
    }

    #[test]
    fn test_astar_around_wall() {
        // Wall in column 2 with a gap at the bottom.
        let mut grid = Array2::from_elem((5, 5), 1u8);
        for y in 0..4 {
            grid[[2, y]] = BLOCKED;
        }

        let path = astar_grid(&grid.view(), IVec2::new(0, 0), IVec2::new(4, 0)).unwrap();

        assert!(path.contains(IVec2::new(2, 4)));
        for cell in path.cells() {
            assert_ne!(grid[[cell.x as usize, cell.y as usize]], BLOCKED);
        }
    }

    #[test]
    fn test_astar_no_corner_cutting() {
        // Two blocked cells touching at a corner leave no route between the open halves.
        let mut grid = Array2::from_elem((2, 2), 1u8);
        grid[[1, 0]] = BLOCKED;
        grid[[0, 1]] = BLOCKED;

        assert!(astar_grid(&grid.view(), IVec2::new(0, 0), IVec2::new(1, 1)).is_none());
    }

    #[test]
    fn test_step_cost_weights_diagonals() {
        let mut grid = Array2::from_elem((3, 3), 1u8);
        grid[[1, 0]] = 4;
        grid[[0, 1]] = 4;

        assert_eq!(step_cost(&grid.view(), IVec2::ZERO, Dir::EAST), Some(4));
        assert_eq!(step_cost(&grid.view(), IVec2::ZERO, Dir::SOUTHEAST), Some(3));
        assert_eq!(step_cost(&grid.view(), IVec2::ZERO, Dir::WEST), None);
    }

    #[test]
    fn test_astar_prefers_cheap_cells() {
        let mut grid = Array2::from_elem((3, 3), 1u8);
        grid[[1, 0]] = 50;

        let path = astar_grid(&grid.view(), IVec2::new(0, 0), IVec2::new(2, 0)).unwrap();
        assert!(!path.contains(IVec2::new(1, 0)));
        assert!(path.cost() < 50);
    }
}
