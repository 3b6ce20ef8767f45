use ndarray::{Array2, ArrayView2};

use crate::BLOCKED;

/// Labels every 4-connected region of traversable cells.
///
/// Returns the label grid (`None` for blocked cells) and the number of regions found.
/// Diagonal steps need both cut cells open, so two cells share a label exactly when
/// the intra-tile search can move between them.
pub(crate) fn flood_fill_regions(costs: ArrayView2<u8>) -> (Array2<Option<usize>>, usize) {
    let mut labels = Array2::from_elem(costs.raw_dim(), None);
    let mut regions = 0;
    let (w, h) = costs.dim();

    for ((x, y), &cost) in costs.indexed_iter() {
        if labels[(x, y)].is_some() || cost == BLOCKED {
            continue;
        }

        let mut stack = vec![(x, y)];

        while let Some((cx, cy)) = stack.pop() {
            if labels[(cx, cy)].is_some() || costs[(cx, cy)] == BLOCKED {
                continue;
            }

            labels[(cx, cy)] = Some(regions);

            if cx > 0 {
                stack.push((cx - 1, cy));
            }
            if cy > 0 {
                stack.push((cx, cy - 1));
            }
            if cx + 1 < w {
                stack.push((cx + 1, cy));
            }
            if cy + 1 < h {
                stack.push((cx, cy + 1));
            }
        }

        regions += 1;
    }

    (labels, regions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_region() {
        let grid = Array2::from_elem((4, 4), 1u8);
        let (labels, count) = flood_fill_regions(grid.view());
        assert_eq!(count, 1);
        assert!(labels.iter().all(|l| *l == Some(0)));
    }

    #[test]
    fn test_split_by_wall() {
        let mut grid = Array2::from_elem((5, 5), 1u8);
        for y in 0..5 {
            grid[[2, y]] = BLOCKED;
        }

        let (labels, count) = flood_fill_regions(grid.view());
        assert_eq!(count, 2);
        assert_eq!(labels[(2, 2)], None);
        assert_ne!(labels[(0, 0)], labels[(4, 4)]);
        assert_eq!(labels[(0, 0)], labels[(1, 4)]);
    }

    #[test]
    fn test_diagonal_touch_is_not_connected() {
        let mut grid = Array2::from_elem((2, 2), 1u8);
        grid[[1, 0]] = BLOCKED;
        grid[[0, 1]] = BLOCKED;

        let (labels, count) = flood_fill_regions(grid.view());
        assert_eq!(count, 2);
        assert_ne!(labels[(0, 0)], labels[(1, 1)]);
    }

    #[test]
    fn test_fully_blocked() {
        let grid = Array2::from_elem((3, 3), BLOCKED);
        let (_, count) = flood_fill_regions(grid.view());
        assert_eq!(count, 0);
    }
}
