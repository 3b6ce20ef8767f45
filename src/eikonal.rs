//! Wavefront relaxation producing arrival values and directions for one cost grid.
use bevy::math::IVec2;
use ndarray::{Array2, ArrayView2};
use std::collections::VecDeque;

use crate::{
    astar::step_cost,
    dir::Dir,
    flow_field::{FlowCell, FlowField},
    BLOCKED,
};

/// Propagates arrival costs outward from `targets` over `costs`.
///
/// Every target starts at 0. Cells are relaxed from a FIFO queue until no value improves,
/// using the same step costs as the intra-tile search. Each improved cell records the
/// direction back towards the cell that improved it. Blocked targets are ignored.
/// Cells no target can reach keep [`crate::UNREACHED`] and no direction.
pub(crate) fn solve(costs: ArrayView2<u8>, targets: &[IVec2]) -> FlowField {
    let (w, h) = costs.dim();
    let mut cells = Array2::from_elem(costs.raw_dim(), FlowCell::default());
    let mut queued = Array2::from_elem(costs.raw_dim(), false);
    let mut trial = VecDeque::with_capacity(costs.len());

    for &target in targets {
        if target.x < 0 || target.y < 0 || target.x as usize >= w || target.y as usize >= h {
            continue;
        }
        let idx = [target.x as usize, target.y as usize];
        if costs[idx] == BLOCKED {
            continue;
        }
        cells[idx].value = 0.0;
        if !queued[idx] {
            queued[idx] = true;
            trial.push_back(target);
        }
    }

    while let Some(center) = trial.pop_front() {
        let center_idx = [center.x as usize, center.y as usize];
        queued[center_idx] = false;
        let center_value = cells[center_idx].value;

        for dir in Dir::all() {
            let Some(step) = step_cost(&costs, center, dir) else {
                continue;
            };

            let neighbor = center + dir.offset();
            let idx = [neighbor.x as usize, neighbor.y as usize];
            let new_value = center_value + step as f32;

            if new_value < cells[idx].value {
                cells[idx] = FlowCell {
                    value: new_value,
                    dir: Some(dir.opposite()),
                };
                if !queued[idx] {
                    queued[idx] = true;
                    trial.push_back(neighbor);
                }
            }
        }
    }

    FlowField::new(cells)
}
