//! Hierarchical flow-field pathfinding for crowds of agents on a tiled cost grid.
//!
//! The map is split into square tiles. Each tile derives boundary portals and
//! caches direction fields, the [`engine::PathEngine`] searches the portal graph,
//! and the [`manager::PathManager`] steers registered agents once per tick.
use std::cmp::Ordering;
use std::hash::BuildHasherDefault;

use indexmap::IndexMap;
use rustc_hash::FxHasher;

pub mod agent;
mod astar;
pub mod dir;
pub mod engine;
pub mod error;
mod eikonal;
pub mod flow_field;
mod flood_fill;
pub mod macros;
pub mod manager;
pub mod path;
mod pathfind;
pub mod plugin;
pub mod point;
pub mod portal;
pub mod settings;
mod task;
pub mod tile;
mod waypoint_cache;

pub mod prelude {
    pub use crate::agent::{AgentId, AgentInfo, NavAgent};
    pub use crate::dir::{Dir, Orientation};
    pub use crate::engine::{EngineStats, PathEngine};
    pub use crate::error::FlowPathError;
    pub use crate::flow_field::{FieldKey, FlowCell, FlowField, FlowLeg, FlowMapExtract};
    pub use crate::manager::PathManager;
    pub use crate::path::Path;
    pub use crate::pathfind::PortalSearchResult;
    pub use crate::plugin::{FlowPathPlugin, FlowPathSet};
    pub use crate::point::TilePoint;
    pub use crate::portal::{Portal, PortalEdge, PortalId};
    pub use crate::settings::{
        CacheSettings, FlowPathSettings, FlowPathSettingsBuilder, SteeringSettings,
        WorkerSettings, WorldTransform,
    };
    pub use crate::tile::Tile;
    pub use crate::{BLOCKED, EMPTY, UNREACHED};
}

pub use pathfind::PortalSearchResult;

/// Cost value of an impassable cell.
pub const BLOCKED: u8 = 255;
/// Cheapest traversable cost, used for uniformly open tiles.
pub const EMPTY: u8 = 1;
/// Arrival value of cells a flow field never reached.
pub const UNREACHED: f32 = 10000.0;

type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

/// Open-set entry for the A* searches. Orders by lowest estimate first,
/// then by the highest cost already paid, then by insertion order.
pub(crate) struct SmallestCostHolder<Id> {
    estimated_cost: Id,
    cost: Id,
    index: usize,
}

impl<Id: PartialEq> PartialEq for SmallestCostHolder<Id> {
    fn eq(&self, other: &Self) -> bool {
        self.estimated_cost.eq(&other.estimated_cost)
            && self.cost.eq(&other.cost)
            && self.index == other.index
    }
}

impl<Id: Eq> Eq for SmallestCostHolder<Id> {}

impl<Id: Ord> PartialOrd for SmallestCostHolder<Id> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<Id: Ord> Ord for SmallestCostHolder<Id> {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.estimated_cost.cmp(&self.estimated_cost) {
            Ordering::Equal => match self.cost.cmp(&other.cost) {
                Ordering::Equal => other.index.cmp(&self.index),
                s => s,
            },
            s => s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    #[test]
    fn test_smallest_cost_holder_order() {
        let mut heap = BinaryHeap::new();
        heap.push(SmallestCostHolder {
            estimated_cost: 5u32,
            cost: 1,
            index: 0,
        });
        heap.push(SmallestCostHolder {
            estimated_cost: 3u32,
            cost: 1,
            index: 1,
        });
        heap.push(SmallestCostHolder {
            estimated_cost: 3u32,
            cost: 2,
            index: 2,
        });
        heap.push(SmallestCostHolder {
            estimated_cost: 3u32,
            cost: 2,
            index: 3,
        });

        let order: Vec<usize> = std::iter::from_fn(|| heap.pop().map(|h| h.index)).collect();
        assert_eq!(order, vec![2, 3, 1, 0]);
    }
}
