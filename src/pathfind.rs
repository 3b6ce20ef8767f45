//! Portal-level A* across tiles, with merging into cached waypoint chains.
use bevy::log;
use indexmap::map::Entry::{Occupied, Vacant};
use std::collections::BinaryHeap;

use crate::{
    engine::{PathEngine, StatCounters},
    point::{chebyshev, TilePoint},
    portal::PortalId,
    FxIndexMap, SmallestCostHolder, BLOCKED,
};

/// Outcome of a portal search.
///
/// `waypoints` alternates between the portal leaving a tile and the portal entering the
/// next one, so it always has even length. A successful search inside a single tile has
/// no waypoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortalSearchResult {
    pub success: bool,
    pub waypoints: Vec<PortalId>,
    /// True if the result was completed from the waypoint cache.
    pub cache_hit: bool,
}

impl PortalSearchResult {
    fn found(waypoints: Vec<PortalId>, cache_hit: bool) -> Self {
        PortalSearchResult {
            success: true,
            waypoints,
            cache_hit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SearchNode {
    Start,
    Portal(PortalId),
    End,
}

/// Collapses a raw portal sequence into (departure, arrival) pairs per tile hop.
fn compact_waypoints(all: &[PortalId]) -> Vec<PortalId> {
    let mut waypoints = Vec::with_capacity(all.len());
    let mut last: Option<PortalId> = None;

    for &waypoint in all {
        match last {
            Some(previous) if previous.tile != waypoint.tile => {
                waypoints.push(previous);
                waypoints.push(waypoint);
                last = None;
            }
            _ => last = Some(waypoint),
        }
    }

    waypoints
}

/// Walks parent links from `index` back to the start node.
/// Joins a searched prefix with a cached chain. Refuses odd results and chains that
/// revisit a portal of the prefix.
fn splice_cached(mut prefix: Vec<PortalId>, cached: Vec<PortalId>) -> Option<Vec<PortalId>> {
    if (prefix.len() + cached.len()) % 2 != 0 || cached.iter().any(|w| prefix.contains(w)) {
        return None;
    }
    prefix.extend(cached);
    Some(prefix)
}

fn reconstruct(visited: &FxIndexMap<SearchNode, (usize, u32)>, index: usize) -> Vec<PortalId> {
    let mut portals = Vec::new();
    let mut current = index;

    while current != usize::MAX {
        let Some((node, &(parent, _))) = visited.get_index(current) else {
            break;
        };
        if let SearchNode::Portal(id) = node {
            portals.push(*id);
        }
        current = parent;
    }

    portals.reverse();
    portals
}

impl PathEngine {
    /// Searches for a route from `start` to `end` and, with `use_cache`, stores the
    /// resulting chain so later searches to the same cell can merge into it.
    pub fn find_portal_path(
        &mut self,
        start: TilePoint,
        end: TilePoint,
        use_cache: bool,
    ) -> PortalSearchResult {
        let result = self.search_portal_path(start, end, use_cache);

        if use_cache && result.success && !result.waypoints.is_empty() {
            self.cache_portal_path(end, &result.waypoints);
        }

        log::debug!(
            "Portal search {:?} -> {:?}: success {} with {} waypoints (cache hit {})",
            start,
            end,
            result.success,
            result.waypoints.len(),
            result.cache_hit
        );

        result
    }

    /// Existence check that neither reads nor writes the waypoint cache.
    pub fn is_path_possible(&self, start: TilePoint, end: TilePoint) -> bool {
        self.search_portal_path(start, end, false).success
    }

    /// Portal-level A* without side effects on the cache.
    ///
    /// The heuristic is the Chebyshev distance in absolute cells, which no edge cost
    /// undercuts. With `use_cache`, portals further than the merge radius from the start
    /// tile try to finish early by attaching to a cached chain to the same destination.
    pub fn search_portal_path(
        &self,
        start: TilePoint,
        end: TilePoint,
        use_cache: bool,
    ) -> PortalSearchResult {
        StatCounters::add(&self.stats.portal_searches, 1);

        let length = self.tile_length() as i32;
        let (Some(start_tile), Some(end_tile)) = (self.tile(start.tile), self.tile(end.tile))
        else {
            return PortalSearchResult::default();
        };

        if !start.is_normalized(length)
            || !end.is_normalized(length)
            || start_tile.cost(start.cell) == BLOCKED
            || end_tile.cost(end.cell) == BLOCKED
        {
            return PortalSearchResult::default();
        }

        if start.tile == end.tile && start_tile.find_path(start.cell, end.cell).is_some() {
            return PortalSearchResult::found(Vec::new(), false);
        }

        let absolute_end = end.absolute(length);
        let heuristic = |id: PortalId| -> u32 {
            self.portal(id)
                .map(|p| chebyshev(p.absolute_center(length), absolute_end))
                .unwrap_or(0)
        };

        let mut to_visit = BinaryHeap::new();
        let mut visited: FxIndexMap<SearchNode, (usize, u32)> = FxIndexMap::default();
        visited.insert(SearchNode::Start, (usize::MAX, 0));

        for portal in start_tile.portals() {
            let Some(path) = start_tile.find_path(start.cell, portal.center) else {
                continue;
            };
            let cost = path.cost();
            let n = match visited.entry(SearchNode::Portal(portal.id)) {
                Vacant(e) => {
                    let n = e.index();
                    e.insert((0, cost));
                    n
                }
                Occupied(_) => continue,
            };
            to_visit.push(SmallestCostHolder {
                estimated_cost: cost + heuristic(portal.id),
                cost,
                index: n,
            });
        }

        while let Some(SmallestCostHolder { cost, index, .. }) = to_visit.pop() {
            let Some((&node, &(_, current_cost))) = visited.get_index(index) else {
                break;
            };

            if cost > current_cost {
                continue;
            }

            let id = match node {
                SearchNode::End => {
                    let all = reconstruct(&visited, index);
                    return PortalSearchResult::found(compact_waypoints(&all), false);
                }
                SearchNode::Start => continue,
                SearchNode::Portal(id) => id,
            };

            let Some(portal) = self.portal(id) else {
                continue;
            };

            if use_cache && (id.tile - start.tile).abs().max_element() > self.merge_radius {
                if let Some(cached) = self.cache.lookup(id, absolute_end) {
                    let prefix = compact_waypoints(&reconstruct(&visited, index));
                    if let Some(waypoints) = splice_cached(prefix, cached) {
                        StatCounters::add(&self.stats.cache_hits, 1);
                        return PortalSearchResult::found(waypoints, true);
                    }
                }
            }

            let mut candidates: Vec<(SearchNode, u32, u32)> = Vec::new();

            if id.tile == end.tile {
                if let Some(path) = end_tile.find_path(portal.center, end.cell) {
                    candidates.push((SearchNode::End, cost + path.cost(), 0));
                }
            }

            for edge in portal.edges() {
                if self.portal(edge.to).is_none() {
                    continue;
                }
                candidates.push((
                    SearchNode::Portal(edge.to),
                    cost + edge.cost,
                    heuristic(edge.to),
                ));
            }

            for (neighbor, new_cost, h) in candidates {
                let n;
                match visited.entry(neighbor) {
                    Vacant(e) => {
                        n = e.index();
                        e.insert((index, new_cost));
                    }
                    Occupied(mut e) => {
                        if e.get().1 > new_cost {
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

        PortalSearchResult::default()
    }
}
