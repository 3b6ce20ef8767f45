//! The [`PathEngine`] owns every loaded tile, the portal graph between them, the
//! waypoint cache and the per-tile direction fields.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bevy::{log, math::IVec2};
use rustc_hash::{FxHashMap, FxHashSet};
use strum::IntoEnumIterator;

use crate::{
    dir::{Dir, Orientation},
    error::FlowPathError,
    flow_field::{FieldKey, FlowField, FlowJob, FlowLeg, FlowMapExtract, JobSource},
    path::Path,
    point::TilePoint,
    portal::{Portal, PortalId},
    tile::{CostBuffers, Tile},
    waypoint_cache::WaypointCache,
    BLOCKED, UNREACHED,
};

/// Penalty on in-tile neighbours while standing on the next portal, so crossing wins.
const PORTAL_THRESHOLD_PENALTY: f32 = 300.0;
/// Penalty on neighbours in other tiles, which have no field of their own here.
const CROSS_TILE_PENALTY: f32 = 500.0;

/// Snapshot of the engine's instrumentation counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub portal_searches: u64,
    pub cache_hits: u64,
    pub cache_stores: u64,
    pub fields_solved: u64,
    pub fields_committed: u64,
    pub fields_evicted: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub(crate) portal_searches: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) cache_stores: AtomicU64,
    pub(crate) fields_solved: AtomicU64,
    pub(crate) fields_committed: AtomicU64,
    pub(crate) fields_evicted: AtomicU64,
}

impl StatCounters {
    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            portal_searches: self.portal_searches.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_stores: self.cache_stores.load(Ordering::Relaxed),
            fields_solved: self.fields_solved.load(Ordering::Relaxed),
            fields_committed: self.fields_committed.load(Ordering::Relaxed),
            fields_evicted: self.fields_evicted.load(Ordering::Relaxed),
        }
    }
}

/// Tile map owner and entry point for all path queries.
///
/// # Example
/// ```
/// use bevy::math::IVec2;
/// use bevy_flowpath::prelude::*;
///
/// let mut engine = PathEngine::new(10);
/// engine.update_map_tile(IVec2::new(0, 0), &[1; 100]).unwrap();
/// engine.update_map_tile(IVec2::new(1, 0), &[1; 100]).unwrap();
///
/// let start = TilePoint::new(IVec2::new(0, 0), IVec2::new(2, 2));
/// let end = TilePoint::new(IVec2::new(1, 0), IVec2::new(7, 7));
/// let result = engine.find_portal_path(start, end, true);
/// assert!(result.success);
/// assert_eq!(result.waypoints.len(), 2);
/// ```
#[derive(Debug)]
pub struct PathEngine {
    tile_length: usize,
    buffers: CostBuffers,
    tiles: FxHashMap<IVec2, Tile>,
    next_generation: u32,
    pub(crate) merge_radius: i32,
    pub(crate) cache: WaypointCache,
    pub(crate) stats: StatCounters,
}

impl PathEngine {
    /// Creates an empty map of square tiles with `tile_length` cells per side.
    pub fn new(tile_length: usize) -> Self {
        if tile_length < 2 {
            panic!("Tile length must be at least 2");
        }

        PathEngine {
            tile_length,
            buffers: CostBuffers::new(tile_length),
            tiles: FxHashMap::default(),
            next_generation: 0,
            merge_radius: 1,
            cache: WaypointCache::new(),
            stats: StatCounters::default(),
        }
    }

    pub fn tile_length(&self) -> usize {
        self.tile_length
    }

    /// Tiles within this Chebyshev distance of a search's start never merge into
    /// cached chains. Defaults to 1.
    pub fn set_cache_merge_radius(&mut self, radius: u32) {
        self.merge_radius = radius as i32;
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    pub fn tile(&self, coord: IVec2) -> Option<&Tile> {
        self.tiles.get(&coord)
    }

    pub fn tile_coordinates(&self) -> Vec<IVec2> {
        self.tiles.keys().copied().collect()
    }

    /// Every portal of every loaded tile.
    pub fn portals(&self) -> impl Iterator<Item = &Portal> {
        self.tiles.values().flat_map(|t| t.portals().iter())
    }

    /// Resolves a portal handle, `None` if its tile was rebuilt or removed.
    pub fn portal(&self, id: PortalId) -> Option<&Portal> {
        self.tiles.get(&id.tile)?.portal(id)
    }

    /// Number of direction fields cached across all tiles.
    pub fn flow_field_count(&self) -> usize {
        self.tiles.values().map(|t| t.field_count()).sum()
    }

    /// Number of (portal, destination) links in the waypoint cache.
    pub fn cached_link_count(&self) -> usize {
        self.cache.len()
    }

    /// Replaces the tile at `coord` with new cost data in row-major order.
    ///
    /// Rejected data leaves the map untouched. Otherwise the old tile's portals are
    /// unlinked from its neighbours, cached chains through them are excised, and the
    /// new tile is connected to every loaded neighbour.
    pub fn update_map_tile(&mut self, coord: IVec2, data: &[u8]) -> Result<(), FlowPathError> {
        let costs = self.buffers.share(data)?;
        let shared = self.buffers.is_canonical(&costs);

        if self.tiles.contains_key(&coord) {
            self.unlink_tile(coord);
        }

        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        let mut tile = crate::timed!("Built tile", { Tile::new(coord, generation, costs) });

        for side in Orientation::iter() {
            if let Some(neighbor) = self.tiles.get_mut(&(coord + side.tile_offset())) {
                tile.connect_overlapping_portals(neighbor, side);
            }
        }

        log::debug!(
            "Loaded tile {} (generation {}) with {} portals, shared buffer: {}",
            coord,
            generation,
            tile.portals().len(),
            shared
        );

        self.tiles.insert(coord, tile);
        Ok(())
    }

    /// Slices a row-major byte image of `width` x `height` cells into tiles, starting at
    /// `upper_left` in tile coordinates. Zero bytes and cells past the image edge are blocked.
    pub fn update_map_tiles_from_raw(
        &mut self,
        upper_left: IVec2,
        width: usize,
        height: usize,
        bytes: &[u8],
    ) -> Result<usize, FlowPathError> {
        let expected = width * height;
        if bytes.len() != expected {
            return Err(FlowPathError::InvalidBlockSize {
                expected,
                actual: bytes.len(),
            });
        }

        let len = self.tile_length;
        let tiles_x = width.div_ceil(len);
        let tiles_y = height.div_ceil(len);
        let mut data = vec![BLOCKED; len * len];

        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                for y in 0..len {
                    for x in 0..len {
                        let px = tx * len + x;
                        let py = ty * len + y;
                        data[x + y * len] = if px < width && py < height {
                            match bytes[px + py * width] {
                                0 => BLOCKED,
                                v => v,
                            }
                        } else {
                            BLOCKED
                        };
                    }
                }
                self.update_map_tile(upper_left + IVec2::new(tx as i32, ty as i32), &data)?;
            }
        }

        Ok(tiles_x * tiles_y)
    }

    /// Removes the tile at `coord` and every reference to it.
    pub fn remove_map_tile(&mut self, coord: IVec2) -> bool {
        if !self.tiles.contains_key(&coord) {
            return false;
        }
        self.unlink_tile(coord);
        true
    }

    fn unlink_tile(&mut self, coord: IVec2) {
        let Some(old) = self.tiles.remove(&coord) else {
            return;
        };

        let mut affected: Vec<PortalId> = Vec::new();
        for portal in old.portals() {
            affected.push(portal.id);
            affected.extend(portal.edges().iter().map(|e| e.to));
        }
        let excised = self.cache.invalidate(&affected, coord);

        let mut evicted = old.field_count();
        for dy in -1..=1 {
            for dx in -1..=1 {
                if let Some(neighbor) = self.tiles.get_mut(&(coord + IVec2::new(dx, dy))) {
                    neighbor.remove_edges_to(coord);
                    evicted += neighbor.retain_fields(|k| !k.touches_tile(coord));
                }
            }
        }
        StatCounters::add(&self.stats.fields_evicted, evicted as u64);

        log::debug!(
            "Unlinked tile {}: {} cache links and {} fields dropped",
            coord,
            excised,
            evicted
        );
    }

    /// Cost at a location, [`BLOCKED`] where no tile is loaded.
    pub fn get_data_for(&self, point: TilePoint) -> u8 {
        match self.tiles.get(&point.tile) {
            Some(tile) => tile.cost(point.cell),
            None => BLOCKED,
        }
    }

    pub(crate) fn data_at_absolute(&self, cell: IVec2) -> u8 {
        self.get_data_for(TilePoint::from_absolute(cell, self.tile_length as i32))
    }

    /// Intra-tile search between two points of the same tile.
    pub fn find_direct_path(&self, start: TilePoint, end: TilePoint) -> Option<Path> {
        if start.tile != end.tile {
            return None;
        }
        self.tiles.get(&start.tile)?.find_path(start.cell, end.cell)
    }

    /// Stores a waypoint chain for `target` so later searches can merge into it.
    pub fn cache_portal_path(&mut self, target: TilePoint, waypoints: &[PortalId]) {
        self.cache.store(self.cache_key(target), waypoints);
        StatCounters::add(&self.stats.cache_stores, 1);
    }

    /// Forgets every cached chain to `target`.
    pub fn delete_from_path_cache(&mut self, target: TilePoint) -> usize {
        self.cache.remove_target(self.cache_key(target))
    }

    /// Absolute cell used to key cached chains for `target`.
    pub(crate) fn cache_key(&self, target: TilePoint) -> IVec2 {
        target.absolute(self.tile_length as i32)
    }

    pub fn clear_path_cache(&mut self) {
        self.cache.clear();
    }

    /// Resolves which tile and field a lookup at `start` needs.
    ///
    /// Without a leg the field leads straight to `end`, which must lie in the same tile.
    /// With a leg, `start` must be in the leg's departure tile.
    pub(crate) fn field_request(
        &self,
        start: TilePoint,
        end: TilePoint,
        leg: Option<FlowLeg>,
    ) -> Result<(IVec2, FieldKey), FlowPathError> {
        let (tile, key) = match leg {
            None => {
                if start.tile != end.tile {
                    return Err(FlowPathError::LocationMismatch {
                        start: start.tile,
                        end: end.tile,
                    });
                }
                (end.tile, FieldKey::Points(vec![end.cell]))
            }
            Some(leg) => {
                if start.tile != leg.next.tile {
                    return Err(FlowPathError::LocationMismatch {
                        start: start.tile,
                        end: leg.next.tile,
                    });
                }
                (start.tile, leg.key())
            }
        };

        if !self.tiles.contains_key(&tile) {
            return Err(FlowPathError::TileNotLoaded(tile));
        }

        Ok((tile, key))
    }

    pub(crate) fn cached_field(&self, tile: IVec2, key: &FieldKey) -> Option<Arc<FlowField>> {
        self.tiles.get(&tile)?.field(key)
    }

    /// Copies the data needed to solve `key` for the tile at `coord`.
    pub(crate) fn prepare_flow_job(
        &self,
        coord: IVec2,
        key: &FieldKey,
    ) -> Result<FlowJob, FlowPathError> {
        let tile = self
            .tiles
            .get(&coord)
            .ok_or(FlowPathError::TileNotLoaded(coord))?;

        match key {
            FieldKey::Points(cells) => Ok(FlowJob {
                source: JobSource::Tile(tile.costs().clone()),
                targets: cells.clone(),
                forced: None,
            }),
            FieldKey::Portal { target, connected } => {
                let portal = tile
                    .portal(*target)
                    .ok_or(FlowPathError::StalePortal(*target))?;
                let other = self
                    .portal(*connected)
                    .ok_or(FlowPathError::StalePortal(*connected))?;
                if !portal.is_connected_to(*connected) {
                    return Err(FlowPathError::StalePortal(*connected));
                }

                let targets = match portal.overlap(other) {
                    Some(range) => portal.cells_in(range),
                    None => portal.cells().collect(),
                };

                Ok(FlowJob {
                    source: JobSource::Tile(tile.costs().clone()),
                    forced: Some((targets.clone(), portal.orientation.outward())),
                    targets,
                })
            }
            FieldKey::Lookahead { target, lookahead } => {
                tile.portal(*target)
                    .ok_or(FlowPathError::StalePortal(*target))?;
                let ahead = self
                    .portal(*lookahead)
                    .ok_or(FlowPathError::StalePortal(*lookahead))?;

                let delta = lookahead.tile - coord;
                if delta.length_squared() != 2 {
                    return Err(FlowPathError::LocationMismatch {
                        start: coord,
                        end: lookahead.tile,
                    });
                }

                let origin = coord + delta.min(IVec2::ZERO);
                let block_tile = |offset: IVec2| match self.tiles.get(&(origin + offset)) {
                    Some(t) => t.costs().clone(),
                    None => self.buffers.blocked(),
                };
                let tiles = [
                    block_tile(IVec2::new(0, 0)),
                    block_tile(IVec2::new(1, 0)),
                    block_tile(IVec2::new(0, 1)),
                    block_tile(IVec2::new(1, 1)),
                ];

                let shift = (lookahead.tile - origin) * self.tile_length as i32;
                Ok(FlowJob {
                    source: JobSource::Block {
                        tiles,
                        quadrant: coord - origin,
                    },
                    targets: ahead.cells().map(|c| c + shift).collect(),
                    forced: None,
                })
            }
        }
    }

    /// Caches a finished field if the tile is still the build it was solved for.
    pub(crate) fn commit_flow_field(
        &mut self,
        coord: IVec2,
        generation: u32,
        key: FieldKey,
        field: Arc<FlowField>,
    ) -> bool {
        let Some(tile) = self.tiles.get_mut(&coord) else {
            return false;
        };
        if tile.generation() != generation {
            return false;
        }
        let inserted = tile.insert_field(key, field);
        if inserted {
            StatCounters::add(&self.stats.fields_committed, 1);
        }
        inserted
    }

    /// Returns the field for a lookup, solving and caching it if needed.
    pub(crate) fn flow_field(
        &mut self,
        start: TilePoint,
        end: TilePoint,
        leg: Option<FlowLeg>,
    ) -> Result<Arc<FlowField>, FlowPathError> {
        let (coord, key) = self.field_request(start, end, leg)?;
        self.field_for(coord, key)
    }

    fn field_for(&mut self, coord: IVec2, key: FieldKey) -> Result<Arc<FlowField>, FlowPathError> {
        if let Some(field) = self.cached_field(coord, &key) {
            return Ok(field);
        }

        let job = self.prepare_flow_job(coord, &key)?;
        let field = Arc::new(crate::timed!("Solved flow field", { job.run() }));
        StatCounters::add(&self.stats.fields_solved, 1);

        if let Some(tile) = self.tiles.get_mut(&coord) {
            tile.insert_field(key, field.clone());
        }
        Ok(field)
    }

    /// Direction to move from `start`, either straight to `end` (no leg) or along `leg`.
    ///
    /// Returns `Ok(None)` on a target cell or a cell the field does not reach.
    pub fn fast_flow_map_lookup(
        &mut self,
        start: TilePoint,
        end: TilePoint,
        leg: Option<FlowLeg>,
    ) -> Result<Option<Dir>, FlowPathError> {
        let field = self.flow_field(start, end, leg)?;
        Ok(field.dir(start.cell))
    }

    /// Samples the flow values around `start` with penalties for leaving the tile.
    ///
    /// Always uses the plain portal field of the leg, never a lookahead field.
    pub fn get_flow_map_value(
        &mut self,
        start: TilePoint,
        end: TilePoint,
        leg: Option<FlowLeg>,
    ) -> Result<FlowMapExtract, FlowPathError> {
        let leg = leg.map(|l| l.with_lookahead(None));
        let orientation = match leg {
            Some(l) => {
                let next = self
                    .portal(l.next)
                    .ok_or(FlowPathError::StalePortal(l.next))?;
                if !next.is_connected_to(l.connected) {
                    return Err(FlowPathError::StalePortal(l.connected));
                }
                Some(next.orientation)
            }
            None => None,
        };

        let field = self.flow_field(start, end, leg)?;
        Ok(self.extract(start, &field, orientation))
    }

    /// Samples around `start` for `leg` without solving anything.
    ///
    /// Uses the leg's plain portal field if it is already cached. Otherwise each
    /// neighbour is scored by its cell cost plus its Chebyshev distance to the centre
    /// of the connected portal across the boundary.
    pub(crate) fn peek_flow_map_value(
        &self,
        start: TilePoint,
        leg: FlowLeg,
    ) -> Result<FlowMapExtract, FlowPathError> {
        let leg = leg.with_lookahead(None);
        let (coord, key) = self.field_request(start, start, Some(leg))?;
        let next = self
            .portal(leg.next)
            .ok_or(FlowPathError::StalePortal(leg.next))?;
        let connected = self
            .portal(leg.connected)
            .ok_or(FlowPathError::StalePortal(leg.connected))?;
        if !next.is_connected_to(leg.connected) {
            return Err(FlowPathError::StalePortal(leg.connected));
        }

        if let Some(field) = self.cached_field(coord, &key) {
            return Ok(self.extract(start, &field, Some(next.orientation)));
        }

        let length = self.tile_length as i32;
        let goal = connected.absolute_center(length);
        let absolute = start.absolute(length);
        let distance = |cell: IVec2| (cell - goal).abs().max_element() as f32;
        let mut neighbors = [UNREACHED; 8];

        for dir in Dir::all() {
            if let Some((a, b)) = dir.corner_offsets() {
                if self.data_at_absolute(absolute + a) == BLOCKED
                    || self.data_at_absolute(absolute + b) == BLOCKED
                {
                    continue;
                }
            }

            let cell = absolute + dir.offset();
            match self.data_at_absolute(cell) {
                BLOCKED => {}
                cost => neighbors[dir.index()] = cost as f32 + distance(cell),
            }
        }

        Ok(FlowMapExtract {
            cell_value: distance(absolute),
            neighbors,
        })
    }

    fn extract(
        &self,
        point: TilePoint,
        field: &FlowField,
        orientation: Option<Orientation>,
    ) -> FlowMapExtract {
        let length = self.tile_length as i32;
        let cell_value = field.value(point.cell);
        let standing_on_portal = cell_value == 0.0 && orientation.is_some();
        let absolute = point.absolute(length);
        let mut neighbors = [UNREACHED; 8];

        for dir in Dir::all() {
            if let Some((a, b)) = dir.corner_offsets() {
                if self.data_at_absolute(absolute + a) == BLOCKED
                    || self.data_at_absolute(absolute + b) == BLOCKED
                {
                    continue;
                }
            }

            let target = TilePoint::new(point.tile, point.cell + dir.offset()).normalized(length);
            let tile_delta = target.tile - point.tile;

            neighbors[dir.index()] = if tile_delta == IVec2::ZERO {
                let value = field.value(target.cell);
                if value >= UNREACHED {
                    UNREACHED
                } else if standing_on_portal {
                    value + PORTAL_THRESHOLD_PENALTY
                } else {
                    value
                }
            } else {
                match self.get_data_for(target) {
                    BLOCKED => UNREACHED,
                    cost if standing_on_portal
                        && orientation.map(|o| o.tile_offset()) == Some(tile_delta) =>
                    {
                        cost as f32
                    }
                    cost => cost as f32 + CROSS_TILE_PENALTY,
                }
            };
        }

        FlowMapExtract {
            cell_value,
            neighbors,
        }
    }

    /// Drops cached fields of every tile not in `in_use`.
    pub fn evict_flow_fields(&mut self, in_use: &FxHashSet<IVec2>) -> usize {
        let mut evicted = 0;
        for (coord, tile) in self.tiles.iter_mut() {
            if !in_use.contains(coord) {
                evicted += tile.clear_fields();
            }
        }
        StatCounters::add(&self.stats.fields_evicted, evicted as u64);
        evicted
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn open_engine(length: usize, tiles: &[(i32, i32)]) -> PathEngine {
        let mut engine = PathEngine::new(length);
        for &(x, y) in tiles {
            engine
                .update_map_tile(IVec2::new(x, y), &vec![1; length * length])
                .unwrap();
        }
        engine
    }

    /// Checks every inter-tile edge has a matching edge back with the same cost.
    pub(crate) fn assert_portal_symmetry(engine: &PathEngine) {
        for portal in engine.portals() {
            for edge in portal.edges() {
                let other = engine
                    .portal(edge.to)
                    .unwrap_or_else(|| panic!("{:?} links to a dead portal", portal.id));
                if edge.to.tile != portal.id.tile {
                    assert_eq!(other.edge_cost(portal.id), Some(edge.cost));
                }
            }
        }
    }

    #[test]
    fn test_portal_symmetry() {
        let mut engine = open_engine(10, &[(0, 0), (1, 0), (0, 1), (1, 1)]);
        let mut data = vec![1u8; 100];
        for i in 0..4 {
            data[i * 10] = BLOCKED;
            data[i] = 7;
        }
        engine.update_map_tile(IVec2::new(2, 0), &data).unwrap();

        assert_portal_symmetry(&engine);

        let right = engine
            .tile(IVec2::ZERO)
            .unwrap()
            .portals()
            .iter()
            .find(|p| p.orientation == Orientation::Right)
            .unwrap();
        assert!(right.edges().iter().any(|e| e.to.tile == IVec2::new(1, 0)));
    }

    #[test]
    fn test_rejected_update_leaves_map_untouched() {
        let mut engine = open_engine(10, &[(0, 0), (1, 0)]);
        let before: Vec<PortalId> = engine.portals().map(|p| p.id).collect();

        let mut data = vec![1u8; 100];
        data[13] = 0;
        assert_eq!(
            engine.update_map_tile(IVec2::new(1, 0), &data),
            Err(FlowPathError::ZeroCost { index: 13 })
        );
        assert!(engine.update_map_tile(IVec2::new(1, 0), &[1; 12]).is_err());

        let after: Vec<PortalId> = engine.portals().map(|p| p.id).collect();
        assert_eq!(before, after);
        assert_eq!(engine.tile_coordinates().len(), 2);
    }

    #[test]
    fn test_rebuild_leaves_no_stale_references() {
        let mut engine = open_engine(10, &[(0, 0), (1, 0), (2, 0), (1, 1)]);
        let old: Vec<PortalId> = engine
            .tile(IVec2::new(1, 0))
            .unwrap()
            .portals()
            .iter()
            .map(|p| p.id)
            .collect();

        let mut data = vec![1u8; 100];
        data[55] = BLOCKED;
        engine.update_map_tile(IVec2::new(1, 0), &data).unwrap();

        for portal in engine.portals() {
            for edge in portal.edges() {
                assert!(!old.contains(&edge.to));
                assert!(engine.portal(edge.to).is_some());
            }
        }
        for id in old {
            assert!(engine.portal(id).is_none());
        }
        assert_portal_symmetry(&engine);
    }

    #[test]
    fn test_get_data_for() {
        let mut engine = PathEngine::new(4);
        let mut data = vec![1u8; 16];
        data[1 + 2 * 4] = 9;
        engine.update_map_tile(IVec2::new(3, 3), &data).unwrap();

        assert_eq!(
            engine.get_data_for(TilePoint::new(IVec2::new(3, 3), IVec2::new(1, 2))),
            9
        );
        assert_eq!(
            engine.get_data_for(TilePoint::new(IVec2::new(0, 0), IVec2::new(1, 2))),
            BLOCKED
        );
        assert_eq!(engine.data_at_absolute(IVec2::new(13, 14)), 9);
    }

    #[test]
    fn test_find_direct_path_scenario() {
        let engine = open_engine(10, &[(0, 0)]);
        let path = engine
            .find_direct_path(
                TilePoint::new(IVec2::ZERO, IVec2::new(1, 0)),
                TilePoint::new(IVec2::ZERO, IVec2::new(3, 3)),
            )
            .unwrap();
        assert_eq!(path.cost(), 3);
        assert!(!path.is_empty());
    }

    #[test]
    fn test_raw_block_update() {
        let mut engine = PathEngine::new(4);
        // 6 x 5 image, a zero byte at (1, 1).
        let mut bytes = vec![2u8; 30];
        bytes[1 + 6] = 0;
        let loaded = engine
            .update_map_tiles_from_raw(IVec2::new(-1, 0), 6, 5, &bytes)
            .unwrap();

        assert_eq!(loaded, 4);
        assert_eq!(engine.data_at_absolute(IVec2::new(-4, 0)), 2);
        assert_eq!(engine.data_at_absolute(IVec2::new(-3, 1)), BLOCKED);
        // Past the image edge.
        assert_eq!(engine.data_at_absolute(IVec2::new(2, 0)), BLOCKED);
        assert_eq!(engine.data_at_absolute(IVec2::new(0, 5)), BLOCKED);

        assert_eq!(
            engine.update_map_tiles_from_raw(IVec2::ZERO, 6, 5, &bytes[1..]),
            Err(FlowPathError::InvalidBlockSize {
                expected: 30,
                actual: 29
            })
        );
    }

    #[test]
    fn test_direct_lookup_requires_same_tile() {
        let mut engine = open_engine(8, &[(0, 0), (1, 0)]);
        let start = TilePoint::new(IVec2::ZERO, IVec2::new(1, 1));
        let end = TilePoint::new(IVec2::new(1, 0), IVec2::new(1, 1));
        assert!(matches!(
            engine.fast_flow_map_lookup(start, end, None),
            Err(FlowPathError::LocationMismatch { .. })
        ));

        let missing = TilePoint::new(IVec2::new(5, 5), IVec2::new(1, 1));
        assert_eq!(
            engine.fast_flow_map_lookup(missing, missing, None),
            Err(FlowPathError::TileNotLoaded(IVec2::new(5, 5)))
        );

        let end = TilePoint::new(IVec2::ZERO, IVec2::new(5, 1));
        assert_eq!(
            engine.fast_flow_map_lookup(start, end, None),
            Ok(Some(Dir::EAST))
        );
        assert_eq!(engine.flow_field_count(), 1);
        assert_eq!(engine.fast_flow_map_lookup(end, end, None), Ok(None));
        assert_eq!(engine.stats().fields_solved, 1);
    }

    #[test]
    fn test_portal_field_steers_across_edge() {
        let mut engine = open_engine(8, &[(0, 0), (1, 0)]);
        let start = TilePoint::new(IVec2::ZERO, IVec2::new(2, 3));
        let end = TilePoint::new(IVec2::new(1, 0), IVec2::new(4, 4));
        let result = engine.find_portal_path(start, end, false);
        assert!(result.success);

        let leg = FlowLeg::new(result.waypoints[0], result.waypoints[1]);
        let dir = engine
            .fast_flow_map_lookup(start, end, Some(leg))
            .unwrap()
            .unwrap();
        assert_eq!(dir.offset().x, 1);

        // Standing in the portal threshold points across the boundary.
        let threshold = TilePoint::new(IVec2::ZERO, IVec2::new(7, 0));
        assert_eq!(
            engine.fast_flow_map_lookup(threshold, end, Some(leg)),
            Ok(Some(Dir::EAST))
        );
    }

    #[test]
    fn test_lookahead_field_crosses_corner() {
        let mut engine = open_engine(8, &[(0, 0), (1, 0), (1, 1)]);
        let start = TilePoint::new(IVec2::ZERO, IVec2::new(1, 1));
        let end = TilePoint::new(IVec2::new(1, 1), IVec2::new(4, 4));
        let result = engine.find_portal_path(start, end, false);
        assert!(result.success);
        assert_eq!(result.waypoints.len(), 4);

        let leg = FlowLeg::new(result.waypoints[0], result.waypoints[1])
            .with_lookahead(Some(result.waypoints[3]));
        assert!(matches!(leg.key(), FieldKey::Lookahead { .. }));

        let dir = engine
            .fast_flow_map_lookup(start, end, Some(leg))
            .unwrap()
            .unwrap();
        assert!(dir.offset().x >= 0 && dir.offset().y >= 0);
        assert_eq!(
            engine
                .tile(IVec2::ZERO)
                .unwrap()
                .field(&leg.key())
                .unwrap()
                .cells()
                .dim(),
            (8, 8)
        );
    }

    #[test]
    fn test_extract_prefers_crossing_on_threshold() {
        let mut engine = open_engine(8, &[(0, 0), (1, 0)]);
        let start = TilePoint::new(IVec2::ZERO, IVec2::new(1, 4));
        let end = TilePoint::new(IVec2::new(1, 0), IVec2::new(4, 4));
        let result = engine.find_portal_path(start, end, false);
        let leg = FlowLeg::new(result.waypoints[0], result.waypoints[1]);

        let threshold = TilePoint::new(IVec2::ZERO, IVec2::new(7, 4));
        let extract = engine.get_flow_map_value(threshold, end, Some(leg)).unwrap();
        assert_eq!(extract.cell_value, 0.0);
        assert_eq!(extract.neighbors[Dir::EAST.index()], 1.0);
        assert_eq!(extract.neighbors[Dir::WEST.index()], 1.0 + PORTAL_THRESHOLD_PENALTY);
        assert!(extract.lowest().contains(&Dir::EAST));

        let inside = TilePoint::new(IVec2::ZERO, IVec2::new(5, 4));
        let extract = engine.get_flow_map_value(inside, end, Some(leg)).unwrap();
        let lowest = extract.lowest();
        assert!(lowest.contains(&Dir::EAST));
        assert!(lowest.iter().all(|d| d.offset().x == 1));
    }

    #[test]
    fn test_peek_never_solves() {
        let mut engine = open_engine(8, &[(0, 0), (1, 0)]);
        let start = TilePoint::new(IVec2::ZERO, IVec2::new(2, 4));
        let end = TilePoint::new(IVec2::new(1, 0), IVec2::new(4, 4));
        let result = engine.find_portal_path(start, end, false);
        let leg = FlowLeg::new(result.waypoints[0], result.waypoints[1]);

        // Without a cached field, neighbours are scored by cost and distance to the crossing.
        let extract = engine.peek_flow_map_value(start, leg).unwrap();
        assert_eq!(engine.flow_field_count(), 0);
        assert_eq!(extract.cell_value, 6.0);
        assert_eq!(extract.neighbors[Dir::EAST.index()], 6.0);
        assert_eq!(extract.neighbors[Dir::WEST.index()], 8.0);
        let lowest = extract.lowest();
        assert!(lowest.contains(&Dir::EAST));
        assert!(lowest.iter().all(|d| d.offset().x == 1));

        let solved = engine.get_flow_map_value(start, end, Some(leg)).unwrap();
        assert_eq!(engine.flow_field_count(), 1);
        assert_eq!(engine.peek_flow_map_value(start, leg), Ok(solved));

        let outside = TilePoint::new(IVec2::new(1, 0), IVec2::new(2, 4));
        assert!(engine.peek_flow_map_value(outside, leg).is_err());
    }

    #[test]
    fn test_extract_outside_loaded_tiles() {
        let mut engine = open_engine(4, &[(0, 0)]);
        let start = TilePoint::new(IVec2::ZERO, IVec2::new(0, 0));
        let end = TilePoint::new(IVec2::ZERO, IVec2::new(3, 3));
        let extract = engine.get_flow_map_value(start, end, None).unwrap();

        assert_eq!(extract.neighbors[Dir::WEST.index()], UNREACHED);
        assert_eq!(extract.neighbors[Dir::NORTH.index()], UNREACHED);
        assert_eq!(extract.lowest().as_slice(), &[Dir::SOUTHEAST]);
    }

    #[test]
    fn test_commit_rejects_stale_generation() {
        let mut engine = open_engine(4, &[(0, 0)]);
        let key = FieldKey::Points(vec![IVec2::new(1, 1)]);
        let job = engine.prepare_flow_job(IVec2::ZERO, &key).unwrap();
        let field = Arc::new(job.run());
        let generation = engine.tile(IVec2::ZERO).unwrap().generation();

        engine.update_map_tile(IVec2::ZERO, &[2; 16]).unwrap();
        assert!(!engine.commit_flow_field(IVec2::ZERO, generation, key.clone(), field.clone()));

        let generation = engine.tile(IVec2::ZERO).unwrap().generation();
        assert!(engine.commit_flow_field(IVec2::ZERO, generation, key.clone(), field.clone()));
        assert!(!engine.commit_flow_field(IVec2::ZERO, generation, key, field));
    }

    #[test]
    fn test_evict_flow_fields() {
        let mut engine = open_engine(4, &[(0, 0), (1, 0)]);
        for coord in [IVec2::new(0, 0), IVec2::new(1, 0)] {
            let point = TilePoint::new(coord, IVec2::new(1, 1));
            engine.fast_flow_map_lookup(point, point, None).unwrap();
        }
        assert_eq!(engine.flow_field_count(), 2);

        let in_use: FxHashSet<IVec2> = [IVec2::new(1, 0)].into_iter().collect();
        assert_eq!(engine.evict_flow_fields(&in_use), 1);
        assert!(engine.tile(IVec2::new(1, 0)).unwrap().field_count() == 1);
    }
}
