//! Tiles own a square block of cell costs, the portals along its edges and the
//! direction fields computed for it.
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use std::sync::Arc;

use bevy::math::IVec2;
use ndarray::{ArcArray2, Array2, ShapeBuilder};
use rustc_hash::FxHashMap;

use crate::{
    astar::astar_grid,
    dir::Orientation,
    error::FlowPathError,
    flood_fill::flood_fill_regions,
    flow_field::{FieldKey, FlowField},
    path::Path,
    point::{chebyshev, in_tile},
    portal::{Portal, PortalEdge, PortalId},
    BLOCKED, EMPTY,
};

/// Checks raw tile data before it replaces anything.
pub(crate) fn validate_tile_data(data: &[u8], tile_length: usize) -> Result<(), FlowPathError> {
    let expected = tile_length * tile_length;
    if data.len() != expected {
        return Err(FlowPathError::InvalidTileLength {
            expected,
            actual: data.len(),
        });
    }

    if let Some(index) = data.iter().position(|&c| c == 0) {
        return Err(FlowPathError::ZeroCost { index });
    }

    Ok(())
}

/// Immutable cost grids shared between tiles. Uniformly open or uniformly blocked
/// tiles reuse one canonical buffer instead of allocating their own.
#[derive(Debug, Clone)]
pub(crate) struct CostBuffers {
    tile_length: usize,
    empty: ArcArray2<u8>,
    blocked: ArcArray2<u8>,
}

impl CostBuffers {
    pub(crate) fn new(tile_length: usize) -> Self {
        CostBuffers {
            tile_length,
            empty: Array2::from_elem((tile_length, tile_length), EMPTY).into_shared(),
            blocked: Array2::from_elem((tile_length, tile_length), BLOCKED).into_shared(),
        }
    }

    pub(crate) fn empty(&self) -> ArcArray2<u8> {
        self.empty.clone()
    }

    pub(crate) fn blocked(&self) -> ArcArray2<u8> {
        self.blocked.clone()
    }

    /// Converts row-major tile data (`x + y * tile_length`) into a grid indexed `[[x, y]]`.
    pub(crate) fn share(&self, data: &[u8]) -> Result<ArcArray2<u8>, FlowPathError> {
        validate_tile_data(data, self.tile_length)?;

        if data.iter().all(|&c| c == EMPTY) {
            return Ok(self.empty());
        }
        if data.iter().all(|&c| c == BLOCKED) {
            return Ok(self.blocked());
        }

        let len = self.tile_length;
        Array2::from_shape_vec((len, len).f(), data.to_vec())
            .map(|a| a.into_shared())
            .map_err(|_| FlowPathError::InvalidTileLength {
                expected: len * len,
                actual: data.len(),
            })
    }

    pub(crate) fn is_canonical(&self, costs: &ArcArray2<u8>) -> bool {
        costs.as_ptr() == self.empty.as_ptr() || costs.as_ptr() == self.blocked.as_ptr()
    }
}

/// A square block of the map.
#[derive(Debug)]
pub struct Tile {
    coordinates: IVec2,
    generation: u32,
    costs: ArcArray2<u8>,
    portals: Vec<Portal>,
    fields: FxHashMap<FieldKey, Arc<FlowField>>,
}

impl Tile {
    /// Builds the tile's portals and connects the ones sharing a region.
    pub fn new(coordinates: IVec2, generation: u32, costs: ArcArray2<u8>) -> Self {
        let mut tile = Tile {
            coordinates,
            generation,
            costs,
            portals: Vec::new(),
            fields: FxHashMap::default(),
        };

        tile.scan_portals();
        tile.connect_internal_portals();
        tile
    }

    pub fn coordinates(&self) -> IVec2 {
        self.coordinates
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn length(&self) -> usize {
        self.costs.dim().0
    }

    pub fn costs(&self) -> &ArcArray2<u8> {
        &self.costs
    }

    /// Cost of a tile-local cell, [`BLOCKED`] outside the tile.
    pub fn cost(&self, cell: IVec2) -> u8 {
        if !in_tile(cell, self.length() as i32) {
            return BLOCKED;
        }
        self.costs[[cell.x as usize, cell.y as usize]]
    }

    pub fn portals(&self) -> &[Portal] {
        &self.portals
    }

    /// Resolves a handle, failing for handles from an earlier build of this tile.
    pub fn portal(&self, id: PortalId) -> Option<&Portal> {
        if id.tile != self.coordinates || id.generation != self.generation {
            return None;
        }
        self.portals.get(id.index as usize)
    }

    /// Intra-tile search between two local cells.
    pub fn find_path(&self, start: IVec2, end: IVec2) -> Option<Path> {
        astar_grid(&self.costs.view(), start, end)
    }

    fn scan_portals(&mut self) {
        let len = self.length() as i32;
        let max = len - 1;

        let edges = [
            (Orientation::Left, IVec2::new(0, 0), IVec2::new(0, 1)),
            (Orientation::Right, IVec2::new(max, 0), IVec2::new(0, 1)),
            (Orientation::Top, IVec2::new(0, 0), IVec2::new(1, 0)),
            (Orientation::Bottom, IVec2::new(0, max), IVec2::new(1, 0)),
        ];

        for (orientation, origin, step) in edges {
            let mut run_start: Option<IVec2> = None;
            for i in 0..len {
                let cell = origin + step * i;
                let open = self.cost(cell) != BLOCKED;
                match (run_start, open) {
                    (None, true) => run_start = Some(cell),
                    (Some(start), false) => {
                        self.push_portal(start, cell - step, orientation);
                        run_start = None;
                    }
                    _ => {}
                }
            }
            if let Some(start) = run_start {
                self.push_portal(start, origin + step * max, orientation);
            }
        }
    }

    fn push_portal(&mut self, start: IVec2, end: IVec2, orientation: Orientation) {
        let id = PortalId::new(self.coordinates, self.generation, self.portals.len() as u16);
        self.portals.push(Portal::new(id, start, end, orientation));
    }

    /// Connects every ordered pair of portals in the same region with the cost of the
    /// intra-tile path between their centers.
    fn connect_internal_portals(&mut self) {
        if self.portals.len() < 2 {
            return;
        }

        let (labels, _) = flood_fill_regions(self.costs.view());
        let region_of = |p: &Portal| labels[[p.start.x as usize, p.start.y as usize]];

        let pairs: Vec<(usize, usize)> = (0..self.portals.len())
            .flat_map(|i| (0..self.portals.len()).map(move |j| (i, j)))
            .filter(|&(i, j)| i != j)
            .filter(|&(i, j)| {
                let a = region_of(&self.portals[i]);
                a.is_some() && a == region_of(&self.portals[j])
            })
            .collect();

        let view = self.costs.view();
        let centers: Vec<IVec2> = self.portals.iter().map(|p| p.center).collect();

        #[cfg(feature = "parallel")]
        let pairs_iter = pairs.par_iter();
        #[cfg(not(feature = "parallel"))]
        let pairs_iter = pairs.iter();

        let connections: Vec<(usize, usize, u32)> = pairs_iter
            .filter_map(|&(i, j)| {
                astar_grid(&view, centers[i], centers[j]).map(|path| (i, j, path.cost()))
            })
            .collect();

        for (i, j, cost) in connections {
            let to = self.portals[j].id;
            self.portals[i].edges.push(PortalEdge { to, cost });
        }
    }

    /// Links portals on `side` of this tile with the overlapping portals of `other`,
    /// which must be the neighbour across that edge.
    pub fn connect_overlapping_portals(&mut self, other: &mut Tile, side: Orientation) {
        let tile_length = self.length() as i32;
        let facing = side.facing();

        for this_portal in self.portals.iter_mut().filter(|p| p.orientation == side) {
            for other_portal in other.portals.iter_mut().filter(|p| p.orientation == facing) {
                if this_portal.overlap(other_portal).is_none() {
                    continue;
                }

                let a = this_portal.absolute_center(tile_length);
                let b = other_portal.absolute_center(tile_length);
                let cost_a = self.costs[[this_portal.center.x as usize, this_portal.center.y as usize]];
                let cost_b = other.costs[[other_portal.center.x as usize, other_portal.center.y as usize]];
                let cost = (chebyshev(a, b) * (cost_a as u32 + cost_b as u32).div_ceil(2)).max(1);

                this_portal.edges.push(PortalEdge {
                    to: other_portal.id,
                    cost,
                });
                other_portal.edges.push(PortalEdge {
                    to: this_portal.id,
                    cost,
                });
            }
        }
    }

    /// Drops every edge pointing into the tile at `coord`.
    pub(crate) fn remove_edges_to(&mut self, coord: IVec2) {
        for portal in self.portals.iter_mut() {
            portal.edges.retain(|e| e.to.tile != coord);
        }
    }

    pub fn field(&self, key: &FieldKey) -> Option<Arc<FlowField>> {
        self.fields.get(key).cloned()
    }

    /// Caches a field. Returns false if an equivalent field was already cached.
    pub(crate) fn insert_field(&mut self, key: FieldKey, field: Arc<FlowField>) -> bool {
        if self.fields.contains_key(&key) {
            return false;
        }
        self.fields.insert(key, field);
        true
    }

    pub(crate) fn retain_fields(&mut self, mut keep: impl FnMut(&FieldKey) -> bool) -> usize {
        let before = self.fields.len();
        self.fields.retain(|k, _| keep(k));
        before - self.fields.len()
    }

    pub(crate) fn clear_fields(&mut self) -> usize {
        let count = self.fields.len();
        self.fields.clear();
        count
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field_keys(&self) -> impl Iterator<Item = &FieldKey> {
        self.fields.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffers() -> CostBuffers {
        CostBuffers::new(10)
    }

    fn tile_from(coord: IVec2, generation: u32, data: &[u8]) -> Tile {
        let costs = buffers().share(data).unwrap();
        Tile::new(coord, generation, costs)
    }

    #[test]
    fn test_open_tile_portals() {
        let tile = tile_from(IVec2::ZERO, 0, &[1; 100]);

        assert_eq!(tile.portals().len(), 4);
        let orientations: Vec<_> = tile.portals().iter().map(|p| p.orientation).collect();
        assert_eq!(
            orientations,
            vec![
                Orientation::Left,
                Orientation::Right,
                Orientation::Top,
                Orientation::Bottom
            ]
        );
        assert_eq!(tile.portals()[0].start, IVec2::new(0, 0));
        assert_eq!(tile.portals()[0].end, IVec2::new(0, 9));
        assert_eq!(tile.portals()[0].center, IVec2::new(0, 4));
        for portal in tile.portals() {
            assert_eq!(portal.edges().len(), 3);
        }
    }

    #[test]
    fn test_blocked_tile_has_no_portals() {
        let tile = tile_from(IVec2::ZERO, 0, &[BLOCKED; 100]);
        assert!(tile.portals().is_empty());
    }

    #[test]
    fn test_portals_split_by_blocked_cells() {
        let mut data = [1u8; 100];
        // Block the left edge at y = 3 and y = 4.
        data[3 * 10] = BLOCKED;
        data[4 * 10] = BLOCKED;
        let tile = tile_from(IVec2::ZERO, 0, &data);

        let left: Vec<_> = tile
            .portals()
            .iter()
            .filter(|p| p.orientation == Orientation::Left)
            .collect();
        assert_eq!(left.len(), 2);
        assert_eq!((left[0].start, left[0].end), (IVec2::new(0, 0), IVec2::new(0, 2)));
        assert_eq!((left[1].start, left[1].end), (IVec2::new(0, 5), IVec2::new(0, 9)));
    }

    #[test]
    fn test_separate_regions_stay_disconnected() {
        let mut data = [1u8; 100];
        for y in 0..10 {
            data[5 + y * 10] = BLOCKED;
        }
        let tile = tile_from(IVec2::ZERO, 0, &data);

        let left = tile
            .portals()
            .iter()
            .find(|p| p.orientation == Orientation::Left)
            .unwrap();
        let right = tile
            .portals()
            .iter()
            .find(|p| p.orientation == Orientation::Right)
            .unwrap();
        assert!(!left.is_connected_to(right.id));

        // Top and bottom each split into two portals, one per side of the wall.
        assert_eq!(tile.portals().len(), 6);
        for portal in tile.portals() {
            assert_eq!(portal.edges().len(), 2);
        }
    }

    #[test]
    fn test_canonical_buffers_are_shared() {
        let buffers = buffers();
        let a = buffers.share(&[EMPTY; 100]).unwrap();
        let b = buffers.share(&[EMPTY; 100]).unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert!(buffers.is_canonical(&a));

        let mut data = [EMPTY; 100];
        data[7] = 3;
        let c = buffers.share(&data).unwrap();
        assert!(!buffers.is_canonical(&c));
        assert_eq!(c[[7, 0]], 3);
    }

    #[test]
    fn test_rejects_invalid_data() {
        let buffers = buffers();
        assert_eq!(
            buffers.share(&[1; 99]).unwrap_err(),
            FlowPathError::InvalidTileLength {
                expected: 100,
                actual: 99
            }
        );

        let mut data = [1u8; 100];
        data[42] = 0;
        assert_eq!(
            buffers.share(&data).unwrap_err(),
            FlowPathError::ZeroCost { index: 42 }
        );
    }

    #[test]
    fn test_connect_overlapping_portals_is_symmetric() {
        let mut a = tile_from(IVec2::new(0, 0), 1, &[1; 100]);
        let mut data = [1u8; 100];
        for y in 0..6 {
            data[y * 10] = BLOCKED;
        }
        let mut b = tile_from(IVec2::new(1, 0), 2, &data);

        a.connect_overlapping_portals(&mut b, Orientation::Right);

        let right = a
            .portals()
            .iter()
            .find(|p| p.orientation == Orientation::Right)
            .unwrap();
        let left = b
            .portals()
            .iter()
            .find(|p| p.orientation == Orientation::Left)
            .unwrap();

        let cost = right.edge_cost(left.id).unwrap();
        assert_eq!(left.edge_cost(right.id), Some(cost));
        assert!(cost >= 1);

        b.remove_edges_to(a.coordinates());
        let left = b
            .portals()
            .iter()
            .find(|p| p.orientation == Orientation::Left)
            .unwrap();
        assert!(!left.is_connected_to(right.id));
    }

    #[test]
    fn test_stale_portal_handles() {
        let tile = tile_from(IVec2::new(2, 3), 7, &[1; 100]);
        let id = tile.portals()[0].id;
        assert!(tile.portal(id).is_some());

        let stale = PortalId::new(id.tile, 6, id.index);
        assert!(tile.portal(stale).is_none());
    }

    #[test]
    fn test_field_cache() {
        let mut tile = tile_from(IVec2::ZERO, 0, &[1; 100]);
        let key = FieldKey::Points(vec![IVec2::new(1, 1)]);
        let field = Arc::new(crate::eikonal::solve(tile.costs().view(), &[IVec2::new(1, 1)]));

        assert!(tile.insert_field(key.clone(), field.clone()));
        assert!(!tile.insert_field(key.clone(), field));
        assert_eq!(tile.field_count(), 1);
        assert!(tile.field(&key).is_some());
        assert_eq!(tile.clear_fields(), 1);
        assert!(tile.field(&key).is_none());
    }
}
