//! Portals are the open spans along a tile's edges and the nodes of the portal graph.
use bevy::math::IVec2;
use smallvec::SmallVec;

use crate::dir::Orientation;

/// Handle to a portal, valid only for the tile build that created it.
///
/// Every time a tile is rebuilt it receives a new `generation`, so handles into
/// the discarded tile stop resolving instead of pointing at a different portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortalId {
    pub tile: IVec2,
    pub generation: u32,
    pub index: u16,
}

impl PortalId {
    pub fn new(tile: IVec2, generation: u32, index: u16) -> Self {
        PortalId {
            tile,
            generation,
            index,
        }
    }
}

/// Connection from one portal to another with its traversal cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortalEdge {
    pub to: PortalId,
    pub cost: u32,
}

#[derive(Debug, Clone)]
pub struct Portal {
    pub id: PortalId,
    /// First cell of the span, in tile-local coordinates.
    pub start: IVec2,
    /// Last cell of the span (inclusive).
    pub end: IVec2,
    pub center: IVec2,
    pub orientation: Orientation,
    pub(crate) edges: SmallVec<[PortalEdge; 8]>,
}

impl Portal {
    pub(crate) fn new(id: PortalId, start: IVec2, end: IVec2, orientation: Orientation) -> Self {
        Portal {
            id,
            start,
            end,
            center: start + (end - start) / 2,
            orientation,
            edges: SmallVec::new(),
        }
    }

    pub fn edges(&self) -> &[PortalEdge] {
        &self.edges
    }

    pub fn edge_cost(&self, to: PortalId) -> Option<u32> {
        self.edges.iter().find(|e| e.to == to).map(|e| e.cost)
    }

    pub fn is_connected_to(&self, to: PortalId) -> bool {
        self.edge_cost(to).is_some()
    }

    /// Number of cells in the span.
    pub fn width(&self) -> usize {
        ((self.end - self.start).abs().max_element() + 1) as usize
    }

    /// Cells covered by the span, in tile-local coordinates.
    pub fn cells(&self) -> impl Iterator<Item = IVec2> + '_ {
        let step = (self.end - self.start).signum();
        (0..self.width() as i32).map(move |i| self.start + step * i)
    }

    pub fn contains(&self, cell: IVec2) -> bool {
        let (lo, hi) = self.span();
        let along = self.along(cell);
        let across = self.across(cell);
        across == self.across(self.start) && along >= lo && along <= hi
    }

    /// Center in absolute cell coordinates.
    pub fn absolute_center(&self, tile_length: i32) -> IVec2 {
        self.id.tile * tile_length + self.center
    }

    /// Range of the span along its edge, shared by the tiles on both sides.
    pub fn span(&self) -> (i32, i32) {
        let a = self.along(self.start);
        let b = self.along(self.end);
        (a.min(b), a.max(b))
    }

    /// Intersection of two facing portals' spans along the shared edge.
    pub fn overlap(&self, other: &Portal) -> Option<(i32, i32)> {
        let (a0, a1) = self.span();
        let (b0, b1) = other.span();
        let lo = a0.max(b0);
        let hi = a1.min(b1);
        (lo <= hi).then_some((lo, hi))
    }

    /// Cells of this portal lying within `range` along the edge.
    pub(crate) fn cells_in(&self, range: (i32, i32)) -> Vec<IVec2> {
        self.cells()
            .filter(|c| {
                let along = self.along(*c);
                along >= range.0 && along <= range.1
            })
            .collect()
    }

    fn along(&self, cell: IVec2) -> i32 {
        match self.orientation {
            Orientation::Top | Orientation::Bottom => cell.x,
            Orientation::Left | Orientation::Right => cell.y,
        }
    }

    fn across(&self, cell: IVec2) -> i32 {
        match self.orientation {
            Orientation::Top | Orientation::Bottom => cell.y,
            Orientation::Left | Orientation::Right => cell.x,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn portal(start: IVec2, end: IVec2, orientation: Orientation) -> Portal {
        Portal::new(PortalId::new(IVec2::ZERO, 0, 0), start, end, orientation)
    }

    #[test]
    fn test_center_truncates() {
        let p = portal(IVec2::new(9, 1), IVec2::new(9, 4), Orientation::Right);
        assert_eq!(p.center, IVec2::new(9, 2));
        assert_eq!(p.width(), 4);
        assert_eq!(p.cells().count(), 4);
    }

    #[test]
    fn test_contains() {
        let p = portal(IVec2::new(2, 0), IVec2::new(5, 0), Orientation::Top);
        assert!(p.contains(IVec2::new(3, 0)));
        assert!(!p.contains(IVec2::new(3, 1)));
        assert!(!p.contains(IVec2::new(6, 0)));
    }

    #[test]
    fn test_overlap() {
        let a = portal(IVec2::new(2, 9), IVec2::new(6, 9), Orientation::Bottom);
        let b = portal(IVec2::new(5, 0), IVec2::new(8, 0), Orientation::Top);
        assert_eq!(a.overlap(&b), Some((5, 6)));
        assert_eq!(
            a.cells_in((5, 6)),
            vec![IVec2::new(5, 9), IVec2::new(6, 9)]
        );

        let c = portal(IVec2::new(7, 0), IVec2::new(8, 0), Orientation::Top);
        assert_eq!(a.overlap(&c), None);
    }
}
