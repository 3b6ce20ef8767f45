//! Direction fields and the work needed to produce them.
use bevy::math::IVec2;
use ndarray::{s, Array2, ArcArray2};
use smallvec::SmallVec;

use crate::{dir::Dir, eikonal, portal::PortalId, BLOCKED, UNREACHED};

/// One cell of a direction field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowCell {
    /// Accumulated cost to the nearest target.
    pub value: f32,
    /// Step towards a lower value, `None` on targets and unreached cells.
    pub dir: Option<Dir>,
}

impl Default for FlowCell {
    fn default() -> Self {
        FlowCell {
            value: UNREACHED,
            dir: None,
        }
    }
}

/// Arrival values and directions for every cell of a tile.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowField {
    cells: Array2<FlowCell>,
}

impl FlowField {
    pub fn new(cells: Array2<FlowCell>) -> Self {
        FlowField { cells }
    }

    pub fn cells(&self) -> &Array2<FlowCell> {
        &self.cells
    }

    pub fn get(&self, cell: IVec2) -> Option<&FlowCell> {
        if cell.x < 0 || cell.y < 0 {
            return None;
        }
        self.cells.get((cell.x as usize, cell.y as usize))
    }

    pub fn dir(&self, cell: IVec2) -> Option<Dir> {
        self.get(cell).and_then(|c| c.dir)
    }

    /// Arrival value at `cell`, [`UNREACHED`] outside the field.
    pub fn value(&self, cell: IVec2) -> f32 {
        self.get(cell).map_or(UNREACHED, |c| c.value)
    }

    /// Overrides the direction of the given cells.
    pub(crate) fn force_dir(&mut self, cells: &[IVec2], dir: Dir) {
        for cell in cells {
            if let Some(c) = self.cells.get_mut((cell.x as usize, cell.y as usize)) {
                c.dir = Some(dir);
            }
        }
    }

    /// Copies the `length`-sized square starting at `origin`.
    pub(crate) fn quadrant(&self, origin: IVec2, length: usize) -> FlowField {
        let x = origin.x as usize;
        let y = origin.y as usize;
        FlowField {
            cells: self.cells.slice(s![x..x + length, y..y + length]).to_owned(),
        }
    }
}

/// Identifies a cached field within a tile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKey {
    /// Leads to `target` in this tile, restricted to its overlap with `connected` across the edge.
    Portal {
        target: PortalId,
        connected: PortalId,
    },
    /// Solved over the 2x2 tile block that contains a diagonal jump to `lookahead`.
    Lookahead {
        target: PortalId,
        lookahead: PortalId,
    },
    /// Leads directly to a set of cells in this tile.
    Points(Vec<IVec2>),
}

impl FieldKey {
    /// Returns true if the field depends on data of the tile at `coord`.
    pub fn touches_tile(&self, coord: IVec2) -> bool {
        match self {
            FieldKey::Portal { target, connected } => {
                target.tile == coord || connected.tile == coord
            }
            FieldKey::Lookahead { target, lookahead } => {
                let min = target.tile.min(lookahead.tile);
                let max = target.tile.max(lookahead.tile);
                coord.cmpge(min).all() && coord.cmple(max).all()
            }
            FieldKey::Points(_) => false,
        }
    }
}

/// The portal pair an agent is currently walking towards, plus the optional
/// portal after the next tile for diagonal lookahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowLeg {
    pub next: PortalId,
    pub connected: PortalId,
    pub lookahead: Option<PortalId>,
}

impl FlowLeg {
    pub fn new(next: PortalId, connected: PortalId) -> Self {
        FlowLeg {
            next,
            connected,
            lookahead: None,
        }
    }

    pub fn with_lookahead(mut self, lookahead: Option<PortalId>) -> Self {
        self.lookahead = lookahead;
        self
    }

    /// The lookahead portal, if it lies in a tile diagonal to the leg's tile.
    pub fn diagonal_lookahead(&self) -> Option<PortalId> {
        self.lookahead
            .filter(|l| (l.tile - self.next.tile).length_squared() == 2)
    }

    pub fn key(&self) -> FieldKey {
        match self.diagonal_lookahead() {
            Some(lookahead) => FieldKey::Lookahead {
                target: self.next,
                lookahead,
            },
            None => FieldKey::Portal {
                target: self.next,
                connected: self.connected,
            },
        }
    }
}

/// Flow values around one cell, used when no precise direction is available yet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowMapExtract {
    pub cell_value: f32,
    /// Indexed by [`Dir::index`].
    pub neighbors: [f32; 8],
}

impl FlowMapExtract {
    /// Directions sharing the lowest neighbour value, if any neighbour is passable.
    pub fn lowest(&self) -> SmallVec<[Dir; 8]> {
        let min = self
            .neighbors
            .iter()
            .copied()
            .fold(f32::INFINITY, f32::min);

        if min >= UNREACHED {
            return SmallVec::new();
        }

        Dir::all()
            .filter(|d| self.neighbors[d.index()] <= min)
            .collect()
    }
}

pub(crate) enum JobSource {
    Tile(ArcArray2<u8>),
    /// Four tiles in block order (top-left, top-right, bottom-left, bottom-right) and the
    /// block position of the tile the field is extracted for.
    Block {
        tiles: [ArcArray2<u8>; 4],
        quadrant: IVec2,
    },
}

/// Everything needed to solve one field, copied out of the engine so the
/// solve can run without holding the map lock.
pub(crate) struct FlowJob {
    pub(crate) source: JobSource,
    /// Target cells in the coordinate space of `source`.
    pub(crate) targets: Vec<IVec2>,
    /// Cells forced to step through a portal, in tile coordinates.
    pub(crate) forced: Option<(Vec<IVec2>, Dir)>,
}

impl FlowJob {
    pub(crate) fn run(&self) -> FlowField {
        let mut field = match &self.source {
            JobSource::Tile(costs) => eikonal::solve(costs.view(), &self.targets),
            JobSource::Block { tiles, quadrant } => {
                let length = tiles[0].dim().0;
                let mut block = Array2::from_elem((length * 2, length * 2), BLOCKED);
                for (i, tile) in tiles.iter().enumerate() {
                    let x = (i % 2) * length;
                    let y = (i / 2) * length;
                    block
                        .slice_mut(s![x..x + length, y..y + length])
                        .assign(tile);
                }

                let solved = eikonal::solve(block.view(), &self.targets);
                solved.quadrant(*quadrant * length as i32, length)
            }
        };

        if let Some((cells, dir)) = &self.forced {
            field.force_dir(cells, *dir);
        }

        field
    }
}
