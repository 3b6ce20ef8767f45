use bevy::math::IVec2;

/// A location on the map, split into the tile coordinate and the cell within that tile.
///
/// A `TilePoint` is not normalized on construction. Call [`TilePoint::normalized`] after
/// offsetting `cell` outside `0..tile_length`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TilePoint {
    pub tile: IVec2,
    pub cell: IVec2,
}

impl TilePoint {
    pub fn new(tile: IVec2, cell: IVec2) -> Self {
        TilePoint { tile, cell }
    }

    /// Splits an absolute cell coordinate into tile and in-tile cell.
    pub fn from_absolute(absolute: IVec2, tile_length: i32) -> Self {
        TilePoint {
            tile: absolute.div_euclid(IVec2::splat(tile_length)),
            cell: absolute.rem_euclid(IVec2::splat(tile_length)),
        }
    }

    /// The absolute cell coordinate across all tiles.
    pub fn absolute(&self, tile_length: i32) -> IVec2 {
        self.tile * tile_length + self.cell
    }

    /// Moves out-of-range cell coordinates into the adjacent tiles.
    pub fn normalized(&self, tile_length: i32) -> Self {
        TilePoint::from_absolute(self.absolute(tile_length), tile_length)
    }

    pub fn is_normalized(&self, tile_length: i32) -> bool {
        in_tile(self.cell, tile_length)
    }
}

/// Returns true if `cell` lies inside a tile of side `tile_length`.
pub(crate) fn in_tile(cell: IVec2, tile_length: i32) -> bool {
    cell.x >= 0 && cell.y >= 0 && cell.x < tile_length && cell.y < tile_length
}

/// Chebyshev distance between two cells.
pub(crate) fn chebyshev(a: IVec2, b: IVec2) -> u32 {
    let d = (a - b).abs();
    d.x.max(d.y) as u32
}
