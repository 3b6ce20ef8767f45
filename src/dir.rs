//! Compass directions used by flow fields and portal orientations.
//!
//! Cell coordinates grow to the right (x) and downwards (y), so `NORTH` is `(0, -1)`.
use bevy::math::{IVec2, Vec2};
use strum::EnumIter;

/// One of the 8 movement directions. The discriminant is the direction index
/// stored in flow fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter)]
pub enum Dir {
    WEST = 0,
    SOUTH = 1,
    EAST = 2,
    NORTH = 3,
    NORTHWEST = 4,
    SOUTHWEST = 5,
    SOUTHEAST = 6,
    NORTHEAST = 7,
}

pub use self::Dir::*;

const ALL: [Dir; 8] = [
    WEST, SOUTH, EAST, NORTH, NORTHWEST, SOUTHWEST, SOUTHEAST, NORTHEAST,
];

impl Dir {
    /// All directions in index order.
    pub fn all() -> std::iter::Copied<std::slice::Iter<'static, Dir>> {
        ALL.iter().copied()
    }

    pub fn from_index(index: usize) -> Option<Dir> {
        ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Cell offset of one step in this direction.
    pub fn offset(self) -> IVec2 {
        match self {
            WEST => IVec2::new(-1, 0),
            SOUTH => IVec2::new(0, 1),
            EAST => IVec2::new(1, 0),
            NORTH => IVec2::new(0, -1),
            NORTHWEST => IVec2::new(-1, -1),
            SOUTHWEST => IVec2::new(-1, 1),
            SOUTHEAST => IVec2::new(1, 1),
            NORTHEAST => IVec2::new(1, -1),
        }
    }

    /// Normalized steering vector for this direction.
    pub fn vector(self) -> Vec2 {
        self.offset().as_vec2().normalize()
    }

    pub fn opposite(self) -> Dir {
        match self {
            WEST => EAST,
            SOUTH => NORTH,
            EAST => WEST,
            NORTH => SOUTH,
            NORTHWEST => SOUTHEAST,
            SOUTHWEST => NORTHEAST,
            SOUTHEAST => NORTHWEST,
            NORTHEAST => SOUTHWEST,
        }
    }

    /// The neighbouring direction 45 degrees counter-clockwise on screen.
    pub fn rotate_left(self) -> Dir {
        match self {
            WEST => SOUTHWEST,
            SOUTH => SOUTHEAST,
            EAST => NORTHEAST,
            NORTH => NORTHWEST,
            NORTHWEST => WEST,
            SOUTHWEST => SOUTH,
            SOUTHEAST => EAST,
            NORTHEAST => NORTH,
        }
    }

    /// The neighbouring direction 45 degrees clockwise on screen.
    pub fn rotate_right(self) -> Dir {
        match self {
            WEST => NORTHWEST,
            SOUTH => SOUTHWEST,
            EAST => SOUTHEAST,
            NORTH => NORTHEAST,
            NORTHWEST => NORTH,
            SOUTHWEST => WEST,
            SOUTHEAST => SOUTH,
            NORTHEAST => EAST,
        }
    }

    pub fn is_diagonal(self) -> bool {
        matches!(self, NORTHWEST | SOUTHWEST | SOUTHEAST | NORTHEAST)
    }

    /// The two orthogonal offsets a diagonal step cuts past.
    pub fn corner_offsets(self) -> Option<(IVec2, IVec2)> {
        if !self.is_diagonal() {
            return None;
        }
        let o = self.offset();
        Some((IVec2::new(o.x, 0), IVec2::new(0, o.y)))
    }
}

/// The tile edge a portal lies on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter)]
pub enum Orientation {
    Top,
    Bottom,
    Left,
    Right,
}

impl Orientation {
    /// Offset from a tile to the neighbouring tile across this edge.
    pub fn tile_offset(self) -> IVec2 {
        self.outward().offset()
    }

    /// Direction that leaves the tile through this edge.
    pub fn outward(self) -> Dir {
        match self {
            Orientation::Top => NORTH,
            Orientation::Bottom => SOUTH,
            Orientation::Left => WEST,
            Orientation::Right => EAST,
        }
    }

    /// The edge of the neighbouring tile that faces this one.
    pub fn facing(self) -> Orientation {
        match self {
            Orientation::Top => Orientation::Bottom,
            Orientation::Bottom => Orientation::Top,
            Orientation::Left => Orientation::Right,
            Orientation::Right => Orientation::Left,
        }
    }

    pub fn from_tile_offset(offset: IVec2) -> Option<Orientation> {
        match (offset.x, offset.y) {
            (0, -1) => Some(Orientation::Top),
            (0, 1) => Some(Orientation::Bottom),
            (-1, 0) => Some(Orientation::Left),
            (1, 0) => Some(Orientation::Right),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_index_roundtrip() {
        for dir in Dir::iter() {
            assert_eq!(Dir::from_index(dir.index()), Some(dir));
        }
        assert_eq!(Dir::from_index(8), None);
    }

    #[test]
    fn test_opposite_cancels_offset() {
        for dir in Dir::all() {
            assert_eq!(dir.offset() + dir.opposite().offset(), IVec2::ZERO);
            assert_eq!(dir.opposite().opposite(), dir);
        }
    }

    #[test]
    fn test_rotations_are_inverse() {
        for dir in Dir::all() {
            assert_eq!(dir.rotate_left().rotate_right(), dir);
            assert_ne!(dir.rotate_left().is_diagonal(), dir.is_diagonal());
        }
        assert_eq!(EAST.rotate_left(), NORTHEAST);
        assert_eq!(EAST.rotate_right(), SOUTHEAST);
    }

    #[test]
    fn test_corner_offsets() {
        assert_eq!(NORTH.corner_offsets(), None);
        assert_eq!(
            SOUTHEAST.corner_offsets(),
            Some((IVec2::new(1, 0), IVec2::new(0, 1)))
        );
    }

    #[test]
    fn test_orientation_facing() {
        for orientation in Orientation::iter() {
            assert_eq!(orientation.facing().facing(), orientation);
            assert_eq!(
                orientation.tile_offset() + orientation.facing().tile_offset(),
                IVec2::ZERO
            );
            assert_eq!(
                Orientation::from_tile_offset(orientation.tile_offset()),
                Some(orientation)
            );
        }
    }
}
