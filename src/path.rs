//! Result of an intra-tile search.
use bevy::math::IVec2;

/// Cells visited by a search inside one tile and the total movement cost.
///
/// The cells run from the first step after the start to the goal, so a path
/// between identical points is empty with a cost of 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Path {
    cells: Vec<IVec2>,
    cost: u32,
}

impl Path {
    pub fn new(cells: Vec<IVec2>, cost: u32) -> Self {
        Path { cells, cost }
    }

    pub fn cells(&self) -> &[IVec2] {
        &self.cells
    }

    /// Returns the movement cost of the path
    pub fn cost(&self) -> u32 {
        self.cost
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn contains(&self, cell: IVec2) -> bool {
        self.cells.contains(&cell)
    }

    pub fn goal(&self) -> Option<IVec2> {
        self.cells.last().copied()
    }
}

impl IntoIterator for Path {
    type Item = IVec2;
    type IntoIter = std::vec::IntoIter<IVec2>;

    fn into_iter(self) -> Self::IntoIter {
        self.cells.into_iter()
    }
}
