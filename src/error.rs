//! Errors returned by map updates and flow lookups.
use bevy::math::IVec2;
use thiserror::Error;

use crate::portal::PortalId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowPathError {
    #[error("tile data has {actual} cells, expected {expected}")]
    InvalidTileLength { expected: usize, actual: usize },
    #[error("tile data contains a zero cost at index {index}")]
    ZeroCost { index: usize },
    #[error("raw block has {actual} bytes, expected {expected}")]
    InvalidBlockSize { expected: usize, actual: usize },
    #[error("no tile is loaded at {0}")]
    TileNotLoaded(IVec2),
    #[error("locations {start} and {end} do not form a valid lookup")]
    LocationMismatch { start: IVec2, end: IVec2 },
    #[error("portal {0:?} no longer exists")]
    StalePortal(PortalId),
}
