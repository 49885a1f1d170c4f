//! Process-local buffers behind a halo field.

mod continuous;
mod grid;

pub use continuous::ContinuousStorage;
pub use grid::GridStorage;

use tessera_core::{Handle, RealPoint, Rect};
use tessera_transport::SerializationError;
use thiserror::Error;

/// A region to pack or unpack, plus the translation from the peer's
/// coordinate frame into ours. Non-zero only for toroidal images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlap {
    pub region: Rect,
    pub shift: Vec<i64>,
}

impl Overlap {
    pub fn new(region: Rect) -> Self {
        let nd = region.nd();
        Overlap {
            region: region.without_id(),
            shift: vec![0; nd],
        }
    }

    pub fn with_shift(region: Rect, shift: Vec<i64>) -> Self {
        Overlap {
            region: region.without_id(),
            shift,
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Expected {expected} elements, received {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("{point} lies outside the storage shape {shape}")]
    OutsideShape { point: RealPoint, shape: Rect },

    #[error("Handle {0:?} no longer refers to a stored object")]
    StaleHandle(Handle),

    #[error("Codec error: {0}")]
    Codec(#[from] SerializationError),
}

/// Storage that can be resized and serialized region by region.
///
/// `pack` writes the regions in order into one buffer and `unpack` replaces
/// the content of the same number of regions with it, so both sides of an
/// exchange must list matching regions in matching order.
pub trait FieldStorage {
    fn shape(&self) -> &Rect;

    /// Resizes to `shape`, keeping whatever lies in both the old and new shapes.
    fn reshape(&mut self, shape: &Rect);

    fn pack(&self, regions: &[Overlap]) -> Result<Vec<u8>, StorageError>;

    fn unpack(&mut self, regions: &[Overlap], buf: &[u8]) -> Result<(), StorageError>;
}
