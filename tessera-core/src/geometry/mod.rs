//! Value types describing axis-aligned regions and points in N dimensions.

mod point;
mod rect;
mod segment;

pub use point::{Coord, Coords, IntPoint, Point, RealPoint};
pub use rect::{Cells, Rect};
pub use segment::Segment;

use serde::{Deserialize, Serialize};

/// Side of a box along one dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    Lower,
    Upper,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Lower, Direction::Upper];

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Lower => Direction::Upper,
            Direction::Upper => Direction::Lower,
        }
    }

    /// Slot of this direction in per-(dimension, direction) tables.
    pub fn index(self) -> usize {
        match self {
            Direction::Lower => 0,
            Direction::Upper => 1,
        }
    }

    pub fn sign(self) -> i64 {
        match self {
            Direction::Lower => -1,
            Direction::Upper => 1,
        }
    }
}
