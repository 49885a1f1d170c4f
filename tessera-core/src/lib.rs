//! Geometry, ownership indices and partition schemes shared by every rank.

pub mod entity;
pub mod error;
pub mod geometry;
pub mod index;
pub mod partition;
pub mod timing;

/// Process (partition) identifier, `0..num_procs`.
pub type Pid = usize;

pub use entity::{Arena, Handle};
pub use error::{GeometryError, PartitionError, QuadTreeError};
pub use geometry::{Direction, IntPoint, Point, RealPoint, Rect, Segment};
pub use index::SegmentTree;
pub use partition::{
    dims_create, CommitHook, GroupSpec, NonUniformPartition, Partition, QuadNode, QuadTree,
    QuadTreePartition,
};
pub use timing::{MovingAverage, TimingStat, Timings};
