use crate::geometry::{IntPoint, Rect};
use crate::Pid;
use thiserror::Error;

/// Errors raised while constructing or combining geometry values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Lower bound exceeds upper bound in dimension {dim}: {lower} > {upper}")]
    InvertedBounds { dim: usize, lower: i64, upper: i64 },

    #[error("{a} and {b} do not intersect")]
    Disjoint { a: Rect, b: Rect },
}

/// Errors raised by the quad tree decomposition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuadTreeError {
    #[error("{np} processes cannot be arranged in a {nd}-dimensional quad tree")]
    InvalidProcessCount { np: usize, nd: usize },

    #[error("Node id pool exhausted, cannot add more children")]
    PoolExhausted,

    #[error("Origin {origin} is not strictly inside node {node} with shape {shape}")]
    OriginOutside { node: usize, origin: IntPoint, shape: Rect },

    #[error("Point {0} lies outside the tree")]
    PointOutside(IntPoint),

    #[error("Unknown quad tree node {0}")]
    UnknownNode(usize),

    #[error("Tree has {leaves} leaves but there are {np} processes")]
    LeafCountMismatch { leaves: usize, np: usize },

    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

/// Errors raised by partition schemes.
///
/// `AmbiguousOwner`, `NoOwner` and `TilingViolation` are structural invariant
/// violations: they mean the decomposition is corrupt and callers should stop
/// the run rather than try to recover.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PartitionError {
    #[error("Point {point} resolves to owners {owners:?} instead of exactly one")]
    AmbiguousOwner { point: IntPoint, owners: Vec<Pid> },

    #[error("No partition overlaps {region}")]
    NoOwner { region: Rect },

    #[error("Tiling invariant violated: {0}")]
    TilingViolation(String),

    #[error("Partition {0} already exists")]
    DuplicatePartition(Pid),

    #[error("Unknown partition {0}")]
    UnknownPartition(Pid),

    #[error("Shape {0} carries no partition id")]
    Unassigned(Rect),

    #[error("Shape {shape} lies outside the domain {domain}")]
    OutsideDomain { shape: Rect, domain: Rect },

    #[error("Invalid partition setup: {0}")]
    Setup(String),

    #[error("{0} is not supported by this partition scheme")]
    Unsupported(&'static str),

    #[error("Commit hook failed: {0}")]
    Hook(String),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    QuadTree(#[from] QuadTreeError),
}

impl PartitionError {
    /// Whether this error signals a corrupted decomposition.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            PartitionError::AmbiguousOwner { .. }
                | PartitionError::NoOwner { .. }
                | PartitionError::TilingViolation(_)
        )
    }
}
