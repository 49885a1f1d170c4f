//! Decomposition of the global domain into one axis-aligned region per process.
//!
//! Callers depend only on the [`Partition`] trait. Two schemes implement it:
//! - [`NonUniformPartition`]: independent rectangles with a two-phase commit
//! - [`QuadTreePartition`]: leaves of a recursive 2^D-ary tree

mod non_uniform;
mod quad_tree;

pub use non_uniform::NonUniformPartition;
pub use quad_tree::{GroupSpec, QuadNode, QuadTree, QuadTreePartition};

use crate::error::PartitionError;
use crate::geometry::{Direction, IntPoint, Rect};
use crate::Pid;
use std::collections::BTreeSet;

/// Callback run around a commit. It receives the partition in its
/// pre-commit state (pre hooks) or its freshly committed state (post hooks).
pub type CommitHook = Box<dyn FnMut(&dyn Partition) -> Result<(), PartitionError>>;

/// Owner queries, neighbor queries, and the begin/commit/abort protocol.
pub trait Partition {
    fn pid(&self) -> Pid;

    fn num_procs(&self) -> usize;

    fn domain_size(&self) -> &[i64];

    fn num_dims(&self) -> usize {
        self.domain_size().len()
    }

    fn domain(&self) -> Rect {
        Rect::from_size(self.domain_size())
    }

    fn is_toroidal(&self) -> bool;

    /// Number of successful commits so far.
    fn epoch(&self) -> u64;

    fn shape(&self, pid: Pid) -> Result<&Rect, PartitionError>;

    fn local_shape(&self) -> Result<&Rect, PartitionError> {
        self.shape(self.pid())
    }

    /// Committed shapes ordered by pid.
    fn shapes(&self) -> Vec<Rect>;

    fn point_owner(&self, point: &IntPoint) -> Result<Pid, PartitionError>;

    fn range_owners(&self, region: &Rect) -> Result<BTreeSet<Pid>, PartitionError>;

    /// Partitions touching `pid` by a face or corner, excluding `pid` itself.
    fn neighbor_ids(&self, pid: Pid) -> Result<Vec<Pid>, PartitionError>;

    /// Partitions across one face of `pid`, sorted by their projection with `dim` removed.
    fn neighbor_ids_shift(
        &self,
        pid: Pid,
        dim: usize,
        dir: Direction,
    ) -> Result<Vec<Pid>, PartitionError>;

    /// All `neighbor_ids_shift` lists, indexed by `dim * 2 + dir.index()`.
    fn ordered_neighbor_ids(&self, pid: Pid) -> Result<Vec<Vec<Pid>>, PartitionError> {
        let mut out = Vec::with_capacity(self.num_dims() * 2);
        for dim in 0..self.num_dims() {
            for dir in Direction::BOTH {
                out.push(self.neighbor_ids_shift(pid, dim, dir)?);
            }
        }
        Ok(out)
    }

    fn begin_update(&mut self, shape: Rect) -> Result<(), PartitionError>;

    /// The staged shape of `pid`, or its committed shape if nothing is staged.
    fn staged_shape(&self, pid: Pid) -> Result<&Rect, PartitionError>;

    /// Validates and applies staged changes, returning how many shapes changed.
    fn commit(&mut self) -> Result<usize, PartitionError>;

    fn abort(&mut self);

    fn register_pre_commit(&mut self, hook: CommitHook);

    fn register_post_commit(&mut self, hook: CommitHook);
}

/// Balanced factorization of `np` into `nd` block counts, largest first.
pub fn dims_create(np: usize, nd: usize) -> Vec<usize> {
    let mut dims = vec![1usize; nd];
    if nd == 0 {
        return dims;
    }
    let mut factors = Vec::new();
    let mut rest = np;
    let mut f = 2;
    while f * f <= rest {
        while rest % f == 0 {
            factors.push(f);
            rest /= f;
        }
        f += 1;
    }
    if rest > 1 {
        factors.push(rest);
    }
    for factor in factors.into_iter().rev() {
        let mut smallest = 0;
        for d in 1..nd {
            if dims[d] < dims[smallest] {
                smallest = d;
            }
        }
        dims[smallest] *= factor;
    }
    dims.sort_unstable_by(|a, b| b.cmp(a));
    dims
}
