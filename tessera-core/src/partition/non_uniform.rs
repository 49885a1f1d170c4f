use super::{dims_create, CommitHook, Partition};
use crate::error::{GeometryError, PartitionError};
use crate::geometry::{Direction, IntPoint, Rect, Segment};
use crate::index::SegmentTree;
use crate::Pid;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Decomposition into independent rectangles, one per process.
///
/// Owner queries are answered by one `SegmentTree` per dimension: the
/// owners of a point or box are the intersection of the per-dimension
/// answers. Shapes only change through `begin_update` + `commit`, which
/// validates that the staged layout still tiles the domain before
/// swapping it in.
pub struct NonUniformPartition {
    pid: Pid,
    np: usize,
    size: Vec<i64>,
    toroidal: bool,
    min_extent: Option<Vec<i64>>,
    shapes: BTreeMap<Pid, Rect>,
    staged: BTreeMap<Pid, Rect>,
    indices: Vec<SegmentTree>,
    epoch: u64,
    pre_commit: Vec<CommitHook>,
    post_commit: Vec<CommitHook>,
}

impl NonUniformPartition {
    pub fn new(pid: Pid, np: usize, size: &[i64], toroidal: bool) -> Result<Self, PartitionError> {
        if np == 0 || pid >= np {
            return Err(PartitionError::Setup(format!(
                "pid {} is not valid for {} processes",
                pid, np
            )));
        }
        if size.is_empty() || size.iter().any(|&s| s <= 0) {
            return Err(PartitionError::Setup(format!(
                "domain size {:?} must be non-empty and positive",
                size
            )));
        }
        let mut partition = NonUniformPartition {
            pid,
            np,
            size: size.to_vec(),
            toroidal,
            min_extent: None,
            shapes: BTreeMap::new(),
            staged: BTreeMap::new(),
            indices: Vec::new(),
            epoch: 0,
            pre_commit: Vec::new(),
            post_commit: Vec::new(),
        };
        partition.indices = partition.empty_indices();
        Ok(partition)
    }

    /// Rejects layouts in which any partition is thinner than `extent`
    /// (normally the halo depth, so halos never reach past direct neighbors).
    pub fn with_min_extent(mut self, extent: &[i64]) -> Self {
        self.min_extent = Some(extent.to_vec());
        self
    }

    /// Adds a partition during setup. Call `validate` once all are inserted.
    pub fn insert_partition(&mut self, shape: Rect) -> Result<(), PartitionError> {
        let pid = shape.id().ok_or_else(|| PartitionError::Unassigned(shape.clone()))?;
        if pid >= self.np {
            return Err(PartitionError::UnknownPartition(pid));
        }
        if self.shapes.contains_key(&pid) {
            return Err(PartitionError::DuplicatePartition(pid));
        }
        self.check_dims(&shape)?;
        if !self.domain().contains_rect(&shape) {
            return Err(PartitionError::OutsideDomain {
                shape,
                domain: self.domain(),
            });
        }
        for (dim, index) in self.indices.iter_mut().enumerate() {
            index.insert(Segment::new(shape.lower()[dim], shape.upper()[dim], pid));
        }
        debug!("Inserted partition {}", shape);
        self.shapes.insert(pid, shape);
        Ok(())
    }

    /// Splits the domain into a grid of `np` blocks. Without explicit `dims`
    /// the block counts are a balanced factorization of `np`.
    pub fn init_uniformly(&mut self, dims: Option<&[usize]>) -> Result<(), PartitionError> {
        if !self.shapes.is_empty() {
            return Err(PartitionError::Setup(
                "partition is already initialized".to_string(),
            ));
        }
        let nd = self.size.len();
        let dims = match dims {
            Some(d) => d.to_vec(),
            None => dims_create(self.np, nd),
        };
        if dims.len() != nd || dims.iter().product::<usize>() != self.np {
            return Err(PartitionError::Setup(format!(
                "grid {:?} does not hold {} partitions in {} dimensions",
                dims, self.np, nd
            )));
        }
        for (d, &count) in dims.iter().enumerate() {
            if count == 0 || self.size[d] < count as i64 {
                return Err(PartitionError::Setup(format!(
                    "dimension {} of size {} cannot be split into {} blocks",
                    d, self.size[d], count
                )));
            }
        }

        for pid in 0..self.np {
            // Row-major grid coordinates, last dimension fastest
            let mut rest = pid;
            let mut coords = vec![0usize; nd];
            for d in (0..nd).rev() {
                coords[d] = rest % dims[d];
                rest /= dims[d];
            }
            let mut lower = Vec::with_capacity(nd);
            let mut upper = Vec::with_capacity(nd);
            for d in 0..nd {
                let (start, end) = block_bounds(self.size[d], dims[d], coords[d]);
                lower.push(start);
                upper.push(end);
            }
            let shape = Rect::new(IntPoint::new(lower), IntPoint::new(upper))?.with_id(pid);
            self.insert_partition(shape)?;
        }
        self.validate()?;
        info!(
            "Partitioned domain {:?} uniformly into {:?} blocks",
            self.size, dims
        );
        Ok(())
    }

    /// Checks that the committed shapes tile the domain.
    pub fn validate(&self) -> Result<(), PartitionError> {
        self.check_tiling(&self.shapes)
    }

    fn check_dims(&self, shape: &Rect) -> Result<(), PartitionError> {
        if shape.nd() != self.size.len() {
            return Err(GeometryError::DimensionMismatch {
                expected: self.size.len(),
                actual: shape.nd(),
            }
            .into());
        }
        Ok(())
    }

    fn check_tiling(&self, shapes: &BTreeMap<Pid, Rect>) -> Result<(), PartitionError> {
        if shapes.len() != self.np || shapes.keys().any(|&pid| pid >= self.np) {
            return Err(PartitionError::TilingViolation(format!(
                "expected {} partitions, found {}",
                self.np,
                shapes.len()
            )));
        }
        let domain = self.domain();
        let mut total = 0i64;
        for shape in shapes.values() {
            if !domain.contains_rect(shape) {
                return Err(PartitionError::TilingViolation(format!(
                    "{} extends past the domain {}",
                    shape, domain
                )));
            }
            if shape.is_empty() {
                return Err(PartitionError::TilingViolation(format!("{} is empty", shape)));
            }
            if let Some(min) = &self.min_extent {
                if let Some(d) = (0..shape.nd()).find(|&d| shape.extent(d) < min[d]) {
                    return Err(PartitionError::TilingViolation(format!(
                        "{} is thinner than {} along dimension {}",
                        shape, min[d], d
                    )));
                }
            }
            total += shape.area();
        }

        for d in 0..self.size.len() {
            let mut projection = SegmentTree::new();
            for (&pid, shape) in shapes {
                projection.insert(Segment::new(shape.lower()[d], shape.upper()[d], pid));
            }
            if !projection.covers(0, self.size[d]) {
                return Err(PartitionError::TilingViolation(format!(
                    "dimension {} is not fully covered",
                    d
                )));
            }
        }

        let all: Vec<&Rect> = shapes.values().collect();
        for (i, a) in all.iter().enumerate() {
            if let Some(b) = all[i + 1..].iter().find(|b| a.intersects(b)) {
                return Err(PartitionError::TilingViolation(format!(
                    "{} overlaps {}",
                    a, b
                )));
            }
        }
        if total != domain.area() {
            return Err(PartitionError::TilingViolation(format!(
                "partitions cover {} cells of {}",
                total,
                domain.area()
            )));
        }
        Ok(())
    }

    fn empty_indices(&self) -> Vec<SegmentTree> {
        self.size
            .iter()
            .map(|&s| {
                if self.toroidal {
                    SegmentTree::toroidal(0, s)
                } else {
                    SegmentTree::new()
                }
            })
            .collect()
    }

    fn rebuild_indices(&mut self) {
        let mut indices = self.empty_indices();
        for (&pid, shape) in &self.shapes {
            for (dim, index) in indices.iter_mut().enumerate() {
                index.insert(Segment::new(shape.lower()[dim], shape.upper()[dim], pid));
            }
        }
        self.indices = indices;
    }

    /// Owners of `region` without the empty-result check.
    fn owners_of(&self, region: &Rect) -> BTreeSet<Pid> {
        let mut owners: Option<BTreeSet<Pid>> = None;
        for (dim, index) in self.indices.iter().enumerate() {
            let found = index.intersect(region.lower()[dim], region.upper()[dim]);
            let next = match owners {
                Some(prev) => prev.intersection(&found).copied().collect(),
                None => found,
            };
            if next.is_empty() {
                return next;
            }
            owners = Some(next);
        }
        owners.unwrap_or_default()
    }

    fn run_hooks(&mut self, post: bool) -> Result<(), PartitionError> {
        let mut hooks = if post {
            std::mem::take(&mut self.post_commit)
        } else {
            std::mem::take(&mut self.pre_commit)
        };
        let result = hooks.iter_mut().try_for_each(|hook| hook(&*self));
        // Hooks registered while running are kept after the existing ones
        let target = if post {
            &mut self.post_commit
        } else {
            &mut self.pre_commit
        };
        hooks.append(target);
        *target = hooks;
        result
    }
}

/// Start and end of block `index` when `size` cells are split into `count`
/// blocks; leading blocks absorb the remainder.
fn block_bounds(size: i64, count: usize, index: usize) -> (i64, i64) {
    let count = count as i64;
    let index = index as i64;
    let base = size / count;
    let rem = size % count;
    let start = index * base + index.min(rem);
    let len = base + if index < rem { 1 } else { 0 };
    (start, start + len)
}

impl Partition for NonUniformPartition {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn num_procs(&self) -> usize {
        self.np
    }

    fn domain_size(&self) -> &[i64] {
        &self.size
    }

    fn is_toroidal(&self) -> bool {
        self.toroidal
    }

    fn epoch(&self) -> u64 {
        self.epoch
    }

    fn shape(&self, pid: Pid) -> Result<&Rect, PartitionError> {
        self.shapes
            .get(&pid)
            .ok_or(PartitionError::UnknownPartition(pid))
    }

    fn shapes(&self) -> Vec<Rect> {
        self.shapes.values().cloned().collect()
    }

    fn point_owner(&self, point: &IntPoint) -> Result<Pid, PartitionError> {
        if point.nd() != self.size.len() {
            return Err(GeometryError::DimensionMismatch {
                expected: self.size.len(),
                actual: point.nd(),
            }
            .into());
        }
        let mut owners: Option<BTreeSet<Pid>> = None;
        for (dim, index) in self.indices.iter().enumerate() {
            let found = index.contains(point[dim]);
            owners = Some(match owners {
                Some(prev) => prev.intersection(&found).copied().collect(),
                None => found,
            });
        }
        let owners: Vec<Pid> = owners.unwrap_or_default().into_iter().collect();
        match owners.as_slice() {
            [pid] => Ok(*pid),
            _ => Err(PartitionError::AmbiguousOwner {
                point: point.clone(),
                owners,
            }),
        }
    }

    fn range_owners(&self, region: &Rect) -> Result<BTreeSet<Pid>, PartitionError> {
        self.check_dims(region)?;
        let owners = self.owners_of(region);
        if owners.is_empty() {
            return Err(PartitionError::NoOwner {
                region: region.clone(),
            });
        }
        Ok(owners)
    }

    fn neighbor_ids(&self, pid: Pid) -> Result<Vec<Pid>, PartitionError> {
        let shape = self.shape(pid)?;
        let expanded = shape.resize_all(&vec![1; self.size.len()])?;
        let mut owners = self.owners_of(&expanded);
        owners.remove(&pid);
        Ok(owners.into_iter().collect())
    }

    fn neighbor_ids_shift(
        &self,
        pid: Pid,
        dim: usize,
        dir: Direction,
    ) -> Result<Vec<Pid>, PartitionError> {
        let shape = self.shape(pid)?;
        // One-cell slab just outside the face
        let slab = match dir {
            Direction::Upper => shape
                .resize_dir(dim, Direction::Upper, 1)?
                .resize_dir(dim, Direction::Lower, -shape.extent(dim))?,
            Direction::Lower => shape
                .resize_dir(dim, Direction::Lower, 1)?
                .resize_dir(dim, Direction::Upper, -shape.extent(dim))?,
        };
        if !self.toroidal && !slab.intersects(&self.domain()) {
            return Ok(Vec::new());
        }
        let mut owners = self.owners_of(&slab);
        owners.remove(&pid);
        let mut ids: Vec<Pid> = owners.into_iter().collect();
        ids.sort_by_cached_key(|id| {
            self.shapes
                .get(id)
                .map(|s| s.reduce_dim(dim))
        });
        Ok(ids)
    }

    fn begin_update(&mut self, shape: Rect) -> Result<(), PartitionError> {
        let pid = shape.id().ok_or_else(|| PartitionError::Unassigned(shape.clone()))?;
        if !self.shapes.contains_key(&pid) {
            return Err(PartitionError::UnknownPartition(pid));
        }
        self.check_dims(&shape)?;
        debug!("Staged {} for partition {}", shape, pid);
        self.staged.insert(pid, shape);
        Ok(())
    }

    fn staged_shape(&self, pid: Pid) -> Result<&Rect, PartitionError> {
        match self.staged.get(&pid) {
            Some(shape) => Ok(shape),
            None => self.shape(pid),
        }
    }

    fn commit(&mut self) -> Result<usize, PartitionError> {
        if self.staged.is_empty() {
            return Ok(0);
        }
        let staged = std::mem::take(&mut self.staged);
        let mut next = self.shapes.clone();
        let mut changed = 0;
        for (pid, shape) in staged {
            if self.shapes.get(&pid) != Some(&shape) {
                changed += 1;
            }
            next.insert(pid, shape);
        }
        if let Err(err) = self.check_tiling(&next) {
            warn!("Partition {} rejected commit: {}", self.pid, err);
            return Err(err);
        }
        if changed == 0 {
            return Ok(0);
        }

        self.run_hooks(false)?;
        self.shapes = next;
        self.rebuild_indices();
        self.epoch += 1;
        info!(
            "Partition {} committed epoch {} ({} shapes changed)",
            self.pid, self.epoch, changed
        );
        self.run_hooks(true)?;
        Ok(changed)
    }

    fn abort(&mut self) {
        if !self.staged.is_empty() {
            debug!("Partition {} discarded {} staged shapes", self.pid, self.staged.len());
        }
        self.staged.clear();
    }

    fn register_pre_commit(&mut self, hook: CommitHook) {
        self.pre_commit.push(hook);
    }

    fn register_post_commit(&mut self, hook: CommitHook) {
        self.post_commit.push(hook);
    }
}

impl fmt::Debug for NonUniformPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonUniformPartition")
            .field("pid", &self.pid)
            .field("np", &self.np)
            .field("size", &self.size)
            .field("toroidal", &self.toroidal)
            .field("epoch", &self.epoch)
            .field("shapes", &self.shapes)
            .field("staged", &self.staged)
            .finish()
    }
}
