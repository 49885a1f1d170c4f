use super::{CommitHook, NonUniformPartition, Partition};
use crate::error::{PartitionError, QuadTreeError};
use crate::geometry::{Direction, IntPoint, Rect};
use crate::Pid;
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone, PartialEq)]
pub struct QuadNode {
    id: usize,
    level: usize,
    shape: Rect,
    origin: Option<IntPoint>,
    parent: Option<usize>,
    children: Vec<usize>,
    proc: Option<Pid>,
}

impl QuadNode {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn shape(&self) -> &Rect {
        &self.shape
    }

    /// Split point, `None` for leaves.
    pub fn origin(&self) -> Option<&IntPoint> {
        self.origin.as_ref()
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn children(&self) -> &[usize] {
        &self.children
    }

    /// Process mapped to this node by `QuadTree::map_procs`.
    pub fn proc(&self) -> Option<Pid> {
        self.proc
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Recursive 2^D-ary subdivision of a box.
///
/// Nodes live in an arena keyed by id. The root is always id 0 and the
/// others draw ids from a bounded pool sized for `np` leaves.
#[derive(Debug, Clone)]
pub struct QuadTree {
    nd: usize,
    nodes: BTreeMap<usize, QuadNode>,
    free: VecDeque<usize>,
    depth: usize,
}

impl QuadTree {
    pub fn new(shape: Rect, np: usize) -> Result<Self, QuadTreeError> {
        let nd = shape.nd();
        let div = 1usize << nd;
        // In one dimension every split adds exactly one leaf
        let valid = match nd {
            0 => false,
            1 => np >= 1,
            _ => np % (div - 1) == 1,
        };
        if !valid {
            return Err(QuadTreeError::InvalidProcessCount { np, nd });
        }
        let capacity = np / (div - 1) * div;
        let root = QuadNode {
            id: 0,
            level: 0,
            shape: shape.without_id(),
            origin: None,
            parent: None,
            children: Vec::new(),
            proc: None,
        };
        Ok(QuadTree {
            nd,
            nodes: BTreeMap::from([(0, root)]),
            free: (1..=capacity).collect(),
            depth: 0,
        })
    }

    pub fn root(&self) -> &QuadNode {
        &self.nodes[&0]
    }

    pub fn node(&self, id: usize) -> Result<&QuadNode, QuadTreeError> {
        self.nodes.get(&id).ok_or(QuadTreeError::UnknownNode(id))
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &QuadNode> {
        self.nodes.values()
    }

    /// Leaves in ascending id order.
    pub fn leaves(&self) -> Vec<&QuadNode> {
        self.nodes.values().filter(|n| n.is_leaf()).collect()
    }

    /// Node ids level by level, children in position order.
    pub fn breadth_first(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut queue = VecDeque::from([0usize]);
        while let Some(id) = queue.pop_front() {
            order.push(id);
            if let Some(node) = self.nodes.get(&id) {
                queue.extend(node.children.iter().copied());
            }
        }
        order
    }

    pub fn leaf_containing(&self, point: &IntPoint) -> Result<&QuadNode, QuadTreeError> {
        let mut curr = self.root();
        if !curr.shape.contains(point) {
            return Err(QuadTreeError::PointOutside(point.clone()));
        }
        while let Some(origin) = &curr.origin {
            let pos = self.child_index(origin, point);
            curr = self.node(curr.children[pos])?;
        }
        Ok(curr)
    }

    /// Whether `ancestor` is `node` or lies on its path to the root.
    pub fn is_ancestor_of(&self, ancestor: usize, node: usize) -> bool {
        let mut curr = Some(node);
        while let Some(id) = curr {
            if id == ancestor {
                return true;
            }
            curr = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    /// Splits the leaf containing `point` at that point.
    pub fn split(&mut self, point: &IntPoint) -> Result<usize, QuadTreeError> {
        let leaf = self.leaf_containing(point)?.id;
        self.split_node(leaf, point)?;
        Ok(leaf)
    }

    pub fn split_all(&mut self, points: &[IntPoint]) -> Result<(), QuadTreeError> {
        points.iter().try_for_each(|p| self.split(p).map(|_| ()))
    }

    /// Moves the split point of `id`, reshaping every descendant. A leaf is
    /// split instead. Nothing changes if any descendant origin would fall
    /// outside its new shape.
    pub fn move_origin(&mut self, id: usize, origin: &IntPoint) -> Result<(), QuadTreeError> {
        let node = self.node(id)?;
        if node.is_leaf() {
            return self.split_node(id, origin);
        }
        self.check_origin(node, origin)?;
        let mut updates = Vec::new();
        self.plan_reshape(id, node.shape.clone(), Some(origin.clone()), &mut updates)?;
        for (node_id, shape, new_origin) in updates {
            if let Some(n) = self.nodes.get_mut(&node_id) {
                n.shape = shape;
                if new_origin.is_some() {
                    n.origin = new_origin;
                }
            }
        }
        debug!("Moved origin of quad node {} to {}", id, origin);
        Ok(())
    }

    /// Removes every descendant of `id`, returning their ids to the pool.
    pub fn merge(&mut self, id: usize) -> Result<(), QuadTreeError> {
        let node = self.nodes.get_mut(&id).ok_or(QuadTreeError::UnknownNode(id))?;
        let mut stack = std::mem::take(&mut node.children);
        node.origin = None;
        while let Some(child) = stack.pop() {
            if let Some(removed) = self.nodes.remove(&child) {
                stack.extend(removed.children);
                self.free.push_back(child);
            }
        }
        self.depth = self.nodes.values().map(|n| n.level).max().unwrap_or(0);
        Ok(())
    }

    /// Maps leaves in ascending id order to procs `0..np`. Each internal
    /// node takes the proc of its first child.
    pub fn map_procs(&mut self, np: usize) -> Result<(), QuadTreeError> {
        let leaves: Vec<usize> = self.leaves().iter().map(|n| n.id).collect();
        if leaves.len() != np {
            return Err(QuadTreeError::LeafCountMismatch {
                leaves: leaves.len(),
                np,
            });
        }
        for (proc, id) in leaves.iter().enumerate() {
            if let Some(node) = self.nodes.get_mut(id) {
                node.proc = Some(proc);
            }
        }
        // Deepest first so children are mapped before their parents
        let mut order = self.breadth_first();
        order.reverse();
        for id in order {
            let first = self.nodes.get(&id).and_then(|n| n.children.first().copied());
            if let Some(first) = first {
                let proc = self.nodes.get(&first).and_then(|n| n.proc);
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.proc = proc;
                }
            }
        }
        Ok(())
    }

    /// Procs of the leaves under `id`, sorted.
    pub fn subtree_procs(&self, id: usize) -> Result<Vec<Pid>, QuadTreeError> {
        let mut procs = Vec::new();
        let mut stack = vec![id];
        while let Some(curr) = stack.pop() {
            let node = self.node(curr)?;
            if node.is_leaf() {
                procs.extend(node.proc);
            } else {
                stack.extend(node.children.iter().copied());
            }
        }
        procs.sort_unstable();
        Ok(procs)
    }

    fn split_node(&mut self, id: usize, origin: &IntPoint) -> Result<(), QuadTreeError> {
        let node = self.node(id)?;
        self.check_origin(node, origin)?;
        if !node.is_leaf() {
            return self.move_origin(id, origin);
        }
        let count = 1usize << self.nd;
        if self.free.len() < count {
            return Err(QuadTreeError::PoolExhausted);
        }
        let shape = node.shape.clone();
        let level = node.level + 1;
        let mut children = Vec::with_capacity(count);
        for pos in 0..count {
            let child_shape = self.child_shape(&shape, origin, pos)?;
            let child_id = self.free.pop_front().ok_or(QuadTreeError::PoolExhausted)?;
            self.nodes.insert(
                child_id,
                QuadNode {
                    id: child_id,
                    level,
                    shape: child_shape,
                    origin: None,
                    parent: Some(id),
                    children: Vec::new(),
                    proc: None,
                },
            );
            children.push(child_id);
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.origin = Some(origin.clone());
            node.children = children;
        }
        self.depth = self.depth.max(level);
        debug!("Split quad node {} at {}", id, origin);
        Ok(())
    }

    /// Collects the new shape (and origin) of `id` and its descendants.
    fn plan_reshape(
        &self,
        id: usize,
        shape: Rect,
        origin: Option<IntPoint>,
        updates: &mut Vec<(usize, Rect, Option<IntPoint>)>,
    ) -> Result<(), QuadTreeError> {
        let node = self.node(id)?;
        let effective = match (&origin, &node.origin) {
            (Some(o), _) | (None, Some(o)) => Some(o.clone()),
            (None, None) => None,
        };
        if let Some(o) = &effective {
            if !is_interior(&shape, o) {
                return Err(QuadTreeError::OriginOutside {
                    node: id,
                    origin: o.clone(),
                    shape,
                });
            }
            for (pos, &child) in node.children.iter().enumerate() {
                let child_shape = self.child_shape(&shape, o, pos)?;
                self.plan_reshape(child, child_shape, None, updates)?;
            }
        }
        updates.push((id, shape, origin));
        Ok(())
    }

    fn check_origin(&self, node: &QuadNode, origin: &IntPoint) -> Result<(), QuadTreeError> {
        if !is_interior(&node.shape, origin) {
            return Err(QuadTreeError::OriginOutside {
                node: node.id,
                origin: origin.clone(),
                shape: node.shape.clone(),
            });
        }
        Ok(())
    }

    /// Child `pos` takes the upper half of dimension `d` when bit `nd - d - 1` is set.
    fn child_shape(&self, shape: &Rect, origin: &IntPoint, pos: usize) -> Result<Rect, QuadTreeError> {
        let mut lower = Vec::with_capacity(self.nd);
        let mut upper = Vec::with_capacity(self.nd);
        for d in 0..self.nd {
            if (pos >> (self.nd - d - 1)) & 1 == 1 {
                lower.push(origin[d]);
                upper.push(shape.upper()[d]);
            } else {
                lower.push(shape.lower()[d]);
                upper.push(origin[d]);
            }
        }
        Ok(Rect::new(IntPoint::new(lower), IntPoint::new(upper))?)
    }

    fn child_index(&self, origin: &IntPoint, point: &IntPoint) -> usize {
        (0..self.nd).fold(0, |idx, d| idx << 1 | usize::from(point[d] >= origin[d]))
    }
}

fn is_interior(shape: &Rect, point: &IntPoint) -> bool {
    point.nd() == shape.nd()
        && (0..shape.nd()).all(|d| shape.lower()[d] < point[d] && point[d] < shape.upper()[d])
}

/// One group of the hierarchy: the leaf procs under a quad tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    pub level: usize,
    pub node: usize,
    pub master_proc: Pid,
    pub shape: Rect,
    pub members: Vec<Pid>,
}

/// Partition whose shapes are the leaves of a `QuadTree`.
///
/// Shapes can only change by moving split points, so the free-form
/// `insert_partition` and `begin_update` are rejected.
#[derive(Debug)]
pub struct QuadTreePartition {
    inner: NonUniformPartition,
    tree: QuadTree,
    leaf: Option<usize>,
}

impl QuadTreePartition {
    pub fn new(pid: Pid, np: usize, size: &[i64], toroidal: bool) -> Result<Self, PartitionError> {
        let inner = NonUniformPartition::new(pid, np, size, toroidal)?;
        let tree = QuadTree::new(Rect::from_size(size), np)?;
        Ok(QuadTreePartition {
            inner,
            tree,
            leaf: None,
        })
    }

    pub fn with_min_extent(mut self, extent: &[i64]) -> Self {
        self.inner = self.inner.with_min_extent(extent);
        self
    }

    pub fn insert_partition(&mut self, _shape: Rect) -> Result<(), PartitionError> {
        Err(PartitionError::Unsupported("insert_partition"))
    }

    pub fn init_uniformly(&mut self, _dims: Option<&[usize]>) -> Result<(), PartitionError> {
        Err(PartitionError::Unsupported("init_uniformly"))
    }

    /// Splits the tree at each point in turn and installs the leaves as
    /// partitions.
    pub fn init_quad_tree(&mut self, split_points: &[IntPoint]) -> Result<(), PartitionError> {
        self.tree.split_all(split_points)?;
        self.tree.map_procs(self.inner.num_procs())?;
        for leaf in self.tree.leaves() {
            if let Some(proc) = leaf.proc() {
                self.inner.insert_partition(leaf.shape().clone().with_id(proc))?;
                if proc == self.inner.pid() {
                    self.leaf = Some(leaf.id());
                }
            }
        }
        self.inner.validate()?;
        info!(
            "Built quad tree of depth {} with {} leaves",
            self.tree.depth(),
            self.inner.num_procs()
        );
        Ok(())
    }

    pub fn tree(&self) -> &QuadTree {
        &self.tree
    }

    /// Leaf node mapped to this process.
    pub fn leaf_node(&self) -> Result<&QuadNode, PartitionError> {
        let id = self.leaf.ok_or(PartitionError::Setup(
            "quad tree is not initialized".to_string(),
        ))?;
        Ok(self.tree.node(id)?)
    }

    /// Moves the split point of internal node `node` and commits the new
    /// leaf shapes. On failure the tree and the partition are unchanged.
    pub fn move_origin(&mut self, node: usize, origin: &IntPoint) -> Result<usize, PartitionError> {
        if self.tree.node(node)?.is_leaf() {
            return Err(PartitionError::Unsupported("move_origin on a leaf"));
        }
        let mut next = self.tree.clone();
        next.move_origin(node, origin)?;
        for leaf in next.leaves() {
            if let Some(proc) = leaf.proc() {
                if let Err(err) = self.inner.begin_update(leaf.shape().clone().with_id(proc)) {
                    self.inner.abort();
                    return Err(err);
                }
            }
        }
        let changed = self.inner.commit()?;
        self.tree = next;
        Ok(changed)
    }

    /// Groups for every node, level by level. Collective group creation must
    /// walk them in this order on every process.
    pub fn group_specs(&self) -> Result<Vec<GroupSpec>, PartitionError> {
        let mut specs = Vec::with_capacity(self.tree.len());
        for id in self.tree.breadth_first() {
            let node = self.tree.node(id)?;
            let master_proc = node.proc().ok_or(PartitionError::Setup(
                "quad tree is not initialized".to_string(),
            ))?;
            specs.push(GroupSpec {
                level: node.level(),
                node: id,
                master_proc,
                shape: node.shape().clone(),
                members: self.tree.subtree_procs(id)?,
            });
        }
        Ok(specs)
    }

    /// Whether this process's leaf lies under `node`.
    pub fn is_member(&self, node: usize) -> bool {
        self.leaf
            .map_or(false, |leaf| self.tree.is_ancestor_of(node, leaf))
    }
}

impl Partition for QuadTreePartition {
    fn pid(&self) -> Pid {
        self.inner.pid()
    }

    fn num_procs(&self) -> usize {
        self.inner.num_procs()
    }

    fn domain_size(&self) -> &[i64] {
        self.inner.domain_size()
    }

    fn is_toroidal(&self) -> bool {
        self.inner.is_toroidal()
    }

    fn epoch(&self) -> u64 {
        self.inner.epoch()
    }

    fn shape(&self, pid: Pid) -> Result<&Rect, PartitionError> {
        self.inner.shape(pid)
    }

    fn shapes(&self) -> Vec<Rect> {
        self.inner.shapes()
    }

    fn point_owner(&self, point: &IntPoint) -> Result<Pid, PartitionError> {
        self.inner.point_owner(point)
    }

    fn range_owners(&self, region: &Rect) -> Result<BTreeSet<Pid>, PartitionError> {
        self.inner.range_owners(region)
    }

    fn neighbor_ids(&self, pid: Pid) -> Result<Vec<Pid>, PartitionError> {
        self.inner.neighbor_ids(pid)
    }

    fn neighbor_ids_shift(
        &self,
        pid: Pid,
        dim: usize,
        dir: Direction,
    ) -> Result<Vec<Pid>, PartitionError> {
        self.inner.neighbor_ids_shift(pid, dim, dir)
    }

    fn begin_update(&mut self, _shape: Rect) -> Result<(), PartitionError> {
        Err(PartitionError::Unsupported("begin_update"))
    }

    fn staged_shape(&self, pid: Pid) -> Result<&Rect, PartitionError> {
        self.inner.staged_shape(pid)
    }

    fn commit(&mut self) -> Result<usize, PartitionError> {
        self.inner.commit()
    }

    fn abort(&mut self) {
        self.inner.abort()
    }

    fn register_pre_commit(&mut self, hook: CommitHook) {
        self.inner.register_pre_commit(hook)
    }

    fn register_post_commit(&mut self, hook: CommitHook) {
        self.inner.register_post_commit(hook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(x: i64, y: i64) -> IntPoint {
        IntPoint::from([x, y])
    }

    fn rect(lower: [i64; 2], upper: [i64; 2]) -> Rect {
        Rect::new(IntPoint::from(lower), IntPoint::from(upper)).unwrap()
    }

    /// 100x100 field split at (40,60), then its upper-left quadrant at (10,80).
    fn seven_leaves() -> QuadTree {
        let mut qt = QuadTree::new(Rect::from_size(&[100, 100]), 7).unwrap();
        qt.split(&p(40, 60)).unwrap();
        qt.split(&p(10, 80)).unwrap();
        qt
    }

    #[test]
    fn test_process_count_validity() {
        let square = Rect::from_size(&[10, 10]);
        for np in [1, 4, 7, 10] {
            assert!(QuadTree::new(square.clone(), np).is_ok(), "np = {}", np);
        }
        assert_eq!(
            QuadTree::new(square, 5).unwrap_err(),
            QuadTreeError::InvalidProcessCount { np: 5, nd: 2 }
        );
        let cube = Rect::from_size(&[8, 8, 8]);
        assert!(QuadTree::new(cube.clone(), 15).is_ok());
        assert!(QuadTree::new(cube, 9).is_err());
        assert!(QuadTree::new(Rect::from_size(&[12]), 3).is_ok());
    }

    #[test]
    fn test_split_child_layout() {
        let mut qt = QuadTree::new(Rect::from_size(&[100, 100]), 7).unwrap();
        assert_eq!(qt.split(&p(40, 60)).unwrap(), 0);
        assert_eq!(qt.root().children(), &[1, 2, 3, 4]);
        assert_eq!(qt.node(1).unwrap().shape(), &rect([0, 0], [40, 60]));
        assert_eq!(qt.node(2).unwrap().shape(), &rect([0, 60], [40, 100]));
        assert_eq!(qt.node(3).unwrap().shape(), &rect([40, 0], [100, 60]));
        assert_eq!(qt.node(4).unwrap().shape(), &rect([40, 60], [100, 100]));
        assert_eq!(qt.leaf_containing(&p(50, 50)).unwrap().id(), 3);
        assert_eq!(qt.depth(), 1);
    }

    #[test]
    fn test_nested_split_and_pool() {
        let mut qt = seven_leaves();
        assert_eq!(qt.node(2).unwrap().children(), &[5, 6, 7, 8]);
        assert_eq!(qt.node(5).unwrap().level(), 2);
        assert_eq!(qt.depth(), 2);
        let leaves: Vec<usize> = qt.leaves().iter().map(|n| n.id()).collect();
        assert_eq!(leaves, vec![1, 3, 4, 5, 6, 7, 8]);
        assert!(qt.is_ancestor_of(0, 7));
        assert!(qt.is_ancestor_of(2, 7));
        assert!(!qt.is_ancestor_of(3, 7));

        assert_eq!(qt.split(&p(70, 30)), Err(QuadTreeError::PoolExhausted));
        assert_eq!(qt.len(), 9);
    }

    #[test]
    fn test_origin_must_be_interior() {
        let mut qt = QuadTree::new(Rect::from_size(&[100, 100]), 7).unwrap();
        assert!(matches!(
            qt.split(&p(0, 50)),
            Err(QuadTreeError::OriginOutside { node: 0, .. })
        ));
        assert_eq!(
            qt.split(&p(100, 50)),
            Err(QuadTreeError::PointOutside(p(100, 50)))
        );
    }

    #[test]
    fn test_move_origin_reshapes_descendants() {
        let mut qt = seven_leaves();
        qt.move_origin(0, &p(60, 70)).unwrap();
        assert_eq!(qt.node(2).unwrap().shape(), &rect([0, 70], [60, 100]));
        assert_eq!(qt.node(5).unwrap().shape(), &rect([0, 70], [10, 80]));
        assert_eq!(qt.node(8).unwrap().shape(), &rect([10, 80], [60, 100]));
        assert_eq!(qt.leaf_containing(&p(50, 50)).unwrap().id(), 1);

        // Node 2 keeps its origin at x=10, which would fall outside [0,5)
        let before = qt.clone();
        assert!(matches!(
            qt.move_origin(0, &p(5, 50)),
            Err(QuadTreeError::OriginOutside { node: 2, .. })
        ));
        assert_eq!(qt.node(2).unwrap().shape(), before.node(2).unwrap().shape());
    }

    #[test]
    fn test_merge_returns_ids() {
        let mut qt = seven_leaves();
        qt.merge(2).unwrap();
        assert_eq!(qt.depth(), 1);
        assert!(qt.node(2).unwrap().is_leaf());
        assert!(qt.node(2).unwrap().origin().is_none());
        assert_eq!(qt.node(5), Err(QuadTreeError::UnknownNode(5)));
        // Freed ids are handed out again
        qt.split(&p(70, 30)).unwrap();
        let mut reused = qt.node(3).unwrap().children().to_vec();
        reused.sort_unstable();
        assert_eq!(reused, vec![5, 6, 7, 8]);

        qt.merge(0).unwrap();
        assert_eq!(qt.len(), 1);
        assert_eq!(qt.depth(), 0);
    }

    #[test]
    fn test_map_procs() {
        let mut qt = seven_leaves();
        qt.map_procs(7).unwrap();
        let procs: Vec<Option<Pid>> = [1, 3, 4, 5, 6, 7, 8]
            .iter()
            .map(|&id| qt.node(id).unwrap().proc())
            .collect();
        assert_eq!(procs, (0..7).map(Some).collect::<Vec<_>>());
        assert_eq!(qt.node(2).unwrap().proc(), Some(3));
        assert_eq!(qt.root().proc(), Some(0));
        assert_eq!(qt.subtree_procs(2).unwrap(), vec![3, 4, 5, 6]);

        assert_eq!(
            qt.map_procs(4),
            Err(QuadTreeError::LeafCountMismatch { leaves: 7, np: 4 })
        );
    }

    fn partition(pid: Pid) -> QuadTreePartition {
        let mut part = QuadTreePartition::new(pid, 7, &[100, 100], false).unwrap();
        part.init_quad_tree(&[p(40, 60), p(10, 80)]).unwrap();
        part
    }

    #[test]
    fn test_partition_from_tree() {
        let part = partition(3);
        assert_eq!(part.point_owner(&p(50, 50)).unwrap(), 1);
        assert_eq!(part.point_owner(&p(5, 75)).unwrap(), 3);
        assert_eq!(part.leaf_node().unwrap().id(), 5);
        assert_eq!(part.local_shape().unwrap(), &rect([0, 60], [10, 80]).with_id(3));
        assert_eq!(part.neighbor_ids(3).unwrap(), vec![0, 4, 5, 6]);
        assert!(part.is_member(2));
        assert!(!part.is_member(4));
    }

    #[test]
    fn test_free_form_updates_rejected() {
        let mut part = partition(0);
        assert_eq!(
            part.begin_update(rect([0, 0], [1, 1]).with_id(0)),
            Err(PartitionError::Unsupported("begin_update"))
        );
        assert!(matches!(
            part.insert_partition(rect([0, 0], [1, 1]).with_id(0)),
            Err(PartitionError::Unsupported(_))
        ));
        assert!(matches!(
            part.move_origin(1, &p(10, 10)),
            Err(PartitionError::Unsupported(_))
        ));
    }

    #[test]
    fn test_partition_move_origin_commits() {
        let mut part = partition(0);
        // Leaf 6 keeps its shape: node 2 still splits at x=10, y=80
        assert_eq!(part.move_origin(0, &p(60, 70)).unwrap(), 6);
        assert_eq!(part.epoch(), 1);
        assert_eq!(part.point_owner(&p(50, 50)).unwrap(), 0);
        assert_eq!(part.shape(0).unwrap(), &rect([0, 0], [60, 70]).with_id(0));

        assert!(part.move_origin(0, &p(5, 50)).is_err());
        assert_eq!(part.epoch(), 1);
        assert_eq!(part.tree().root().origin(), Some(&p(60, 70)));
    }

    #[test]
    fn test_group_specs() {
        let part = partition(4);
        let specs = part.group_specs().unwrap();
        assert_eq!(specs.len(), 9);
        assert_eq!(specs[0].node, 0);
        assert_eq!(specs[0].members, (0..7).collect::<Vec<_>>());
        let node2 = specs.iter().find(|s| s.node == 2).unwrap();
        assert_eq!(node2.level, 1);
        assert_eq!(node2.master_proc, 3);
        assert_eq!(node2.members, vec![3, 4, 5, 6]);
        let levels: Vec<usize> = specs.iter().map(|s| s.level).collect();
        assert_eq!(levels, vec![0, 1, 1, 1, 1, 2, 2, 2, 2]);
    }
}
