//! Stabbing and range index over partition extents along one dimension.

use crate::geometry::Segment;
use crate::Pid;
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
struct Node {
    seg: Segment,
    // Bounds over this node and all of its descendants
    max_end: i64,
    min_start: i64,
    left: Option<usize>,
    right: Option<usize>,
}

/// Augmented interval tree keyed by `(start, end)`.
///
/// Every node tracks the largest end and smallest start of its subtree so
/// that stabbing and range queries can skip subtrees that cannot overlap.
/// In toroidal mode the tree knows the domain extent `[min, max)` and
/// normalizes queries into it, splitting ranges that wrap.
#[derive(Debug, Clone, Default)]
pub struct SegmentTree {
    nodes: Vec<Node>,
    root: Option<usize>,
    domain: Option<(i64, i64)>,
}

impl SegmentTree {
    pub fn new() -> Self {
        SegmentTree::default()
    }

    pub fn toroidal(min: i64, max: i64) -> Self {
        SegmentTree {
            nodes: Vec::new(),
            root: None,
            domain: Some((min, max)),
        }
    }

    pub fn is_toroidal(&self) -> bool {
        self.domain.is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn insert(&mut self, seg: Segment) {
        let idx = self.nodes.len();
        self.nodes.push(Node {
            seg,
            max_end: seg.end,
            min_start: seg.start,
            left: None,
            right: None,
        });

        let mut curr = match self.root {
            Some(root) => root,
            None => {
                self.root = Some(idx);
                return;
            }
        };
        loop {
            let node = &mut self.nodes[curr];
            node.max_end = node.max_end.max(seg.end);
            node.min_start = node.min_start.min(seg.start);
            let slot = if node.seg <= seg {
                &mut node.right
            } else {
                &mut node.left
            };
            match *slot {
                Some(next) => curr = next,
                None => {
                    *slot = Some(idx);
                    return;
                }
            }
        }
    }

    /// Owners of every segment containing `x`.
    pub fn contains(&self, x: i64) -> BTreeSet<Pid> {
        let x = self.wrap_point(x);
        let mut out = BTreeSet::new();
        self.visit(
            |n| n.max_end <= x || n.min_start > x,
            |seg| seg.contains(x),
            &mut out,
        );
        out
    }

    /// Owners of every segment overlapping the half-open range `[start, end)`.
    pub fn intersect(&self, start: i64, end: i64) -> BTreeSet<Pid> {
        let mut out = BTreeSet::new();
        for (st, ed) in self.wrap_range(start, end) {
            self.visit(
                |n| n.max_end <= st || n.min_start >= ed,
                |seg| seg.overlaps(st, ed),
                &mut out,
            );
        }
        out
    }

    /// Stored segments in `(start, end)` order.
    pub fn segments(&self) -> Vec<Segment> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = Vec::new();
        let mut curr = self.root;
        while curr.is_some() || !stack.is_empty() {
            while let Some(i) = curr {
                stack.push(i);
                curr = self.nodes[i].left;
            }
            if let Some(i) = stack.pop() {
                out.push(self.nodes[i].seg);
                curr = self.nodes[i].right;
            }
        }
        out
    }

    /// Whether the union of the stored segments is exactly `[min, max)`.
    pub fn covers(&self, min: i64, max: i64) -> bool {
        let mut reach = min;
        for seg in self.segments() {
            if seg.start < min || seg.end > max || seg.start > reach {
                return false;
            }
            reach = reach.max(seg.end);
        }
        reach == max
    }

    fn visit(
        &self,
        prune: impl Fn(&Node) -> bool,
        accept: impl Fn(&Segment) -> bool,
        out: &mut BTreeSet<Pid>,
    ) {
        let mut stack: Vec<usize> = self.root.into_iter().collect();
        while let Some(i) = stack.pop() {
            let node = &self.nodes[i];
            if prune(node) {
                continue;
            }
            if accept(&node.seg) {
                out.insert(node.seg.pid);
            }
            stack.extend(node.left);
            stack.extend(node.right);
        }
    }

    fn wrap_point(&self, x: i64) -> i64 {
        match self.domain {
            Some((min, max)) => min + (x - min).rem_euclid(max - min),
            None => x,
        }
    }

    /// Splits a query range into at most two ranges inside the domain.
    fn wrap_range(&self, start: i64, end: i64) -> Vec<(i64, i64)> {
        if start >= end {
            return Vec::new();
        }
        let (min, max) = match self.domain {
            Some(domain) => domain,
            None => return vec![(start, end)],
        };
        let len = max - min;
        if end - start >= len {
            return vec![(min, max)];
        }
        let st = self.wrap_point(start);
        let ed = st + (end - start);
        if ed <= max {
            vec![(st, ed)]
        } else {
            vec![(st, max), (min, ed - len)]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(segs: &[(i64, i64, Pid)]) -> SegmentTree {
        let mut t = SegmentTree::new();
        for &(st, ed, pid) in segs {
            t.insert(Segment::new(st, ed, pid));
        }
        t
    }

    fn set(ids: &[Pid]) -> BTreeSet<Pid> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_stabbing_and_range() {
        let t = tree(&[
            (4, 10, 0),
            (10, 11, 1),
            (13, 15, 2),
            (1, 7, 3),
            (6, 9, 4),
            (5, 8, 5),
            (8, 12, 6),
            (9, 20, 7),
        ]);
        assert_eq!(t.contains(9), set(&[0, 6, 7]));
        assert_eq!(t.contains(0), set(&[]));
        assert_eq!(t.contains(4), set(&[0, 3]));
        assert_eq!(t.intersect(7, 10), set(&[0, 4, 5, 6, 7]));
        assert_eq!(t.intersect(20, 25), set(&[]));
        assert_eq!(t.intersect(3, 3), set(&[]));
    }

    #[test]
    fn test_segments_in_order() {
        let t = tree(&[(5, 6, 0), (2, 4, 1), (3, 5, 2), (2, 3, 3)]);
        let starts: Vec<(i64, i64)> = t.segments().iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(starts, vec![(2, 3), (2, 4), (3, 5), (5, 6)]);
    }

    #[test]
    fn test_covers() {
        let t = tree(&[(0, 3, 0), (3, 7, 1), (7, 10, 2), (3, 7, 3)]);
        assert!(t.covers(0, 10));
        assert!(!t.covers(0, 11));

        let gap = tree(&[(0, 3, 0), (4, 10, 1)]);
        assert!(!gap.covers(0, 10));
    }

    #[test]
    fn test_toroidal_queries() {
        let mut t = SegmentTree::toroidal(0, 10);
        for &(st, ed, pid) in &[(2, 4, 0), (3, 5, 1), (3, 7, 2), (6, 8, 3), (9, 10, 4), (5, 6, 5)] {
            t.insert(Segment::new(st, ed, pid));
        }

        // Wraps from the end of the domain back to the start
        assert_eq!(t.intersect(8, 11), set(&[4]));
        assert_eq!(t.intersect(9, 14), set(&[0, 1, 2, 4]));
        // Ranges fully outside the domain are translated in
        assert_eq!(t.intersect(-2, -1), set(&[]));
        assert_eq!(t.intersect(-4, -2), set(&[2, 3]));
        assert_eq!(t.intersect(12, 14), set(&[0, 1, 2]));
        // Longer than the domain covers everything
        assert_eq!(t.intersect(-5, 20), set(&[0, 1, 2, 3, 4, 5]));
        assert_eq!(t.intersect(2, 2), set(&[]));

        assert_eq!(t.contains(-1), set(&[4]));
        assert_eq!(t.contains(13), set(&[0, 1, 2]));
    }

    #[test]
    fn test_toroidal_split_at_boundary() {
        let mut t = SegmentTree::toroidal(0, 10);
        t.insert(Segment::new(0, 9, 0));
        t.insert(Segment::new(9, 10, 1));
        assert_eq!(t.intersect(8, 11), set(&[0, 1]));
        assert_eq!(t.contains(10), set(&[0]));
    }
}
