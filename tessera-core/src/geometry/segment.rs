use crate::Pid;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One dimension's projection of a partition shape: `[start, end)` owned by `pid`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Segment {
    pub start: i64,
    pub end: i64,
    pub pid: Pid,
}

impl Segment {
    pub fn new(start: i64, end: i64, pid: Pid) -> Self {
        Segment { start, end, pid }
    }

    pub fn contains(&self, x: i64) -> bool {
        self.start <= x && x < self.end
    }

    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start < end && start < self.end
    }

    pub fn len(&self) -> i64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Segment {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.start, self.end, self.pid).cmp(&(other.start, other.end, other.pid))
    }
}
