use super::{Coord, Direction, IntPoint, Point, Segment};
use crate::error::GeometryError;
use crate::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open axis-aligned box `[lower, upper)` with an optional owner.
///
/// Ordering is lexicographic over `(lower, upper, id)`, which gives the
/// deterministic overlap and neighbor orderings every process agrees on.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rect {
    lower: IntPoint,
    upper: IntPoint,
    id: Option<Pid>,
}

impl Rect {
    pub fn new(lower: IntPoint, upper: IntPoint) -> Result<Self, GeometryError> {
        if lower.nd() != upper.nd() {
            return Err(GeometryError::DimensionMismatch {
                expected: lower.nd(),
                actual: upper.nd(),
            });
        }
        for dim in 0..lower.nd() {
            if lower[dim] > upper[dim] {
                return Err(GeometryError::InvertedBounds {
                    dim,
                    lower: lower[dim],
                    upper: upper[dim],
                });
            }
        }
        Ok(Rect {
            lower,
            upper,
            id: None,
        })
    }

    /// The box `[0, size)`.
    pub fn from_size(size: &[i64]) -> Self {
        Rect {
            lower: IntPoint::zeros(size.len()),
            upper: IntPoint::new(size.iter().map(|&s| s.max(0))),
            id: None,
        }
    }

    pub fn with_id(mut self, id: Pid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn without_id(mut self) -> Self {
        self.id = None;
        self
    }

    pub fn id(&self) -> Option<Pid> {
        self.id
    }

    pub fn lower(&self) -> &IntPoint {
        &self.lower
    }

    pub fn upper(&self) -> &IntPoint {
        &self.upper
    }

    pub fn nd(&self) -> usize {
        self.lower.nd()
    }

    pub fn size(&self) -> Vec<i64> {
        (0..self.nd()).map(|d| self.extent(d)).collect()
    }

    pub fn extent(&self, dim: usize) -> i64 {
        self.upper[dim] - self.lower[dim]
    }

    pub fn area(&self) -> i64 {
        (0..self.nd()).map(|d| self.extent(d)).product()
    }

    pub fn is_empty(&self) -> bool {
        self.area() == 0
    }

    pub fn contains<T: Coord>(&self, p: &Point<T>) -> bool {
        p.nd() == self.nd()
            && (0..self.nd()).all(|d| {
                let x = p[d].to_f64();
                self.lower[d] as f64 <= x && x < self.upper[d] as f64
            })
    }

    pub fn contains_rect(&self, other: &Rect) -> bool {
        (0..self.nd()).all(|d| self.lower[d] <= other.lower[d] && other.upper[d] <= self.upper[d])
    }

    /// True when the two boxes share a region of positive volume.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.nd() == other.nd()
            && (0..self.nd())
                .all(|d| self.lower[d] < other.upper[d] && other.lower[d] < self.upper[d])
    }

    pub fn intersection(&self, other: &Rect) -> Result<Rect, GeometryError> {
        if !self.intersects(other) {
            return Err(GeometryError::Disjoint {
                a: self.clone(),
                b: other.clone(),
            });
        }
        let lower = IntPoint::new((0..self.nd()).map(|d| self.lower[d].max(other.lower[d])));
        let upper = IntPoint::new((0..self.nd()).map(|d| self.upper[d].min(other.upper[d])));
        Rect::new(lower, upper)
    }

    /// Grows (positive) or shrinks (negative) both sides of every dimension.
    pub fn resize_all(&self, amounts: &[i64]) -> Result<Rect, GeometryError> {
        let lower = self.lower.rshift(amounts);
        let upper = self.upper.shift_all(amounts);
        Ok(Rect::new(lower, upper)?.keep_id(self.id))
    }

    /// Symmetric resize of a single dimension.
    pub fn resize(&self, dim: usize, amount: i64) -> Result<Rect, GeometryError> {
        let lower = self.lower.shift(dim, -amount);
        let upper = self.upper.shift(dim, amount);
        Ok(Rect::new(lower, upper)?.keep_id(self.id))
    }

    /// One-sided resize: moves the face at `dir` outward by `amount`.
    pub fn resize_dir(&self, dim: usize, dir: Direction, amount: i64) -> Result<Rect, GeometryError> {
        let (lower, upper) = match dir {
            Direction::Lower => (self.lower.shift(dim, -amount), self.upper.clone()),
            Direction::Upper => (self.lower.clone(), self.upper.shift(dim, amount)),
        };
        Ok(Rect::new(lower, upper)?.keep_id(self.id))
    }

    /// Shrinks by `amounts`, collapsing a dimension to an empty interval at
    /// its midpoint instead of inverting it.
    pub fn shrink_clamped(&self, amounts: &[i64]) -> Rect {
        let mut lower = self.lower.clone();
        let mut upper = self.upper.clone();
        for d in 0..self.nd() {
            let (lo, hi) = (self.lower[d] + amounts[d], self.upper[d] - amounts[d]);
            if lo <= hi {
                lower.coords_mut()[d] = lo;
                upper.coords_mut()[d] = hi;
            } else {
                let mid = self.lower[d] + self.extent(d) / 2;
                lower.coords_mut()[d] = mid;
                upper.coords_mut()[d] = mid;
            }
        }
        Rect {
            lower,
            upper,
            id: self.id,
        }
    }

    pub fn shift(&self, offsets: &[i64]) -> Rect {
        Rect {
            lower: self.lower.shift_all(offsets),
            upper: self.upper.shift_all(offsets),
            id: self.id,
        }
    }

    /// Projects out one axis.
    pub fn reduce_dim(&self, dim: usize) -> Rect {
        Rect {
            lower: self.lower.reduce_dim(dim),
            upper: self.upper.reduce_dim(dim),
            id: self.id,
        }
    }

    pub fn segment(&self, dim: usize) -> Option<Segment> {
        self.id
            .map(|pid| Segment::new(self.lower[dim], self.upper[dim], pid))
    }

    /// Same bounds, ignoring ids.
    pub fn same_bounds(&self, other: &Rect) -> bool {
        self.lower == other.lower && self.upper == other.upper
    }

    /// Whether both boxes span the same extent in every dimension except `dim`.
    pub fn is_aligned(&self, other: &Rect, dim: usize) -> bool {
        self.reduce_dim(dim).same_bounds(&other.reduce_dim(dim))
    }

    pub fn bounding<'a>(rects: impl IntoIterator<Item = &'a Rect>) -> Option<Rect> {
        let mut iter = rects.into_iter();
        let first = iter.next()?;
        let mut lower = first.lower.clone();
        let mut upper = first.upper.clone();
        for r in iter {
            for d in 0..lower.nd() {
                lower.coords_mut()[d] = lower[d].min(r.lower[d]);
                upper.coords_mut()[d] = upper[d].max(r.upper[d]);
            }
        }
        Some(Rect {
            lower,
            upper,
            id: None,
        })
    }

    /// Every integer cell of the box in row-major order (last dimension fastest).
    pub fn cells(&self) -> Cells {
        Cells {
            lower: self.lower.clone(),
            upper: self.upper.clone(),
            next: if self.is_empty() {
                None
            } else {
                Some(self.lower.clone())
            },
        }
    }

    /// Gap along one dimension between two boxes, zero when the projections touch or overlap.
    pub fn gap(&self, other: &Rect, dim: usize) -> i64 {
        (other.lower[dim] - self.upper[dim])
            .max(self.lower[dim] - other.upper[dim])
            .max(0)
    }

    fn keep_id(mut self, id: Option<Pid>) -> Rect {
        self.id = id;
        self
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.lower, self.upper)?;
        if let Some(id) = self.id {
            write!(f, "#{}", id)?;
        }
        Ok(())
    }
}

/// Row-major iterator over the cells of a `Rect`.
pub struct Cells {
    lower: IntPoint,
    upper: IntPoint,
    next: Option<IntPoint>,
}

impl Iterator for Cells {
    type Item = IntPoint;

    fn next(&mut self) -> Option<IntPoint> {
        let current = self.next.take()?;
        let mut succ = current.clone();
        let mut dim = succ.nd();
        while dim > 0 {
            dim -= 1;
            succ.coords_mut()[dim] += 1;
            if succ[dim] < self.upper[dim] {
                self.next = Some(succ);
                break;
            }
            succ.coords_mut()[dim] = self.lower[dim];
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(lower: [i64; 2], upper: [i64; 2]) -> Rect {
        Rect::new(IntPoint::from(lower), IntPoint::from(upper)).unwrap()
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        let result = Rect::new(IntPoint::from([0, 5]), IntPoint::from([1, 4]));
        assert!(matches!(
            result,
            Err(GeometryError::InvertedBounds { dim: 1, lower: 5, upper: 4 })
        ));
    }

    #[test]
    fn test_half_open_containment() {
        let r = rect([3, 8], [7, 12]);
        assert!(r.contains(&IntPoint::from([4, 9])));
        assert!(r.contains(&IntPoint::from([3, 8])));
        assert!(!r.contains(&IntPoint::from([7, 9])));
        assert!(r.contains(&Point::<f64>::from([6.99, 11.5])));
        assert!(!r.contains(&Point::<f64>::from([6.99, 12.0])));
    }

    #[test]
    fn test_intersection() {
        let a = rect([0, 0], [5, 5]);
        let b = rect([3, 4], [8, 8]);
        assert_eq!(a.intersection(&b).unwrap(), rect([3, 4], [5, 5]));

        // Touching faces share no volume
        let c = rect([5, 0], [6, 5]);
        assert!(!a.intersects(&c));
        assert!(matches!(a.intersection(&c), Err(GeometryError::Disjoint { .. })));
    }

    #[test]
    fn test_resize_variants() {
        let r = rect([2, 2], [4, 6]).with_id(7);
        assert_eq!(r.resize_all(&[1, 1]).unwrap(), rect([1, 1], [5, 7]).with_id(7));
        assert_eq!(r.resize(0, 1).unwrap(), rect([1, 2], [5, 6]).with_id(7));
        assert_eq!(
            r.resize_dir(1, Direction::Upper, -2).unwrap(),
            rect([2, 2], [4, 4]).with_id(7)
        );
        assert_eq!(
            r.resize_dir(1, Direction::Lower, 2).unwrap(),
            rect([2, 0], [4, 6]).with_id(7)
        );
        assert!(r.resize_all(&[-2, -2]).is_err());
        assert_eq!(r.shrink_clamped(&[2, 1]), rect([3, 3], [3, 5]).with_id(7));
    }

    #[test]
    fn test_reduce_dim_and_alignment() {
        let a = rect([0, 0], [3, 12]);
        let b = rect([3, 0], [10, 12]);
        let c = rect([3, 0], [10, 8]);
        assert!(a.is_aligned(&b, 0));
        assert!(!a.is_aligned(&c, 0));
        assert_eq!(a.reduce_dim(0), Rect::from_size(&[12]));
    }

    #[test]
    fn test_bounding_and_area() {
        let parts = [rect([0, 0], [2, 2]), rect([2, 0], [5, 1])];
        let bbox = Rect::bounding(parts.iter()).unwrap();
        assert_eq!(bbox, rect([0, 0], [5, 2]));
        assert_eq!(bbox.area(), 10);
        assert_eq!(bbox.size(), vec![5, 2]);
        assert!(Rect::bounding(std::iter::empty()).is_none());
    }

    #[test]
    fn test_cells_row_major() {
        let cells: Vec<IntPoint> = rect([1, 1], [3, 3]).cells().collect();
        assert_eq!(
            cells,
            vec![
                IntPoint::from([1, 1]),
                IntPoint::from([1, 2]),
                IntPoint::from([2, 1]),
                IntPoint::from([2, 2]),
            ]
        );
        assert_eq!(rect([1, 1], [1, 3]).cells().count(), 0);
    }

    #[test]
    fn test_ordering_ties_on_id() {
        let a = rect([0, 0], [1, 1]).with_id(2);
        let b = rect([0, 0], [1, 1]).with_id(1);
        assert!(b < a);
        assert!(a.same_bounds(&b));
    }
}
