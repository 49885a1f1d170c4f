use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Index, Sub};

/// Scalar usable as a point coordinate.
pub trait Coord:
    Copy
    + Default
    + PartialOrd
    + fmt::Debug
    + fmt::Display
    + Add<Output = Self>
    + Sub<Output = Self>
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Total order, also defined for NaN on reals.
    fn total_cmp(&self, other: &Self) -> Ordering;
    fn from_i64(value: i64) -> Self;
    fn to_f64(self) -> f64;
    fn floor_i64(self) -> i64;
    /// Maps the value into `[0, len)`.
    fn wrap(self, len: i64) -> Self;
}

impl Coord for i64 {
    fn total_cmp(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }

    fn from_i64(value: i64) -> Self {
        value
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn floor_i64(self) -> i64 {
        self
    }

    fn wrap(self, len: i64) -> Self {
        self.rem_euclid(len)
    }
}

impl Coord for f64 {
    fn total_cmp(&self, other: &Self) -> Ordering {
        f64::total_cmp(self, other)
    }

    fn from_i64(value: i64) -> Self {
        value as f64
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn floor_i64(self) -> i64 {
        self.floor() as i64
    }

    fn wrap(self, len: i64) -> Self {
        self.rem_euclid(len as f64)
    }
}

pub type Coords<T> = SmallVec<[T; 3]>;

/// N-dimensional point. Equality and ordering are lexicographic over the
/// coordinates, using the total order of the scalar type.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Point<T: Coord> {
    c: Coords<T>,
}

pub type IntPoint = Point<i64>;
pub type RealPoint = Point<f64>;

impl<T: Coord> Point<T> {
    pub fn new(coords: impl IntoIterator<Item = T>) -> Self {
        Point {
            c: coords.into_iter().collect(),
        }
    }

    pub fn zeros(nd: usize) -> Self {
        Point {
            c: std::iter::repeat(T::default()).take(nd).collect(),
        }
    }

    pub fn nd(&self) -> usize {
        self.c.len()
    }

    pub fn coords(&self) -> &[T] {
        &self.c
    }

    pub(crate) fn coords_mut(&mut self) -> &mut [T] {
        &mut self.c
    }

    /// Moves the point along one dimension.
    pub fn shift(&self, dim: usize, offset: T) -> Self {
        let mut p = self.clone();
        p.c[dim] = p.c[dim] + offset;
        p
    }

    pub fn shift_all(&self, offsets: &[T]) -> Self {
        Point {
            c: self.c.iter().zip(offsets).map(|(&a, &b)| a + b).collect(),
        }
    }

    /// Inverse of `shift_all`; turns a global point into coordinates relative to `origin`.
    pub fn rshift(&self, origin: &[T]) -> Self {
        Point {
            c: self.c.iter().zip(origin).map(|(&a, &b)| a - b).collect(),
        }
    }

    pub fn reduce_dim(&self, dim: usize) -> Self {
        let mut c = self.c.clone();
        c.remove(dim);
        Point { c }
    }

    pub fn increase_dim(&self, dim: usize, value: T) -> Self {
        let mut c = self.c.clone();
        c.insert(dim, value);
        Point { c }
    }

    /// Wraps every coordinate into `[0, size)`.
    pub fn to_toroidal(&self, size: &[i64]) -> Self {
        Point {
            c: self.c.iter().zip(size).map(|(&x, &s)| x.wrap(s)).collect(),
        }
    }

    pub fn floor(&self) -> IntPoint {
        Point {
            c: self.c.iter().map(|x| x.floor_i64()).collect(),
        }
    }

    pub fn to_real(&self) -> RealPoint {
        Point {
            c: self.c.iter().map(|x| x.to_f64()).collect(),
        }
    }

    pub fn distance(&self, other: &Self) -> f64 {
        self.c
            .iter()
            .zip(&other.c)
            .map(|(&a, &b)| {
                let d = a.to_f64() - b.to_f64();
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }
}

impl<T: Coord> Index<usize> for Point<T> {
    type Output = T;

    fn index(&self, dim: usize) -> &T {
        &self.c[dim]
    }
}

impl<T: Coord, const N: usize> From<[T; N]> for Point<T> {
    fn from(coords: [T; N]) -> Self {
        Point::new(coords)
    }
}

impl<T: Coord> PartialEq for Point<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Coord> Eq for Point<T> {}

impl<T: Coord> PartialOrd for Point<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Coord> Ord for Point<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.c.iter().zip(&other.c) {
            match a.total_cmp(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        self.c.len().cmp(&other.c.len())
    }
}

impl<T: Coord> std::hash::Hash for Point<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for x in &self.c {
            x.to_f64().to_bits().hash(state);
        }
    }
}

impl<T: Coord> fmt::Display for Point<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, x) in self.c.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", x)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_and_dims() {
        let p = IntPoint::from([3, 4, 5]);
        assert_eq!(p.shift(1, -4), IntPoint::from([3, 0, 5]));
        assert_eq!(p.reduce_dim(0), IntPoint::from([4, 5]));
        assert_eq!(p.reduce_dim(0).increase_dim(0, 3), p);
        assert_eq!(p.rshift(&[1, 1, 1]), IntPoint::from([2, 3, 4]));
        assert_eq!(p.shift_all(&[1, 1, 1]).rshift(&[1, 1, 1]), p);
    }

    #[test]
    fn test_total_order() {
        let mut points = vec![
            IntPoint::from([2, 0]),
            IntPoint::from([0, 9]),
            IntPoint::from([0, 1]),
        ];
        points.sort();
        assert_eq!(points[0], IntPoint::from([0, 1]));
        assert_eq!(points[2], IntPoint::from([2, 0]));

        let a = RealPoint::from([0.5, f64::NAN]);
        assert_eq!(a, a.clone());
        assert!(RealPoint::from([0.5, 1.0]) < RealPoint::from([0.5, 1.5]));
    }

    #[test]
    fn test_toroidal_and_floor() {
        let p = IntPoint::from([-1, 10, 4]);
        assert_eq!(p.to_toroidal(&[10, 10, 10]), IntPoint::from([9, 0, 4]));

        let r = RealPoint::from([-0.5, 9.25]);
        assert_eq!(r.floor(), IntPoint::from([-1, 9]));
        assert_eq!(r.to_toroidal(&[10, 10]), RealPoint::from([9.5, 9.25]));
    }

    #[test]
    fn test_distance() {
        let a = RealPoint::from([0.0, 0.0]);
        let b = RealPoint::from([3.0, 4.0]);
        assert_eq!(a.distance(&b), 5.0);
    }
}
