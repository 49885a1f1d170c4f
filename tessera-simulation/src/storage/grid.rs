use super::{FieldStorage, Overlap, StorageError};
use serde::{de::DeserializeOwned, Serialize};
use tessera_core::{IntPoint, Rect};
use tessera_transport::codec::{decode, encode, pack_frames, unpack_frames};

/// Dense row-major grid over a box, last dimension fastest.
#[derive(Debug, Clone)]
pub struct GridStorage<T> {
    shape: Rect,
    strides: Vec<i64>,
    data: Vec<T>,
}

impl<T> GridStorage<T>
where
    T: Clone + Default + Serialize + DeserializeOwned,
{
    pub fn new(shape: Rect) -> Self {
        let shape = shape.without_id();
        GridStorage {
            strides: strides(&shape),
            data: vec![T::default(); shape.area().max(0) as usize],
            shape,
        }
    }

    fn offset(&self, p: &IntPoint) -> Option<usize> {
        if p.nd() != self.shape.nd() || !self.shape.contains(p) {
            return None;
        }
        let offset: i64 = (0..p.nd())
            .map(|d| (p[d] - self.shape.lower()[d]) * self.strides[d])
            .sum();
        Some(offset as usize)
    }

    pub fn get(&self, p: &IntPoint) -> Option<&T> {
        self.offset(p).map(|i| &self.data[i])
    }

    pub fn get_mut(&mut self, p: &IntPoint) -> Option<&mut T> {
        self.offset(p).map(move |i| &mut self.data[i])
    }

    pub fn set(&mut self, p: &IntPoint, value: T) -> Result<(), StorageError> {
        match self.offset(p) {
            Some(i) => {
                self.data[i] = value;
                Ok(())
            }
            None => Err(StorageError::OutsideShape {
                point: p.to_real(),
                shape: self.shape.clone(),
            }),
        }
    }

    pub fn fill(&mut self, value: T) {
        self.data.iter_mut().for_each(|v| *v = value.clone());
    }

    /// Values in row-major order.
    pub fn values(&self) -> &[T] {
        &self.data
    }

    pub fn values_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Values of `region` in row-major order; cells outside the shape are skipped.
    pub fn region_values(&self, region: &Rect) -> Vec<T> {
        region
            .cells()
            .filter_map(|p| self.get(&p).cloned())
            .collect()
    }
}

fn strides(shape: &Rect) -> Vec<i64> {
    let nd = shape.nd();
    let mut strides = vec![1i64; nd];
    for d in (0..nd.saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape.extent(d + 1);
    }
    strides
}

impl<T> FieldStorage for GridStorage<T>
where
    T: Clone + Default + Serialize + DeserializeOwned,
{
    fn shape(&self) -> &Rect {
        &self.shape
    }

    fn reshape(&mut self, shape: &Rect) {
        let mut next = GridStorage::new(shape.clone());
        if self.shape.intersects(&next.shape) {
            for p in self.shape.cells() {
                if let (Some(src), Some(dst)) = (self.offset(&p), next.offset(&p)) {
                    next.data[dst] = self.data[src].clone();
                }
            }
        }
        *self = next;
    }

    fn pack(&self, regions: &[Overlap]) -> Result<Vec<u8>, StorageError> {
        let frames = regions
            .iter()
            .map(|o| encode(&self.region_values(&o.region)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pack_frames(&frames))
    }

    fn unpack(&mut self, regions: &[Overlap], buf: &[u8]) -> Result<(), StorageError> {
        let frames = unpack_frames(buf)?;
        if frames.len() != regions.len() {
            return Err(StorageError::SizeMismatch {
                expected: regions.len(),
                actual: frames.len(),
            });
        }
        for (overlap, frame) in regions.iter().zip(frames) {
            let values: Vec<T> = decode(&frame)?;
            let expected = overlap.region.area() as usize;
            if values.len() != expected {
                return Err(StorageError::SizeMismatch {
                    expected,
                    actual: values.len(),
                });
            }
            for (p, value) in overlap.region.cells().zip(values) {
                self.set(&p, value)?;
            }
        }
        Ok(())
    }
}
