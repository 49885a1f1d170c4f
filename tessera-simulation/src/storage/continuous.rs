use super::{FieldStorage, Overlap, StorageError};
use ordered_float::OrderedFloat;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use tessera_core::{Arena, Handle, IntPoint, RealPoint, Rect};
use tessera_transport::codec::{decode, encode, pack_frames, unpack_frames};

/// Objects at real-valued positions, bucketed on a regular grid for
/// neighborhood queries.
#[derive(Debug, Clone)]
pub struct ContinuousStorage<T> {
    shape: Rect,
    discretization: Vec<f64>,
    objects: Arena<(T, RealPoint)>,
    buckets: HashMap<IntPoint, Vec<Handle>>,
}

impl<T> ContinuousStorage<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    /// `discretization` is the bucket edge length per dimension.
    pub fn new(shape: Rect, discretization: &[f64]) -> Self {
        ContinuousStorage {
            shape: shape.without_id(),
            discretization: discretization.iter().map(|d| d.max(f64::MIN_POSITIVE)).collect(),
            objects: Arena::new(),
            buckets: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn bucket_of(&self, pos: &RealPoint) -> IntPoint {
        IntPoint::new(
            (0..pos.nd()).map(|d| (pos[d] / self.discretization[d]).floor() as i64),
        )
    }

    fn check_inside(&self, pos: &RealPoint) -> Result<(), StorageError> {
        if pos.nd() != self.shape.nd() || !self.shape.contains(pos) {
            return Err(StorageError::OutsideShape {
                point: pos.clone(),
                shape: self.shape.clone(),
            });
        }
        Ok(())
    }

    pub fn add(&mut self, value: T, pos: RealPoint) -> Result<Handle, StorageError> {
        self.check_inside(&pos)?;
        let bucket = self.bucket_of(&pos);
        let handle = self.objects.insert((value, pos));
        self.buckets.entry(bucket).or_default().push(handle);
        Ok(handle)
    }

    pub fn remove(&mut self, handle: Handle) -> Result<T, StorageError> {
        let (value, pos) = self
            .objects
            .remove(handle)
            .ok_or(StorageError::StaleHandle(handle))?;
        self.unlink(handle, &pos);
        Ok(value)
    }

    pub fn move_to(&mut self, handle: Handle, pos: RealPoint) -> Result<(), StorageError> {
        self.check_inside(&pos)?;
        let old = self
            .objects
            .get(handle)
            .map(|(_, p)| p.clone())
            .ok_or(StorageError::StaleHandle(handle))?;
        let (old_bucket, new_bucket) = (self.bucket_of(&old), self.bucket_of(&pos));
        if old_bucket != new_bucket {
            self.unlink(handle, &old);
            self.buckets.entry(new_bucket).or_default().push(handle);
        }
        if let Some(entry) = self.objects.get_mut(handle) {
            entry.1 = pos;
        }
        Ok(())
    }

    fn unlink(&mut self, handle: Handle, pos: &RealPoint) {
        let bucket = self.bucket_of(pos);
        if let Some(list) = self.buckets.get_mut(&bucket) {
            list.retain(|&h| h != handle);
            if list.is_empty() {
                self.buckets.remove(&bucket);
            }
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.objects.get(handle).map(|(v, _)| v)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.objects.get_mut(handle).map(|(v, _)| v)
    }

    pub fn position(&self, handle: Handle) -> Option<&RealPoint> {
        self.objects.get(handle).map(|(_, p)| p)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T, &RealPoint)> {
        self.objects.iter().map(|(h, (v, p))| (h, v, p))
    }

    /// Handles whose bucket lies in `[lower, upper]` (inclusive), unfiltered.
    fn candidates(&self, lower: &RealPoint, upper: &RealPoint) -> Vec<Handle> {
        let lo = self.bucket_of(lower);
        let hi = self.bucket_of(upper);
        // Saturated bucket indices overflow here; those ranges take the walk
        let span = (0..lo.nd()).try_fold(1i64, |acc, d| {
            hi[d]
                .checked_sub(lo[d])
                .and_then(|s| s.checked_add(1))
                .and_then(|s| acc.checked_mul(s))
        });
        let end: Option<Vec<i64>> = (0..hi.nd()).map(|d| hi[d].checked_add(1)).collect();
        let mut out = Vec::new();
        match (span, end) {
            (Some(span), Some(end)) if span > 0 && span as u64 <= self.buckets.len() as u64 => {
                if let Ok(range) = Rect::new(lo.clone(), IntPoint::new(end)) {
                    for bucket in range.cells() {
                        if let Some(handles) = self.buckets.get(&bucket) {
                            out.extend(handles.iter().copied());
                        }
                    }
                }
            }
            _ => {
                for (bucket, handles) in &self.buckets {
                    if (0..lo.nd()).all(|d| lo[d] <= bucket[d] && bucket[d] <= hi[d]) {
                        out.extend(handles.iter().copied());
                    }
                }
            }
        }
        out.sort_unstable();
        out
    }

    /// Objects inside `region`, in handle order.
    pub fn objects_in(&self, region: &Rect) -> Vec<Handle> {
        if region.is_empty() {
            return Vec::new();
        }
        let lower = region.lower().to_real();
        let upper = region.upper().to_real();
        self.candidates(&lower, &upper)
            .into_iter()
            .filter(|&h| self.position(h).map_or(false, |p| region.contains(p)))
            .collect()
    }

    /// Other objects within `radius` of `handle`, in handle order.
    pub fn neighbors_within(&self, handle: Handle, radius: f64) -> Result<Vec<Handle>, StorageError> {
        let center = self
            .position(handle)
            .ok_or(StorageError::StaleHandle(handle))?
            .clone();
        let lower = RealPoint::new(center.coords().iter().map(|c| c - radius));
        let upper = RealPoint::new(center.coords().iter().map(|c| c + radius));
        Ok(self
            .candidates(&lower, &upper)
            .into_iter()
            .filter(|&h| {
                h != handle && self.position(h).map_or(false, |p| p.distance(&center) <= radius)
            })
            .collect())
    }

    /// The `k` objects closest to `handle`, nearest first.
    pub fn nearest_neighbors(&self, handle: Handle, k: usize) -> Result<Vec<Handle>, StorageError> {
        let center = self
            .position(handle)
            .ok_or(StorageError::StaleHandle(handle))?;
        let mut others: Vec<(OrderedFloat<f64>, Handle)> = self
            .iter()
            .filter(|(h, _, _)| *h != handle)
            .map(|(h, _, p)| (OrderedFloat(p.distance(center)), h))
            .collect();
        others.sort_unstable();
        Ok(others.into_iter().take(k).map(|(_, h)| h).collect())
    }

    /// Drops a handle known to be live, keeping its bucket in step.
    fn detach(&mut self, handle: Handle) {
        if let Some((_, pos)) = self.objects.remove(handle) {
            self.unlink(handle, &pos);
        }
    }

    fn remove_region(&mut self, region: &Rect) {
        for handle in self.objects_in(region) {
            self.detach(handle);
        }
    }
}

impl<T> FieldStorage for ContinuousStorage<T>
where
    T: Clone + Serialize + DeserializeOwned,
{
    fn shape(&self) -> &Rect {
        &self.shape
    }

    fn reshape(&mut self, shape: &Rect) {
        self.shape = shape.clone().without_id();
        let outside: Vec<Handle> = self
            .iter()
            .filter(|(_, _, p)| !self.shape.contains(*p))
            .map(|(h, _, _)| h)
            .collect();
        for handle in outside {
            self.detach(handle);
        }
    }

    fn pack(&self, regions: &[Overlap]) -> Result<Vec<u8>, StorageError> {
        let frames = regions
            .iter()
            .map(|o| {
                let objects: Vec<(T, RealPoint)> = self
                    .objects_in(&o.region)
                    .into_iter()
                    .filter_map(|h| self.objects.get(h).cloned())
                    .collect();
                encode(&objects)
            })
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
            let objects: Vec<(T, RealPoint)> = decode(&frame)?;
            self.remove_region(&overlap.region);
            let shift: Vec<f64> = overlap.shift.iter().map(|&s| s as f64).collect();
            for (value, pos) in objects {
                self.add(value, pos.shift_all(&shift))?;
            }
        }
        Ok(())
    }
}
