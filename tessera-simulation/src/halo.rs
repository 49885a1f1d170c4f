//! Distributed field with ghost layers kept in step with the neighbors.
//!
//! Each process stores its local shape expanded by `depth` cells. Cells
//! outside the local shape mirror whichever process owns them and are
//! refreshed by [`HaloField::sync`]. On a toroidal domain the expansion
//! wraps, so a neighbor can be seen through several periodic images and a
//! process can even see itself; the wrap is tracked as a shift on every
//! overlap.

use crate::storage::{ContinuousStorage, FieldStorage, GridStorage, Overlap, StorageError};
use log::debug;
use serde::{de::DeserializeOwned, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tessera_core::geometry::Coord;
use tessera_core::{
    CommitHook, GeometryError, Handle, IntPoint, Partition, PartitionError, Pid, Point, RealPoint,
    Rect,
};
use tessera_transport::{Communicator, TransportError};
use thiserror::Error;

/// Which boundary an access crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Global,
    Local,
    Halo,
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Boundary::Global => write!(f, "global domain"),
            Boundary::Local => write!(f, "local shape"),
            Boundary::Halo => write!(f, "halo"),
        }
    }
}

#[derive(Error, Debug)]
pub enum HaloError {
    #[error("{point} lies outside the {boundary} {region}")]
    OutOfBounds {
        point: RealPoint,
        region: Rect,
        boundary: Boundary,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Partition error: {0}")]
    Partition(#[from] PartitionError),

    #[error("Geometry error: {0}")]
    Geometry(#[from] GeometryError),
}

/// Exchange record for one neighboring process.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub pid: Pid,
    /// Parts of our local shape the neighbor keeps as halo, ascending by shift.
    pub send: Vec<Overlap>,
    /// Parts of our halo the neighbor owns, descending by shift.
    pub recv: Vec<Overlap>,
}

pub struct HaloField<S, C> {
    pid: Pid,
    depth: i64,
    size: Vec<i64>,
    domain: Rect,
    toroidal: bool,
    local: Rect,
    expanded: Rect,
    private: Rect,
    shapes: Vec<Rect>,
    neighbors: Vec<Neighbor>,
    neighbor_ids: Vec<Pid>,
    self_send: Vec<Overlap>,
    self_recv: Vec<Overlap>,
    storage: S,
    comm: Rc<C>,
    epoch: u64,
}

/// Every translation `k * size` with `k` in `{-1, 0, 1}^N`, in ascending
/// order; only the zero shift when the domain does not wrap.
fn images(size: &[i64], toroidal: bool) -> Vec<Vec<i64>> {
    if !toroidal {
        return vec![vec![0; size.len()]];
    }
    let mut out: Vec<Vec<i64>> = vec![Vec::new()];
    for &s in size {
        out = out
            .into_iter()
            .flat_map(|prefix| {
                [-s, 0, s].into_iter().map(move |k| {
                    let mut next = prefix.clone();
                    next.push(k);
                    next
                })
            })
            .collect();
    }
    out
}

fn negated(shift: &[i64]) -> Vec<i64> {
    shift.iter().map(|s| -s).collect()
}

fn shifted<T: Coord>(p: &Point<T>, shift: &[i64]) -> Point<T> {
    let offsets: Vec<T> = shift.iter().map(|&s| T::from_i64(s)).collect();
    p.shift_all(&offsets)
}

/// `(send, recv)` overlaps between `ours` and a peer, each list already in
/// exchange order. `skip_identity` drops the zero shift, for self-wrap.
fn overlaps(
    local: &Rect,
    expanded: &Rect,
    peer_local: &Rect,
    peer_expanded: &Rect,
    images: &[Vec<i64>],
    skip_identity: bool,
) -> (Vec<Overlap>, Vec<Overlap>) {
    let mut send = Vec::new();
    let mut recv = Vec::new();
    for shift in images {
        if skip_identity && shift.iter().all(|&s| s == 0) {
            continue;
        }
        if let Ok(region) = local.intersection(&peer_expanded.shift(shift)) {
            send.push(Overlap::with_shift(region, shift.clone()));
        }
        if let Ok(region) = expanded.intersection(&peer_local.shift(shift)) {
            recv.push(Overlap::with_shift(region, shift.clone()));
        }
    }
    send.sort_by(|a, b| a.shift.cmp(&b.shift));
    recv.sort_by(|a, b| negated(&a.shift).cmp(&negated(&b.shift)));
    (send, recv)
}

impl<S, C> HaloField<S, C>
where
    S: FieldStorage,
    C: Communicator,
{
    /// Builds the field for this process. The communicator rank must equal
    /// the partition pid.
    pub fn new(partition: &dyn Partition, depth: i64, storage: S, comm: Rc<C>) -> Result<Self, HaloError> {
        if depth < 0 {
            return Err(PartitionError::Setup(format!("halo depth {} is negative", depth)).into());
        }
        if comm.size() != partition.num_procs() || comm.rank() != partition.pid() {
            return Err(PartitionError::Setup(format!(
                "communicator rank {} of {} does not match partition {} of {}",
                comm.rank(),
                comm.size(),
                partition.pid(),
                partition.num_procs()
            ))
            .into());
        }
        let domain = partition.domain();
        let mut field = HaloField {
            pid: partition.pid(),
            depth,
            size: partition.domain_size().to_vec(),
            toroidal: partition.is_toroidal(),
            local: domain.clone(),
            expanded: domain.clone(),
            private: domain.clone(),
            domain,
            shapes: Vec::new(),
            neighbors: Vec::new(),
            neighbor_ids: Vec::new(),
            self_send: Vec::new(),
            self_recv: Vec::new(),
            storage,
            comm,
            epoch: 0,
        };
        field.reload(partition)?;
        Ok(field)
    }

    /// Recomputes shapes and overlaps from the committed partition. Data in
    /// both the old and new expanded shapes is kept.
    pub fn reload(&mut self, partition: &dyn Partition) -> Result<(), HaloError> {
        let nd = self.size.len();
        let depths = vec![self.depth; nd];
        let expand = |shape: &Rect| -> Result<Rect, HaloError> {
            let grown = shape.resize_all(&depths)?.without_id();
            if self.toroidal {
                Ok(grown)
            } else {
                Ok(grown.intersection(&self.domain)?)
            }
        };

        self.shapes = partition.shapes();
        self.local = partition.local_shape()?.clone().without_id();
        self.expanded = expand(&self.local)?;
        self.private = self.local.shrink_clamped(&depths);

        let images = images(&self.size, self.toroidal);
        self.neighbors.clear();
        for shape in &self.shapes {
            let pid = match shape.id() {
                Some(pid) if pid != self.pid => pid,
                _ => continue,
            };
            let (send, recv) = overlaps(
                &self.local,
                &self.expanded,
                shape,
                &expand(shape)?,
                &images,
                false,
            );
            if !send.is_empty() || !recv.is_empty() {
                self.neighbors.push(Neighbor { pid, send, recv });
            }
        }
        self.neighbor_ids = self.neighbors.iter().map(|n| n.pid).collect();
        let (self_send, self_recv) = overlaps(
            &self.local,
            &self.expanded,
            &self.local,
            &self.expanded,
            &images,
            true,
        );
        self.self_send = self_send;
        self.self_recv = self_recv;

        self.storage.reshape(&self.expanded);
        self.epoch = partition.epoch();
        debug!(
            "Halo of {} reloaded at epoch {}: local {}, expanded {}, neighbors {:?}",
            self.pid, self.epoch, self.local, self.expanded, self.neighbor_ids
        );
        Ok(())
    }

    /// Refreshes every halo cell from its owner. Collective over the
    /// neighbors; a payload that does not match the receiving regions is a
    /// fatal protocol error.
    pub fn sync(&mut self) -> Result<(), HaloError> {
        let payloads = self
            .neighbors
            .iter()
            .map(|n| self.storage.pack(&n.send))
            .collect::<Result<Vec<_>, _>>()?;
        let received = self.comm.neighbor_exchange(&self.neighbor_ids, payloads)?;
        for (neighbor, payload) in self.neighbors.iter().zip(received) {
            self.storage.unpack(&neighbor.recv, &payload)?;
        }
        if !self.self_send.is_empty() {
            let buf = self.storage.pack(&self.self_send)?;
            self.storage.unpack(&self.self_recv, &buf)?;
        }
        Ok(())
    }

    /// Gathers every local shape into `full` at `dst`. `full` must cover the
    /// domain and is only touched at `dst`.
    pub fn collect(&self, dst: Pid, full: Option<&mut S>) -> Result<(), HaloError> {
        let payload = self.storage.pack(&[Overlap::new(self.local.clone())])?;
        if let Some(parts) = self.comm.gather(dst, payload)? {
            if let Some(full) = full {
                for (shape, part) in self.shapes.iter().zip(parts) {
                    full.unpack(&[Overlap::new(shape.clone())], &part)?;
                }
            }
        }
        Ok(())
    }

    /// Scatters `full` from `src` into every local shape, then syncs the halos.
    /// `full` is only read at `src`.
    pub fn distribute(&mut self, src: Pid, full: Option<&S>) -> Result<(), HaloError> {
        let parts = match full {
            Some(full) if self.pid == src => self
                .shapes
                .iter()
                .map(|shape| full.pack(&[Overlap::new(shape.clone())]))
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };
        let part = self.comm.scatter(src, parts)?;
        self.storage.unpack(&[Overlap::new(self.local.clone())], &part)?;
        self.sync()
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn depth(&self) -> i64 {
        self.depth
    }

    /// Partition epoch this field was last reloaded at.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn local_shape(&self) -> &Rect {
        &self.local
    }

    pub fn expanded_shape(&self) -> &Rect {
        &self.expanded
    }

    /// Local cells no neighbor keeps as halo (those at least `depth` from the edge).
    pub fn private_shape(&self) -> &Rect {
        &self.private
    }

    pub fn neighbors(&self) -> &[Neighbor] {
        &self.neighbors
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Direct access to the buffer. Writes to halo cells are overwritten by the next `sync`.
    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn to_toroidal<T: Coord>(&self, p: &Point<T>) -> Point<T> {
        if self.toroidal {
            p.to_toroidal(&self.size)
        } else {
            p.clone()
        }
    }

    pub fn in_global<T: Coord>(&self, p: &Point<T>) -> bool {
        self.domain.contains(&self.to_toroidal(p))
    }

    pub fn in_local<T: Coord>(&self, p: &Point<T>) -> bool {
        self.local.contains(&self.to_toroidal(p))
    }

    pub fn in_private<T: Coord>(&self, p: &Point<T>) -> bool {
        self.private.contains(&self.to_toroidal(p))
    }

    pub fn in_shared<T: Coord>(&self, p: &Point<T>) -> bool {
        self.in_local(p) && !self.in_private(p)
    }

    pub fn in_local_and_halo<T: Coord>(&self, p: &Point<T>) -> bool {
        self.image_in_expanded(p).is_some()
    }

    pub fn in_halo<T: Coord>(&self, p: &Point<T>) -> bool {
        self.in_local_and_halo(p) && !self.in_local(p)
    }

    /// The image of `p` that lies in the expanded shape, preferring the
    /// unshifted one.
    fn image_in_expanded<T: Coord>(&self, p: &Point<T>) -> Option<Point<T>> {
        if !self.in_global(p) {
            return None;
        }
        let base = self.to_toroidal(p);
        if self.expanded.contains(&base) {
            return Some(base);
        }
        images(&self.size, self.toroidal)
            .iter()
            .map(|shift| shifted(&base, shift))
            .find(|image| self.expanded.contains(image))
    }

    /// Maps `p` to the coordinates it is stored under, failing when it is
    /// outside the domain or beyond the halo.
    pub fn to_local_point<T: Coord>(&self, p: &Point<T>) -> Result<Point<T>, HaloError> {
        if !self.in_global(p) {
            return Err(self.out_of_bounds(p, Boundary::Global));
        }
        self.image_in_expanded(p)
            .ok_or_else(|| self.out_of_bounds(p, Boundary::Halo))
    }

    /// `p` wrapped into the domain, failing unless it is local.
    fn require_local<T: Coord>(&self, p: &Point<T>) -> Result<Point<T>, HaloError> {
        if !self.in_global(p) {
            return Err(self.out_of_bounds(p, Boundary::Global));
        }
        let wrapped = self.to_toroidal(p);
        if !self.local.contains(&wrapped) {
            return Err(self.out_of_bounds(p, Boundary::Local));
        }
        Ok(wrapped)
    }

    fn out_of_bounds<T: Coord>(&self, p: &Point<T>, boundary: Boundary) -> HaloError {
        let region = match boundary {
            Boundary::Global => &self.domain,
            Boundary::Local => &self.local,
            Boundary::Halo => &self.expanded,
        };
        HaloError::OutOfBounds {
            point: p.to_real(),
            region: region.clone(),
            boundary,
        }
    }
}

impl<T, C> HaloField<GridStorage<T>, C>
where
    T: Clone + Default + Serialize + DeserializeOwned,
    C: Communicator,
{
    /// A grid field over the expanded shape, filled with `T::default()`.
    pub fn grid(partition: &dyn Partition, depth: i64, comm: Rc<C>) -> Result<Self, HaloError> {
        let storage = GridStorage::new(Rect::from_size(&vec![0; partition.num_dims()]));
        HaloField::new(partition, depth, storage, comm)
    }

    /// Value of a local or halo cell.
    pub fn get(&self, p: &IntPoint) -> Result<&T, HaloError> {
        let local = self.to_local_point(p)?;
        self.storage
            .get(&local)
            .ok_or_else(|| self.out_of_bounds(p, Boundary::Halo))
    }

    /// Writes a local cell. Halo cells belong to the neighbors.
    pub fn set(&mut self, p: &IntPoint, value: T) -> Result<(), HaloError> {
        let local = self.require_local(p)?;
        Ok(self.storage.set(&local, value)?)
    }
}

impl<T, C> HaloField<ContinuousStorage<T>, C>
where
    T: Clone + Serialize + DeserializeOwned,
    C: Communicator,
{
    /// An object field bucketed by `discretization`.
    pub fn continuous(
        partition: &dyn Partition,
        depth: i64,
        discretization: &[f64],
        comm: Rc<C>,
    ) -> Result<Self, HaloError> {
        let storage = ContinuousStorage::new(partition.domain(), discretization);
        HaloField::new(partition, depth, storage, comm)
    }

    /// Adds an object at a local position (wrapped into the domain first).
    pub fn add(&mut self, value: T, pos: &RealPoint) -> Result<Handle, HaloError> {
        let pos = self.require_local(pos)?;
        Ok(self.storage.add(value, pos)?)
    }

    pub fn move_to(&mut self, handle: Handle, pos: &RealPoint) -> Result<(), HaloError> {
        let pos = self.require_local(pos)?;
        Ok(self.storage.move_to(handle, pos)?)
    }

    pub fn remove(&mut self, handle: Handle) -> Result<T, HaloError> {
        Ok(self.storage.remove(handle)?)
    }

    pub fn object(&self, handle: Handle) -> Option<&T> {
        self.storage.get(handle)
    }

    pub fn position(&self, handle: Handle) -> Option<&RealPoint> {
        self.storage.position(handle)
    }

    pub fn objects_in(&self, region: &Rect) -> Vec<Handle> {
        self.storage.objects_in(region)
    }

    /// Handles of the objects inside the local shape.
    pub fn local_objects(&self) -> Vec<Handle> {
        self.storage.objects_in(&self.local)
    }

    pub fn neighbors_within(&self, handle: Handle, radius: f64) -> Result<Vec<Handle>, HaloError> {
        Ok(self.storage.neighbors_within(handle, radius)?)
    }

    pub fn nearest_neighbors(&self, handle: Handle, k: usize) -> Result<Vec<Handle>, HaloError> {
        Ok(self.storage.nearest_neighbors(handle, k)?)
    }
}

/// Post-commit hook: reload the field from the new shapes, then refresh the halos.
pub fn reload_hook<S, C>(field: &Rc<RefCell<HaloField<S, C>>>) -> CommitHook
where
    S: FieldStorage + 'static,
    C: Communicator + 'static,
{
    let field = Rc::clone(field);
    Box::new(move |partition: &dyn Partition| {
        let mut field = field.borrow_mut();
        field
            .reload(partition)
            .and_then(|_| field.sync())
            .map_err(|e| PartitionError::Hook(e.to_string()))
    })
}

/// Pre-commit hook: refresh the halos so cells changing owner carry current values.
pub fn sync_hook<S, C>(field: &Rc<RefCell<HaloField<S, C>>>) -> CommitHook
where
    S: FieldStorage + 'static,
    C: Communicator + 'static,
{
    let field = Rc::clone(field);
    Box::new(move |_: &dyn Partition| {
        field
            .borrow_mut()
            .sync()
            .map_err(|e| PartitionError::Hook(e.to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::NonUniformPartition;
    use tessera_transport::{Cluster, LocalComm};

    fn uniform(comm: &LocalComm, size: &[i64], toroidal: bool) -> NonUniformPartition {
        let mut partition =
            NonUniformPartition::new(comm.rank(), comm.size(), size, toroidal).unwrap();
        partition.init_uniformly(None).unwrap();
        partition
    }

    fn fill_local(field: &mut HaloField<GridStorage<i64>, LocalComm>, f: impl Fn(&IntPoint) -> i64) {
        for p in field.local_shape().cells() {
            field.set(&p, f(&p)).unwrap();
        }
    }

    #[test]
    fn test_images() {
        assert_eq!(images(&[10, 20], false), vec![vec![0, 0]]);
        let wrapped = images(&[10, 20], true);
        assert_eq!(wrapped.len(), 9);
        assert_eq!(wrapped[0], vec![-10, -20]);
        assert_eq!(wrapped[4], vec![0, 0]);
        assert_eq!(wrapped[8], vec![10, 20]);
    }

    #[test]
    fn test_one_dimensional_sync() {
        let results = Cluster::new(2)
            .run(|comm| -> Result<Vec<i64>, HaloError> {
                let partition = uniform(&comm, &[10], false);
                let mut field = HaloField::grid(&partition, 1, Rc::new(comm))?;
                let pid = field.pid() as i64;
                fill_local(&mut field, |p| pid * 100 + p[0]);
                field.sync()?;
                field
                    .expanded_shape()
                    .cells()
                    .map(|p| field.get(&p).cloned())
                    .collect()
            })
            .unwrap();
        assert_eq!(results[0].as_ref().unwrap(), &vec![0, 1, 2, 3, 4, 105]);
        assert_eq!(results[1].as_ref().unwrap(), &vec![4, 105, 106, 107, 108, 109]);
    }

    #[test]
    fn test_toroidal_sync_fills_every_image() {
        let results = Cluster::new(2)
            .run(|comm| -> Result<bool, HaloError> {
                let partition = uniform(&comm, &[4, 4], true);
                let mut field = HaloField::grid(&partition, 1, Rc::new(comm))?;
                let value = |p: &IntPoint| {
                    let w = p.to_toroidal(&[4, 4]);
                    w[0] * 10 + w[1]
                };
                fill_local(&mut field, value);
                field.sync()?;
                let mut all_match = true;
                for p in field.expanded_shape().cells() {
                    all_match &= *field.storage().get(&p).unwrap() == value(&p);
                }
                Ok(all_match)
            })
            .unwrap();
        for result in results {
            assert!(result.unwrap());
        }
    }

    #[test]
    fn test_out_of_bounds_access() {
        let mut partition = NonUniformPartition::new(0, 1, &[6, 6], false).unwrap();
        partition.init_uniformly(None).unwrap();
        let mut field: HaloField<GridStorage<i64>, _> =
            HaloField::grid(&partition, 1, Rc::new(LocalComm::solo())).unwrap();
        assert!(matches!(
            field.get(&IntPoint::from([6, 0])),
            Err(HaloError::OutOfBounds { boundary: Boundary::Global, .. })
        ));
        assert!(field.set(&IntPoint::from([5, 5]), 3).is_ok());
        assert_eq!(field.get(&IntPoint::from([5, 5])).unwrap(), &3);
        assert!(field.in_private(&IntPoint::from([2, 2])));
        assert!(field.in_shared(&IntPoint::from([0, 3])));
        assert!(!field.in_halo(&IntPoint::from([0, 3])));
    }

    #[test]
    fn test_local_and_halo_boundaries() {
        let results = Cluster::new(2)
            .run(|comm| -> Result<(), HaloError> {
                let partition = uniform(&comm, &[10], false);
                let mut field: HaloField<GridStorage<i64>, _> =
                    HaloField::grid(&partition, 1, Rc::new(comm))?;
                if field.pid() == 0 {
                    assert!(field.in_halo(&IntPoint::from([5])));
                    assert!(matches!(
                        field.set(&IntPoint::from([5]), 1),
                        Err(HaloError::OutOfBounds { boundary: Boundary::Local, .. })
                    ));
                    assert!(matches!(
                        field.get(&IntPoint::from([6])),
                        Err(HaloError::OutOfBounds { boundary: Boundary::Halo, .. })
                    ));
                }
                Ok(())
            })
            .unwrap();
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn test_collect_and_distribute() {
        let results = Cluster::new(4)
            .run(|comm| -> Result<(Option<Vec<i64>>, bool), HaloError> {
                let partition = uniform(&comm, &[4, 4], false);
                let mut field = HaloField::grid(&partition, 1, Rc::new(comm))?;
                fill_local(&mut field, |p| p[0] * 4 + p[1]);

                let mut full = GridStorage::new(partition.domain());
                let collected = if field.pid() == 0 {
                    field.collect(0, Some(&mut full))?;
                    Some(full.values().to_vec())
                } else {
                    field.collect(0, None)?;
                    None
                };

                let mut source = GridStorage::new(partition.domain());
                for (i, v) in source.values_mut().iter_mut().enumerate() {
                    *v = -(i as i64);
                }
                let src = if field.pid() == 1 { Some(&source) } else { None };
                field.distribute(1, src)?;
                let mirrored = field
                    .expanded_shape()
                    .cells()
                    .all(|p| *field.get(&p).unwrap() == -(p[0] * 4 + p[1]));
                Ok((collected, mirrored))
            })
            .unwrap();
        let expected: Vec<i64> = (0..16).collect();
        assert_eq!(results[0].as_ref().unwrap().0, Some(expected));
        for result in results {
            assert!(result.unwrap().1);
        }
    }

    #[test]
    fn test_hooks_follow_a_boundary_shift() {
        let results = Cluster::new(2)
            .run(|comm| -> Result<Vec<i64>, HaloError> {
                let mut partition = uniform(&comm, &[10], false);
                let field: Rc<RefCell<HaloField<GridStorage<i64>, LocalComm>>> =
                    Rc::new(RefCell::new(HaloField::grid(&partition, 1, Rc::new(comm))?));
                partition.register_pre_commit(sync_hook(&field));
                partition.register_post_commit(reload_hook(&field));
                {
                    let mut f = field.borrow_mut();
                    let pid = f.pid() as i64;
                    fill_local(&mut *f, |p| pid * 100 + p[0]);
                }

                partition.begin_update(Rect::new(IntPoint::from([0]), IntPoint::from([6]))?.with_id(0))?;
                partition.begin_update(Rect::new(IntPoint::from([6]), IntPoint::from([10]))?.with_id(1))?;
                assert_eq!(partition.commit()?, 2);

                let f = field.borrow();
                assert_eq!(f.epoch(), 1);
                f.expanded_shape().cells().map(|p| f.get(&p).cloned()).collect()
            })
            .unwrap();
        assert_eq!(results[0].as_ref().unwrap(), &vec![0, 1, 2, 3, 4, 105, 106]);
        assert_eq!(results[1].as_ref().unwrap(), &vec![105, 106, 107, 108, 109]);
    }
}
