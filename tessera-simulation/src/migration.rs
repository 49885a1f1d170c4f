//! Moving objects between processes, one neighbor hop per round.
//!
//! Envelopes are only ever exchanged with direct neighbors. An envelope
//! for a process further away is forwarded each round to the neighbor
//! whose shape is closest to the destination, which always exists because
//! the shapes tile the domain.

use log::{debug, info};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tessera_core::{CommitHook, Partition, PartitionError, Pid, RealPoint, Rect};
use tessera_transport::codec::{decode, encode, size_frame, unpack_frames};
use tessera_transport::collective::all_gather_obj;
use tessera_transport::{Communicator, SerializationError, TransportError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Partition {0} is not a valid destination")]
    UnknownDestination(Pid),

    #[error("{in_flight} envelopes still in flight after {rounds} rounds")]
    Unsettled { rounds: usize, in_flight: usize },

    #[error("Codec error: {0}")]
    Codec(#[from] SerializationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Partition error: {0}")]
    Partition(#[from] PartitionError),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    destination: Pid,
    payload: T,
    position: Option<RealPoint>,
    hops: u32,
}

/// An object delivered to this process.
#[derive(Debug, Clone, PartialEq)]
pub struct Arrival<T> {
    pub payload: T,
    pub position: Option<RealPoint>,
    /// Intermediate processes it passed through.
    pub hops: u32,
}

/// Where `dispatch` put an object.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch<T> {
    /// The position is ours; the object is handed back.
    Local(T),
    /// Queued for the owner.
    Sent(Pid),
}

/// Encoded envelopes waiting for one neighbor, each behind a size frame.
#[derive(Debug, Default)]
struct Outbox {
    buf: Vec<u8>,
    count: usize,
}

impl Outbox {
    fn push(&mut self, frame: Vec<u8>) {
        self.buf.extend_from_slice(&size_frame(frame.len()));
        self.buf.extend_from_slice(&frame);
        self.count += 1;
    }
}

pub struct MigrationQueue<T, C> {
    pid: Pid,
    size: Vec<i64>,
    toroidal: bool,
    shapes: Vec<Rect>,
    neighbors: Vec<Pid>,
    outboxes: BTreeMap<Pid, Outbox>,
    arrived: Vec<Arrival<T>>,
    comm: Rc<C>,
}

/// Distance between two intervals along one axis, zero when they touch.
fn interval_gap(a: (i64, i64), b: (i64, i64)) -> i64 {
    (b.0 - a.1).max(a.0 - b.1).max(0)
}

impl<T, C> MigrationQueue<T, C>
where
    T: Serialize + DeserializeOwned,
    C: Communicator,
{
    pub fn new(partition: &dyn Partition, comm: Rc<C>) -> Result<Self, MigrationError> {
        let mut queue = MigrationQueue {
            pid: partition.pid(),
            size: partition.domain_size().to_vec(),
            toroidal: partition.is_toroidal(),
            shapes: Vec::new(),
            neighbors: Vec::new(),
            outboxes: BTreeMap::new(),
            arrived: Vec::new(),
            comm,
        };
        queue.refresh(partition)?;
        Ok(queue)
    }

    fn refresh(&mut self, partition: &dyn Partition) -> Result<(), MigrationError> {
        self.shapes = partition.shapes();
        self.neighbors = partition.neighbor_ids(self.pid)?;
        Ok(())
    }

    pub fn neighbors(&self) -> &[Pid] {
        &self.neighbors
    }

    /// Queues `payload` for a direct neighbor.
    pub fn enqueue(&mut self, payload: T, position: Option<RealPoint>, destination: Pid) -> Result<(), MigrationError> {
        if !self.neighbors.contains(&destination) {
            return Err(MigrationError::UnknownDestination(destination));
        }
        self.post(destination, Envelope {
            destination,
            payload,
            position,
            hops: 0,
        })
    }

    /// Queues `payload` for any process, through intermediate neighbors if
    /// needed. Sending to ourselves delivers immediately.
    pub fn enqueue_routed(
        &mut self,
        payload: T,
        position: Option<RealPoint>,
        destination: Pid,
    ) -> Result<(), MigrationError> {
        if destination >= self.shapes.len() {
            return Err(MigrationError::UnknownDestination(destination));
        }
        if destination == self.pid {
            self.arrived.push(Arrival {
                payload,
                position,
                hops: 0,
            });
            return Ok(());
        }
        let hop = self.next_hop(destination)?;
        self.post(hop, Envelope {
            destination,
            payload,
            position,
            hops: 0,
        })
    }

    /// Hands `payload` back if `position` is local, otherwise routes it to the owner.
    pub fn dispatch(
        &mut self,
        partition: &dyn Partition,
        payload: T,
        position: RealPoint,
    ) -> Result<Dispatch<T>, MigrationError> {
        let position = if self.toroidal {
            position.to_toroidal(&self.size)
        } else {
            position
        };
        let owner = partition.point_owner(&position.floor())?;
        if owner == self.pid {
            return Ok(Dispatch::Local(payload));
        }
        self.enqueue_routed(payload, Some(position), owner)?;
        Ok(Dispatch::Sent(owner))
    }

    fn post(&mut self, hop: Pid, envelope: Envelope<T>) -> Result<(), MigrationError> {
        let frame = encode(&envelope)?;
        self.outboxes.entry(hop).or_default().push(frame);
        Ok(())
    }

    /// The neighbor to hand an envelope for `destination` to.
    ///
    /// A neighboring destination is used directly; otherwise the neighbor
    /// whose shape has the smallest summed per-axis gap to the destination
    /// wins, lower pid first on ties.
    pub fn next_hop(&self, destination: Pid) -> Result<Pid, MigrationError> {
        if self.neighbors.contains(&destination) {
            return Ok(destination);
        }
        let target = self
            .shapes
            .get(destination)
            .ok_or(MigrationError::UnknownDestination(destination))?;
        let mut best: Option<(i64, Pid)> = None;
        for &pid in &self.neighbors {
            let Some(shape) = self.shapes.get(pid) else {
                continue;
            };
            let gap = self.distance(shape, target);
            if best.map_or(true, |(g, p)| gap < g || (gap == g && pid < p)) {
                best = Some((gap, pid));
            }
        }
        best.map(|(_, pid)| pid)
            .ok_or(MigrationError::UnknownDestination(destination))
    }

    fn distance(&self, a: &Rect, b: &Rect) -> i64 {
        (0..a.nd())
            .map(|d| {
                let (al, au) = (a.lower()[d], a.upper()[d]);
                let (bl, bu) = (b.lower()[d], b.upper()[d]);
                if self.toroidal {
                    let s = self.size[d];
                    [-s, 0, s]
                        .iter()
                        .map(|k| interval_gap((al, au), (bl + k, bu + k)))
                        .min()
                        .unwrap_or(0)
                } else {
                    interval_gap((al, au), (bl, bu))
                }
            })
            .sum()
    }

    /// Envelopes buffered here, waiting for the next round.
    pub fn in_flight(&self) -> usize {
        self.outboxes.values().map(|o| o.count).sum()
    }

    pub fn in_flight_for(&self, neighbor: Pid) -> usize {
        self.outboxes.get(&neighbor).map_or(0, |o| o.count)
    }

    /// One exchange round with every neighbor. Arrivals for us are kept,
    /// the rest are forwarded one hop. Returns what is still in flight here.
    pub fn sync(&mut self) -> Result<usize, MigrationError> {
        let payloads: Vec<Vec<u8>> = self
            .neighbors
            .iter()
            .map(|pid| self.outboxes.remove(pid).map(|o| o.buf).unwrap_or_default())
            .collect();
        let received = self.comm.neighbor_exchange(&self.neighbors, payloads)?;

        let mut forwarded = 0;
        for buf in received {
            for frame in unpack_frames(&buf)? {
                let mut envelope: Envelope<T> = decode(&frame)?;
                if envelope.destination == self.pid {
                    self.arrived.push(Arrival {
                        payload: envelope.payload,
                        position: envelope.position,
                        hops: envelope.hops,
                    });
                } else {
                    let hop = self.next_hop(envelope.destination)?;
                    envelope.hops += 1;
                    self.post(hop, envelope)?;
                    forwarded += 1;
                }
            }
        }
        if forwarded > 0 {
            debug!("Partition {} forwarded {} envelopes", self.pid, forwarded);
        }
        Ok(self.in_flight())
    }

    /// Runs `sync` rounds until nothing is in flight anywhere. Collective
    /// over the whole communicator; returns the number of rounds.
    pub fn sync_until_settled(&mut self, max_rounds: usize) -> Result<usize, MigrationError> {
        let max_rounds = max_rounds.max(1);
        let mut in_flight = 0;
        for round in 1..=max_rounds {
            let local = self.sync()?;
            let counts: Vec<usize> = all_gather_obj(&*self.comm, &local)?;
            in_flight = counts.iter().sum();
            if in_flight == 0 {
                return Ok(round);
            }
        }
        Err(MigrationError::Unsettled {
            rounds: max_rounds,
            in_flight,
        })
    }

    /// Takes everything delivered so far.
    pub fn drain(&mut self) -> Vec<Arrival<T>> {
        std::mem::take(&mut self.arrived)
    }

    /// Drops delivered and pending envelopes alike.
    pub fn clear(&mut self) {
        self.arrived.clear();
        self.outboxes.clear();
    }

    /// Picks up new shapes and neighbors. Envelopes waiting for a process
    /// that is no longer a neighbor are routed again.
    pub fn reload(&mut self, partition: &dyn Partition) -> Result<(), MigrationError> {
        self.refresh(partition)?;
        let stranded: Vec<Pid> = self
            .outboxes
            .keys()
            .copied()
            .filter(|pid| !self.neighbors.contains(pid))
            .collect();
        for pid in stranded {
            let Some(outbox) = self.outboxes.remove(&pid) else {
                continue;
            };
            for frame in unpack_frames(&outbox.buf)? {
                let envelope: Envelope<T> = decode(&frame)?;
                if envelope.destination == self.pid {
                    self.arrived.push(Arrival {
                        payload: envelope.payload,
                        position: envelope.position,
                        hops: envelope.hops,
                    });
                } else {
                    let hop = self.next_hop(envelope.destination)?;
                    self.post(hop, envelope)?;
                }
            }
            info!(
                "Partition {} re-routed {} envelopes bound for former neighbor {}",
                self.pid, outbox.count, pid
            );
        }
        Ok(())
    }
}

/// Post-commit hook keeping a shared queue's neighbors current.
pub fn reload_hook<T, C>(queue: &Rc<RefCell<MigrationQueue<T, C>>>) -> CommitHook
where
    T: Serialize + DeserializeOwned + 'static,
    C: Communicator + 'static,
{
    let queue = Rc::clone(queue);
    Box::new(move |partition: &dyn Partition| {
        queue
            .borrow_mut()
            .reload(partition)
            .map_err(|e| PartitionError::Hook(e.to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{IntPoint, NonUniformPartition};
    use tessera_transport::{Cluster, LocalComm};

    fn uniform(pid: Pid, np: usize, size: &[i64]) -> NonUniformPartition {
        let mut partition = NonUniformPartition::new(pid, np, size, false).unwrap();
        partition.init_uniformly(None).unwrap();
        partition
    }

    #[test]
    fn test_every_object_arrives_once_at_its_owner() {
        let results = Cluster::new(4)
            .run(|comm| -> Result<(usize, usize, bool), MigrationError> {
                let partition = uniform(comm.rank(), 4, &[4, 4]);
                let mut queue: MigrationQueue<(Pid, i64, i64), LocalComm> =
                    MigrationQueue::new(&partition, Rc::new(comm))?;
                let mut kept = 0;
                for cell in partition.domain().cells() {
                    let position = RealPoint::from([cell[0] as f64 + 0.5, cell[1] as f64 + 0.5]);
                    let item = (partition.pid(), cell[0], cell[1]);
                    if let Dispatch::Local(_) = queue.dispatch(&partition, item, position)? {
                        kept += 1;
                    }
                }
                let rounds = queue.sync_until_settled(4)?;
                let local = partition.local_shape()?.clone();
                let arrivals = queue.drain();
                let all_inside = arrivals.iter().all(|a| {
                    a.position.as_ref().map_or(false, |p| local.contains(p))
                        && local.contains(&IntPoint::from([a.payload.1, a.payload.2]))
                        && a.payload.0 != partition.pid()
                });
                assert_eq!(rounds, 1);
                Ok((kept, arrivals.len(), all_inside))
            })
            .unwrap();
        for result in results {
            let (kept, arrived, all_inside) = result.unwrap();
            assert_eq!(kept, 4);
            assert_eq!(arrived, 12);
            assert!(all_inside);
        }
    }

    #[test]
    fn test_grid_of_nine_settles_across_corners() {
        let results = Cluster::new(9)
            .run(|comm| -> Result<(usize, usize, usize, bool), MigrationError> {
                let mut partition = NonUniformPartition::new(comm.rank(), 9, &[9, 9], false)?;
                partition.init_uniformly(Some(&[3, 3]))?;
                let mut queue: MigrationQueue<(Pid, i64, i64), LocalComm> =
                    MigrationQueue::new(&partition, Rc::new(comm))?;
                let mut kept = 0;
                for cell in partition.domain().cells() {
                    let position = RealPoint::from([cell[0] as f64 + 0.5, cell[1] as f64 + 0.5]);
                    let item = (partition.pid(), cell[0], cell[1]);
                    if let Dispatch::Local(_) = queue.dispatch(&partition, item, position)? {
                        kept += 1;
                    }
                }
                let rounds = queue.sync_until_settled(4)?;
                let local = partition.local_shape()?.clone();
                let arrivals = queue.drain();
                let all_inside = arrivals.iter().all(|a| {
                    a.position.as_ref().map_or(false, |p| local.contains(p))
                        && local.contains(&IntPoint::from([a.payload.1, a.payload.2]))
                });
                Ok((kept, arrivals.len(), rounds, all_inside))
            })
            .unwrap();
        for result in results {
            let (kept, arrived, rounds, all_inside) = result.unwrap();
            assert_eq!(kept, 9);
            assert_eq!(arrived, 72);
            assert!(rounds <= 2);
            assert!(all_inside);
        }
    }

    #[test]
    fn test_forwarding_along_a_line() {
        let results = Cluster::new(4)
            .run(|comm| -> Result<(usize, Vec<Arrival<String>>), MigrationError> {
                let partition = uniform(comm.rank(), 4, &[10]);
                let mut queue = MigrationQueue::new(&partition, Rc::new(comm))?;
                if partition.pid() == 0 {
                    assert!(matches!(
                        queue.enqueue("direct".to_string(), None, 3),
                        Err(MigrationError::UnknownDestination(3))
                    ));
                    queue.enqueue_routed("hello".to_string(), None, 3)?;
                    assert_eq!(queue.in_flight_for(1), 1);
                }
                let rounds = queue.sync_until_settled(5)?;
                Ok((rounds, queue.drain()))
            })
            .unwrap();
        for (pid, result) in results.into_iter().enumerate() {
            let (rounds, arrivals) = result.unwrap();
            assert_eq!(rounds, 3);
            if pid == 3 {
                assert_eq!(
                    arrivals,
                    vec![Arrival {
                        payload: "hello".to_string(),
                        position: None,
                        hops: 2,
                    }]
                );
            } else {
                assert!(arrivals.is_empty());
            }
        }
    }

    #[test]
    fn test_round_limit_reports_in_flight() {
        let results = Cluster::new(4)
            .run(|comm| -> Result<usize, MigrationError> {
                let partition = uniform(comm.rank(), 4, &[10]);
                let mut queue: MigrationQueue<u8, LocalComm> = MigrationQueue::new(&partition, Rc::new(comm))?;
                if partition.pid() == 0 {
                    queue.enqueue_routed(1, None, 3)?;
                }
                queue.sync_until_settled(1)
            })
            .unwrap();
        for result in results {
            assert!(matches!(
                result,
                Err(MigrationError::Unsettled { rounds: 1, in_flight: 1 })
            ));
        }
    }

    #[test]
    fn test_routing_rules() {
        let partition = uniform(0, 4, &[10]);
        let mut queue: MigrationQueue<u8, LocalComm> =
            MigrationQueue::new(&partition, Rc::new(LocalComm::solo())).unwrap();
        assert_eq!(queue.neighbors(), &[1]);
        assert_eq!(queue.next_hop(1).unwrap(), 1);
        assert_eq!(queue.next_hop(3).unwrap(), 1);
        assert!(matches!(
            queue.enqueue_routed(5, None, 9),
            Err(MigrationError::UnknownDestination(9))
        ));
        queue.enqueue_routed(5, None, 0).unwrap();
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.drain().len(), 1);

        queue.enqueue_routed(6, None, 2).unwrap();
        queue.clear();
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn test_reload_reroutes_stranded_envelopes() {
        let mut partition = uniform(0, 3, &[10]);
        let queue: Rc<RefCell<MigrationQueue<u8, LocalComm>>> = Rc::new(RefCell::new(
            MigrationQueue::new(&partition, Rc::new(LocalComm::solo())).unwrap(),
        ));
        partition.register_post_commit(reload_hook(&queue));
        queue.borrow_mut().enqueue(9, None, 1).unwrap();

        // Swap the two right-hand strips so 1 no longer touches 0
        let swap = |lo: i64, hi: i64, pid: Pid| {
            Rect::new(IntPoint::from([lo]), IntPoint::from([hi])).unwrap().with_id(pid)
        };
        partition.begin_update(swap(4, 7, 2)).unwrap();
        partition.begin_update(swap(7, 10, 1)).unwrap();
        assert_eq!(partition.commit().unwrap(), 2);

        let queue = queue.borrow();
        assert_eq!(queue.neighbors(), &[2]);
        assert_eq!(queue.in_flight_for(1), 0);
        assert_eq!(queue.in_flight_for(2), 1);
    }
}
