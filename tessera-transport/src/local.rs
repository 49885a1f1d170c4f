//! In-process substrate: every rank is a thread with its own mailbox.

use crate::codec::{read_size, size_frame};
use crate::comm::Communicator;
use crate::error::TransportError;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error};
use std::cell::{Cell, RefCell};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

const WORLD_CONTEXT: u64 = 0;

#[derive(Debug)]
struct Envelope {
    ctx: u64,
    tag: u64,
    src: usize,
    payload: Vec<u8>,
}

/// `(context, tag, source rank)`
type MatchKey = (u64, u64, usize);

struct Mailbox {
    rx: Receiver<Envelope>,
    // Messages that arrived before anyone asked for them
    pending: HashMap<MatchKey, VecDeque<Vec<u8>>>,
}

/// Communicator backed by crossbeam channels between threads of one process.
///
/// Messages are matched on a context id (one per communicator), a sequence
/// tag (one per collective call) and the sender's rank. Anything received
/// out of order is buffered until the matching call asks for it.
pub struct LocalComm {
    ctx: u64,
    rank: usize,
    members: Vec<usize>,
    peers: Arc<Vec<Sender<Envelope>>>,
    mailbox: Rc<RefCell<Mailbox>>,
    seq: Cell<u64>,
    splits: RefCell<HashMap<Vec<usize>, u64>>,
    timeout: Duration,
}

impl LocalComm {
    fn new(
        rank: usize,
        peers: Arc<Vec<Sender<Envelope>>>,
        rx: Receiver<Envelope>,
        timeout: Duration,
    ) -> Self {
        LocalComm {
            ctx: WORLD_CONTEXT,
            rank,
            members: (0..peers.len()).collect(),
            peers,
            mailbox: Rc::new(RefCell::new(Mailbox {
                rx,
                pending: HashMap::new(),
            })),
            seq: Cell::new(0),
            splits: RefCell::new(HashMap::new()),
            timeout,
        }
    }

    /// A world of one rank, for code that runs without peers.
    pub fn solo() -> Self {
        let (tx, rx) = unbounded();
        LocalComm::new(0, Arc::new(vec![tx]), rx, DEFAULT_STALL_TIMEOUT)
    }

    /// Rank of this process in the world this communicator was split from.
    pub fn world_rank(&self) -> usize {
        self.members[self.rank]
    }

    fn next_tag(&self) -> u64 {
        let tag = self.seq.get();
        self.seq.set(tag + 1);
        tag
    }

    fn send(&self, to: usize, tag: u64, payload: Vec<u8>) -> Result<(), TransportError> {
        let world = *self.members.get(to).ok_or(TransportError::NotMember(to))?;
        self.peers[world]
            .send(Envelope {
                ctx: self.ctx,
                tag,
                src: self.rank,
                payload,
            })
            .map_err(|_| TransportError::Disconnected(to))
    }

    fn recv(&self, from: usize, tag: u64) -> Result<Vec<u8>, TransportError> {
        let key = (self.ctx, tag, from);
        let mut guard = self.mailbox.borrow_mut();
        let mailbox = &mut *guard;
        if let Some(queue) = mailbox.pending.get_mut(&key) {
            if let Some(payload) = queue.pop_front() {
                if queue.is_empty() {
                    mailbox.pending.remove(&key);
                }
                return Ok(payload);
            }
        }
        loop {
            match mailbox.rx.recv_timeout(self.timeout) {
                Ok(env) => {
                    let got = (env.ctx, env.tag, env.src);
                    if got == key {
                        return Ok(env.payload);
                    }
                    mailbox.pending.entry(got).or_default().push_back(env.payload);
                }
                Err(RecvTimeoutError::Timeout) => {
                    error!(
                        "Rank {} gave up waiting on rank {} after {:?}",
                        self.world_rank(),
                        from,
                        self.timeout
                    );
                    return Err(TransportError::Stalled {
                        rank: self.rank,
                        peer: from,
                        timeout: self.timeout,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::Disconnected(from))
                }
            }
        }
    }

    fn context_for(&self, members: &[usize]) -> u64 {
        let mut splits = self.splits.borrow_mut();
        let count = splits.entry(members.to_vec()).or_insert(0);
        *count += 1;
        let mut hasher = DefaultHasher::new();
        (self.ctx, members, *count).hash(&mut hasher);
        hasher.finish()
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn neighbor_exchange(
        &self,
        neighbors: &[usize],
        payloads: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, TransportError> {
        if neighbors.len() != payloads.len() {
            return Err(TransportError::PartCount {
                expected: neighbors.len(),
                actual: payloads.len(),
            });
        }
        let tag = self.next_tag();
        for (&to, payload) in neighbors.iter().zip(payloads) {
            self.send(to, tag, size_frame(payload.len()))?;
            self.send(to, tag, payload)?;
        }
        neighbors
            .iter()
            .map(|&from| {
                let expected = read_size(&self.recv(from, tag)?)?;
                let payload = self.recv(from, tag)?;
                if payload.len() != expected {
                    return Err(TransportError::SizeMismatch {
                        from,
                        expected,
                        actual: payload.len(),
                    });
                }
                Ok(payload)
            })
            .collect()
    }

    fn all_gather(&self, data: Vec<u8>) -> Result<Vec<Vec<u8>>, TransportError> {
        let tag = self.next_tag();
        for to in 0..self.size() {
            self.send(to, tag, data.clone())?;
        }
        (0..self.size()).map(|from| self.recv(from, tag)).collect()
    }

    fn gather(&self, root: usize, data: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>, TransportError> {
        self.check_root(root)?;
        let tag = self.next_tag();
        self.send(root, tag, data)?;
        if self.rank != root {
            return Ok(None);
        }
        let parts = (0..self.size())
            .map(|from| self.recv(from, tag))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(parts))
    }

    fn scatter(&self, root: usize, parts: Vec<Vec<u8>>) -> Result<Vec<u8>, TransportError> {
        self.check_root(root)?;
        let tag = self.next_tag();
        if self.rank == root {
            if parts.len() != self.size() {
                return Err(TransportError::PartCount {
                    expected: self.size(),
                    actual: parts.len(),
                });
            }
            for (to, part) in parts.into_iter().enumerate() {
                self.send(to, tag, part)?;
            }
        }
        self.recv(root, tag)
    }

    fn broadcast(&self, root: usize, data: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        self.check_root(root)?;
        let tag = self.next_tag();
        if self.rank == root {
            for to in 0..self.size() {
                self.send(to, tag, data.clone())?;
            }
        }
        self.recv(root, tag)
    }

    fn split(&self, members: &[usize]) -> Result<Self, TransportError> {
        if let Some(&bad) = members.iter().find(|&&m| m >= self.size()) {
            return Err(TransportError::NotMember(bad));
        }
        let mut members = members.to_vec();
        members.sort_unstable();
        members.dedup();
        let rank = members
            .iter()
            .position(|&m| m == self.rank)
            .ok_or(TransportError::NotMember(self.rank))?;
        let ctx = self.context_for(&members);
        debug!(
            "Rank {} joined a group of {} as rank {}",
            self.world_rank(),
            members.len(),
            rank
        );
        Ok(LocalComm {
            ctx,
            rank,
            members: members.iter().map(|&m| self.members[m]).collect(),
            peers: Arc::clone(&self.peers),
            mailbox: Rc::clone(&self.mailbox),
            seq: Cell::new(0),
            splits: RefCell::new(HashMap::new()),
            timeout: self.timeout,
        })
    }
}

/// Launches one thread per rank and runs the same closure on each.
#[derive(Debug, Clone)]
pub struct Cluster {
    size: usize,
    stall_timeout: Duration,
}

impl Cluster {
    pub fn new(size: usize) -> Self {
        Cluster {
            size,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs `f` on every rank and returns the results indexed by rank.
    pub fn run<F, R>(&self, f: F) -> Result<Vec<R>, TransportError>
    where
        F: Fn(LocalComm) -> R + Sync,
        R: Send,
    {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..self.size).map(|_| unbounded()).unzip();
        let peers = Arc::new(senders);
        let f = &f;
        let timeout = self.stall_timeout;

        thread::scope(|scope| {
            let handles: Vec<_> = receivers
                .into_iter()
                .enumerate()
                .map(|(rank, rx)| {
                    let peers = Arc::clone(&peers);
                    thread::Builder::new()
                        .name(format!("rank-{}", rank))
                        .spawn_scoped(scope, move || f(LocalComm::new(rank, peers, rx, timeout)))
                })
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| match handle {
                    Ok(handle) => handle.join().map_err(|_| TransportError::RankPanicked(rank)),
                    Err(_) => Err(TransportError::Spawn(rank)),
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solo_comm() {
        let comm = LocalComm::solo();
        assert_eq!(comm.size(), 1);
        comm.barrier().unwrap();
        assert_eq!(comm.broadcast(0, vec![4]).unwrap(), vec![4]);
        assert_eq!(comm.all_gather(vec![1, 2]).unwrap(), vec![vec![1, 2]]);
    }

    #[test]
    fn test_all_gather_orders_by_rank() {
        let results = Cluster::new(4)
            .run(|comm| comm.all_gather(vec![comm.rank() as u8; comm.rank() + 1]))
            .unwrap();
        for gathered in results {
            let gathered = gathered.unwrap();
            assert_eq!(gathered.len(), 4);
            for (rank, data) in gathered.iter().enumerate() {
                assert_eq!(data, &vec![rank as u8; rank + 1]);
            }
        }
    }

    #[test]
    fn test_ring_neighbor_exchange() {
        let results = Cluster::new(3)
            .run(|comm| {
                let n = comm.size();
                let left = (comm.rank() + n - 1) % n;
                let right = (comm.rank() + 1) % n;
                // Variable sized payloads to each side
                let payloads = vec![vec![comm.rank() as u8], vec![comm.rank() as u8; 3]];
                comm.neighbor_exchange(&[left, right], payloads)
            })
            .unwrap();
        for (rank, received) in results.into_iter().enumerate() {
            let received = received.unwrap();
            let left = (rank + 2) % 3;
            let right = (rank + 1) % 3;
            // Left neighbor sent us its "right" payload and vice versa
            assert_eq!(received[0], vec![left as u8; 3]);
            assert_eq!(received[1], vec![right as u8]);
        }
    }

    #[test]
    fn test_rooted_collectives() {
        let results = Cluster::new(3)
            .run(|comm| -> Result<(Vec<u8>, Vec<u8>, Option<Vec<Vec<u8>>>), TransportError> {
                let parts = if comm.rank() == 1 {
                    vec![vec![10], vec![11], vec![12]]
                } else {
                    Vec::new()
                };
                let mine = comm.scatter(1, parts)?;
                let everyone = comm.broadcast(2, vec![comm.rank() as u8])?;
                let gathered = comm.gather(0, mine.clone())?;
                Ok((mine, everyone, gathered))
            })
            .unwrap();
        for (rank, result) in results.into_iter().enumerate() {
            let (mine, everyone, gathered) = result.unwrap();
            assert_eq!(mine, vec![10 + rank as u8]);
            assert_eq!(everyone, vec![2]);
            if rank == 0 {
                assert_eq!(gathered, Some(vec![vec![10], vec![11], vec![12]]));
            } else {
                assert_eq!(gathered, None);
            }
        }
    }

    #[test]
    fn test_invalid_root() {
        let comm = LocalComm::solo();
        assert!(matches!(
            comm.broadcast(3, Vec::new()),
            Err(TransportError::InvalidRoot { root: 3, size: 1 })
        ));
    }

    #[test]
    fn test_split_groups_are_isolated() {
        let results = Cluster::new(4)
            .run(|comm| -> Result<(usize, Vec<Vec<u8>>, Vec<Vec<u8>>), TransportError> {
                let members: Vec<usize> = (0..4).filter(|r| r % 2 == comm.rank() % 2).collect();
                let group = comm.split(&members)?;
                let inner = group.all_gather(vec![comm.rank() as u8])?;
                let outer = comm.all_gather(vec![group.rank() as u8])?;
                Ok((group.rank(), inner, outer))
            })
            .unwrap();
        for (rank, result) in results.into_iter().enumerate() {
            let (group_rank, inner, outer) = result.unwrap();
            assert_eq!(group_rank, rank / 2);
            let expected: Vec<Vec<u8>> = (0..4u8)
                .filter(|r| *r as usize % 2 == rank % 2)
                .map(|r| vec![r])
                .collect();
            assert_eq!(inner, expected);
            assert_eq!(outer, vec![vec![0], vec![0], vec![1], vec![1]]);
        }
    }

    #[test]
    fn test_split_requires_membership() {
        let comm = LocalComm::solo();
        assert!(matches!(comm.split(&[1]), Err(TransportError::NotMember(1))));
        let results = Cluster::new(2)
            .run(|comm| comm.split(&[0]).map(|g| g.size()))
            .unwrap();
        assert_eq!(results[0].as_ref().ok(), Some(&1));
        assert!(matches!(results[1], Err(TransportError::NotMember(1))));
    }

    #[test]
    fn test_missing_peer_stalls() {
        let results = Cluster::new(2)
            .with_stall_timeout(Duration::from_millis(50))
            .run(|comm| {
                if comm.rank() == 0 {
                    comm.barrier()
                } else {
                    Ok(())
                }
            })
            .unwrap();
        assert!(matches!(
            results[0],
            Err(TransportError::Stalled { peer: 1, .. }) | Err(TransportError::Disconnected(1))
        ));
        assert!(results[1].is_ok());
    }

    #[test]
    fn test_panicking_rank_is_reported() {
        let result = Cluster::new(2).run(|comm| {
            if comm.rank() == 1 {
                panic!("rank failure");
            }
            comm.rank()
        });
        assert!(matches!(result, Err(TransportError::RankPanicked(1))));
    }
}
