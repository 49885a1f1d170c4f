//! Diffusive load balancing by shifting partition faces.
//!
//! Processes take turns by graph color so no two adjacent processes decide
//! in the same step. On its turn a process compares its runtime with the
//! neighbors across each face and proposes moving that face by a fixed
//! offset toward the slower side. Every process then applies every proposal
//! in pid order and commits, so all replicas of the partition stay equal.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::time::Duration;
use tessera_core::{CommitHook, Direction, MovingAverage, Partition, PartitionError, Pid, Rect};
use tessera_transport::collective::{all_gather_obj, neighbor_all_gather};
use tessera_transport::{Communicator, TransportError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BalanceError {
    #[error("Invalid balance action: {0}")]
    InvalidAction(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Partition error: {0}")]
    Partition(#[from] PartitionError),
}

/// Greedy coloring of the adjacency graph in ascending pid order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coloring {
    colors: Vec<usize>,
    num_colors: usize,
}

impl Coloring {
    pub fn compute(partition: &dyn Partition) -> Result<Self, PartitionError> {
        let np = partition.num_procs();
        let mut colors: Vec<usize> = Vec::with_capacity(np);
        for pid in 0..np {
            let taken: BTreeSet<usize> = partition
                .neighbor_ids(pid)?
                .into_iter()
                .filter(|&n| n < pid)
                .map(|n| colors[n])
                .collect();
            let color = (0..).find(|c| !taken.contains(c)).unwrap_or(0);
            colors.push(color);
        }
        let num_colors = colors.iter().max().map_or(0, |&c| c + 1);
        Ok(Coloring { colors, num_colors })
    }

    pub fn color(&self, pid: Pid) -> usize {
        self.colors.get(pid).copied().unwrap_or(0)
    }

    pub fn num_colors(&self) -> usize {
        self.num_colors
    }
}

/// A face shift proposed by one process for one balancing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BalanceAction {
    Idle,
    /// Moves the `direction` face of `source` outward by `offset` along
    /// `dim`, and the facing side of every target the other way.
    Shift {
        source: Pid,
        targets: Vec<Pid>,
        dim: usize,
        direction: Direction,
        offset: i64,
    },
}

impl BalanceAction {
    /// Stages the shift on top of whatever is already staged.
    pub fn apply(&self, partition: &mut dyn Partition) -> Result<(), BalanceError> {
        let (source, targets, dim, direction, offset) = match self {
            BalanceAction::Idle => return Ok(()),
            BalanceAction::Shift {
                source,
                targets,
                dim,
                direction,
                offset,
            } => (*source, targets, *dim, *direction, *offset),
        };
        if dim >= partition.num_dims() {
            return Err(BalanceError::InvalidAction(format!(
                "dimension {} out of range",
                dim
            )));
        }
        let resized = |partition: &dyn Partition, pid: Pid, dir: Direction, amount: i64| -> Result<Rect, BalanceError> {
            let shape = partition
                .staged_shape(pid)
                .map_err(|e| BalanceError::InvalidAction(e.to_string()))?;
            shape
                .resize_dir(dim, dir, amount)
                .map_err(|e| BalanceError::InvalidAction(format!("partition {}: {}", pid, e)))
        };

        let mut next: Vec<Rect> = vec![resized(&*partition, source, direction, offset)?];
        for &target in targets {
            next.push(resized(&*partition, target, direction.opposite(), -offset)?);
        }
        for shape in next {
            partition.begin_update(shape)?;
        }
        Ok(())
    }
}

/// Stages every action in order, aborting everything on the first failure.
fn apply_batch(partition: &mut dyn Partition, actions: &[BalanceAction]) -> Result<(), BalanceError> {
    for action in actions {
        if let Err(e) = action.apply(partition) {
            partition.abort();
            warn!("Aborted balancing round, {:?} could not be applied: {}", action, e);
            return Err(match e {
                BalanceError::Partition(e) => BalanceError::InvalidAction(e.to_string()),
                other => other,
            });
        }
    }
    Ok(())
}

pub struct LoadBalancer<C> {
    pid: Pid,
    coloring: Rc<RefCell<Coloring>>,
    interval: Option<usize>,
    offsets: Vec<i64>,
    threshold: f64,
    runtimes: MovingAverage,
    comm: Rc<C>,
}

impl<C: Communicator> LoadBalancer<C> {
    /// Balances every step with unit offsets until configured otherwise.
    pub fn new(partition: &dyn Partition, comm: Rc<C>) -> Result<Self, BalanceError> {
        Ok(LoadBalancer {
            pid: partition.pid(),
            coloring: Rc::new(RefCell::new(Coloring::compute(partition)?)),
            interval: Some(0),
            offsets: vec![1; partition.num_dims()],
            threshold: 0.0,
            runtimes: MovingAverage::new(10),
            comm,
        })
    }

    /// Idle steps between balancing rounds; `None` turns balancing off.
    pub fn with_interval(mut self, interval: Option<usize>) -> Self {
        self.interval = interval;
        self
    }

    /// How far one action moves a face in each dimension.
    pub fn with_offsets(mut self, offsets: Vec<i64>) -> Self {
        self.offsets = offsets;
        self
    }

    /// Minimum expected gain (runtime units per round) worth a commit.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Number of runtime samples averaged.
    pub fn with_window(mut self, window: usize) -> Self {
        self.runtimes = MovingAverage::new(window);
        self
    }

    pub fn coloring(&self) -> Coloring {
        self.coloring.borrow().clone()
    }

    fn period(&self) -> Option<usize> {
        self.interval
            .map(|interval| self.coloring.borrow().num_colors() + interval)
    }

    pub fn should_balance(&self, step: usize) -> bool {
        match self.period() {
            Some(period) if period > 0 => step % period < self.coloring.borrow().num_colors(),
            _ => false,
        }
    }

    pub fn is_my_turn(&self, step: usize) -> bool {
        match self.period() {
            Some(period) if period > 0 => step % period == self.coloring.borrow().color(self.pid),
            _ => false,
        }
    }

    pub fn record_runtime(&mut self, elapsed: Duration) {
        self.record_runtime_ms(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn record_runtime_ms(&mut self, ms: f64) {
        self.runtimes.next(ms);
    }

    /// Moving-average runtime, 0 before the first sample.
    pub fn runtime(&self) -> f64 {
        self.runtimes.average()
    }

    /// Post-commit hook keeping the coloring current when other components commit.
    pub fn recolor_hook(&self) -> CommitHook {
        let coloring = Rc::clone(&self.coloring);
        Box::new(move |partition: &dyn Partition| {
            *coloring.borrow_mut() = Coloring::compute(partition)?;
            Ok(())
        })
    }

    /// Picks the face shift with the largest expected gain, or `Idle`.
    ///
    /// `neighbors[i]` reported `runtimes[i]`. Single aligned neighbors are
    /// scanned before whole faces and a later candidate must be strictly
    /// better, so a pair wins a tie with its group.
    pub fn decide(
        &self,
        partition: &dyn Partition,
        neighbors: &[Pid],
        runtimes: &[f64],
    ) -> Result<BalanceAction, BalanceError> {
        let own = self.runtime();
        let theirs: HashMap<Pid, f64> = neighbors.iter().copied().zip(runtimes.iter().copied()).collect();
        let local = partition.local_shape()?.clone();
        let size = partition.domain_size().to_vec();

        let mut best: Option<(f64, BalanceAction)> = None;
        let mut consider = |delta: f64, targets: Vec<Pid>, dim: usize, direction: Direction| {
            if best.as_ref().map_or(true, |(b, _)| delta.abs() > *b) {
                let step = self.offsets.get(dim).copied().unwrap_or(0);
                let offset = if delta > 0.0 { -step } else { step };
                best = Some((
                    delta.abs(),
                    BalanceAction::Shift {
                        source: self.pid,
                        targets,
                        dim,
                        direction,
                        offset,
                    },
                ));
            }
        };

        for dim in 0..size.len() {
            let extent = local.extent(dim).max(1) as f64;
            let scale = self.offsets.get(dim).copied().unwrap_or(0) as f64 / extent;
            for direction in Direction::BOTH {
                let at_edge = match direction {
                    Direction::Lower => local.lower()[dim] == 0,
                    Direction::Upper => local.upper()[dim] == size[dim],
                };
                if at_edge {
                    continue;
                }
                let face = partition.neighbor_ids_shift(self.pid, dim, direction)?;
                let mut known = Vec::with_capacity(face.len());
                for &pid in &face {
                    if let Some(&runtime) = theirs.get(&pid) {
                        known.push((pid, runtime, partition.shape(pid)?.clone()));
                    }
                }
                if known.len() != face.len() || face.is_empty() {
                    continue;
                }

                for (pid, runtime, shape) in &known {
                    if local.is_aligned(shape, dim) {
                        consider((own - runtime) * scale, vec![*pid], dim, direction);
                    }
                }

                if known.len() > 1 {
                    let projections: Vec<Rect> = known.iter().map(|(_, _, s)| s.reduce_dim(dim)).collect();
                    let covers = Rect::bounding(&projections)
                        .map_or(false, |b| b.same_bounds(&local.reduce_dim(dim)));
                    if covers {
                        let average = known.iter().map(|(_, r, _)| r).sum::<f64>() / known.len() as f64;
                        consider((own - average) * scale, face.clone(), dim, direction);
                    }
                }
            }
        }

        let period = self.period().unwrap_or(0) as f64;
        Ok(match best {
            Some((delta, action)) if delta * period > self.threshold => action,
            _ => BalanceAction::Idle,
        })
    }

    /// One balancing step. Collective whenever `should_balance(step)`;
    /// returns the number of partitions whose shape changed.
    pub fn tick(&mut self, step: usize, partition: &mut dyn Partition) -> Result<usize, BalanceError> {
        if !self.should_balance(step) {
            return Ok(0);
        }
        let neighbors = partition.neighbor_ids(self.pid)?;
        let runtimes: Vec<f64> = neighbor_all_gather(&*self.comm, &neighbors, &self.runtime())?;

        let action = if self.is_my_turn(step) {
            self.decide(&*partition, &neighbors, &runtimes)?
        } else {
            BalanceAction::Idle
        };
        if action != BalanceAction::Idle {
            debug!("Partition {} proposes {:?} at step {}", self.pid, action, step);
        }

        let actions: Vec<BalanceAction> = all_gather_obj(&*self.comm, &action)?;
        apply_batch(partition, &actions)?;
        let changed = match partition.commit() {
            Ok(changed) => changed,
            Err(e) => {
                warn!("Balancing commit at step {} rejected: {}", step, e);
                return Err(e.into());
            }
        };
        if changed > 0 {
            *self.coloring.borrow_mut() = Coloring::compute(&*partition)?;
            info!(
                "Step {}: balancing moved {} partitions, {} colors",
                step,
                changed,
                self.coloring.borrow().num_colors()
            );
        }
        Ok(changed)
    }
}
