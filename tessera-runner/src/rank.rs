//! The per-rank demonstration loop: a diffusing heat field written by random
//! walkers that migrate between partitions while the balancer moves the
//! boundaries under them.

use hdrhistogram::Histogram;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tessera_config::{Config, PartitionScheme};
use tessera_core::{
    CommitHook, Handle, IntPoint, NonUniformPartition, Partition, PartitionError, Pid, QuadTreePartition, RealPoint,
    Rect, Timings,
};
use tessera_simulation::halo::{reload_hook, sync_hook};
use tessera_simulation::migration::reload_hook as queue_reload_hook;
use tessera_simulation::{
    BalanceError, ContinuousStorage, Dispatch, GridStorage, GroupError, HaloError, HaloField,
    HierarchicalGroups, LoadBalancer, MigrationError, MigrationQueue,
};
use tessera_transport::collective::{all_gather_obj, broadcast_obj};
use tessera_transport::{Communicator, LocalComm, TransportError};
use thiserror::Error;

/// Heat left in a cell by each walker visit.
const DEPOSIT: f64 = 0.05;
/// Steps between stop flag broadcasts.
const STOP_CHECK_INTERVAL: usize = 10;
/// Keeps clamped walkers strictly inside the upper domain face.
const EDGE: f64 = 1e-9;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Partition error: {0}")]
    Partition(#[from] PartitionError),

    #[error("Halo error: {0}")]
    Halo(#[from] HaloError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Balancer error: {0}")]
    Balance(#[from] BalanceError),

    #[error("Group error: {0}")]
    Group(#[from] GroupError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Histogram error: {0}")]
    Histogram(String),

    #[error("{0} walkers were lost during the run")]
    LostWalkers(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Walker {
    id: u64,
    origin: Pid,
    steps: u32,
}

type HeatField = HaloField<GridStorage<f64>, LocalComm>;
type WalkerField = HaloField<ContinuousStorage<Walker>, LocalComm>;
type WalkerQueue = MigrationQueue<Walker, LocalComm>;

/// What one rank reports back to the launcher.
#[derive(Debug, Clone)]
pub struct RankReport {
    pub pid: Pid,
    pub steps: usize,
    pub walkers: usize,
    pub shape: Rect,
    pub epoch: u64,
    pub rebalances: usize,
    pub max_rounds: usize,
    pub mean_crowding: f64,
    pub p50_us: u64,
    pub p99_us: u64,
}

impl fmt::Display for RankReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rank {}: {} steps, {} walkers in {}, epoch {} ({} rebalances), \
             up to {} migration rounds, crowding {:.2}, step p50 {}us p99 {}us",
            self.pid,
            self.steps,
            self.walkers,
            self.shape,
            self.epoch,
            self.rebalances,
            self.max_rounds,
            self.mean_crowding,
            self.p50_us,
            self.p99_us
        )
    }
}

fn build_partition(
    config: &Config,
    comm: &LocalComm,
) -> Result<(Box<dyn Partition>, Option<HierarchicalGroups<LocalComm>>), RunError> {
    let pid = comm.rank();
    let np = comm.size();
    let size = &config.domain.size;
    let min_extent = vec![config.halo.depth; size.len()];
    match config.partition.scheme {
        PartitionScheme::Uniform => {
            let mut partition =
                NonUniformPartition::new(pid, np, size, config.domain.toroidal)?.with_min_extent(&min_extent);
            partition.init_uniformly(config.partition.dims.as_deref())?;
            let partition: Box<dyn Partition> = Box::new(partition);
            Ok((partition, None))
        }
        PartitionScheme::QuadTree => {
            let mut partition =
                QuadTreePartition::new(pid, np, size, config.domain.toroidal)?.with_min_extent(&min_extent);
            let points: Vec<IntPoint> = config
                .partition
                .split_points
                .iter()
                .map(|p| IntPoint::new(p.iter().copied()))
                .collect();
            partition.init_quad_tree(&points)?;
            let groups = HierarchicalGroups::new(&partition, comm)?;
            let partition: Box<dyn Partition> = Box::new(partition);
            Ok((partition, Some(groups)))
        }
    }
}

/// Post-commit hook for the walkers: objects outside the new local shape
/// are handed to the migration queue before the field reshapes.
fn handover_hook(walkers: &Rc<RefCell<WalkerField>>, queue: &Rc<RefCell<WalkerQueue>>) -> CommitHook {
    let walkers = Rc::clone(walkers);
    let queue = Rc::clone(queue);
    Box::new(move |partition: &dyn Partition| {
        hand_over(&mut walkers.borrow_mut(), &mut queue.borrow_mut(), partition)
            .map_err(|e| PartitionError::Hook(e.to_string()))
    })
}

fn hand_over(walkers: &mut WalkerField, queue: &mut WalkerQueue, partition: &dyn Partition) -> Result<(), RunError> {
    let local = partition.local_shape()?.clone();
    let leaving: Vec<Handle> = walkers
        .storage()
        .iter()
        .filter(|(_, _, pos)| !local.contains(*pos))
        .map(|(handle, _, _)| handle)
        .collect();
    let mut kept = Vec::new();
    for handle in &leaving {
        let Some(pos) = walkers.position(*handle).cloned() else {
            continue;
        };
        let walker = walkers.remove(*handle)?;
        if let Dispatch::Local(walker) = queue.dispatch(partition, walker, pos.clone())? {
            kept.push((walker, pos));
        }
    }
    walkers.reload(partition)?;
    for (walker, pos) in kept {
        walkers.add(walker, &pos)?;
    }
    if !leaving.is_empty() {
        debug!("Partition {} handed over {} walkers", partition.pid(), leaving.len());
    }
    Ok(())
}

/// Removes the halo copies left by the last walker sync.
fn strip_copies(walkers: &mut WalkerField) -> Result<usize, RunError> {
    let local = walkers.local_shape().clone();
    let copies: Vec<Handle> = walkers
        .storage()
        .iter()
        .filter(|(_, _, pos)| !local.contains(*pos))
        .map(|(handle, _, _)| handle)
        .collect();
    for handle in &copies {
        walkers.remove(*handle)?;
    }
    Ok(copies.len())
}

/// One explicit diffusion step over the local cells. Missing neighbors
/// (past a non-toroidal domain face) carry no flux.
fn diffuse(heat: &mut HeatField, rate: f64) -> Result<(), RunError> {
    let local = heat.local_shape().clone();
    let cells: Vec<IntPoint> = local.cells().collect();
    let grid = heat.storage();
    let nd = local.nd();
    let next: Vec<f64> = cells
        .par_iter()
        .map(|cell| {
            let here = grid.get(cell).copied().unwrap_or_default();
            let flux: f64 = (0..nd)
                .flat_map(|d| [cell.shift(d, -1), cell.shift(d, 1)])
                .map(|n| grid.get(&n).map_or(0.0, |v| v - here))
                .sum();
            here + rate * flux
        })
        .collect();
    for (cell, value) in cells.iter().zip(next) {
        heat.set(cell, value)?;
    }
    Ok(())
}

fn deposit(heat: &mut HeatField, walkers: &WalkerField) -> Result<(), RunError> {
    for handle in walkers.local_objects() {
        let Some(pos) = walkers.position(handle) else {
            continue;
        };
        let cell = pos.floor();
        let value = *heat.get(&cell)?;
        heat.set(&cell, value + DEPOSIT)?;
    }
    Ok(())
}

/// Random step for every local walker; leavers go to the queue. Returns
/// how many were sent.
fn move_walkers(
    walkers: &mut WalkerField,
    queue: &mut WalkerQueue,
    partition: &dyn Partition,
    rng: &mut StdRng,
    speed: f64,
) -> Result<usize, RunError> {
    let size = partition.domain_size().to_vec();
    let toroidal = partition.is_toroidal();
    let mut sent = 0;
    for handle in walkers.local_objects() {
        let Some(pos) = walkers.position(handle).cloned() else {
            continue;
        };
        let next = RealPoint::new((0..pos.nd()).map(|d| {
            let x = pos[d] + rng.gen_range(-speed..=speed);
            if toroidal {
                x
            } else {
                x.clamp(0.0, size[d] as f64 - EDGE)
            }
        }));
        if walkers.in_local(&next) {
            walkers.move_to(handle, &next)?;
            if let Some(walker) = walkers.storage_mut().get_mut(handle) {
                walker.steps += 1;
            }
            continue;
        }
        let mut walker = walkers.remove(handle)?;
        walker.steps += 1;
        match queue.dispatch(partition, walker, next.clone())? {
            Dispatch::Local(walker) => {
                walkers.add(walker, &next)?;
            }
            Dispatch::Sent(_) => sent += 1,
        }
    }
    Ok(sent)
}

fn receive_walkers(walkers: &mut WalkerField, queue: &mut WalkerQueue) -> Result<usize, RunError> {
    let mut received = 0;
    for arrival in queue.drain() {
        match arrival.position {
            Some(pos) => {
                walkers.add(arrival.payload, &pos)?;
                received += 1;
            }
            None => warn!("Walker {} arrived without a position", arrival.payload.id),
        }
    }
    Ok(received)
}

/// Average number of walkers within `radius` of each local walker,
/// counting halo copies.
fn crowding(walkers: &WalkerField, radius: f64) -> Result<f64, RunError> {
    let handles = walkers.local_objects();
    if handles.is_empty() {
        return Ok(0.0);
    }
    let mut total = 0;
    for handle in &handles {
        total += walkers.neighbors_within(*handle, radius)?.len();
    }
    Ok(total as f64 / handles.len() as f64)
}

/// Runs the whole demonstration on one rank. Collective over `comm`.
pub fn run_rank(comm: LocalComm, config: &Config, stop: &AtomicBool) -> Result<RankReport, RunError> {
    let (mut partition, groups) = build_partition(config, &comm)?;
    let comm = Rc::new(comm);
    let pid = partition.pid();
    let nd = partition.num_dims();
    let sim = &config.simulation;

    let heat: Rc<RefCell<HeatField>> = Rc::new(RefCell::new(HaloField::grid(
        &*partition,
        config.halo.depth,
        Rc::clone(&comm),
    )?));
    let walkers: Rc<RefCell<WalkerField>> = Rc::new(RefCell::new(HaloField::continuous(
        &*partition,
        config.halo.depth,
        &vec![sim.discretization; nd],
        Rc::clone(&comm),
    )?));
    let queue: Rc<RefCell<WalkerQueue>> = Rc::new(RefCell::new(MigrationQueue::new(&*partition, Rc::clone(&comm))?));

    partition.register_pre_commit(sync_hook(&heat));
    partition.register_post_commit(reload_hook(&heat));
    partition.register_post_commit(queue_reload_hook(&queue));
    partition.register_post_commit(handover_hook(&walkers, &queue));

    let interval = match config.partition.scheme {
        PartitionScheme::Uniform => config.balancer.interval,
        PartitionScheme::QuadTree => {
            info!("Partition {}: quad tree layout, face balancing disabled", pid);
            None
        }
    };
    let mut balancer = LoadBalancer::new(&*partition, Rc::clone(&comm))?
        .with_interval(interval)
        .with_offsets(config.balance_offsets())
        .with_threshold(config.balancer.threshold)
        .with_window(config.balancer.window);

    let mut rng = StdRng::seed_from_u64(sim.seed.wrapping_add(pid as u64));
    let seeded = sim.walkers_per_rank * (pid + 1);
    {
        let mut walkers = walkers.borrow_mut();
        let local = walkers.local_shape().clone();
        for i in 0..seeded {
            let pos = RealPoint::new((0..nd).map(|d| rng.gen_range(local.lower()[d] as f64..local.upper()[d] as f64)));
            let walker = Walker {
                id: ((pid as u64) << 32) | i as u64,
                origin: pid,
                steps: 0,
            };
            walkers.add(walker, &pos)?;
        }
    }
    let expected: usize = all_gather_obj(&*comm, &seeded)?.iter().sum();
    info!("Partition {} owns {} with {} walkers", pid, partition.local_shape()?, seeded);

    let mut timings = Timings::new(config.balancer.window);
    let mut step_times =
        Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).map_err(|e| RunError::Histogram(e.to_string()))?;
    let mut rebalances = 0;
    let mut max_rounds = 0;
    let mut crowd = 0.0;
    let mut steps_run = 0;

    for step in 0..sim.steps {
        if step % STOP_CHECK_INTERVAL == 0 {
            let flag = stop.load(Ordering::SeqCst);
            let stop_now: bool = broadcast_obj(&*comm, 0, comm.is_root().then_some(&flag))?;
            if stop_now {
                info!("Partition {} stopping at step {}", pid, step);
                break;
            }
        }
        let started = Instant::now();

        {
            let mut heat = heat.borrow_mut();
            let mut walkers = walkers.borrow_mut();
            let mut queue = queue.borrow_mut();
            strip_copies(&mut walkers)?;
            heat.sync()?;

            timings.start("compute");
            diffuse(&mut heat, sim.diffusion_rate)?;
            deposit(&mut heat, &walkers)?;
            let sent = move_walkers(&mut walkers, &mut queue, &*partition, &mut rng, sim.walker_speed)?;
            if let Some(elapsed) = timings.stop("compute") {
                balancer.record_runtime(elapsed);
            }

            let rounds = queue.sync_until_settled(config.migration.max_rounds)?;
            max_rounds = max_rounds.max(rounds);
            let received = receive_walkers(&mut walkers, &mut queue)?;
            if sent > 0 || received > 0 {
                debug!(
                    "Partition {} step {}: sent {} walkers, received {} in {} rounds",
                    pid, step, sent, received, rounds
                );
            }

            walkers.sync()?;
            crowd = crowding(&walkers, sim.discretization)?;
            strip_copies(&mut walkers)?;
        }

        match balancer.tick(step, &mut *partition) {
            Ok(changed) if changed > 0 => rebalances += 1,
            Ok(_) => {}
            Err(BalanceError::InvalidAction(msg)) => {
                warn!("Partition {} skipped balancing at step {}: {}", pid, step, msg);
            }
            // Rejected before any hook ran, so every shape is unchanged
            Err(BalanceError::Partition(e)) if !matches!(e, PartitionError::Hook(_)) => {
                warn!("Partition {} skipped balancing at step {}: {}", pid, step, e);
            }
            Err(e) => return Err(e.into()),
        }

        step_times.saturating_record(started.elapsed().as_micros() as u64);
        steps_run = step + 1;
    }

    // Walkers handed over by the last commit are still queued
    let rounds = queue.borrow_mut().sync_until_settled(config.migration.max_rounds)?;
    max_rounds = max_rounds.max(rounds);
    let owned = {
        let mut walkers = walkers.borrow_mut();
        strip_copies(&mut walkers)?;
        receive_walkers(&mut walkers, &mut queue.borrow_mut())?;
        walkers.local_objects().len()
    };
    let total: usize = all_gather_obj(&*comm, &owned)?.iter().sum();
    if total != expected {
        return Err(RunError::LostWalkers(expected.saturating_sub(total)));
    }

    let mut full = comm.is_root().then(|| GridStorage::new(partition.domain()));
    heat.borrow().collect(0, full.as_mut())?;
    if let Some(full) = full {
        info!(
            "Collected heat field: total {:.3}, {} walkers across {} ranks",
            full.values().iter().sum::<f64>(),
            total,
            comm.size()
        );
    }

    if let Some(groups) = &groups {
        for group in groups.iter() {
            let counts: Vec<usize> = all_gather_obj(&group.comm, &owned)?;
            if group.master_proc == pid {
                info!(
                    "Level {} node {} ({}): {} walkers on {} ranks",
                    group.level,
                    group.node,
                    group.shape,
                    counts.iter().sum::<usize>(),
                    counts.len()
                );
            }
        }
    }

    Ok(RankReport {
        pid,
        steps: steps_run,
        walkers: owned,
        shape: partition.local_shape()?.clone(),
        epoch: partition.epoch(),
        rebalances,
        max_rounds,
        mean_crowding: crowd,
        p50_us: step_times.value_at_quantile(0.5),
        p99_us: step_times.value_at_quantile(0.99),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_transport::Cluster;

    fn small_config(processes: usize) -> Config {
        let mut config = Config::default();
        config.processes = processes;
        config.domain.size = vec![16, 16];
        config.simulation.steps = 12;
        config.simulation.walkers_per_rank = 6;
        config.balancer.interval = Some(2);
        config.balancer.threshold = 0.0;
        config
    }

    fn run(config: &Config) -> Vec<RankReport> {
        let stop = AtomicBool::new(false);
        Cluster::new(config.processes)
            .run(|comm| run_rank(comm, config, &stop))
            .unwrap()
            .into_iter()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_walkers_are_conserved() {
        let config = small_config(4);
        let reports = run(&config);
        let total: usize = reports.iter().map(|r| r.walkers).sum();
        assert_eq!(total, 6 * (1 + 2 + 3 + 4));
        assert!(reports.iter().all(|r| r.steps == 12));
        let epochs: Vec<u64> = reports.iter().map(|r| r.epoch).collect();
        assert!(epochs.iter().all(|&e| e == epochs[0]));
    }

    #[test]
    fn test_toroidal_run() {
        let mut config = small_config(2);
        config.domain.toroidal = true;
        config.simulation.walker_speed = 3.0;
        let reports = run(&config);
        assert_eq!(reports.iter().map(|r| r.walkers).sum::<usize>(), 6 * 3);
    }

    #[test]
    fn test_quad_tree_run() {
        let mut config = small_config(4);
        config.partition.scheme = PartitionScheme::QuadTree;
        config.partition.split_points = vec![vec![8, 8]];
        let reports = run(&config);
        assert!(reports.iter().all(|r| r.epoch == 0));
        assert_eq!(reports.iter().map(|r| r.walkers).sum::<usize>(), 6 * 10);
    }

    #[test]
    fn test_stop_flag_ends_run_early() {
        let config = small_config(2);
        let stop = AtomicBool::new(true);
        let reports = Cluster::new(2).run(|comm| run_rank(comm, &config, &stop)).unwrap();
        for report in reports {
            assert_eq!(report.unwrap().steps, 0);
        }
    }
}
