//! Sub-communicators following the levels of a quad tree partition.

use log::debug;
use tessera_core::{Partition, PartitionError, Pid, QuadTreePartition, Rect};
use tessera_transport::{Communicator, TransportError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GroupError {
    #[error("No group at level {0} for this process")]
    UnknownLevel(usize),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Partition error: {0}")]
    Partition(#[from] PartitionError),
}

/// The processes under one quad tree node, with a communicator over them.
pub struct GroupComm<C> {
    pub level: usize,
    pub node: usize,
    pub master_proc: Pid,
    pub shape: Rect,
    pub comm: C,
}

/// One group per level on the path from the root to this process's leaf.
pub struct HierarchicalGroups<C> {
    pid: Pid,
    groups: Vec<GroupComm<C>>,
}

impl<C: Communicator> HierarchicalGroups<C> {
    /// Collective over `world`: every process walks the nodes level by
    /// level and joins the groups of the nodes above its leaf.
    pub fn new(partition: &QuadTreePartition, world: &C) -> Result<Self, GroupError> {
        let pid = partition.pid();
        let specs = partition.group_specs()?;
        let mut groups = Vec::new();
        let mut level = 0;
        for spec in specs {
            if spec.level != level {
                world.barrier()?;
                level = spec.level;
            }
            if !partition.is_member(spec.node) {
                continue;
            }
            let comm = world.split(&spec.members)?;
            debug!(
                "Partition {} joined group of node {} at level {} ({} members)",
                pid,
                spec.node,
                spec.level,
                spec.members.len()
            );
            groups.push(GroupComm {
                level: spec.level,
                node: spec.node,
                master_proc: spec.master_proc,
                shape: spec.shape,
                comm,
            });
        }
        world.barrier()?;
        Ok(HierarchicalGroups { pid, groups })
    }

    pub fn depth(&self) -> usize {
        self.groups.len()
    }

    pub fn group_comm(&self, level: usize) -> Result<&GroupComm<C>, GroupError> {
        self.groups
            .iter()
            .find(|g| g.level == level)
            .ok_or(GroupError::UnknownLevel(level))
    }

    pub fn is_group_master(&self, level: usize) -> Result<bool, GroupError> {
        Ok(self.group_comm(level)?.master_proc == self.pid)
    }

    /// Shape of the tree node this process belongs to at `level`.
    pub fn node_shape_at_level(&self, level: usize) -> Result<&Rect, GroupError> {
        Ok(&self.group_comm(level)?.shape)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GroupComm<C>> {
        self.groups.iter()
    }
}
