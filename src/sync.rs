//! Host-side completion barriers
//!
//! The host issues every descriptor of an invocation first, then waits on
//! one barrier per transfer group (an interface tile and a direction).
//! Barriers may retire in any order; results are valid only once all have.

use std::collections::HashSet;

use serde::Serialize;

use crate::descriptor::{Direction, TransferDescriptor};
use crate::error::{CompileError, CompileResult};
use crate::hardware::TileCoord;

/// Transfers of one interface tile in one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TransferGroup {
    pub interface: TileCoord,
    pub direction: Direction,
}

impl TransferGroup {
    pub fn of(descriptor: &TransferDescriptor) -> Self {
        Self {
            interface: descriptor.interface,
            direction: descriptor.direction,
        }
    }
}

/// A blocking wait on one transfer group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Barrier {
    pub group: TransferGroup,
}

/// One host action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HostOp {
    /// Issue the descriptor at this index
    Issue(usize),
    Await(Barrier),
}

/// Descriptors and barriers of one invocation, in host order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostSequence {
    pub descriptors: Vec<TransferDescriptor>,
    pub barriers: Vec<Barrier>,
}

impl HostSequence {
    /// All issues, then all waits.
    pub fn ops(&self) -> Vec<HostOp> {
        (0..self.descriptors.len())
            .map(HostOp::Issue)
            .chain(self.barriers.iter().copied().map(HostOp::Await))
            .collect()
    }

    /// Check a host op list: every descriptor issued once, no issue after the
    /// first wait, and exactly one wait per transfer group.
    pub fn validate_ops(&self, ops: &[HostOp]) -> CompileResult<()> {
        let mut issued = HashSet::new();
        let mut awaited = HashSet::new();
        let mut waiting = false;
        for op in ops {
            match op {
                HostOp::Issue(i) => {
                    if waiting {
                        return Err(CompileError::descriptor(format!(
                            "descriptor {} issued after a barrier wait",
                            i
                        )));
                    }
                    if *i >= self.descriptors.len() || !issued.insert(*i) {
                        return Err(CompileError::descriptor(format!(
                            "descriptor {} is unknown or issued twice",
                            i
                        )));
                    }
                }
                HostOp::Await(barrier) => {
                    waiting = true;
                    if !awaited.insert(barrier.group) {
                        return Err(CompileError::descriptor(format!(
                            "transfer group on {} awaited twice",
                            barrier.group.interface
                        )));
                    }
                }
            }
        }
        if issued.len() != self.descriptors.len() {
            return Err(CompileError::descriptor(format!(
                "{} of {} descriptors issued",
                issued.len(),
                self.descriptors.len()
            )));
        }
        let groups: HashSet<_> = self.descriptors.iter().map(TransferGroup::of).collect();
        if groups != awaited {
            return Err(CompileError::descriptor(format!(
                "{} transfer groups but {} barriers awaited",
                groups.len(),
                awaited.len()
            )));
        }
        Ok(())
    }
}

/// Plans the barriers that close an invocation
pub struct SyncBarrier;

impl SyncBarrier {
    /// One barrier per distinct transfer group, in first-issue order.
    pub fn plan(descriptors: Vec<TransferDescriptor>) -> HostSequence {
        let mut seen = HashSet::new();
        let barriers = descriptors
            .iter()
            .map(TransferGroup::of)
            .filter(|g| seen.insert(*g))
            .map(|group| Barrier { group })
            .collect();
        HostSequence {
            descriptors,
            barriers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHandle;
    use crate::descriptor::HostBufferId;

    fn descriptor(column: usize, direction: Direction) -> TransferDescriptor {
        TransferDescriptor {
            channel: ChannelHandle(0),
            channel_name: "c".to_string(),
            interface: TileCoord::new(column, 0),
            direction,
            slot: 0,
            buffer: HostBufferId(0),
            offsets: [0; 4],
            sizes: [1, 1, 1, 4],
            strides: [0; 3],
        }
    }

    #[test]
    fn test_one_barrier_per_group() {
        let sequence = SyncBarrier::plan(vec![
            descriptor(0, Direction::HostToDevice),
            descriptor(0, Direction::DeviceToHost),
            descriptor(1, Direction::HostToDevice),
            descriptor(0, Direction::HostToDevice),
        ]);
        assert_eq!(sequence.barriers.len(), 3);
        let ops = sequence.ops();
        assert_eq!(ops.len(), 7);
        assert!(sequence.validate_ops(&ops).is_ok());
    }

    #[test]
    fn test_issue_after_wait_rejected() {
        let sequence = SyncBarrier::plan(vec![
            descriptor(0, Direction::HostToDevice),
            descriptor(1, Direction::HostToDevice),
        ]);
        let ops = vec![
            HostOp::Issue(0),
            HostOp::Await(sequence.barriers[0]),
            HostOp::Issue(1),
            HostOp::Await(sequence.barriers[1]),
        ];
        assert!(sequence.validate_ops(&ops).is_err());
    }

    #[test]
    fn test_missing_barrier_rejected() {
        let sequence = SyncBarrier::plan(vec![
            descriptor(0, Direction::HostToDevice),
            descriptor(1, Direction::HostToDevice),
        ]);
        let ops = vec![HostOp::Issue(0), HostOp::Issue(1), HostOp::Await(sequence.barriers[1])];
        assert!(sequence.validate_ops(&ops).is_err());
    }
}
