//! Byte layouts of the split-pipelined and hierarchical exchanges.

use std::fmt;
use std::ops::Range;

use crate::distributed::{span, CommunicatorState, DistributedError, Result};

/// Pipeline direction. Backward runs the stages in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

impl Direction {
    pub fn from_backward(is_backward: bool) -> Self {
        if is_backward {
            Self::Backward
        } else {
            Self::Forward
        }
    }

    /// Stage indices in processing order.
    pub fn stage_order(self, num_split: usize) -> Vec<usize> {
        match self {
            Self::Forward => (0..num_split).collect(),
            Self::Backward => (0..num_split).rev().collect(),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Backward => write!(f, "backward"),
        }
    }
}

/// Layout of one split-pipelined all-to-all.
///
/// The fused buffer holds `num_split * num_slices_per_split` equal slices;
/// slice `(j, stage)` sits at index `j * num_split + stage` and belongs to
/// rank `world_size * j / num_slices_per_split`. A stage buffer holds the
/// `num_slices_per_split` slices of one stage back to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPlan {
    pub num_split: usize,
    pub num_slices_per_split: usize,
    pub world_size: usize,
    /// Bytes per slice.
    pub slice_size: usize,
    pub direction: Direction,
}

impl SplitPlan {
    /// Validate the split parameters against a fused buffer of
    /// `total_bytes` and an event pool of `max_num_split` slots.
    pub fn new(
        total_bytes: usize,
        num_split: usize,
        num_slices_per_split: usize,
        world_size: usize,
        max_num_split: usize,
        direction: Direction,
    ) -> Result<Self> {
        if num_split == 0 || num_split > max_num_split {
            return Err(DistributedError::InvalidSplit(format!(
                "num_split {num_split} must be in 1..={max_num_split}"
            )));
        }
        if num_slices_per_split == 0 || num_slices_per_split % world_size != 0 {
            return Err(DistributedError::InvalidSplit(format!(
                "num_slices_per_split {num_slices_per_split} is not a positive multiple of world_size {world_size}"
            )));
        }
        let num_slices = num_split * num_slices_per_split;
        if total_bytes % num_slices != 0 {
            return Err(DistributedError::InvalidSplit(format!(
                "{total_bytes} bytes do not divide into {num_slices} slices"
            )));
        }
        Ok(Self {
            num_split,
            num_slices_per_split,
            world_size,
            slice_size: total_bytes / num_slices,
            direction,
        })
    }

    pub fn num_slices(&self) -> usize {
        self.num_split * self.num_slices_per_split
    }

    pub fn total_bytes(&self) -> usize {
        self.num_slices() * self.slice_size
    }

    /// Bytes of one stage buffer.
    pub fn stage_bytes(&self) -> usize {
        self.num_slices_per_split * self.slice_size
    }

    pub fn stage_order(&self) -> Vec<usize> {
        self.direction.stage_order(self.num_split)
    }

    /// Rank exchanging slice `j` of every stage.
    pub fn peer(&self, j: usize) -> usize {
        self.world_size * j / self.num_slices_per_split
    }

    /// Slice `(j, stage)` in the fused buffer.
    pub fn fused_range(&self, j: usize, stage: usize) -> Range<usize> {
        span((j * self.num_split + stage) * self.slice_size, self.slice_size)
    }

    /// Slice `j` in a stage buffer.
    pub fn stage_range(&self, j: usize) -> Range<usize> {
        span(j * self.slice_size, self.slice_size)
    }
}

/// Layout of the two-level all-to-all.
///
/// The buffer holds one `slice_size` chunk per destination rank, in rank
/// order. With `g` devices per node and `n` nodes, the first stride copy
/// regroups chunks by destination local device, the intra-node round
/// delivers them, the second stride copy regroups by destination node, and
/// the inter-node round finishes the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HierarchyPlan {
    pub nodes: usize,
    pub local_size: usize,
    pub node_rank: usize,
    pub local_rank: usize,
    /// Bytes per destination rank.
    pub slice_size: usize,
}

impl HierarchyPlan {
    pub fn new(total_bytes: usize, state: &CommunicatorState) -> Result<Self> {
        if total_bytes % state.world_size != 0 {
            return Err(DistributedError::InvalidSplit(format!(
                "{total_bytes} bytes do not divide among {} ranks",
                state.world_size
            )));
        }
        if state.world_size % state.local_size != 0 {
            return Err(DistributedError::InvalidSplit(format!(
                "world_size {} is not a multiple of local_size {}",
                state.world_size, state.local_size
            )));
        }
        Ok(Self {
            nodes: state.num_nodes(),
            local_size: state.local_size,
            node_rank: state.node_rank(),
            local_rank: state.local_rank,
            slice_size: total_bytes / state.world_size,
        })
    }

    pub fn world_size(&self) -> usize {
        self.nodes * self.local_size
    }

    /// One level has a single member, so a flat exchange is equivalent.
    pub fn is_flat(&self) -> bool {
        self.nodes == 1 || self.local_size == 1
    }

    /// Peer of intra-node block `g`.
    pub fn intra_peer(&self, g: usize) -> usize {
        self.node_rank * self.local_size + g
    }

    /// Peer of inter-node block `n`.
    pub fn inter_peer(&self, n: usize) -> usize {
        n * self.local_size + self.local_rank
    }

    pub fn intra_block(&self, g: usize) -> Range<usize> {
        let len = self.nodes * self.slice_size;
        span(g * len, len)
    }

    pub fn inter_block(&self, n: usize) -> Range<usize> {
        let len = self.local_size * self.slice_size;
        span(n * len, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_follows_direction() {
        assert_eq!(Direction::Forward.stage_order(3), vec![0, 1, 2]);
        assert_eq!(Direction::Backward.stage_order(3), vec![2, 1, 0]);
        assert_eq!(Direction::from_backward(true), Direction::Backward);
    }

    #[test]
    fn slices_interleave_stages() {
        let plan = SplitPlan::new(64, 2, 4, 2, 8, Direction::Forward).unwrap();
        assert_eq!(plan.slice_size, 8);
        assert_eq!(plan.stage_bytes(), 32);
        assert_eq!(plan.fused_range(1, 1), 24..32);
        assert_eq!(plan.stage_range(3), 24..32);
        let peers: Vec<_> = (0..4).map(|j| plan.peer(j)).collect();
        assert_eq!(peers, vec![0, 0, 1, 1]);
    }

    #[test]
    fn rejects_inconsistent_splits() {
        let bad = [
            SplitPlan::new(64, 2, 3, 2, 8, Direction::Forward),
            SplitPlan::new(64, 0, 2, 2, 8, Direction::Forward),
            SplitPlan::new(64, 9, 2, 2, 8, Direction::Forward),
            SplitPlan::new(60, 2, 4, 2, 8, Direction::Forward),
        ];
        for result in bad {
            assert!(matches!(result, Err(DistributedError::InvalidSplit(_))));
        }
    }

    #[test]
    fn hierarchy_peers() {
        let state = CommunicatorState::new(8, 5, 4);
        let plan = HierarchyPlan::new(64, &state).unwrap();
        assert_eq!((plan.nodes, plan.node_rank, plan.local_rank), (2, 1, 1));
        assert!(!plan.is_flat());
        assert_eq!(plan.intra_peer(2), 6);
        assert_eq!(plan.inter_peer(0), 1);
        assert_eq!(plan.intra_block(1), 16..32);
        assert_eq!(plan.inter_block(1), 32..64);
    }

    #[test]
    fn single_level_is_flat() {
        let state = CommunicatorState::new(4, 0, 4);
        assert!(HierarchyPlan::new(16, &state).unwrap().is_flat());
        let state = CommunicatorState::new(6, 0, 4);
        assert!(HierarchyPlan::new(12, &state).is_err());
    }
}
