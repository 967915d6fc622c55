//! Process group abstractions for SPMD training.
//!
//! A process group represents a set of processes that participate in
//! collective operations. Every process runs the same program; groups are
//! carved out of the global world as contiguous model groups (which together
//! hold every expert) and strided data groups (replicas of one expert shard).

use super::error::{DistributedError, Result};

/// Trait for process group operations.
///
/// A process group manages rank assignment and provides the foundation
/// for collective communications.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this process inside the group (0..world_size).
    fn rank(&self) -> usize;

    /// Total number of processes in the group.
    fn world_size(&self) -> usize;

    /// Local rank on this node (device ordinal).
    fn local_rank(&self) -> usize;

    /// Whether this is the coordinator (rank 0).
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Whether this is a single-process group.
    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// Local process group for single-process execution.
///
/// All collective operations over it become identity/no-ops.
#[derive(Debug, Clone)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
}

impl LocalProcessGroup {
    /// Create a new local process group (one process).
    pub fn new() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Create a local process group with specific rank/size.
    ///
    /// Useful for exercising multi-rank bookkeeping inside one process.
    pub fn with_rank(rank: usize, world_size: usize) -> Self {
        assert!(rank < world_size, "rank must be < world_size");
        Self { rank, world_size }
    }
}

impl Default for LocalProcessGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn local_rank(&self) -> usize {
        self.rank
    }
}

/// Placement of one global rank inside the data × model grid.
///
/// The world is split into `group_count` model groups of `model_size`
/// consecutive ranks. Ranks at the same position of different model groups
/// form a data group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLayout {
    pub global_rank: usize,
    pub global_size: usize,
    pub group_count: usize,
    /// Number of ranks per model group.
    pub model_size: usize,
    /// Position inside the model group.
    pub model_rank: usize,
    /// Index of the model group this rank belongs to.
    pub data_rank: usize,
}

impl GroupLayout {
    pub fn new(global_size: usize, group_count: usize, global_rank: usize) -> Result<Self> {
        if global_size == 0 || global_rank >= global_size {
            return Err(DistributedError::InvalidRank {
                rank: global_rank,
                world_size: global_size,
            });
        }
        if group_count == 0 || global_size % group_count != 0 {
            return Err(DistributedError::UnevenGroups {
                world_size: global_size,
                group_count,
            });
        }

        let model_size = global_size / group_count;
        Ok(Self {
            global_rank,
            global_size,
            group_count,
            model_size,
            model_rank: global_rank % model_size,
            data_rank: global_rank / model_size,
        })
    }

    /// Global ranks of this rank's model group, in group order.
    pub fn model_group_ranks(&self) -> Vec<usize> {
        let start = self.data_rank * self.model_size;
        (start..start + self.model_size).collect()
    }

    /// Global ranks of this rank's data group, in group order.
    pub fn data_group_ranks(&self) -> Vec<usize> {
        (0..self.group_count)
            .map(|i| self.model_rank + i * self.model_size)
            .collect()
    }

    /// Every global rank, in order.
    pub fn global_group_ranks(&self) -> Vec<usize> {
        (0..self.global_size).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_pg_is_coordinator() {
        let pg = LocalProcessGroup::new();
        assert!(pg.is_coordinator());
        assert!(pg.is_single());
    }

    #[test]
    fn local_pg_with_rank() {
        let pg = LocalProcessGroup::with_rank(2, 4);
        assert_eq!(pg.rank(), 2);
        assert_eq!(pg.world_size(), 4);
        assert!(!pg.is_coordinator());
        assert!(!pg.is_single());
    }

    #[test]
    #[should_panic(expected = "rank must be < world_size")]
    fn local_pg_invalid_rank_panics() {
        LocalProcessGroup::with_rank(5, 4);
    }

    #[test]
    fn layout_single_group() {
        let layout = GroupLayout::new(4, 1, 2).unwrap();
        assert_eq!(layout.model_size, 4);
        assert_eq!(layout.model_rank, 2);
        assert_eq!(layout.data_rank, 0);
        assert_eq!(layout.model_group_ranks(), vec![0, 1, 2, 3]);
        assert_eq!(layout.data_group_ranks(), vec![2]);
    }

    #[test]
    fn layout_two_groups() {
        // 8 ranks, 2 replicas of a 4-way expert split.
        let layout = GroupLayout::new(8, 2, 6).unwrap();
        assert_eq!(layout.model_size, 4);
        assert_eq!(layout.model_rank, 2);
        assert_eq!(layout.data_rank, 1);
        assert_eq!(layout.model_group_ranks(), vec![4, 5, 6, 7]);
        assert_eq!(layout.data_group_ranks(), vec![2, 6]);
        assert_eq!(layout.global_group_ranks().len(), 8);
    }

    #[test]
    fn layout_pure_data_parallel() {
        let layout = GroupLayout::new(4, 4, 3).unwrap();
        assert_eq!(layout.model_size, 1);
        assert_eq!(layout.model_rank, 0);
        assert_eq!(layout.data_rank, 3);
        assert_eq!(layout.model_group_ranks(), vec![3]);
        assert_eq!(layout.data_group_ranks(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn layout_rejects_uneven_split() {
        let err = GroupLayout::new(6, 4, 0).unwrap_err();
        assert!(matches!(
            err,
            DistributedError::UnevenGroups {
                world_size: 6,
                group_count: 4
            }
        ));
        assert!(GroupLayout::new(4, 0, 0).is_err());
    }

    #[test]
    fn layout_rejects_bad_rank() {
        assert!(matches!(
            GroupLayout::new(2, 1, 2),
            Err(DistributedError::InvalidRank { .. })
        ));
    }
}
