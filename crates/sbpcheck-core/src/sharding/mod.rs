//! Placement and sharding metadata for global tensors.
//!
//! A global tensor is described by three pieces of metadata:
//!
//! - A [`Placement`], which names the ranks that hold the tensor's data and arranges them into a row-major
//!   *hierarchy* (e.g., `[4]` for four ranks, or `[2, 2]` for two nodes with two ranks each).
//! - An [`NdSbp`], which assigns one [`Sbp`] to each hierarchy axis and describes how the logical tensor is
//!   distributed along that axis: **s**plit along a tensor dimension, **b**roadcast (replicated), or
//!   **p**artial-sum (each rank holds an addend of the logical value).
//! - A [`ShardingLayout`], which combines both with a global shape and precomputes the slice of the logical tensor
//!   that each rank holds.
//!
//! | Component | Meaning along one hierarchy axis |
//! |---|---|
//! | `S(d)` | Tensor dimension `d` is split evenly across the ranks of the axis. |
//! | `B` | Every rank of the axis holds the full value. |
//! | `P` | The logical value is the sum of the values held by the ranks of the axis. |
//!
//! # Gradients and duality
//!
//! The gradient of a tensor sharded with `B` along some axis is naturally a partial sum along that axis (each replica
//! contributes an addend), and vice versa. [`Sbp::dual`] and [`NdSbp::dual`] implement this exchange; splits are
//! self-dual.

use thiserror::Error;

pub mod layout;
pub mod placement;
pub mod sbp;

pub use layout::{ShardDescriptor, ShardSlice, ShardingLayout};
pub use placement::{DeviceType, Placement, PlacementRank, Rank};
pub use sbp::{NdSbp, Sbp};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error type for placement, SBP, and shard layout construction.
///
/// Any of these errors surfacing while a test case is being set up indicates an invalid configuration.
#[derive(Error, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShardingError {
    /// Error returned when a placement hierarchy has no axes.
    #[error("placement hierarchies must have at least one axis")]
    EmptyHierarchy,

    /// Error returned when a placement hierarchy axis has size `0`.
    #[error("placement hierarchy axis #{axis} must have size > 0")]
    InvalidHierarchyAxisSize { axis: usize },

    /// Error returned when the number of ranks does not match the product of the hierarchy axis sizes.
    #[error("placement has {actual_rank_count} rank(s), but its hierarchy implies {expected_rank_count} rank(s)")]
    RankCountMismatch { expected_rank_count: usize, actual_rank_count: usize },

    /// Error returned when ranks in a placement are not unique.
    #[error("rank {rank} appears more than once in the placement")]
    DuplicateRank { rank: Rank },

    /// Error returned when an SBP signature does not have one component per hierarchy axis.
    #[error("sbp signature has {sbp_ndim} component(s), but the placement hierarchy has {hierarchy_ndim} axis(es)")]
    NdSbpRankMismatch { sbp_ndim: usize, hierarchy_ndim: usize },

    /// Error returned when a split references a tensor dimension that does not exist.
    #[error("split along dimension {axis} is invalid for a tensor of rank {tensor_rank}")]
    SplitAxisOutOfRange { axis: usize, tensor_rank: usize },

    /// Error returned when a split dimension cannot be divided evenly among the ranks splitting it.
    #[error(
        "dimension #{dimension} of size {dimension_size} cannot be split evenly into {partition_count} partition(s)"
    )]
    IndivisibleSplit { dimension: usize, dimension_size: usize, partition_count: usize },

    /// Error returned when a partition index is out of range.
    #[error("partition index {partition_index} is out of range for partition count {partition_count}")]
    InvalidPartitionIndex { partition_index: usize, partition_count: usize },

    /// Error returned when an invalid slice range is constructed.
    #[error("invalid shard slice range [{start}, {end})")]
    InvalidShardSlice { start: usize, end: usize },

    /// Error returned when arithmetic overflows while building shard metadata.
    #[error("overflow while {context}")]
    Overflow { context: String },
}
