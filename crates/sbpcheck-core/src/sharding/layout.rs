use serde::Serialize;

use super::{NdSbp, Placement, PlacementRank, Rank, Sbp, ShardingError};

// ---------------------------------------------------------------------------
// Shard metadata
// ---------------------------------------------------------------------------

/// Half-open slice `[start, end)` for one logical tensor dimension in a shard.
///
/// For a dimension that is not split, the slice spans the full extent `[0, dimension_size)`. For a split dimension,
/// the slice covers the partition assigned to a specific rank based on its hierarchy coordinate.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct ShardSlice {
    start: usize,
    end: usize,
}

impl ShardSlice {
    /// Creates a new shard slice.
    pub fn new(start: usize, end: usize) -> Result<Self, ShardingError> {
        if start > end {
            return Err(ShardingError::InvalidShardSlice { start, end });
        }
        Ok(Self { start, end })
    }

    /// Inclusive start index.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Exclusive end index.
    pub fn end(&self) -> usize {
        self.end
    }

    /// Length of this slice.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns `true` iff this slice is empty.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Metadata for the shard of a global tensor that one rank holds.
///
/// This is pure metadata. The shard data itself lives in the local tensors of a
/// [`GlobalTensor`](crate::global::GlobalTensor).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct ShardDescriptor {
    shard_index: usize,
    device: PlacementRank,
    hierarchy_coordinate: Vec<usize>,
    slices: Vec<ShardSlice>,
    shape: Vec<usize>,
}

impl ShardDescriptor {
    /// Shard index in row-major hierarchy order.
    pub fn shard_index(&self) -> usize {
        self.shard_index
    }

    /// Rank that holds this shard.
    pub fn device(&self) -> PlacementRank {
        self.device
    }

    /// Row-major hierarchy coordinate of this shard.
    pub fn hierarchy_coordinate(&self) -> &[usize] {
        self.hierarchy_coordinate.as_slice()
    }

    /// Per-dimension logical slices for this shard.
    pub fn slices(&self) -> &[ShardSlice] {
        self.slices.as_slice()
    }

    /// Shape of this shard.
    pub fn shape(&self) -> &[usize] {
        self.shape.as_slice()
    }

    /// Returns `true` if this shard sits at coordinate `0` along every hierarchy axis that `nd_sbp` marks as partial
    /// sum. When a logical value is distributed with `nd_sbp`, only such shards receive it; all other shards hold
    /// zeros so that the partial sums add up to the logical value exactly once.
    pub fn is_partial_owner(&self, nd_sbp: &NdSbp) -> bool {
        self.is_origin_along(nd_sbp, Sbp::is_partial_sum)
    }

    /// Returns `true` if this shard sits at coordinate `0` along every hierarchy axis that `nd_sbp` marks as
    /// broadcast. When gathering a value distributed with `nd_sbp`, only such shards are read, so that every replica
    /// is counted exactly once.
    pub fn is_replica_leader(&self, nd_sbp: &NdSbp) -> bool {
        self.is_origin_along(nd_sbp, Sbp::is_broadcast)
    }

    fn is_origin_along(&self, nd_sbp: &NdSbp, predicate: fn(&Sbp) -> bool) -> bool {
        nd_sbp
            .components()
            .iter()
            .zip(self.hierarchy_coordinate.iter())
            .all(|(sbp, coordinate)| !predicate(sbp) || *coordinate == 0)
    }

    /// Row-major flat indices (into the logical tensor) of the elements held by this shard, in shard order.
    pub fn logical_indices(&self, global_shape: &[usize]) -> Vec<usize> {
        region_indices(global_shape, self.slices.as_slice())
    }
}

// ---------------------------------------------------------------------------
// Sharding layout
// ---------------------------------------------------------------------------

/// Precomputed shard metadata for a logical tensor.
///
/// Given a global shape, a [`Placement`], and an [`NdSbp`], this structure computes the [`ShardDescriptor`] for
/// every rank of the placement.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ShardingLayout {
    global_shape: Vec<usize>,
    placement: Placement,
    nd_sbp: NdSbp,
    shards: Vec<ShardDescriptor>,
}

impl ShardingLayout {
    /// Constructs shard metadata for all ranks in the placement.
    ///
    /// Returns [`ShardingError::IndivisibleSplit`] if a split dimension cannot be divided evenly among the ranks
    /// splitting it.
    pub fn new(global_shape: Vec<usize>, placement: Placement, nd_sbp: NdSbp) -> Result<Self, ShardingError> {
        nd_sbp.validate(&placement, global_shape.len())?;

        let splitting_axes =
            (0..global_shape.len()).map(|dimension| nd_sbp.hierarchy_axes_splitting(dimension)).collect::<Vec<_>>();

        let mut shards = Vec::with_capacity(placement.rank_count());
        for (shard_index, device) in placement.devices().iter().copied().enumerate() {
            let hierarchy_coordinate = placement
                .coordinate_for_rank_index(shard_index)
                .ok_or(ShardingError::InvalidPartitionIndex {
                    partition_index: shard_index,
                    partition_count: placement.rank_count(),
                })?;

            let mut slices = Vec::with_capacity(global_shape.len());
            let mut shape = Vec::with_capacity(global_shape.len());
            for (dimension, dimension_size) in global_shape.iter().copied().enumerate() {
                let axes = splitting_axes[dimension].as_slice();
                let slice = if axes.is_empty() {
                    ShardSlice::new(0, dimension_size)?
                } else {
                    let (partition_index, partition_count) =
                        partition_index_for_axes(placement.hierarchy(), hierarchy_coordinate.as_slice(), axes)?;
                    if dimension_size % partition_count != 0 {
                        return Err(ShardingError::IndivisibleSplit { dimension, dimension_size, partition_count });
                    }
                    partition_slice(dimension_size, partition_count, partition_index)?
                };
                shape.push(slice.len());
                slices.push(slice);
            }

            shards.push(ShardDescriptor { shard_index, device, hierarchy_coordinate, slices, shape });
        }

        Ok(Self { global_shape, placement, nd_sbp, shards })
    }

    /// Global (logical) tensor shape.
    pub fn global_shape(&self) -> &[usize] {
        self.global_shape.as_slice()
    }

    /// The placement used to build this layout.
    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    /// The SBP signature used to build this layout.
    pub fn nd_sbp(&self) -> &NdSbp {
        &self.nd_sbp
    }

    /// Shard descriptors for all ranks, in row-major hierarchy order.
    pub fn shards(&self) -> &[ShardDescriptor] {
        self.shards.as_slice()
    }

    /// Returns the descriptor for `shard_index`, if it exists.
    pub fn shard(&self, shard_index: usize) -> Option<&ShardDescriptor> {
        self.shards.get(shard_index)
    }

    /// Returns the shard descriptor for `rank`, if the rank is in the placement.
    pub fn shard_for_rank(&self, rank: Rank) -> Option<&ShardDescriptor> {
        self.placement.rank_index(rank).and_then(|index| self.shard(index))
    }

    /// Returns the replica leader of the shard at `shard_index`: the shard with the same hierarchy coordinate, except
    /// along broadcast axes where its coordinate is `0`. Leaders are their own leaders.
    pub fn replica_leader(&self, shard_index: usize) -> Option<&ShardDescriptor> {
        let descriptor = self.shard(shard_index)?;
        let leader_coordinate = self
            .nd_sbp
            .components()
            .iter()
            .zip(descriptor.hierarchy_coordinate.iter())
            .map(|(sbp, coordinate)| if sbp.is_broadcast() { 0 } else { *coordinate })
            .collect::<Vec<_>>();
        self.shards.iter().find(|shard| shard.hierarchy_coordinate == leader_coordinate)
    }

    /// Returns shard indices that belong to `node_index`.
    pub fn shard_indices_for_node(&self, node_index: usize) -> Vec<usize> {
        self.shards
            .iter()
            .filter_map(|descriptor| (descriptor.device.node_index() == node_index).then_some(descriptor.shard_index))
            .collect()
    }

    /// Returns a layout with the same shape, placement, and slices, but with the dual SBP signature.
    pub fn dual(&self) -> Self {
        Self { nd_sbp: self.nd_sbp.dual(), ..self.clone() }
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

/// Row-major strides for `shape`, in elements.
pub(crate) fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

/// Row-major flat indices of the elements of the region `slices` inside a tensor with shape `shape`.
pub(crate) fn region_indices(shape: &[usize], slices: &[ShardSlice]) -> Vec<usize> {
    let region_shape = slices.iter().map(ShardSlice::len).collect::<Vec<_>>();
    let element_count = region_shape.iter().product::<usize>();
    if element_count == 0 {
        return Vec::new();
    }

    let strides = row_major_strides(shape);
    let mut indices = Vec::with_capacity(element_count);
    let mut position = vec![0usize; slices.len()];
    for _ in 0..element_count {
        indices.push(
            position
                .iter()
                .zip(slices.iter())
                .zip(strides.iter())
                .map(|((offset, slice), stride)| (slice.start + offset) * stride)
                .sum(),
        );
        for axis in (0..position.len()).rev() {
            position[axis] += 1;
            if position[axis] < region_shape[axis] {
                break;
            }
            position[axis] = 0;
        }
    }
    indices
}

fn partition_index_for_axes(
    hierarchy: &[usize],
    hierarchy_coordinate: &[usize],
    hierarchy_axes: &[usize],
) -> Result<(usize, usize), ShardingError> {
    let mut partition_index = 0usize;
    let mut partition_count = 1usize;

    for &axis in hierarchy_axes {
        let axis_size = hierarchy[axis];
        let axis_coordinate = hierarchy_coordinate[axis];

        partition_index = partition_index
            .checked_mul(axis_size)
            .and_then(|value| value.checked_add(axis_coordinate))
            .ok_or_else(|| ShardingError::Overflow {
                context: format!("computing partition index for hierarchy axis #{axis}"),
            })?;
        partition_count = partition_count.checked_mul(axis_size).ok_or_else(|| ShardingError::Overflow {
            context: format!("computing partition count for hierarchy axis #{axis}"),
        })?;
    }

    Ok((partition_index, partition_count))
}

fn partition_slice(
    dimension_size: usize,
    partition_count: usize,
    partition_index: usize,
) -> Result<ShardSlice, ShardingError> {
    if partition_index >= partition_count {
        return Err(ShardingError::InvalidPartitionIndex { partition_index, partition_count });
    }

    let size = dimension_size / partition_count;
    let start = partition_index
        .checked_mul(size)
        .ok_or_else(|| ShardingError::Overflow { context: "computing shard-slice start index".to_string() })?;
    ShardSlice::new(start, start + size)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::sharding::DeviceType;

    fn test_placement_2x2() -> Placement {
        Placement::from_ranks(DeviceType::Cpu, vec![2, 2], 0..4, 2).unwrap()
    }

    #[test]
    fn test_sharding_layout_rank_mismatch() {
        let nd_sbp = NdSbp::new(vec![Sbp::split(0)]);
        assert!(matches!(
            ShardingLayout::new(vec![8], test_placement_2x2(), nd_sbp),
            Err(ShardingError::NdSbpRankMismatch { sbp_ndim: 1, hierarchy_ndim: 2 }),
        ));
    }

    #[test]
    fn test_sharding_layout_indivisible_split() {
        let nd_sbp = NdSbp::new(vec![Sbp::split(0), Sbp::split(0)]);
        assert!(matches!(
            ShardingLayout::new(vec![6, 4], test_placement_2x2(), nd_sbp),
            Err(ShardingError::IndivisibleSplit { dimension: 0, dimension_size: 6, partition_count: 4 }),
        ));
    }

    #[test]
    fn test_sharding_layout_2d_partitioning() {
        let nd_sbp = NdSbp::new(vec![Sbp::split(0), Sbp::split(1)]);
        let layout = ShardingLayout::new(vec![8, 6], test_placement_2x2(), nd_sbp).unwrap();

        let shard0 = layout.shard_for_rank(0).unwrap();
        assert_eq!(shard0.shape(), &[4, 3]);
        assert_eq!(shard0.slices()[0], ShardSlice::new(0, 4).unwrap());
        assert_eq!(shard0.slices()[1], ShardSlice::new(0, 3).unwrap());

        let shard3 = layout.shard_for_rank(3).unwrap();
        assert_eq!(shard3.shape(), &[4, 3]);
        assert_eq!(shard3.slices()[0], ShardSlice::new(4, 8).unwrap());
        assert_eq!(shard3.slices()[1], ShardSlice::new(3, 6).unwrap());
    }

    #[test]
    fn test_sharding_layout_same_dimension_split_twice() {
        let nd_sbp = NdSbp::new(vec![Sbp::split(0), Sbp::split(0)]);
        let layout = ShardingLayout::new(vec![8], test_placement_2x2(), nd_sbp).unwrap();
        let slices = layout.shards().iter().map(|shard| shard.slices()[0]).collect::<Vec<_>>();
        assert_eq!(
            slices,
            vec![
                ShardSlice::new(0, 2).unwrap(),
                ShardSlice::new(2, 4).unwrap(),
                ShardSlice::new(4, 6).unwrap(),
                ShardSlice::new(6, 8).unwrap(),
            ],
        );
    }

    #[test]
    fn test_sharding_layout_broadcast_and_partial_sum_roles() {
        let nd_sbp = NdSbp::new(vec![Sbp::broadcast(), Sbp::partial_sum()]);
        let layout = ShardingLayout::new(vec![4], test_placement_2x2(), nd_sbp.clone()).unwrap();
        let owners = layout.shards().iter().map(|shard| shard.is_partial_owner(&nd_sbp)).collect::<Vec<_>>();
        let leaders = layout.shards().iter().map(|shard| shard.is_replica_leader(&nd_sbp)).collect::<Vec<_>>();
        assert_eq!(owners, vec![true, false, true, false]);
        assert_eq!(leaders, vec![true, true, false, false]);
        assert!(layout.shards().iter().all(|shard| shard.shape() == [4]));
        let replica_leaders = (0..4)
            .map(|index| layout.replica_leader(index).map(ShardDescriptor::shard_index))
            .collect::<Vec<_>>();
        assert_eq!(replica_leaders, vec![Some(0), Some(1), Some(0), Some(1)]);
        assert_eq!(layout.replica_leader(4), None);

        let dual = layout.dual();
        assert_eq!(dual.nd_sbp(), &NdSbp::new(vec![Sbp::partial_sum(), Sbp::broadcast()]));
        assert_eq!(dual.shards(), layout.shards());
    }

    #[test]
    fn test_sharding_layout_node_filtering() {
        let nd_sbp = NdSbp::new(vec![Sbp::split(0), Sbp::broadcast()]);
        let layout = ShardingLayout::new(vec![8], test_placement_2x2(), nd_sbp).unwrap();
        assert_eq!(layout.shard_indices_for_node(0), vec![0, 1]);
        assert_eq!(layout.shard_indices_for_node(1), vec![2, 3]);
        assert_eq!(layout.shard_indices_for_node(42), Vec::<usize>::new());
    }

    #[test]
    fn test_region_indices() {
        let slices = vec![ShardSlice::new(1, 3).unwrap(), ShardSlice::new(2, 4).unwrap()];
        assert_eq!(region_indices(&[4, 4], slices.as_slice()), vec![6, 7, 10, 11]);
        assert_eq!(region_indices(&[], &[]), vec![0]);
        assert_eq!(region_indices(&[4], &[ShardSlice::new(2, 2).unwrap()]), Vec::<usize>::new());
        assert_eq!(row_major_strides(&[2, 3, 4]), vec![12, 4, 1]);
    }
}
