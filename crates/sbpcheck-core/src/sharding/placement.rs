use std::fmt::Display;

use serde::Serialize;

use super::ShardingError;

/// Global rank of one (simulated) device.
pub type Rank = usize;

/// Kind of device that a [`Placement`] refers to.
///
/// Devices are simulated, so the device type only affects how placements are labeled and enumerated.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    Cuda,
}

impl Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
        }
    }
}

/// Rank entry in a [`Placement`].
///
/// Separates the global rank from the node (host) that owns it, so that the same placement metadata can describe
/// both single-node and multi-node setups.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct PlacementRank {
    rank: Rank,
    node_index: usize,
}

impl PlacementRank {
    /// Creates a placement-rank entry.
    pub fn new(rank: Rank, node_index: usize) -> Self {
        Self { rank, node_index }
    }

    /// Global rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Index of the node owning this rank.
    pub fn node_index(&self) -> usize {
        self.node_index
    }
}

/// Set of ranks holding the data of a global tensor, arranged into a row-major hierarchy.
///
/// For a hierarchy `[2, 2]` over ranks `[0, 1, 2, 3]`, the rank at hierarchy coordinate `(i, j)` is the one with
/// linear index `i * 2 + j`, i.e.:
///
/// ```text
/// [[0, 1],
///  [2, 3]]
/// ```
///
/// Each hierarchy axis is paired with one component of an [`NdSbp`](super::NdSbp).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct Placement {
    device_type: DeviceType,
    hierarchy: Vec<usize>,
    devices: Vec<PlacementRank>,
}

impl Placement {
    /// Creates a placement from a hierarchy and row-major rank entries.
    ///
    /// Validates that the hierarchy is non-empty with positive axis sizes, that the number of `devices` matches the
    /// product of the hierarchy axis sizes, and that ranks are unique.
    pub fn new(
        device_type: DeviceType,
        hierarchy: Vec<usize>,
        devices: Vec<PlacementRank>,
    ) -> Result<Self, ShardingError> {
        if hierarchy.is_empty() {
            return Err(ShardingError::EmptyHierarchy);
        }
        if let Some(axis) = hierarchy.iter().position(|size| *size == 0) {
            return Err(ShardingError::InvalidHierarchyAxisSize { axis });
        }

        let expected_rank_count = hierarchy.iter().try_fold(1usize, |count, size| {
            count.checked_mul(*size).ok_or_else(|| ShardingError::Overflow {
                context: "computing placement rank count from hierarchy".to_string(),
            })
        })?;
        if devices.len() != expected_rank_count {
            return Err(ShardingError::RankCountMismatch { expected_rank_count, actual_rank_count: devices.len() });
        }

        for (index, device) in devices.iter().enumerate() {
            if devices[..index].iter().any(|other| other.rank == device.rank) {
                return Err(ShardingError::DuplicateRank { rank: device.rank });
            }
        }

        Ok(Self { device_type, hierarchy, devices })
    }

    /// Creates a placement over `ranks`, assigning each rank to node `rank / ranks_per_node`.
    pub fn from_ranks<I: IntoIterator<Item = Rank>>(
        device_type: DeviceType,
        hierarchy: Vec<usize>,
        ranks: I,
        ranks_per_node: usize,
    ) -> Result<Self, ShardingError> {
        let ranks_per_node = ranks_per_node.max(1);
        let devices = ranks.into_iter().map(|rank| PlacementRank::new(rank, rank / ranks_per_node)).collect();
        Self::new(device_type, hierarchy, devices)
    }

    /// Device type of this placement.
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Sizes of the hierarchy axes.
    pub fn hierarchy(&self) -> &[usize] {
        self.hierarchy.as_slice()
    }

    /// Number of hierarchy axes.
    pub fn ndim(&self) -> usize {
        self.hierarchy.len()
    }

    /// Rank entries in row-major order.
    pub fn devices(&self) -> &[PlacementRank] {
        self.devices.as_slice()
    }

    /// Number of ranks in this placement.
    pub fn rank_count(&self) -> usize {
        self.devices.len()
    }

    /// Just the ranks, in row-major order.
    pub fn ranks(&self) -> Vec<Rank> {
        self.devices.iter().map(PlacementRank::rank).collect()
    }

    /// Returns the row-major index of `rank`, if present.
    pub fn rank_index(&self, rank: Rank) -> Option<usize> {
        self.devices.iter().position(|device| device.rank == rank)
    }

    /// Returns the hierarchy coordinate of the rank at `rank_index`, if valid.
    pub fn coordinate_for_rank_index(&self, rank_index: usize) -> Option<Vec<usize>> {
        (rank_index < self.devices.len()).then(|| coordinate_for_linear_index(rank_index, self.hierarchy.as_slice()))
    }

    /// Returns the hierarchy coordinate of `rank`, if present.
    pub fn coordinate_for_rank(&self, rank: Rank) -> Option<Vec<usize>> {
        self.rank_index(rank).and_then(|rank_index| self.coordinate_for_rank_index(rank_index))
    }

    /// Returns `true` if any two ranks belong to different nodes.
    pub fn is_multi_node(&self) -> bool {
        self.devices.windows(2).any(|pair| pair[0].node_index != pair[1].node_index)
    }

    /// Returns the ranks owned by `node_index`.
    pub fn ranks_on_node(&self, node_index: usize) -> Vec<Rank> {
        self.devices.iter().filter(|device| device.node_index == node_index).map(PlacementRank::rank).collect()
    }
}

impl Display for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ranks = self.ranks();
        write!(f, "placement(type=\"{}\", ranks=", self.device_type)?;
        write_nested_ranks(f, ranks.as_slice(), self.hierarchy.as_slice())?;
        write!(f, ")")
    }
}

fn write_nested_ranks(f: &mut std::fmt::Formatter<'_>, ranks: &[Rank], hierarchy: &[usize]) -> std::fmt::Result {
    write!(f, "[")?;
    match hierarchy {
        [] | [_] => {
            for (index, rank) in ranks.iter().enumerate() {
                if index > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{rank}")?;
            }
        }
        [outer, inner @ ..] => {
            let chunk_size = ranks.len() / outer;
            for (index, chunk) in ranks.chunks(chunk_size.max(1)).enumerate() {
                if index > 0 {
                    write!(f, ", ")?;
                }
                write_nested_ranks(f, chunk, inner)?;
            }
        }
    }
    write!(f, "]")
}

pub(crate) fn coordinate_for_linear_index(mut index: usize, axis_sizes: &[usize]) -> Vec<usize> {
    let mut coordinate = vec![0usize; axis_sizes.len()];
    for axis in (0..axis_sizes.len()).rev() {
        let axis_size = axis_sizes[axis];
        coordinate[axis] = index % axis_size;
        index /= axis_size;
    }
    coordinate
}
