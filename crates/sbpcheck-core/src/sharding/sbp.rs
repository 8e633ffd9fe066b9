use std::fmt::Display;

use serde::Serialize;

use super::{Placement, ShardingError};

/// Distribution of a tensor along one placement hierarchy axis.
///
/// | Variant | Rendering | Meaning |
/// |---|---|---|
/// | `Split(d)` | `S(d)` | Tensor dimension `d` is split evenly across the ranks of the axis. |
/// | `Broadcast` | `B` | Every rank of the axis holds the full value. |
/// | `PartialSum` | `P` | The logical value is the sum of the values held by the ranks of the axis. |
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub enum Sbp {
    Split(usize),
    Broadcast,
    PartialSum,
}

impl Sbp {
    pub fn split(axis: usize) -> Self {
        Self::Split(axis)
    }

    pub fn broadcast() -> Self {
        Self::Broadcast
    }

    pub fn partial_sum() -> Self {
        Self::PartialSum
    }

    /// Returns the split tensor dimension, if this is a split.
    pub fn split_axis(&self) -> Option<usize> {
        match self {
            Self::Split(axis) => Some(*axis),
            _ => None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Broadcast)
    }

    pub fn is_partial_sum(&self) -> bool {
        matches!(self, Self::PartialSum)
    }

    /// Distribution of the gradient of a tensor distributed with `self`.
    pub fn dual(&self) -> Self {
        match self {
            Self::Split(axis) => Self::Split(*axis),
            Self::Broadcast => Self::PartialSum,
            Self::PartialSum => Self::Broadcast,
        }
    }
}

impl Display for Sbp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Split(axis) => write!(f, "S({axis})"),
            Self::Broadcast => write!(f, "B"),
            Self::PartialSum => write!(f, "P"),
        }
    }
}

/// SBP signature with one [`Sbp`] per placement hierarchy axis.
///
/// The same tensor dimension may be split along several hierarchy axes, in which case it is split along the
/// product of their sizes, major to minor (e.g., `(S(0), S(0))` on a `[2, 2]` hierarchy splits dimension `0` into
/// four parts).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct NdSbp {
    components: Vec<Sbp>,
}

impl NdSbp {
    pub fn new(components: Vec<Sbp>) -> Self {
        Self { components }
    }

    /// Creates a signature that broadcasts along all `ndim` hierarchy axes.
    pub fn broadcast(ndim: usize) -> Self {
        Self { components: vec![Sbp::Broadcast; ndim] }
    }

    pub fn components(&self) -> &[Sbp] {
        self.components.as_slice()
    }

    /// Number of components (which must match the placement hierarchy rank).
    pub fn ndim(&self) -> usize {
        self.components.len()
    }

    pub fn dual(&self) -> Self {
        Self { components: self.components.iter().map(Sbp::dual).collect() }
    }

    pub fn has_partial_sum(&self) -> bool {
        self.components.iter().any(Sbp::is_partial_sum)
    }

    pub fn is_all_broadcast(&self) -> bool {
        self.components.iter().all(Sbp::is_broadcast)
    }

    /// Hierarchy axes that split tensor dimension `dimension`, major to minor.
    pub fn hierarchy_axes_splitting(&self, dimension: usize) -> Vec<usize> {
        self.components
            .iter()
            .enumerate()
            .filter_map(|(axis, sbp)| (sbp.split_axis() == Some(dimension)).then_some(axis))
            .collect()
    }

    /// Validates this signature for a tensor of rank `tensor_rank` on `placement`.
    pub fn validate(&self, placement: &Placement, tensor_rank: usize) -> Result<(), ShardingError> {
        if self.components.len() != placement.ndim() {
            return Err(ShardingError::NdSbpRankMismatch {
                sbp_ndim: self.components.len(),
                hierarchy_ndim: placement.ndim(),
            });
        }
        if let Some(axis) = self.components.iter().filter_map(Sbp::split_axis).find(|axis| *axis >= tensor_rank) {
            return Err(ShardingError::SplitAxisOutOfRange { axis, tensor_rank });
        }
        Ok(())
    }

    /// Replaces every split with a partial sum. This is the signature of a full reduction of a tensor with this
    /// signature.
    pub fn reduced(&self) -> Self {
        Self {
            components: self
                .components
                .iter()
                .map(|sbp| if sbp.split_axis().is_some() { Sbp::PartialSum } else { *sbp })
                .collect(),
        }
    }
}

impl From<Vec<Sbp>> for NdSbp {
    fn from(components: Vec<Sbp>) -> Self {
        Self::new(components)
    }
}

impl Display for NdSbp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (index, sbp) in self.components.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{sbp}")?;
        }
        write!(f, ")")
    }
}
