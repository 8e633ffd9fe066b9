//! Exhaustive enumeration of the (placement, SBP) configuration space for a tensor rank.

use std::fmt::Display;

use serde::Serialize;

use sbpcheck_core::{DeviceType, NdSbp, Placement, Sbp, ShardingError};

use crate::config::Environment;

// ---------------------------------------------------------------------------
// Placements
// ---------------------------------------------------------------------------

/// Returns every placement that tests run on: for each device type, the flat hierarchy `[world_size]` and the
/// two-level hierarchy `[node_size, world_size / node_size]`, both over ranks `0..world_size`.
pub fn all_placements(environment: &Environment, device_types: &[DeviceType]) -> Result<Vec<Placement>, ShardingError> {
    let world_size = environment.world_size();
    let ranks_per_node = environment.ranks_per_node();
    let mut placements = Vec::with_capacity(2 * device_types.len());
    for device_type in device_types.iter().copied() {
        placements.push(Placement::from_ranks(device_type, vec![world_size], 0..world_size, ranks_per_node)?);
        placements.push(Placement::from_ranks(
            device_type,
            vec![environment.node_size(), ranks_per_node],
            0..world_size,
            ranks_per_node,
        )?);
    }
    Ok(placements)
}

// ---------------------------------------------------------------------------
// SBP signatures
// ---------------------------------------------------------------------------

/// Restrictions on the SBP components that [`all_sbp`] combines.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SbpOptions {
    pub except_split: bool,
    pub except_broadcast: bool,
    pub except_partial_sum: bool,

    /// Tensor dimensions that may be split. All dimensions below `max_dim` when `None`.
    pub valid_split_axes: Option<Vec<usize>>,
}

impl SbpOptions {
    /// Components that may appear along each hierarchy axis, in order: splits, then broadcast, then partial sum.
    pub fn candidates(&self, max_dim: usize) -> Vec<Sbp> {
        if max_dim == 0 {
            return vec![Sbp::broadcast()];
        }
        let mut candidates = Vec::new();
        if !self.except_split {
            candidates.extend(
                (0..max_dim)
                    .filter(|axis| self.valid_split_axes.as_ref().is_none_or(|axes| axes.contains(axis)))
                    .map(Sbp::split),
            );
        }
        if !self.except_broadcast {
            candidates.push(Sbp::broadcast());
        }
        if !self.except_partial_sum {
            candidates.push(Sbp::partial_sum());
        }
        candidates
    }
}

/// Lazily enumerates every SBP signature for `placement` whose components are drawn from
/// [`SbpOptions::candidates`]: the cartesian product of the candidates, repeated once per hierarchy axis.
///
/// When `max_dim` is `0` (i.e., for rank-0 tensors), the only signature is the all-broadcast one.
pub fn all_sbp(placement: &Placement, max_dim: usize, options: &SbpOptions) -> AllSbp {
    AllSbp::new(options.candidates(max_dim), placement.ndim())
}

/// Iterator returned by [`all_sbp`]. Signatures are produced in lexicographic order of candidate indices, with the
/// last hierarchy axis varying fastest.
#[derive(Clone, Debug)]
pub struct AllSbp {
    candidates: Vec<Sbp>,
    odometer: Option<Vec<usize>>,
    remaining: usize,
}

impl AllSbp {
    fn new(candidates: Vec<Sbp>, ndim: usize) -> Self {
        let remaining = if candidates.is_empty() {
            0
        } else {
            (0..ndim).fold(1usize, |count, _| count.saturating_mul(candidates.len()))
        };
        let odometer = (remaining > 0).then(|| vec![0; ndim]);
        Self { candidates, odometer, remaining }
    }
}

impl Iterator for AllSbp {
    type Item = NdSbp;

    fn next(&mut self) -> Option<Self::Item> {
        let odometer = self.odometer.as_mut()?;
        let nd_sbp = NdSbp::new(odometer.iter().map(|index| self.candidates[*index]).collect());
        self.remaining = self.remaining.saturating_sub(1);

        let mut exhausted = true;
        for axis in (0..odometer.len()).rev() {
            odometer[axis] += 1;
            if odometer[axis] < self.candidates.len() {
                exhausted = false;
                break;
            }
            odometer[axis] = 0;
        }
        if exhausted {
            self.odometer = None;
        }
        Some(nd_sbp)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for AllSbp {}

// ---------------------------------------------------------------------------
// Configurations
// ---------------------------------------------------------------------------

/// One point of the configuration space: a tensor rank, a placement, and an SBP signature that is valid for both.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Configuration {
    pub ndim: usize,
    pub placement: Placement,
    pub nd_sbp: NdSbp,
}

impl Display for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ndim={}, {}, sbp={}", self.ndim, self.placement, self.nd_sbp)
    }
}

/// Every (placement, SBP) pair for tensors of rank `ndim`.
///
/// Iteration is lazy and restartable: each call to [`ConfigurationSpace::iter`] starts a fresh pass over the whole
/// space. An empty placement set yields an empty space.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfigurationSpace {
    ndim: usize,
    placements: Vec<Placement>,
    options: SbpOptions,
}

impl ConfigurationSpace {
    pub fn new(ndim: usize, placements: Vec<Placement>) -> Self {
        Self { ndim, placements, options: SbpOptions::default() }
    }

    pub fn with_options(self, options: SbpOptions) -> Self {
        Self { options, ..self }
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    pub fn placements(&self) -> &[Placement] {
        self.placements.as_slice()
    }

    pub fn options(&self) -> &SbpOptions {
        &self.options
    }

    pub fn iter(&self) -> Configurations<'_> {
        Configurations { space: self, placement_index: 0, signatures: None }
    }

    /// Number of configurations in this space.
    pub fn len(&self) -> usize {
        self.placements.iter().map(|placement| all_sbp(placement, self.ndim, &self.options).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a> IntoIterator for &'a ConfigurationSpace {
    type Item = Configuration;
    type IntoIter = Configurations<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator returned by [`ConfigurationSpace::iter`].
#[derive(Clone, Debug)]
pub struct Configurations<'a> {
    space: &'a ConfigurationSpace,
    placement_index: usize,
    signatures: Option<AllSbp>,
}

impl Iterator for Configurations<'_> {
    type Item = Configuration;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let placement = self.space.placements.get(self.placement_index)?;
            let signatures = self
                .signatures
                .get_or_insert_with(|| all_sbp(placement, self.space.ndim, &self.space.options));
            match signatures.next() {
                Some(nd_sbp) => {
                    return Some(Configuration { ndim: self.space.ndim, placement: placement.clone(), nd_sbp });
                }
                None => {
                    self.placement_index += 1;
                    self.signatures = None;
                }
            }
        }
    }
}
