use std::fmt::Display;

use serde::{Serialize, Serializer};

use crate::enumerator::Configuration;
use crate::errors::CaseError;

/// Outcome of one passing test case.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CaseReport {
    pub configuration: Configuration,
    pub seed: u64,
    pub extents: Vec<usize>,
    pub fill_value: f64,
    pub max_value_deviation: f64,

    /// `None` when gradients were not checked.
    pub max_gradient_deviation: Option<f64>,
}

/// A failing test case, with everything needed to replay it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CaseFailure {
    pub configuration: Configuration,
    pub seed: u64,
    #[serde(serialize_with = "serialize_display")]
    pub error: CaseError,
}

impl Display for CaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, seed={}] {}", self.configuration, self.seed, self.error)
    }
}

/// Result of sweeping one [`EquivalenceCase`](crate::executor::EquivalenceCase) over a configuration space.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SweepReport {
    pub case: String,
    pub seed: u64,
    pub ndim: usize,
    pub executed: usize,
    pub passed: usize,
    pub failures: Vec<CaseFailure>,
}

impl SweepReport {
    pub fn new(case: &str, seed: u64, ndim: usize) -> Self {
        Self { case: case.to_string(), seed, ndim, executed: 0, passed: 0, failures: Vec::new() }
    }

    /// Returns `true` if no case failed. Sweeps over empty configuration spaces succeed trivially.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

impl Display for SweepReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (ndim={}, seed={}): {}/{} case(s) passed",
            self.case, self.ndim, self.seed, self.passed, self.executed,
        )
    }
}

fn serialize_display<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}
