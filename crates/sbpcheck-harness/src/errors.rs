use thiserror::Error;

use sbpcheck_core::ShardingError;

use crate::compare::Mismatch;
use crate::report::SweepReport;

/// Error returned when a random-value specification is invalid.
#[derive(Error, Clone, Debug, PartialEq)]
pub enum RandomError {
    /// Error returned when an integer range `[low, high)` contains no values.
    #[error("integer range [{low}, {high}) is empty")]
    EmptyIntRange { low: i64, high: i64 },

    /// Error returned when a float range `[low, high)` is empty or has non-finite bounds.
    #[error("float range [{low}, {high}) is empty or not finite")]
    InvalidFloatRange { low: f64, high: f64 },

    /// Error returned when an extent specification could produce negative extents.
    #[error("extent factors must be non-negative, but the factor range starts at {low}")]
    NegativeExtentFactor { low: i64 },

    /// Error returned when the parameters of a value distribution are invalid.
    #[error("invalid {distribution} distribution: {message}")]
    InvalidDistribution { distribution: &'static str, message: String },

    #[error("{0}")]
    Tensor(#[from] sbpcheck_core::Error),
}

/// Error returned when loading or validating a [`HarnessConfig`](crate::config::HarnessConfig).
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {message}")]
    Io { path: String, message: String },

    #[error("failed to parse config file '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("invalid value '{value}' for environment variable '{variable}'")]
    InvalidEnvironmentVariable { variable: String, value: String },

    #[error("invalid value for '{key}': {message}")]
    InvalidValue { key: &'static str, message: String },
}

/// Reason why a single equivalence test case did not pass.
#[derive(Error, Clone, Debug, PartialEq)]
pub enum CaseError {
    /// The placement/SBP combination is not valid for the generated input. This is fatal for the whole sweep.
    #[error("invalid configuration: {0}")]
    Configuration(ShardingError),

    /// The output shape differs from the reference output (or from the input) shape.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { expected: Vec<usize>, actual: Vec<usize> },

    #[error("value mismatch: {0}")]
    ValueMismatch(Mismatch),

    #[error("gradient mismatch: {0}")]
    GradientMismatch(Mismatch),

    /// A broadcast replica of the global output differs from the replica that the logical value is read from.
    #[error("shard #{shard_index} differs from its replica leader #{leader_index}: {mismatch}")]
    ReplicaMismatch { shard_index: usize, leader_index: usize, mismatch: Mismatch },

    /// An in-place update was not observed through a handle taken before the update.
    #[error("in-place update is not visible through the {pipeline} alias: {mismatch}")]
    AliasMismatch { pipeline: &'static str, mismatch: Mismatch },

    #[error("no gradient was recorded for the {pipeline} input")]
    MissingGradient { pipeline: &'static str },

    #[error("failed to generate case input: {0}")]
    Generation(#[from] RandomError),

    #[error("execution failed: {0}")]
    Execution(sbpcheck_core::Error),
}

impl CaseError {
    /// Returns `true` for errors that abort the sweep instead of being recorded as a failure.
    pub fn is_fatal_for_sweep(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

impl From<sbpcheck_core::Error> for CaseError {
    fn from(error: sbpcheck_core::Error) -> Self {
        match error {
            sbpcheck_core::Error::ShardingError(error) => Self::Configuration(error),
            error => Self::Execution(error),
        }
    }
}

/// Error that aborts a sweep. It carries the report of the cases executed before the abort.
#[derive(Error, Clone, Debug, PartialEq)]
pub enum SweepError {
    #[error("configuration '{configuration}' (seed {seed}) is invalid: {source}")]
    InvalidConfiguration { configuration: String, seed: u64, source: ShardingError, report: Box<SweepReport> },
}

impl SweepError {
    /// Report of the sweep up to (and including) the case that aborted it.
    pub fn report(&self) -> &SweepReport {
        match self {
            Self::InvalidConfiguration { report, .. } => report,
        }
    }
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a test named '{name}' is already registered")]
    DuplicateTest { name: String },
}

/// Error returned by a test function. Assertion failures are not errors: they are recorded in the
/// [`TestContext`](crate::context::TestContext).
#[derive(Error, Clone, Debug, PartialEq)]
pub enum TestError {
    #[error("{0}")]
    Sweep(#[from] SweepError),

    #[error("{0}")]
    Random(#[from] RandomError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Sharding(#[from] ShardingError),

    #[error("{0}")]
    Core(#[from] sbpcheck_core::Error),
}
