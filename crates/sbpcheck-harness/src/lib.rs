//! Randomized cross-configuration equivalence testing.
//!
//! Tests draw a tensor rank and inputs from a seeded [`RandomGenerator`], enumerate every placement and SBP signature
//! of the simulated environment, and check that each [`EquivalenceCase`] produces the same values, aliasing, and
//! gradients on a [`GlobalTensor`](sbpcheck_core::GlobalTensor) as on the local reference implementation.

pub mod compare;
pub mod config;
pub mod context;
pub mod enumerator;
pub mod errors;
pub mod executor;
pub mod orchestrator;
pub mod random;
pub mod registry;
pub mod report;
pub mod suites;

pub use compare::{Mismatch, Tolerance, compare_values};
pub use config::{Environment, HarnessConfig};
pub use context::TestContext;
pub use enumerator::{Configuration, ConfigurationSpace, SbpOptions, all_placements, all_sbp};
pub use errors::{CaseError, ConfigError, RandomError, RegistryError, SweepError, TestError};
pub use executor::{CaseInput, EquivalenceCase, Executor};
pub use orchestrator::{Sweep, SweepState};
pub use random::{ExtentSpec, RandomFloat, RandomGenerator, RandomInt, TensorSpec, ValueDistribution};
pub use registry::{RegisteredTest, RunSummary, TestOutcome, TestRegistry, TestResult, TestStatus};
pub use report::{CaseFailure, CaseReport, SweepReport};
