use tracing::warn;

use sbpcheck_core::{Placement, ShardingError};

use crate::compare::{Tolerance, compare_values};
use crate::config::{Environment, HarnessConfig};
use crate::enumerator::all_placements;
use crate::errors::SweepError;
use crate::executor::Executor;
use crate::orchestrator::Sweep;
use crate::random::RandomGenerator;
use crate::report::SweepReport;

/// Explicit per-test context, handed to every registered test function.
///
/// The context owns the seeded generator of the test, so everything a test draws is reproducible from the seed
/// reported alongside its result. Assertions never panic: failures are recorded and reported once the test returns.
#[derive(Clone, Debug)]
pub struct TestContext {
    name: String,
    config: HarnessConfig,
    generator: RandomGenerator,
    assertions: usize,
    failures: Vec<String>,
    sweeps: Vec<SweepReport>,
}

impl TestContext {
    pub fn new(name: &str, config: HarnessConfig, seed: u64) -> Self {
        Self {
            name: name.to_string(),
            config,
            generator: RandomGenerator::new(seed),
            assertions: 0,
            failures: Vec::new(),
            sweeps: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn environment(&self) -> Environment {
        self.config.environment()
    }

    pub fn seed(&self) -> u64 {
        self.generator.seed()
    }

    pub fn generator_mut(&mut self) -> &mut RandomGenerator {
        &mut self.generator
    }

    /// Executor configured from the harness configuration.
    pub fn executor(&self) -> Executor {
        Executor {
            tolerance: self.config.tolerance(),
            check_gradients: self.config.check_gradients,
            check_aliasing: self.config.check_aliasing,
        }
    }

    /// Every placement of the simulated environment.
    pub fn placements(&self) -> Result<Vec<Placement>, ShardingError> {
        all_placements(&self.environment(), self.config.device_types().as_slice())
    }

    // ----- Assertions -----

    /// Records a failure with `message` unless `condition` holds. Returns `condition`.
    pub fn assert_true<M: Into<String>>(&mut self, condition: bool, message: M) -> bool {
        self.assertions += 1;
        if !condition {
            self.record_failure(message.into());
        }
        condition
    }

    /// Records a failure unless `actual` is element-wise close to `expected`. Returns `true` on success.
    pub fn assert_eq_values(&mut self, actual: &[f64], expected: &[f64], tolerance: Tolerance, what: &str) -> bool {
        self.assertions += 1;
        if actual.len() != expected.len() {
            self.record_failure(format!("{what}: expected {} value(s), got {}", expected.len(), actual.len()));
            return false;
        }
        match compare_values(actual, expected, tolerance) {
            Ok(_) => true,
            Err(mismatch) => {
                self.record_failure(format!("{what}: {mismatch}"));
                false
            }
        }
    }

    /// Records the outcome of a sweep. Every executed case counts as one assertion and every failing case as one
    /// failure.
    pub fn record_sweep(&mut self, report: SweepReport) {
        self.assertions += report.executed;
        for failure in &report.failures {
            self.failures.push(format!("{}: {failure}", report.case));
        }
        self.sweeps.push(report);
    }

    /// Runs `sweep` to completion and records its report. An aborted sweep is still recorded up to the case that
    /// aborted it before its error is returned.
    pub fn run_sweep(&mut self, sweep: Sweep<'_>) -> Result<(), SweepError> {
        match sweep.run() {
            Ok(report) => {
                self.record_sweep(report);
                Ok(())
            }
            Err(error) => {
                self.record_sweep(error.report().clone());
                Err(error)
            }
        }
    }

    fn record_failure(&mut self, message: String) {
        warn!(test = self.name.as_str(), "{message}");
        self.failures.push(message);
    }

    pub fn assertion_count(&self) -> usize {
        self.assertions
    }

    pub fn failures(&self) -> &[String] {
        self.failures.as_slice()
    }

    pub fn sweeps(&self) -> &[SweepReport] {
        self.sweeps.as_slice()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn into_parts(self) -> (usize, Vec<String>, Vec<SweepReport>) {
        (self.assertions, self.failures, self.sweeps)
    }
}
