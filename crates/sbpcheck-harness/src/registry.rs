//! Named test registry and the runner that executes registered tests.

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::context::TestContext;
use crate::errors::{RegistryError, TestError};
use crate::random::RandomGenerator;
use crate::report::SweepReport;

/// Function implementing a registered test.
pub type TestFunction = fn(&mut TestContext) -> Result<(), TestError>;

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub enum TestStatus {
    Enabled,

    /// The test is registered but not run. `reason` names the defect that has to be fixed before enabling it.
    Disabled { reason: String },
}

#[derive(Clone, Debug)]
pub struct RegisteredTest {
    name: String,
    function: TestFunction,
    num_nodes: usize,
    status: TestStatus,
}

impl RegisteredTest {
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn function(&self) -> TestFunction {
        self.function
    }

    /// Number of nodes that the test requires.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn status(&self) -> &TestStatus {
        &self.status
    }

    pub fn is_enabled(&self) -> bool {
        self.status == TestStatus::Enabled
    }
}

/// Collection of named tests, ordered by name.
#[derive(Clone, Debug, Default)]
pub struct TestRegistry {
    tests: BTreeMap<String, RegisteredTest>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, num_nodes: usize, function: TestFunction) -> Result<(), RegistryError> {
        self.insert(RegisteredTest { name: name.to_string(), function, num_nodes, status: TestStatus::Enabled })
    }

    /// Registers a test that is listed but skipped by [`TestRegistry::run`].
    pub fn register_disabled(
        &mut self,
        name: &str,
        num_nodes: usize,
        function: TestFunction,
        reason: &str,
    ) -> Result<(), RegistryError> {
        self.insert(RegisteredTest {
            name: name.to_string(),
            function,
            num_nodes,
            status: TestStatus::Disabled { reason: reason.to_string() },
        })
    }

    fn insert(&mut self, test: RegisteredTest) -> Result<(), RegistryError> {
        if self.tests.contains_key(test.name()) {
            return Err(RegistryError::DuplicateTest { name: test.name });
        }
        self.tests.insert(test.name.clone(), test);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTest> {
        self.tests.get(name)
    }

    pub fn tests(&self) -> impl Iterator<Item = &RegisteredTest> {
        self.tests.values()
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Keeps only the tests whose node requirement satisfies `predicate`.
    pub fn filter_by_num_nodes<P: Fn(usize) -> bool>(self, predicate: P) -> Self {
        Self { tests: self.tests.into_iter().filter(|(_, test)| predicate(test.num_nodes)).collect() }
    }

    /// Tests whose name contains `filter`, or every test when `filter` is `None`.
    pub fn select<'a>(&'a self, filter: Option<&'a str>) -> impl Iterator<Item = &'a RegisteredTest> {
        self.tests().filter(move |test| filter.is_none_or(|filter| test.name().contains(filter)))
    }

    /// Runs the selected tests.
    ///
    /// Every test gets a seed derived from the run seed and its own name, so a single test can be replayed with the
    /// run seed regardless of which other tests are selected.
    pub fn run(&self, config: &HarnessConfig, filter: Option<&str>) -> RunSummary {
        let generator = config.seed.map(RandomGenerator::new).unwrap_or_else(RandomGenerator::from_entropy);
        info!(seed = generator.seed(), tests = self.len(), "starting test run");
        let results = self
            .select(filter)
            .map(|test| run_test(test, config, generator.fork_named(test.name()).seed()))
            .collect();
        RunSummary { seed: generator.seed(), results }
    }
}

fn run_test(test: &RegisteredTest, config: &HarnessConfig, seed: u64) -> TestResult {
    if let TestStatus::Disabled { reason } = test.status() {
        info!(test = test.name(), reason = reason.as_str(), "skipping disabled test");
        return TestResult::new(test.name(), seed, TestOutcome::Skipped { reason: reason.clone() });
    }
    let mut context = TestContext::new(test.name(), config.clone(), seed);
    let returned = (test.function())(&mut context);
    let (assertions, failures, sweeps) = context.into_parts();
    let outcome = match returned {
        Err(error) => TestOutcome::Errored { error: error.to_string(), failures },
        Ok(()) if failures.is_empty() => TestOutcome::Passed,
        Ok(()) => TestOutcome::Failed { failures },
    };
    match &outcome {
        TestOutcome::Passed => info!(test = test.name(), seed, assertions, "test passed"),
        outcome => warn!(test = test.name(), seed, %outcome, "test did not pass"),
    }
    TestResult { assertions, sweeps, ..TestResult::new(test.name(), seed, outcome) }
}

// ----- Results -----

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed { failures: Vec<String> },

    /// The test function returned an error before finishing. `failures` holds the failures recorded until then.
    Errored { error: String, failures: Vec<String> },
    Skipped { reason: String },
}

impl Display for TestOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed { failures } => write!(f, "failed with {} failure(s)", failures.len()),
            Self::Errored { error, failures } if failures.is_empty() => write!(f, "errored: {error}"),
            Self::Errored { error, failures } => write!(f, "errored after {} failure(s): {error}", failures.len()),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TestResult {
    pub name: String,

    /// Seed that replays this test.
    pub seed: u64,
    pub outcome: TestOutcome,
    pub assertions: usize,
    pub sweeps: Vec<SweepReport>,
}

impl TestResult {
    fn new(name: &str, seed: u64, outcome: TestOutcome) -> Self {
        Self { name: name.to_string(), seed, outcome, assertions: 0, sweeps: Vec::new() }
    }
}

impl Display for TestResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (seed={}): {}", self.name, self.seed, self.outcome)
    }
}

/// Results of a [`TestRegistry::run`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunSummary {
    pub seed: u64,
    pub results: Vec<TestResult>,
}

impl RunSummary {
    fn count<P: Fn(&TestOutcome) -> bool>(&self, predicate: P) -> usize {
        self.results.iter().filter(|result| predicate(&result.outcome)).count()
    }

    pub fn passed(&self) -> usize {
        self.count(|outcome| matches!(outcome, TestOutcome::Passed))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, TestOutcome::Failed { .. }))
    }

    pub fn errored(&self) -> usize {
        self.count(|outcome| matches!(outcome, TestOutcome::Errored { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, TestOutcome::Skipped { .. }))
    }

    /// Returns `true` if no test failed or errored. Skipped tests do not count as failures.
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && self.errored() == 0
    }
}

impl Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "seed {}: {} passed, {} failed, {} errored, {} skipped",
            self.seed,
            self.passed(),
            self.failed(),
            self.errored(),
            self.skipped(),
        )
    }
}
