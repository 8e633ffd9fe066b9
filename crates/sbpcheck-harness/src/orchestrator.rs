use tracing::{info, warn};

use crate::enumerator::{Configuration, ConfigurationSpace, Configurations};
use crate::errors::{CaseError, SweepError};
use crate::executor::{EquivalenceCase, Executor};
use crate::random::RandomGenerator;
use crate::report::{CaseFailure, SweepReport};

/// State of a [`Sweep`].
#[derive(Clone, Debug, PartialEq)]
pub enum SweepState {
    /// Waiting for the next configuration of the space.
    Enumerating,

    /// About to execute the test cases of a configuration.
    Executing(Configuration),

    /// Every configuration has been visited, or the sweep was aborted.
    Finished,
}

/// Runs an [`EquivalenceCase`] on every configuration of a [`ConfigurationSpace`].
///
/// Each configuration is executed `repeat` times, with a seed that only depends on the sweep seed and on the index
/// of the execution within the sweep. Failing cases are recorded and the sweep moves on; only an invalid
/// configuration aborts it, and the resulting [`SweepError`] still carries the failures recorded until then.
pub struct Sweep<'a> {
    case: &'a dyn EquivalenceCase,
    executor: Executor,
    configurations: Configurations<'a>,
    generator: RandomGenerator,
    repeat: usize,
    executions: u64,
    state: SweepState,
    report: SweepReport,
}

impl<'a> Sweep<'a> {
    pub fn new(
        case: &'a dyn EquivalenceCase,
        executor: Executor,
        space: &'a ConfigurationSpace,
        seed: u64,
        repeat: usize,
    ) -> Self {
        Self {
            case,
            executor,
            configurations: space.iter(),
            generator: RandomGenerator::new(seed),
            repeat: repeat.max(1),
            executions: 0,
            state: SweepState::Enumerating,
            report: SweepReport::new(case.name(), seed, space.ndim()),
        }
    }

    pub fn state(&self) -> &SweepState {
        &self.state
    }

    pub fn report(&self) -> &SweepReport {
        &self.report
    }

    /// Advances the sweep by one state transition.
    pub fn step(&mut self) -> Result<&SweepState, SweepError> {
        let state = std::mem::replace(&mut self.state, SweepState::Finished);
        self.state = match state {
            SweepState::Enumerating => match self.configurations.next() {
                Some(configuration) => SweepState::Executing(configuration),
                None => SweepState::Finished,
            },
            SweepState::Executing(configuration) => {
                self.execute(&configuration)?;
                SweepState::Enumerating
            }
            SweepState::Finished => SweepState::Finished,
        };
        Ok(&self.state)
    }

    /// Runs the sweep to completion and returns its report.
    pub fn run(mut self) -> Result<SweepReport, SweepError> {
        while self.step()? != &SweepState::Finished {}
        info!(
            case = self.report.case.as_str(),
            seed = self.report.seed,
            executed = self.report.executed,
            passed = self.report.passed,
            failed = self.report.failures.len(),
            "sweep finished"
        );
        Ok(self.report)
    }

    fn execute(&mut self, configuration: &Configuration) -> Result<(), SweepError> {
        for _ in 0..self.repeat {
            let seed = self.generator.fork(self.executions).seed();
            self.executions += 1;
            self.report.executed += 1;
            match self.executor.execute(self.case, configuration, seed) {
                Ok(_) => self.report.passed += 1,
                Err(CaseError::Configuration(source)) => {
                    warn!(
                        case = self.case.name(),
                        %configuration,
                        seed,
                        %source,
                        failed = self.report.failures.len(),
                        "aborting sweep on invalid configuration"
                    );
                    return Err(SweepError::InvalidConfiguration {
                        configuration: configuration.to_string(),
                        seed,
                        source,
                        report: Box::new(self.report.clone()),
                    });
                }
                Err(error) => {
                    warn!(case = self.case.name(), %configuration, seed, %error, "equivalence case failed");
                    self.report.failures.push(CaseFailure { configuration: configuration.clone(), seed, error });
                }
            }
        }
        Ok(())
    }
}
