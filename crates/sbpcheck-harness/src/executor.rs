//! Execution of a single equivalence test case.
//!
//! A case is generated from a seed, and the generated input is copied into two independent pipelines: one runs the
//! operation under test on a [`GlobalTensor`] distributed according to the configuration, and the other runs the
//! reference implementation on a local [`Tensor`]. Neither pipeline can observe mutations made by the other.

use tracing::debug;

use sbpcheck_core::{Error, GlobalTensor, Tensor};

use crate::compare::{Tolerance, compare_values};
use crate::enumerator::Configuration;
use crate::errors::{CaseError, RandomError};
use crate::random::RandomGenerator;
use crate::report::CaseReport;

/// Generated input of one test case.
#[derive(Clone, Debug)]
pub struct CaseInput {
    pub extents: Vec<usize>,
    pub tensor: Tensor,
    pub fill_value: f64,
}

/// Operation pipeline that is checked for equivalence between global tensors and the local reference
/// implementation.
///
/// Each pipeline runs a `baseline` operation that produces an intermediate tensor, followed by an in-place `mutate`
/// operation on that intermediate.
pub trait EquivalenceCase {
    fn name(&self) -> &str;

    /// Generates the input for a tensor of rank `ndim`.
    fn generate(&self, ndim: usize, generator: &mut RandomGenerator) -> Result<CaseInput, RandomError>;

    fn baseline_global(&self, input: &GlobalTensor, case: &CaseInput) -> Result<GlobalTensor, Error>;

    fn mutate_global(&self, intermediate: &GlobalTensor, case: &CaseInput) -> Result<(), Error>;

    fn baseline_reference(&self, input: &Tensor, case: &CaseInput) -> Result<Tensor, Error>;

    fn mutate_reference(&self, intermediate: &Tensor, case: &CaseInput) -> Result<(), Error>;

    /// Handle on the global baseline output that is taken before `mutate_global` runs and that must observe its
    /// update. Defaults to a view.
    fn alias_global(&self, output: &GlobalTensor) -> Result<GlobalTensor, Error> {
        Ok(output.view())
    }

    /// Same as [`EquivalenceCase::alias_global`] for the reference pipeline.
    fn alias_reference(&self, output: &Tensor) -> Result<Tensor, Error> {
        Ok(output.view())
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Executor {
    pub tolerance: Tolerance,
    pub check_gradients: bool,
    pub check_aliasing: bool,
}

impl Default for Executor {
    fn default() -> Self {
        Self { tolerance: Tolerance::default(), check_gradients: true, check_aliasing: true }
    }
}

impl Executor {
    /// Runs `case` for `configuration` with inputs generated from `seed`.
    ///
    /// A shape mismatch aborts the case before any value is compared. Otherwise, the case fails on the first check
    /// that does not hold, in order: alias visibility, logical values, consistency of broadcast replicas, and
    /// gradients.
    pub fn execute(
        &self,
        case: &dyn EquivalenceCase,
        configuration: &Configuration,
        seed: u64,
    ) -> Result<CaseReport, CaseError> {
        let mut generator = RandomGenerator::new(seed);
        let input = case.generate(configuration.ndim, &mut generator)?;

        let reference_input = input.tensor.deep_clone().with_requires_grad(self.check_gradients)?;
        let global_input =
            GlobalTensor::from_local(&input.tensor, configuration.placement.clone(), configuration.nd_sbp.clone())?
                .with_requires_grad(self.check_gradients)?;

        let reference_output = case.baseline_reference(&reference_input, &input)?;
        let global_output = case.baseline_global(&global_input, &input)?;
        let reference_alias = case.alias_reference(&reference_output)?;
        let global_alias = case.alias_global(&global_output)?;

        case.mutate_reference(&reference_output, &input)?;
        case.mutate_global(&global_output, &input)?;

        check_shape(input.extents.as_slice(), reference_output.shape())?;
        check_shape(reference_output.shape(), global_output.shape())?;

        let expected = reference_output.to_vec();
        let actual = global_output.to_local().to_vec();
        if self.check_aliasing {
            compare_values(&global_alias.to_local().to_vec(), &actual, Tolerance::exact())
                .map_err(|mismatch| CaseError::AliasMismatch { pipeline: "global", mismatch })?;
            compare_values(&reference_alias.to_vec(), &expected, Tolerance::exact())
                .map_err(|mismatch| CaseError::AliasMismatch { pipeline: "reference", mismatch })?;
        }
        let max_value_deviation =
            compare_values(&actual, &expected, self.tolerance).map_err(CaseError::ValueMismatch)?;
        check_replicas(&global_output)?;

        let max_gradient_deviation = if self.check_gradients {
            reference_output.sum().backward()?;
            global_output.sum()?.backward()?;
            let expected = reference_input.grad().ok_or(CaseError::MissingGradient { pipeline: "reference" })?;
            let actual = global_input.grad().ok_or(CaseError::MissingGradient { pipeline: "global" })?;
            let actual = actual.to_local();
            check_shape(expected.shape(), actual.shape())?;
            Some(
                compare_values(&actual.to_vec(), &expected.to_vec(), self.tolerance)
                    .map_err(CaseError::GradientMismatch)?,
            )
        } else {
            None
        };

        debug!(
            case = case.name(),
            %configuration,
            seed,
            max_value_deviation,
            ?max_gradient_deviation,
            "equivalence case passed"
        );
        Ok(CaseReport {
            configuration: configuration.clone(),
            seed,
            extents: input.extents,
            fill_value: input.fill_value,
            max_value_deviation,
            max_gradient_deviation,
        })
    }
}

fn check_shape(expected: &[usize], actual: &[usize]) -> Result<(), CaseError> {
    if expected != actual {
        return Err(CaseError::ShapeMismatch { expected: expected.to_vec(), actual: actual.to_vec() });
    }
    Ok(())
}

/// Checks that every shard holds exactly the values of its replica leader. The logical value of a global tensor is
/// read from the leaders only, so stale replicas would otherwise go unnoticed.
fn check_replicas(tensor: &GlobalTensor) -> Result<(), CaseError> {
    let layout = tensor.layout();
    for (descriptor, shard) in layout.shards().iter().zip(tensor.shards().iter()) {
        let Some(leader) = layout.replica_leader(descriptor.shard_index()) else {
            continue;
        };
        if leader.shard_index() == descriptor.shard_index() {
            continue;
        }
        let Some(leader_shard) = tensor.shards().get(leader.shard_index()) else {
            continue;
        };
        compare_values(&shard.to_vec(), &leader_shard.to_vec(), Tolerance::exact()).map_err(|mismatch| {
            CaseError::ReplicaMismatch {
                shard_index: descriptor.shard_index(),
                leader_index: leader.shard_index(),
                mismatch,
            }
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use sbpcheck_core::{DataType, DeviceType, NdSbp, Placement, Sbp};

    use super::*;
    use crate::compare::Mismatch;

    /// `y = 2 * x` followed by `y.fill_(v)`, where either pipeline can be made to misbehave.
    struct ScaleThenFill {
        global_fill_offset: f64,
        reference_reshape: bool,
    }

    impl EquivalenceCase for ScaleThenFill {
        fn name(&self) -> &str {
            "scale_then_fill"
        }

        fn generate(&self, ndim: usize, generator: &mut RandomGenerator) -> Result<CaseInput, RandomError> {
            let extents = vec![4; ndim];
            let count = extents.iter().product::<usize>();
            let seed = generator.next_seed() % 100;
            let values = (0..count).map(|index| (index as u64 + seed) as f64).collect();
            let tensor = Tensor::from_vec(extents.clone(), values, DataType::F32)?;
            Ok(CaseInput { extents, tensor, fill_value: 3.0 })
        }

        fn baseline_global(&self, input: &GlobalTensor, _: &CaseInput) -> Result<GlobalTensor, Error> {
            Ok(input.mul_scalar(2.0))
        }

        fn mutate_global(&self, intermediate: &GlobalTensor, case: &CaseInput) -> Result<(), Error> {
            intermediate.fill_(case.fill_value + self.global_fill_offset)
        }

        fn baseline_reference(&self, input: &Tensor, _: &CaseInput) -> Result<Tensor, Error> {
            if self.reference_reshape {
                return input.mul_scalar(2.0).reshape(vec![input.element_count()]);
            }
            Ok(input.mul_scalar(2.0))
        }

        fn mutate_reference(&self, intermediate: &Tensor, case: &CaseInput) -> Result<(), Error> {
            intermediate.fill_(case.fill_value)
        }
    }

    /// `y = baseline(0)` followed by `mutate(y)`, with every step of either pipeline given as a plain function.
    struct ZeroInputCase {
        global_baseline: fn(&GlobalTensor) -> Result<GlobalTensor, Error>,
        global_mutation: fn(&GlobalTensor) -> Result<(), Error>,
        reference_baseline: fn(&Tensor) -> Result<Tensor, Error>,
        reference_mutation: fn(&Tensor) -> Result<(), Error>,
        copying_global_alias: bool,
    }

    impl Default for ZeroInputCase {
        fn default() -> Self {
            Self {
                global_baseline: |input| Ok(input.add_scalar(1.0)),
                global_mutation: |output| output.fill_(3.0),
                reference_baseline: |input| Ok(input.add_scalar(1.0)),
                reference_mutation: |output| output.fill_(3.0),
                copying_global_alias: false,
            }
        }
    }

    impl EquivalenceCase for ZeroInputCase {
        fn name(&self) -> &str {
            "zero_input"
        }

        fn generate(&self, ndim: usize, _: &mut RandomGenerator) -> Result<CaseInput, RandomError> {
            let extents = vec![4; ndim];
            Ok(CaseInput { tensor: Tensor::zeros(extents.clone(), DataType::F32), extents, fill_value: 3.0 })
        }

        fn baseline_global(&self, input: &GlobalTensor, _: &CaseInput) -> Result<GlobalTensor, Error> {
            (self.global_baseline)(input)
        }

        fn mutate_global(&self, intermediate: &GlobalTensor, _: &CaseInput) -> Result<(), Error> {
            (self.global_mutation)(intermediate)
        }

        fn baseline_reference(&self, input: &Tensor, _: &CaseInput) -> Result<Tensor, Error> {
            (self.reference_baseline)(input)
        }

        fn mutate_reference(&self, intermediate: &Tensor, _: &CaseInput) -> Result<(), Error> {
            (self.reference_mutation)(intermediate)
        }

        fn alias_global(&self, output: &GlobalTensor) -> Result<GlobalTensor, Error> {
            if !self.copying_global_alias {
                return Ok(output.view());
            }
            GlobalTensor::from_local(&output.to_local(), output.placement().clone(), output.nd_sbp().clone())
        }
    }

    fn configuration(nd_sbp: NdSbp) -> Configuration {
        Configuration {
            ndim: 2,
            placement: Placement::from_ranks(DeviceType::Cpu, vec![2, 2], 0..4, 2).unwrap(),
            nd_sbp,
        }
    }

    #[test]
    fn test_executor_passing_case() {
        let case = ScaleThenFill { global_fill_offset: 0.0, reference_reshape: false };
        let configuration = configuration(NdSbp::new(vec![Sbp::split(0), Sbp::partial_sum()]));
        let report = Executor::default().execute(&case, &configuration, 17).unwrap();
        assert_eq!(report.extents, vec![4, 4]);
        assert_eq!(report.fill_value, 3.0);
        assert_eq!(report.max_value_deviation, 0.0);
        assert_eq!(report.max_gradient_deviation, Some(0.0));
        assert_eq!(report.seed, 17);
    }

    #[test]
    fn test_executor_value_mismatch() {
        let case = ScaleThenFill { global_fill_offset: 0.5, reference_reshape: false };
        let error = Executor::default().execute(&case, &configuration(NdSbp::broadcast(2)), 0).unwrap_err();
        assert!(matches!(
            error,
            CaseError::ValueMismatch(mismatch) if mismatch.mismatch_count == 16 && mismatch.max_deviation == 0.5,
        ));
    }

    #[test]
    fn test_executor_shape_mismatch() {
        let case = ScaleThenFill { global_fill_offset: 0.0, reference_reshape: true };
        let executor = Executor { check_gradients: false, ..Executor::default() };
        let error = executor.execute(&case, &configuration(NdSbp::broadcast(2)), 0).unwrap_err();
        assert_eq!(error, CaseError::ShapeMismatch { expected: vec![4, 4], actual: vec![16] });
    }

    #[test]
    fn test_executor_without_gradients() {
        let case = ScaleThenFill { global_fill_offset: 0.0, reference_reshape: false };
        let executor = Executor { check_gradients: false, ..Executor::default() };
        let report = executor.execute(&case, &configuration(NdSbp::broadcast(2)), 3).unwrap();
        assert_eq!(report.max_gradient_deviation, None);
    }

    #[test]
    fn test_executor_stale_replica() {
        let case =
            ZeroInputCase { global_mutation: |output| output.shards()[0].fill_(3.0), ..ZeroInputCase::default() };
        let stale = Mismatch {
            index: 0,
            expected: 3.0,
            actual: 1.0,
            max_deviation: 2.0,
            mismatch_count: 16,
            element_count: 16,
        };
        let error = Executor::default().execute(&case, &configuration(NdSbp::broadcast(2)), 0).unwrap_err();
        assert_eq!(error, CaseError::ReplicaMismatch { shard_index: 1, leader_index: 0, mismatch: stale.clone() });

        let flat = Configuration {
            ndim: 2,
            placement: Placement::from_ranks(DeviceType::Cpu, vec![4], 0..4, 4).unwrap(),
            nd_sbp: NdSbp::broadcast(1),
        };
        let error = Executor::default().execute(&case, &flat, 0).unwrap_err();
        assert_eq!(error, CaseError::ReplicaMismatch { shard_index: 1, leader_index: 0, mismatch: stale });
    }

    #[test]
    fn test_executor_alias_mismatch() {
        let case = ZeroInputCase { copying_global_alias: true, ..ZeroInputCase::default() };
        let error = Executor::default().execute(&case, &configuration(NdSbp::broadcast(2)), 0).unwrap_err();
        assert!(matches!(
            error,
            CaseError::AliasMismatch { pipeline: "global", mismatch }
                if mismatch.expected == 3.0 && mismatch.actual == 1.0 && mismatch.mismatch_count == 16,
        ));

        let executor = Executor { check_aliasing: false, ..Executor::default() };
        assert!(executor.execute(&case, &configuration(NdSbp::broadcast(2)), 0).is_ok());
    }

    #[test]
    fn test_executor_gradient_mismatch() {
        let case = ZeroInputCase {
            global_baseline: |input| Ok(input.mul_scalar(2.0)),
            global_mutation: |_| Ok(()),
            reference_baseline: |input| Ok(input.add_scalar(0.0)),
            reference_mutation: |_| Ok(()),
            copying_global_alias: false,
        };
        let error = Executor::default().execute(&case, &configuration(NdSbp::broadcast(2)), 0).unwrap_err();
        assert_eq!(
            error,
            CaseError::GradientMismatch(Mismatch {
                index: 0,
                expected: 1.0,
                actual: 2.0,
                max_deviation: 1.0,
                mismatch_count: 16,
                element_count: 16,
            }),
        );
    }

    #[test]
    fn test_executor_missing_gradient() {
        let case = ZeroInputCase {
            global_baseline: |input| {
                let detached =
                    GlobalTensor::from_local(&input.to_local(), input.placement().clone(), input.nd_sbp().clone())?;
                Ok(detached.with_requires_grad(true)?.add_scalar(1.0))
            },
            ..ZeroInputCase::default()
        };
        let configuration = configuration(NdSbp::new(vec![Sbp::split(0), Sbp::broadcast()]));
        let error = Executor::default().execute(&case, &configuration, 0).unwrap_err();
        assert_eq!(error, CaseError::MissingGradient { pipeline: "global" });
    }

    #[test]
    fn test_executor_invalid_configuration() {
        let case = ScaleThenFill { global_fill_offset: 0.0, reference_reshape: false };
        let configuration = Configuration {
            ndim: 1,
            placement: Placement::from_ranks(DeviceType::Cpu, vec![8], 0..8, 8).unwrap(),
            nd_sbp: NdSbp::new(vec![Sbp::split(0)]),
        };
        let error = Executor::default().execute(&case, &configuration, 0).unwrap_err();
        assert!(error.is_fatal_for_sweep());
    }
}
