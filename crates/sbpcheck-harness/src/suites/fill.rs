//! Equivalence tests for the in-place fill of global tensors.

use sbpcheck_core::{Error, GlobalTensor, NdSbp, Placement, Tensor};

use crate::config::Environment;
use crate::context::TestContext;
use crate::enumerator::ConfigurationSpace;
use crate::errors::{RandomError, RegistryError, TestError};
use crate::executor::{CaseInput, EquivalenceCase};
use crate::orchestrator::Sweep;
use crate::random::{ExtentSpec, RandomFloat, RandomGenerator, RandomInt, TensorSpec};
use crate::registry::TestRegistry;

pub const TEST_FILL: &str = "test_fill_";
pub const TEST_FILL_TENSOR: &str = "test_fill_tensor_";

/// Reason why [`test_fill_tensor_`] is registered disabled.
pub const FILL_TENSOR_DISABLED_REASON: &str =
    "the gradient of the fill value is not recovered when switching from global to local tensors";

/// Tensor ranks are drawn from `[1, 5)`.
const NDIM_RANGE: (i64, i64) = (1, 5);

/// Value of the broadcast rank-0 tensor used by [`FillTensorCase`].
const FILL_TENSOR_VALUE: f64 = 1.0;

// ---------------------------------------------------------------------------
// Cases
// ---------------------------------------------------------------------------

/// `y = x + 1` followed by `y.fill_(value)`, with a random `value` in `[1, 6)`.
#[derive(Clone, Debug)]
pub struct FillCase {
    extents: ExtentSpec,
    values: TensorSpec,
    fill_value: RandomFloat,
}

impl FillCase {
    /// Case whose extents can be split across every partition count of `environment`.
    pub fn new(environment: &Environment) -> Self {
        Self {
            extents: ExtentSpec::for_world_size(environment.world_size()),
            values: TensorSpec::default(),
            fill_value: RandomFloat::default(),
        }
    }

    pub fn extents(&self) -> ExtentSpec {
        self.extents
    }
}

impl EquivalenceCase for FillCase {
    fn name(&self) -> &str {
        "fill_"
    }

    fn generate(&self, ndim: usize, generator: &mut RandomGenerator) -> Result<CaseInput, RandomError> {
        let extents = self.extents.sample(generator, ndim);
        let tensor = self.values.sample(generator, extents.clone())?;
        let fill_value = self.values.data_type.cast(self.fill_value.sample(generator));
        Ok(CaseInput { extents, tensor, fill_value })
    }

    fn baseline_global(&self, input: &GlobalTensor, _: &CaseInput) -> Result<GlobalTensor, Error> {
        Ok(input.add_scalar(1.0))
    }

    fn mutate_global(&self, intermediate: &GlobalTensor, case: &CaseInput) -> Result<(), Error> {
        intermediate.fill_(case.fill_value)
    }

    fn baseline_reference(&self, input: &Tensor, _: &CaseInput) -> Result<Tensor, Error> {
        Ok(input.add_scalar(1.0))
    }

    fn mutate_reference(&self, intermediate: &Tensor, case: &CaseInput) -> Result<(), Error> {
        intermediate.fill_(case.fill_value)
    }
}

/// `y = x + 1` followed by `y.fill_(value)`, where `value` is a rank-0 tensor that requires gradients and that is
/// broadcast along every hierarchy axis of the placement of `y`.
#[derive(Clone, Debug)]
pub struct FillTensorCase {
    extents: ExtentSpec,
    values: TensorSpec,
}

impl FillTensorCase {
    /// Extent factors are drawn from `[1, 4)`, scaled so that they can be split across `environment`.
    pub fn new(environment: &Environment) -> Self {
        Self { extents: ExtentSpec::for_world_size(environment.world_size()), values: TensorSpec::default() }
    }

    fn value(&self) -> Result<Tensor, Error> {
        Tensor::scalar(FILL_TENSOR_VALUE, self.values.data_type).with_requires_grad(true)
    }
}

/// Rank-0 tensor holding `tensor`'s value, broadcast along every hierarchy axis of `placement`.
fn broadcast_value(tensor: &Tensor, placement: &Placement) -> Result<GlobalTensor, Error> {
    GlobalTensor::from_local(tensor, placement.clone(), NdSbp::broadcast(placement.ndim()))?.with_requires_grad(true)
}

impl EquivalenceCase for FillTensorCase {
    fn name(&self) -> &str {
        "fill_tensor_"
    }

    fn generate(&self, ndim: usize, generator: &mut RandomGenerator) -> Result<CaseInput, RandomError> {
        let extents = self.extents.sample(generator, ndim);
        let tensor = self.values.sample(generator, extents.clone())?;
        Ok(CaseInput { extents, tensor, fill_value: FILL_TENSOR_VALUE })
    }

    fn baseline_global(&self, input: &GlobalTensor, _: &CaseInput) -> Result<GlobalTensor, Error> {
        Ok(input.add_scalar(1.0))
    }

    fn mutate_global(&self, intermediate: &GlobalTensor, _: &CaseInput) -> Result<(), Error> {
        intermediate.fill_tensor_(&broadcast_value(&self.value()?, intermediate.placement())?)
    }

    fn baseline_reference(&self, input: &Tensor, _: &CaseInput) -> Result<Tensor, Error> {
        Ok(input.add_scalar(1.0))
    }

    fn mutate_reference(&self, intermediate: &Tensor, _: &CaseInput) -> Result<(), Error> {
        intermediate.fill_tensor_(&self.value()?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

fn sweep_all_configurations<C: EquivalenceCase>(context: &mut TestContext, case: &C) -> Result<usize, TestError> {
    let ndim = RandomInt::new(NDIM_RANGE.0, NDIM_RANGE.1)?.sample(context.generator_mut()) as usize;
    let space = ConfigurationSpace::new(ndim, context.placements()?);
    let seed = context.generator_mut().next_seed();
    let sweep = Sweep::new(case, context.executor(), &space, seed, context.config().repeat);
    context.run_sweep(sweep)?;
    Ok(ndim)
}

/// Checks `fill_` on every placement and every SBP signature of a tensor of random rank.
pub fn test_fill_(context: &mut TestContext) -> Result<(), TestError> {
    let case = FillCase::new(&context.environment());
    sweep_all_configurations(context, &case)?;
    Ok(())
}

/// Checks `fill_` with a tensor value on every configuration, and that the gradient of the value matches the one of
/// the reference implementation.
pub fn test_fill_tensor_(context: &mut TestContext) -> Result<(), TestError> {
    let case = FillTensorCase::new(&context.environment());
    let ndim = sweep_all_configurations(context, &case)?;
    let extents = case.extents.sample(context.generator_mut(), ndim);
    let element_count = extents.iter().product::<usize>() as f64;
    for placement in context.placements()? {
        let target = GlobalTensor::from_local(
            &Tensor::zeros(extents.clone(), case.values.data_type),
            placement.clone(),
            NdSbp::broadcast(placement.ndim()),
        )?
        .add_scalar(1.0);
        let value = broadcast_value(&case.value()?, &placement)?;
        target.fill_tensor_(&value)?;
        target.sum()?.backward()?;
        let gradient = value.grad().map(|gradient| gradient.to_local().to_vec()).unwrap_or_default();
        let tolerance = context.config().tolerance();
        let what = format!("fill value gradient on {placement}");
        context.assert_eq_values(&gradient, &[element_count], tolerance, what.as_str());
    }
    Ok(())
}

/// Registers the fill tests. Both run on a single node.
pub fn register(registry: &mut TestRegistry) -> Result<(), RegistryError> {
    registry.register(TEST_FILL, 1, test_fill_)?;
    registry.register_disabled(TEST_FILL_TENSOR, 1, test_fill_tensor_, FILL_TENSOR_DISABLED_REASON)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use sbpcheck_core::{DataType, DeviceType, Sbp};

    use super::*;
    use crate::config::HarnessConfig;
    use crate::enumerator::{Configuration, all_placements};
    use crate::executor::Executor;
    use crate::registry::TestStatus;

    fn config() -> HarnessConfig {
        HarnessConfig { seed: Some(2024), world_size: 2, cpu_only: true, ..HarnessConfig::default() }
    }

    #[test]
    fn test_fill_case_generation() {
        let case = FillCase::new(&Environment::new(8, 2).unwrap());
        assert_eq!(case.extents().multiple(), 8);
        let mut generator = RandomGenerator::new(5);
        let input = case.generate(3, &mut generator).unwrap();
        assert_eq!(input.extents.len(), 3);
        assert!(input.extents.iter().all(|extent| extent % 8 == 0 && (8..32).contains(extent)));
        assert_eq!(input.tensor.shape(), input.extents.as_slice());
        assert_eq!(input.tensor.data_type(), DataType::F32);
        assert!((1.0..6.0).contains(&input.fill_value));
        assert_eq!(input.fill_value, DataType::F32.cast(input.fill_value));
        assert!(input.tensor.to_vec().iter().all(|value| (0.0..=1.0).contains(value)));

        let replayed = case.generate(3, &mut RandomGenerator::new(5)).unwrap();
        assert_eq!(replayed.tensor.to_vec(), input.tensor.to_vec());
        assert_eq!(replayed.fill_value, input.fill_value);
    }

    #[test]
    fn test_fill_tensor_case_on_mixed_signature() {
        let case = FillTensorCase::new(&Environment::new(4, 2).unwrap());
        let configuration = Configuration {
            ndim: 2,
            placement: Placement::from_ranks(DeviceType::Cpu, vec![2, 2], 0..4, 2).unwrap(),
            nd_sbp: NdSbp::new(vec![Sbp::partial_sum(), Sbp::split(1)]),
        };
        let report = Executor::default().execute(&case, &configuration, 8).unwrap();
        assert_eq!(report.max_value_deviation, 0.0);
        assert_eq!(report.max_gradient_deviation, Some(0.0));
    }

    #[test]
    fn test_fill_passes_on_every_configuration() {
        let config = config();
        let mut context = TestContext::new(TEST_FILL, config, 1);
        test_fill_(&mut context).unwrap();
        assert!(context.is_success(), "{:?}", context.failures());
        assert_eq!(context.sweeps().len(), 1);
        let sweep = &context.sweeps()[0];
        assert!((1..5).contains(&sweep.ndim));
        let signatures_per_axis = sweep.ndim + 2;
        assert_eq!(sweep.executed, signatures_per_axis + signatures_per_axis * signatures_per_axis);
        assert_eq!(sweep.passed, sweep.executed);
    }

    #[test]
    fn test_fill_passes_for_every_rank() {
        for (world_size, node_size) in [(4, 1), (4, 2), (2, 2)] {
            let environment = Environment::new(world_size, node_size).unwrap();
            let placements = all_placements(&environment, &[DeviceType::Cpu]).unwrap();
            assert_eq!(placements.iter().map(Placement::ndim).collect::<Vec<_>>(), vec![1, 2]);
            let case = FillCase::new(&environment);
            for ndim in 1..5 {
                let space = ConfigurationSpace::new(ndim, placements.clone());
                let report = Sweep::new(&case, Executor::default(), &space, ndim as u64, 1).run().unwrap();
                let signatures_per_axis = ndim + 2;
                assert_eq!(report.executed, signatures_per_axis + signatures_per_axis * signatures_per_axis);
                assert!(report.is_success(), "world size {world_size}, {node_size} node(s): {:?}", report.failures);
            }
        }
    }

    #[test]
    fn test_fill_tensor_passes_when_run_directly() {
        let mut context = TestContext::new(TEST_FILL_TENSOR, config(), 4);
        test_fill_tensor_(&mut context).unwrap();
        assert!(context.is_success(), "{:?}", context.failures());
        assert_eq!(context.sweeps().len(), 1);
    }

    #[test]
    fn test_fill_registration() {
        let mut registry = TestRegistry::new();
        register(&mut registry).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get(TEST_FILL).unwrap().is_enabled());
        assert_eq!(
            registry.get(TEST_FILL_TENSOR).unwrap().status(),
            &TestStatus::Disabled { reason: FILL_TENSOR_DISABLED_REASON.to_string() },
        );
        assert!(registry.tests().all(|test| test.num_nodes() == 1));

        let summary = registry.run(&config(), None);
        assert!(summary.is_success(), "{summary}");
        assert_eq!((summary.passed(), summary.skipped()), (1, 1));
    }
}
