use pretty_assertions::assert_eq;
use proptest::prelude::*;

use sbpcheck::core::{DataType, DeviceType, GlobalTensor, NdSbp, Placement, Sbp, Tensor};
use sbpcheck::harness::enumerator::{Configuration, ConfigurationSpace, SbpOptions, all_sbp};
use sbpcheck::harness::executor::{EquivalenceCase, Executor};
use sbpcheck::harness::orchestrator::Sweep;
use sbpcheck::harness::random::RandomGenerator;
use sbpcheck::harness::suites::fill::FillCase;
use sbpcheck::harness::{CaseInput, Environment, Tolerance, compare_values};

fn placement(hierarchy: Vec<usize>) -> Placement {
    let rank_count = hierarchy.iter().product::<usize>();
    Placement::from_ranks(DeviceType::Cpu, hierarchy, 0..rank_count, rank_count).unwrap()
}

/// Candidate components for rank-2 tensors, in enumeration order.
fn component(index: usize) -> Sbp {
    match index {
        0 => Sbp::split(0),
        1 => Sbp::split(1),
        2 => Sbp::broadcast(),
        _ => Sbp::partial_sum(),
    }
}

fn nd_sbp(indices: &[usize]) -> NdSbp {
    NdSbp::new(indices.iter().copied().map(component).collect())
}

/// Fill case with fixed extents and fill value.
struct FixedFill {
    extents: Vec<usize>,
    fill_value: f64,
}

impl EquivalenceCase for FixedFill {
    fn name(&self) -> &str {
        "fixed_fill"
    }

    fn generate(
        &self,
        _: usize,
        generator: &mut RandomGenerator,
    ) -> Result<CaseInput, sbpcheck::harness::RandomError> {
        let tensor = sbpcheck::harness::TensorSpec::default().sample(generator, self.extents.clone())?;
        Ok(CaseInput { extents: self.extents.clone(), tensor, fill_value: self.fill_value })
    }

    fn baseline_global(&self, input: &GlobalTensor, _: &CaseInput) -> Result<GlobalTensor, sbpcheck::Error> {
        Ok(input.add_scalar(1.0))
    }

    fn mutate_global(&self, intermediate: &GlobalTensor, case: &CaseInput) -> Result<(), sbpcheck::Error> {
        intermediate.fill_(case.fill_value)
    }

    fn baseline_reference(&self, input: &Tensor, _: &CaseInput) -> Result<Tensor, sbpcheck::Error> {
        Ok(input.add_scalar(1.0))
    }

    fn mutate_reference(&self, intermediate: &Tensor, case: &CaseInput) -> Result<(), sbpcheck::Error> {
        intermediate.fill_(case.fill_value)
    }
}

#[test]
fn test_fill_of_split_rank_2_tensor() {
    let case = FixedFill { extents: vec![4, 4], fill_value: 3.0 };
    let configuration = Configuration {
        ndim: 2,
        placement: placement(vec![4]),
        nd_sbp: NdSbp::new(vec![Sbp::split(0)]),
    };
    let executor = Executor { tolerance: Tolerance::new(1e-5, 1e-5), ..Executor::default() };
    let report = executor.execute(&case, &configuration, 0).unwrap();
    assert_eq!(report.extents, vec![4, 4]);
    assert_eq!(report.max_value_deviation, 0.0);

    let x = GlobalTensor::from_local(
        &Tensor::zeros(vec![4, 4], DataType::F32),
        configuration.placement.clone(),
        configuration.nd_sbp.clone(),
    )
    .unwrap();
    let y = x.add_scalar(1.0);
    y.fill_(3.0).unwrap();
    assert_eq!(y.shape(), &[4, 4]);
    assert_eq!(y.to_local().to_vec(), vec![3.0; 16]);
}

#[test]
fn test_sweep_over_every_configuration_of_a_two_node_environment() {
    let environment = Environment::new(4, 2).unwrap();
    let placements = vec![placement(vec![4]), placement(vec![2, 2])];
    let space = ConfigurationSpace::new(3, placements);
    assert_eq!(space.len(), 5 + 25);
    let case = FillCase::new(&environment);
    let report = Sweep::new(&case, Executor::default(), &space, 31, 1).run().unwrap();
    assert_eq!(report.executed, 30);
    assert!(report.is_success(), "{:?}", report.failures);
}

#[test]
fn test_sweep_over_empty_placement_set() {
    let case = FillCase::new(&Environment::new(4, 1).unwrap());
    let space = ConfigurationSpace::new(2, Vec::new());
    let report = Sweep::new(&case, Executor::default(), &space, 0, 3).run().unwrap();
    assert_eq!((report.executed, report.passed, report.failures.len()), (0, 0, 0));
    assert!(report.is_success());
}

fn global_operand(hierarchy: Vec<usize>, components: &[usize], factors: (usize, usize)) -> GlobalTensor {
    let shape = vec![factors.0 * 4, factors.1 * 4];
    let count = shape.iter().product::<usize>();
    let local = Tensor::from_vec(shape, (0..count).map(|index| index as f64).collect(), DataType::F32).unwrap();
    GlobalTensor::from_local(&local, placement(hierarchy), nd_sbp(components)).unwrap().add_scalar(1.0)
}

fn hierarchy_strategy() -> impl Strategy<Value = (Vec<usize>, Vec<usize>)> {
    prop_oneof![
        (0..4usize).prop_map(|index| (vec![4], vec![index])),
        (0..4usize, 0..4usize).prop_map(|(first, second)| (vec![2, 2], vec![first, second])),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn fill_is_idempotent(
        (hierarchy, components) in hierarchy_strategy(),
        factors in (1..4usize, 1..4usize),
        value in -100.0f64..100.0,
    ) {
        let once = global_operand(hierarchy.clone(), &components, factors);
        once.fill_(value).unwrap();
        let twice = global_operand(hierarchy, &components, factors);
        twice.fill_(value).unwrap();
        twice.fill_(value).unwrap();
        prop_assert_eq!(once.to_local().to_vec(), twice.to_local().to_vec());
    }

    #[test]
    fn fill_preserves_shape_and_sets_every_element(
        (hierarchy, components) in hierarchy_strategy(),
        factors in (1..4usize, 1..4usize),
        value in -100.0f64..100.0,
    ) {
        let tensor = global_operand(hierarchy, &components, factors);
        let shape = tensor.shape().to_vec();
        tensor.fill_(value).unwrap();
        prop_assert_eq!(tensor.shape(), shape.as_slice());
        let expected = vec![DataType::F32.cast(value); shape.iter().product::<usize>()];
        prop_assert!(compare_values(&tensor.to_local().to_vec(), &expected, Tolerance::exact()).is_ok());
    }

    #[test]
    fn fill_is_visible_through_views(
        (hierarchy, components) in hierarchy_strategy(),
        factors in (1..4usize, 1..4usize),
        value in -100.0f64..100.0,
    ) {
        let tensor = global_operand(hierarchy, &components, factors);
        let alias = tensor.view();
        tensor.fill_(value).unwrap();
        prop_assert!(alias.shares_storage(&tensor));
        prop_assert_eq!(alias.to_local().to_vec(), tensor.to_local().to_vec());
    }

    #[test]
    fn enumerated_configurations_are_valid(ndim in 0..5usize, two_level in any::<bool>()) {
        let placement = if two_level { placement(vec![2, 2]) } else { placement(vec![4]) };
        let signatures = all_sbp(&placement, ndim, &SbpOptions::default());
        let expected_count = signatures.len();
        let mut count = 0;
        for nd_sbp in signatures {
            prop_assert!(nd_sbp.validate(&placement, ndim).is_ok());
            prop_assert_eq!(nd_sbp.ndim(), placement.ndim());
            count += 1;
        }
        prop_assert_eq!(count, expected_count);
    }

    #[test]
    fn case_generation_replays_from_its_seed(seed in any::<u64>(), ndim in 1..5usize) {
        let case = FillCase::new(&Environment::new(4, 1).unwrap());
        let first = case.generate(ndim, &mut RandomGenerator::new(seed)).unwrap();
        let second = case.generate(ndim, &mut RandomGenerator::new(seed)).unwrap();
        prop_assert_eq!(first.extents, second.extents);
        prop_assert_eq!(first.tensor.to_vec(), second.tensor.to_vec());
        prop_assert_eq!(first.fill_value, second.fill_value);
    }
}
