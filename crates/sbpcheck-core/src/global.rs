//! Global (distributed) tensors over simulated devices.
//!
//! A [`GlobalTensor`] holds one local [`Tensor`] shard per rank of its [`Placement`]. Its logical value is the one
//! that [`GlobalTensor::to_local`] reconstructs from the shards, following its [`NdSbp`]:
//!
//! - along `S(d)` axes, shards hold disjoint slices of dimension `d`,
//! - along `B` axes, shards hold identical replicas (only the replica at coordinate `0` is read),
//! - along `P` axes, the logical value is the sum of the shards.
//!
//! Operations run shard-wise on the local tensors, so gradients are tracked per shard. [`GlobalTensor::backward`]
//! seeds every shard using the dual signature of the output, and [`GlobalTensor::grad`] reassembles shard gradients
//! using the dual signature of the input, so that `grad()?.to_local()` is the logical gradient.

use std::fmt::Display;

use tracing::trace;

use crate::errors::Error;
use crate::sharding::{NdSbp, Placement, Rank, ShardingLayout};
use crate::tensor::Tensor;
use crate::types::DataType;

#[derive(Clone, Debug)]
pub struct GlobalTensor {
    layout: ShardingLayout,
    shards: Vec<Tensor>,
    data_type: DataType,
}

impl GlobalTensor {
    /// Distributes the logical value `tensor` over `placement` following `nd_sbp`.
    ///
    /// The shards are fresh tensors: they do not share storage or gradient history with `tensor`.
    pub fn from_local(tensor: &Tensor, placement: Placement, nd_sbp: NdSbp) -> Result<Self, Error> {
        let layout = ShardingLayout::new(tensor.shape().to_vec(), placement, nd_sbp)?;
        let shards = distribute(&layout, &tensor.values(), tensor.data_type());
        trace!(
            placement = %layout.placement(),
            nd_sbp = %layout.nd_sbp(),
            shape = ?layout.global_shape(),
            "distributed tensor"
        );
        Ok(Self { layout, shards, data_type: tensor.data_type() })
    }

    fn with_shards(&self, layout: ShardingLayout, shards: Vec<Tensor>) -> Self {
        Self { layout, shards, data_type: self.data_type }
    }

    pub fn layout(&self) -> &ShardingLayout {
        &self.layout
    }

    pub fn placement(&self) -> &Placement {
        self.layout.placement()
    }

    pub fn nd_sbp(&self) -> &NdSbp {
        self.layout.nd_sbp()
    }

    /// Logical shape.
    pub fn shape(&self) -> &[usize] {
        self.layout.global_shape()
    }

    pub fn ndim(&self) -> usize {
        self.layout.global_shape().len()
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Local shards, in row-major placement order.
    pub fn shards(&self) -> &[Tensor] {
        self.shards.as_slice()
    }

    /// Local shard held by `rank`, if the rank belongs to the placement.
    pub fn local_shard(&self, rank: Rank) -> Option<&Tensor> {
        self.layout.placement().rank_index(rank).and_then(|index| self.shards.get(index))
    }

    /// Reconstructs the logical value of this tensor as a fresh local tensor without gradient history.
    pub fn to_local(&self) -> Tensor {
        gather(&self.layout, self.shards.as_slice(), self.data_type)
    }

    /// Redistributes the logical value of this tensor over `placement` following `nd_sbp`.
    pub fn to_global(&self, placement: Placement, nd_sbp: NdSbp) -> Result<Self, Error> {
        Self::from_local(&self.to_local(), placement, nd_sbp)
    }

    /// Returns a view of this tensor: every shard of the result is a view of the corresponding shard of `self`.
    pub fn view(&self) -> Self {
        self.with_shards(self.layout.clone(), self.shards.iter().map(Tensor::view).collect())
    }

    /// Returns `true` if every shard of `self` shares storage with the corresponding shard of `other`.
    pub fn shares_storage(&self, other: &GlobalTensor) -> bool {
        self.shards.len() == other.shards.len()
            && self.shards.iter().zip(other.shards.iter()).all(|(lhs, rhs)| lhs.shares_storage(rhs))
    }

    // ----- Operations -----

    /// Adds `value` to the logical tensor. The constant is only added on the shards that own partial sums, so that
    /// it is counted exactly once.
    pub fn add_scalar(&self, value: f64) -> Self {
        let shards =
            self.map_shards(|shard, is_partial_owner| shard.add_scalar(if is_partial_owner { value } else { 0.0 }));
        self.with_shards(self.layout.clone(), shards)
    }

    pub fn mul_scalar(&self, factor: f64) -> Self {
        let shards = self.shards.iter().map(|shard| shard.mul_scalar(factor)).collect();
        self.with_shards(self.layout.clone(), shards)
    }

    /// Sums all elements into a rank-0 global tensor. Split and partial-sum axes become partial-sum axes.
    pub fn sum(&self) -> Result<Self, Error> {
        let layout = ShardingLayout::new(Vec::new(), self.placement().clone(), self.nd_sbp().reduced())?;
        Ok(self.with_shards(layout, self.shards.iter().map(Tensor::sum).collect()))
    }

    /// Fills the logical tensor with `value`, in place. Shards that do not own partial sums are filled with zeros.
    pub fn fill_(&self, value: f64) -> Result<(), Error> {
        for (descriptor, shard) in self.layout.shards().iter().zip(self.shards.iter()) {
            shard.fill_(if descriptor.is_partial_owner(self.nd_sbp()) { value } else { 0.0 })?;
        }
        Ok(())
    }

    /// Fills the logical tensor with the value of the rank-0 global tensor `value`, in place.
    ///
    /// `value` must live on the same placement as `self` and must be broadcast along every hierarchy axis.
    pub fn fill_tensor_(&self, value: &GlobalTensor) -> Result<(), Error> {
        if value.placement() != self.placement() {
            return Err(Error::PlacementMismatch {
                operation: "fill_tensor_".to_string(),
                expected: self.placement().to_string(),
                actual: value.placement().to_string(),
            });
        }
        if !value.nd_sbp().is_all_broadcast() {
            return Err(Error::NotBroadcast {
                operation: "fill_tensor_".to_string(),
                nd_sbp: value.nd_sbp().to_string(),
            });
        }
        if value.ndim() != 0 {
            return Err(Error::NonScalarFillValue { shape: value.shape().to_vec() });
        }
        for ((descriptor, shard), value_shard) in
            self.layout.shards().iter().zip(self.shards.iter()).zip(value.shards.iter())
        {
            if descriptor.is_partial_owner(self.nd_sbp()) {
                shard.fill_tensor_(value_shard)?;
            } else {
                shard.fill_tensor_(&value_shard.mul_scalar(0.0))?;
            }
        }
        Ok(())
    }

    fn map_shards<F: Fn(&Tensor, bool) -> Tensor>(&self, f: F) -> Vec<Tensor> {
        self.layout
            .shards()
            .iter()
            .zip(self.shards.iter())
            .map(|(descriptor, shard)| f(shard, descriptor.is_partial_owner(self.nd_sbp())))
            .collect()
    }

    // ----- Gradients -----

    /// Marks every shard of this leaf tensor as requiring gradients (or not).
    pub fn with_requires_grad(self, requires_grad: bool) -> Result<Self, Error> {
        let shards = self
            .shards
            .into_iter()
            .map(|shard| shard.with_requires_grad(requires_grad))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { shards, ..self })
    }

    pub fn requires_grad(&self) -> bool {
        self.shards.iter().any(Tensor::requires_grad)
    }

    /// Computes gradients of this single-element tensor with respect to every leaf it depends on.
    pub fn backward(&self) -> Result<(), Error> {
        if self.shape().iter().product::<usize>() != 1 {
            return Err(Error::NonScalarBackward { shape: self.shape().to_vec() });
        }
        if !self.requires_grad() {
            return Err(Error::BackwardWithoutGradient);
        }
        let seed = Tensor::full(self.shape().to_vec(), 1.0, self.data_type);
        let seed_layout = self.layout.dual();
        let seeds = distribute(&seed_layout, &seed.values(), self.data_type);
        for (shard, seed) in self.shards.iter().zip(seeds.iter()) {
            if shard.requires_grad() {
                shard.backward_with(seed)?;
            }
        }
        Ok(())
    }

    /// Gradient accumulated into this leaf, distributed with the dual of this tensor's signature.
    pub fn grad(&self) -> Option<GlobalTensor> {
        let grads = self.shards.iter().map(Tensor::grad).collect::<Vec<_>>();
        if grads.iter().all(Option::is_none) {
            return None;
        }
        let shards = grads
            .into_iter()
            .zip(self.shards.iter())
            .map(|(grad, shard)| grad.unwrap_or_else(|| Tensor::zeros(shard.shape().to_vec(), self.data_type)))
            .collect();
        Some(self.with_shards(self.layout.dual(), shards))
    }
}

impl Display for GlobalTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "global_tensor(shape={:?}, dtype={}, placement={}, sbp={})",
            self.shape(),
            self.data_type,
            self.placement(),
            self.nd_sbp(),
        )
    }
}

fn distribute(layout: &ShardingLayout, values: &[f64], data_type: DataType) -> Vec<Tensor> {
    layout
        .shards()
        .iter()
        .map(|descriptor| {
            let shard_values = if descriptor.is_partial_owner(layout.nd_sbp()) {
                descriptor.logical_indices(layout.global_shape()).into_iter().map(|index| values[index]).collect()
            } else {
                vec![0.0; descriptor.shape().iter().product()]
            };
            Tensor::from_values(descriptor.shape().to_vec(), shard_values, data_type)
        })
        .collect()
}

fn gather(layout: &ShardingLayout, shards: &[Tensor], data_type: DataType) -> Tensor {
    let global_shape = layout.global_shape();
    let mut values = vec![0.0; global_shape.iter().product()];
    for (descriptor, shard) in layout.shards().iter().zip(shards.iter()) {
        if !descriptor.is_replica_leader(layout.nd_sbp()) {
            continue;
        }
        let shard_values = shard.values();
        for (index, value) in descriptor.logical_indices(global_shape).into_iter().zip(shard_values.iter()) {
            values[index] += value;
        }
    }
    Tensor::from_values(global_shape.to_vec(), values, data_type)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::sharding::{DeviceType, Sbp};

    fn placement_1d() -> Placement {
        Placement::from_ranks(DeviceType::Cpu, vec![4], 0..4, 4).unwrap()
    }

    fn placement_2d() -> Placement {
        Placement::from_ranks(DeviceType::Cpu, vec![2, 2], 0..4, 4).unwrap()
    }

    fn iota(shape: Vec<usize>) -> Tensor {
        let count = shape.iter().product::<usize>();
        Tensor::from_vec(shape, (0..count).map(|value| value as f64).collect(), DataType::F64).unwrap()
    }

    fn all_signatures() -> Vec<NdSbp> {
        let candidates = [Sbp::split(0), Sbp::split(1), Sbp::broadcast(), Sbp::partial_sum()];
        candidates
            .iter()
            .flat_map(|outer| candidates.iter().map(move |inner| NdSbp::new(vec![*outer, *inner])))
            .collect()
    }

    #[test]
    fn test_global_tensor_distribution() {
        let x = iota(vec![4, 2]);
        let split = GlobalTensor::from_local(&x, placement_1d(), NdSbp::new(vec![Sbp::split(0)])).unwrap();
        assert_eq!(split.shards()[1].to_vec(), vec![2.0, 3.0]);
        assert_eq!(split.local_shard(3).unwrap().shape(), &[1, 2]);

        let broadcast = GlobalTensor::from_local(&x, placement_1d(), NdSbp::broadcast(1)).unwrap();
        assert!(broadcast.shards().iter().all(|shard| shard.to_vec() == x.to_vec()));

        let partial = GlobalTensor::from_local(&x, placement_1d(), NdSbp::new(vec![Sbp::partial_sum()])).unwrap();
        assert_eq!(partial.shards()[0].to_vec(), x.to_vec());
        assert_eq!(partial.shards()[2].to_vec(), vec![0.0; 8]);
    }

    #[test]
    fn test_global_tensor_round_trip_for_all_signatures() {
        let x = iota(vec![4, 4]);
        for nd_sbp in all_signatures() {
            let global = GlobalTensor::from_local(&x, placement_2d(), nd_sbp.clone()).unwrap();
            assert_eq!(global.to_local().to_vec(), x.to_vec(), "signature {nd_sbp}");
            assert_eq!(global.to_local().shape(), &[4, 4]);
        }
    }

    #[test]
    fn test_global_tensor_rejects_indivisible_splits() {
        let x = iota(vec![3]);
        assert!(matches!(
            GlobalTensor::from_local(&x, placement_1d(), NdSbp::new(vec![Sbp::split(0)])),
            Err(Error::ShardingError(_)),
        ));
    }

    #[test]
    fn test_global_tensor_ops_match_local_ops() {
        let x = iota(vec![4, 4]);
        let expected_sum = x.add_scalar(1.0).mul_scalar(2.0).sum().item();
        for nd_sbp in all_signatures() {
            let global = GlobalTensor::from_local(&x, placement_2d(), nd_sbp.clone()).unwrap();
            let y = global.add_scalar(1.0).mul_scalar(2.0);
            assert_eq!(y.to_local().to_vec(), x.add_scalar(1.0).mul_scalar(2.0).to_vec(), "signature {nd_sbp}");
            let total = y.sum().unwrap();
            assert_eq!(total.shape(), &[] as &[usize]);
            assert_eq!(total.to_local().item(), expected_sum, "signature {nd_sbp}");
        }
    }

    #[test]
    fn test_global_fill_matches_local_fill() {
        let x = iota(vec![4, 4]);
        for nd_sbp in all_signatures() {
            let global = GlobalTensor::from_local(&x, placement_2d(), nd_sbp.clone()).unwrap();
            let alias = global.view();
            global.fill_(3.0).unwrap();
            assert_eq!(global.to_local().to_vec(), vec![3.0; 16], "signature {nd_sbp}");
            assert_eq!(alias.to_local().to_vec(), vec![3.0; 16], "signature {nd_sbp}");
            assert!(alias.shares_storage(&global));
        }
    }

    #[test]
    fn test_global_fill_tensor() {
        let x = iota(vec![4]);
        let value = GlobalTensor::from_local(&Tensor::scalar(2.0, DataType::F64), placement_2d(), NdSbp::broadcast(2))
            .unwrap()
            .with_requires_grad(true)
            .unwrap();
        for nd_sbp in all_signatures().into_iter().filter(|nd_sbp| nd_sbp.hierarchy_axes_splitting(1).is_empty()) {
            let global = GlobalTensor::from_local(&x, placement_2d(), nd_sbp.clone()).unwrap();
            global.fill_tensor_(&value).unwrap();
            assert_eq!(global.to_local().to_vec(), vec![2.0; 4], "signature {nd_sbp}");
        }

        let y = GlobalTensor::from_local(&x, placement_2d(), NdSbp::new(vec![Sbp::split(0), Sbp::partial_sum()]))
            .unwrap()
            .with_requires_grad(true)
            .unwrap()
            .mul_scalar(1.0);
        value.shards().iter().for_each(Tensor::zero_grad);
        y.fill_tensor_(&value).unwrap();
        y.sum().unwrap().backward().unwrap();
        assert_eq!(value.grad().unwrap().to_local().item(), Some(4.0));
    }

    #[test]
    fn test_global_fill_tensor_validation() {
        let x = GlobalTensor::from_local(&iota(vec![4]), placement_2d(), NdSbp::broadcast(2)).unwrap();
        let scalar = Tensor::scalar(1.0, DataType::F64);

        let other_placement = GlobalTensor::from_local(&scalar, placement_1d(), NdSbp::broadcast(1)).unwrap();
        assert!(matches!(x.fill_tensor_(&other_placement), Err(Error::PlacementMismatch { .. })));

        let partial =
            GlobalTensor::from_local(&scalar, placement_2d(), NdSbp::new(vec![Sbp::broadcast(), Sbp::partial_sum()]))
                .unwrap();
        assert!(matches!(x.fill_tensor_(&partial), Err(Error::NotBroadcast { nd_sbp, .. }) if nd_sbp == "(B, P)"));

        let vector = GlobalTensor::from_local(&iota(vec![2]), placement_2d(), NdSbp::broadcast(2)).unwrap();
        assert!(matches!(x.fill_tensor_(&vector), Err(Error::NonScalarFillValue { .. })));
    }

    #[test]
    fn test_global_gradients_match_local_gradients() {
        let x = iota(vec![4, 4]);
        let local = x.deep_clone().with_requires_grad(true).unwrap();
        local.add_scalar(1.0).mul_scalar(3.0).sum().backward().unwrap();
        let expected = local.grad().unwrap().to_vec();

        for nd_sbp in all_signatures() {
            let global = GlobalTensor::from_local(&x, placement_2d(), nd_sbp.clone())
                .unwrap()
                .with_requires_grad(true)
                .unwrap();
            global.add_scalar(1.0).mul_scalar(3.0).sum().unwrap().backward().unwrap();
            let grad = global.grad().unwrap();
            assert_eq!(grad.nd_sbp(), &nd_sbp.dual());
            assert_eq!(grad.to_local().to_vec(), expected, "signature {nd_sbp}");
        }
    }

    #[test]
    fn test_global_fill_gradients_are_zero() {
        let x = iota(vec![4, 4]);
        for nd_sbp in all_signatures() {
            let global = GlobalTensor::from_local(&x, placement_2d(), nd_sbp.clone())
                .unwrap()
                .with_requires_grad(true)
                .unwrap();
            let y = global.add_scalar(1.0);
            y.fill_(5.0).unwrap();
            y.sum().unwrap().backward().unwrap();
            assert_eq!(global.grad().unwrap().to_local().to_vec(), vec![0.0; 16], "signature {nd_sbp}");
        }
    }

    #[test]
    fn test_global_backward_requires_scalar_with_history() {
        let global = GlobalTensor::from_local(&iota(vec![4]), placement_1d(), NdSbp::broadcast(1)).unwrap();
        assert!(matches!(global.backward(), Err(Error::NonScalarBackward { .. })));
        assert_eq!(global.sum().unwrap().backward(), Err(Error::BackwardWithoutGradient));
        assert!(global.grad().is_none());
    }

    #[test]
    fn test_global_to_global() {
        let x = iota(vec![4, 4]);
        let global = GlobalTensor::from_local(&x, placement_2d(), NdSbp::new(vec![Sbp::split(0), Sbp::partial_sum()]))
            .unwrap();
        let redistributed = global.to_global(placement_1d(), NdSbp::new(vec![Sbp::split(1)])).unwrap();
        assert_eq!(redistributed.shards()[0].shape(), &[4, 1]);
        assert_eq!(redistributed.to_local().to_vec(), x.to_vec());
        assert!(global.to_string().starts_with("global_tensor(shape=[4, 4], dtype=float64"));
    }
}
