use crate::autograd::Node;
use crate::tensor::Tensor;

impl Tensor {
    /// Returns `self + value`, element-wise.
    pub fn add_scalar(&self, value: f64) -> Tensor {
        let values = self.values().iter().map(|element| element + value).collect();
        let output = Tensor::from_values(self.shape().to_vec(), values, self.data_type());
        if let Some(edge) = self.edge() {
            output.set_grad_fn(Node::add_scalar(edge));
        }
        output
    }

    /// Returns `self * factor`, element-wise.
    pub fn mul_scalar(&self, factor: f64) -> Tensor {
        let values = self.values().iter().map(|element| element * factor).collect();
        let output = Tensor::from_values(self.shape().to_vec(), values, self.data_type());
        if let Some(edge) = self.edge() {
            output.set_grad_fn(Node::mul_scalar(factor, edge));
        }
        output
    }

    /// Sums all elements into a rank-0 tensor.
    pub fn sum(&self) -> Tensor {
        let total = self.values().iter().sum::<f64>();
        let output = Tensor::from_values(Vec::new(), vec![total], self.data_type());
        if let Some(edge) = self.edge() {
            output.set_grad_fn(Node::sum(self.element_count(), edge));
        }
        output
    }
}
