use crate::autograd::Node;
use crate::errors::Error;
use crate::tensor::Tensor;

impl Tensor {
    /// Overwrites every element of this tensor with `value` (cast to the tensor's data type), in place.
    ///
    /// The tensor keeps its identity and shape, so handles and views taken before the fill observe the new values.
    /// If the tensor requires gradients, its history is rebased onto a fill node, through which the gradient with
    /// respect to the previous value is zero.
    ///
    /// Fails with [`Error::InPlaceOnLeafRequiringGrad`] on leaves that require gradients, and with
    /// [`Error::InPlaceOnViewRequiringGrad`] on views whose history requires gradients.
    pub fn fill_(&self, value: f64) -> Result<(), Error> {
        self.check_in_place()?;
        self.write_values(|_| value);
        if self.requires_grad() {
            self.set_grad_fn(Node::fill(self.element_count(), self.edge(), None));
        }
        Ok(())
    }

    /// Overwrites every element of this tensor with the single element of the rank-0 tensor `value`, in place.
    ///
    /// Behaves like [`Tensor::fill_`], except that gradients also flow into `value`: its gradient is the sum of the
    /// gradient of the filled tensor.
    pub fn fill_tensor_(&self, value: &Tensor) -> Result<(), Error> {
        if value.ndim() != 0 {
            return Err(Error::NonScalarFillValue { shape: value.shape().to_vec() });
        }
        let fill_value = value.item().ok_or_else(|| Error::NonScalarFillValue { shape: value.shape().to_vec() })?;
        self.check_in_place()?;
        self.write_values(|_| fill_value);
        if self.requires_grad() || value.requires_grad() {
            self.set_grad_fn(Node::fill(self.element_count(), self.edge(), value.edge()));
        }
        Ok(())
    }

    fn check_in_place(&self) -> Result<(), Error> {
        if !self.requires_grad() {
            return Ok(());
        }
        if self.is_leaf() {
            return Err(Error::InPlaceOnLeafRequiringGrad);
        }
        if self.is_view() {
            return Err(Error::InPlaceOnViewRequiringGrad);
        }
        Ok(())
    }
}
