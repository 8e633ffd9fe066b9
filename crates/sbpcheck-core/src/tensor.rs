use std::cell::{Ref, RefCell};
use std::fmt::Display;
use std::rc::Rc;

use crate::autograd::{AutogradMeta, Edge, Node};
use crate::errors::Error;
use crate::types::DataType;

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Flat row-major element buffer that may be shared by several tensors (a base tensor and its views).
#[derive(Debug)]
pub(crate) struct Storage {
    values: Vec<f64>,
    version: u64,
}

impl Storage {
    fn new(values: Vec<f64>) -> Self {
        Self { values, version: 0 }
    }
}

#[derive(Debug)]
struct TensorInner {
    shape: Vec<usize>,
    data_type: DataType,
    storage: Rc<RefCell<Storage>>,
    is_view: bool,
    autograd: RefCell<AutogradMeta>,
}

// ---------------------------------------------------------------------------
// Tensor
// ---------------------------------------------------------------------------

/// Dense, eagerly evaluated tensor living on a single (simulated) device.
///
/// A [`Tensor`] is a handle: cloning it yields another handle to the *same* tensor, so in-place operations through
/// one handle are observed through all of them. Use [`Tensor::deep_clone`] to obtain an independent copy.
///
/// Tensors also carry the metadata needed for reverse-mode differentiation. Leaf tensors may be marked with
/// [`Tensor::with_requires_grad`], operations on tensors that require gradients record a backward graph, and
/// [`Tensor::backward`] accumulates gradients into the [`Tensor::grad`] of every leaf that the output depends on.
#[derive(Clone, Debug)]
pub struct Tensor {
    inner: Rc<TensorInner>,
}

impl Tensor {
    /// Creates a tensor from row-major `values`. Every value is cast to `data_type`.
    pub fn from_vec(shape: Vec<usize>, values: Vec<f64>, data_type: DataType) -> Result<Self, Error> {
        let expected_count = shape.iter().product::<usize>();
        if values.len() != expected_count {
            return Err(Error::ElementCountMismatch { shape, expected_count, actual_count: values.len() });
        }
        Ok(Self::from_values(shape, values, data_type))
    }

    /// Same as [`Tensor::from_vec`] for callers that already know that `values` matches `shape`.
    pub(crate) fn from_values(shape: Vec<usize>, values: Vec<f64>, data_type: DataType) -> Self {
        let values = values.into_iter().map(|value| data_type.cast(value)).collect();
        Self::from_storage(shape, data_type, Rc::new(RefCell::new(Storage::new(values))), false)
    }

    /// Creates a tensor filled with zeros.
    pub fn zeros(shape: Vec<usize>, data_type: DataType) -> Self {
        Self::full(shape, 0.0, data_type)
    }

    /// Creates a tensor filled with `value` (after casting it to `data_type`).
    pub fn full(shape: Vec<usize>, value: f64, data_type: DataType) -> Self {
        let count = shape.iter().product::<usize>();
        let values = vec![data_type.cast(value); count];
        Self::from_storage(shape, data_type, Rc::new(RefCell::new(Storage::new(values))), false)
    }

    /// Creates a rank-0 tensor holding `value`.
    pub fn scalar(value: f64, data_type: DataType) -> Self {
        Self::full(Vec::new(), value, data_type)
    }

    fn from_storage(shape: Vec<usize>, data_type: DataType, storage: Rc<RefCell<Storage>>, is_view: bool) -> Self {
        Self {
            inner: Rc::new(TensorInner {
                shape,
                data_type,
                storage,
                is_view,
                autograd: RefCell::new(AutogradMeta::default()),
            }),
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.inner.shape.as_slice()
    }

    pub fn ndim(&self) -> usize {
        self.inner.shape.len()
    }

    pub fn element_count(&self) -> usize {
        self.inner.shape.iter().product()
    }

    pub fn data_type(&self) -> DataType {
        self.inner.data_type
    }

    /// Copies the elements of this tensor out, in row-major order.
    pub fn to_vec(&self) -> Vec<f64> {
        self.inner.storage.borrow().values.clone()
    }

    /// Returns the single element of a one-element tensor.
    pub fn item(&self) -> Option<f64> {
        let storage = self.inner.storage.borrow();
        match storage.values.as_slice() {
            [value] => Some(*value),
            _ => None,
        }
    }

    /// Number of in-place modifications made to the storage of this tensor (shared with its views).
    pub fn version(&self) -> u64 {
        self.inner.storage.borrow().version
    }

    /// Returns `true` if `self` and `other` are views of the same storage.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.inner.storage, &other.inner.storage)
    }

    /// Returns `true` if `self` and `other` are handles to the same tensor.
    pub fn is_same(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_view(&self) -> bool {
        self.inner.is_view
    }

    /// Copies this tensor into fresh storage. The copy has no gradient history and does not require gradients.
    pub fn deep_clone(&self) -> Self {
        let values = self.to_vec();
        Self::from_storage(
            self.inner.shape.clone(),
            self.inner.data_type,
            Rc::new(RefCell::new(Storage::new(values))),
            false,
        )
    }

    /// Returns a view of this tensor with the same shape.
    pub fn view(&self) -> Self {
        self.view_as(self.inner.shape.clone())
    }

    /// Returns a view of this tensor with a different shape holding the same number of elements.
    pub fn reshape(&self, shape: Vec<usize>) -> Result<Self, Error> {
        if shape.iter().product::<usize>() != self.element_count() {
            return Err(Error::InvalidView { from: self.inner.shape.clone(), to: shape });
        }
        Ok(self.view_as(shape))
    }

    fn view_as(&self, shape: Vec<usize>) -> Self {
        let view = Self::from_storage(shape, self.inner.data_type, self.inner.storage.clone(), true);
        if let Some(edge) = self.edge() {
            view.set_grad_fn(Node::view(edge));
        }
        view
    }

    // ----- Gradient metadata -----

    /// Returns `true` if gradients flow into this tensor, i.e., it is a leaf that was marked as requiring gradients
    /// or it was computed from one.
    pub fn requires_grad(&self) -> bool {
        let autograd = self.inner.autograd.borrow();
        autograd.requires_grad || autograd.grad_fn.is_some()
    }

    /// Returns `true` if this tensor has no gradient history.
    pub fn is_leaf(&self) -> bool {
        self.inner.autograd.borrow().grad_fn.is_none()
    }

    /// Marks this leaf tensor as requiring gradients (or not).
    pub fn with_requires_grad(self, requires_grad: bool) -> Result<Self, Error> {
        if !self.is_leaf() {
            return Err(Error::RequiresGradOnNonLeaf);
        }
        self.inner.autograd.borrow_mut().requires_grad = requires_grad;
        Ok(self)
    }

    /// Gradient accumulated into this leaf by previous backward passes, if any.
    pub fn grad(&self) -> Option<Tensor> {
        self.inner.autograd.borrow().grad.clone()
    }

    /// Clears the accumulated gradient of this tensor.
    pub fn zero_grad(&self) {
        self.inner.autograd.borrow_mut().grad = None;
    }

    pub(crate) fn grad_fn(&self) -> Option<Rc<Node>> {
        self.inner.autograd.borrow().grad_fn.clone()
    }

    pub(crate) fn set_grad_fn(&self, node: Node) {
        self.inner.autograd.borrow_mut().grad_fn = Some(Rc::new(node));
    }

    /// Edge through which gradients reach this tensor, or `None` if it does not require gradients.
    pub(crate) fn edge(&self) -> Option<Edge> {
        let autograd = self.inner.autograd.borrow();
        match &autograd.grad_fn {
            Some(node) => Some(Edge::Interior(node.clone())),
            None if autograd.requires_grad => Some(Edge::Leaf(self.clone())),
            None => None,
        }
    }

    pub(crate) fn accumulate_grad(&self, values: Vec<f64>) -> Result<(), Error> {
        let mut autograd = self.inner.autograd.borrow_mut();
        let values = match &autograd.grad {
            Some(grad) => grad.to_vec().into_iter().zip(values).map(|(lhs, rhs)| lhs + rhs).collect(),
            None => values,
        };
        let grad = Tensor::from_vec(self.inner.shape.clone(), values, self.inner.data_type)?;
        autograd.grad = Some(grad);
        Ok(())
    }

    // ----- Storage access -----

    pub(crate) fn values(&self) -> Ref<'_, [f64]> {
        Ref::map(self.inner.storage.borrow(), |storage| storage.values.as_slice())
    }

    /// Overwrites every element of the underlying storage with `f(index)` and bumps the storage version.
    pub(crate) fn write_values<F: FnMut(usize) -> f64>(&self, mut f: F) {
        let data_type = self.inner.data_type;
        let mut storage = self.inner.storage.borrow_mut();
        for (index, value) in storage.values.iter_mut().enumerate() {
            *value = data_type.cast(f(index));
        }
        storage.version += 1;
    }
}

impl Display for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tensor(shape={:?}, dtype={}, values={:?})", self.shape(), self.data_type(), self.values())
    }
}
