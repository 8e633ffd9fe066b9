//! Reverse-mode differentiation for [`Tensor`]s.
//!
//! Every operation applied to a tensor that requires gradients attaches a [`Node`] to its output. A node records the
//! [`BackwardOp`] needed to map the gradient of the output to gradients of the inputs, along with one [`Edge`] per
//! input. Edges either point at another node or at a leaf tensor, where gradients are accumulated.
//!
//! In-place operations do not mutate existing nodes. Instead, they *rebase* the mutated tensor onto a new node whose
//! first input is the tensor's previous history.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::errors::Error;
use crate::tensor::Tensor;

#[derive(Debug, Default)]
pub(crate) struct AutogradMeta {
    pub(crate) requires_grad: bool,
    pub(crate) grad: Option<Tensor>,
    pub(crate) grad_fn: Option<Rc<Node>>,
}

#[derive(Clone, Debug)]
pub(crate) enum Edge {
    Leaf(Tensor),
    Interior(Rc<Node>),
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum BackwardOp {
    AddScalar,
    MulScalar { factor: f64 },
    Sum { input_count: usize },
    View,
    /// Fill of `input_count` elements, optionally with a tensor-valued fill value (second input).
    Fill { input_count: usize },
}

impl BackwardOp {
    /// Maps the gradient of the output to one gradient per input.
    fn apply(&self, grad: &[f64]) -> Vec<Vec<f64>> {
        match self {
            Self::AddScalar | Self::View => vec![grad.to_vec()],
            Self::MulScalar { factor } => vec![grad.iter().map(|value| value * factor).collect()],
            Self::Sum { input_count } => vec![vec![grad.iter().sum(); *input_count]],
            Self::Fill { input_count } => vec![vec![0.0; *input_count], vec![grad.iter().sum()]],
        }
    }
}

#[derive(Debug)]
pub(crate) struct Node {
    op: BackwardOp,
    inputs: Vec<Option<Edge>>,
}

impl Node {
    pub(crate) fn add_scalar(input: Edge) -> Self {
        Self { op: BackwardOp::AddScalar, inputs: vec![Some(input)] }
    }

    pub(crate) fn mul_scalar(factor: f64, input: Edge) -> Self {
        Self { op: BackwardOp::MulScalar { factor }, inputs: vec![Some(input)] }
    }

    pub(crate) fn sum(input_count: usize, input: Edge) -> Self {
        Self { op: BackwardOp::Sum { input_count }, inputs: vec![Some(input)] }
    }

    pub(crate) fn view(input: Edge) -> Self {
        Self { op: BackwardOp::View, inputs: vec![Some(input)] }
    }

    pub(crate) fn fill(input_count: usize, previous: Option<Edge>, value: Option<Edge>) -> Self {
        Self { op: BackwardOp::Fill { input_count }, inputs: vec![previous, value] }
    }

    #[cfg(test)]
    pub(crate) fn op(&self) -> &BackwardOp {
        &self.op
    }
}

impl Tensor {
    /// Computes gradients of this single-element tensor with respect to every leaf it depends on, using an implicit
    /// seed of `1`.
    pub fn backward(&self) -> Result<(), Error> {
        if self.element_count() != 1 {
            return Err(Error::NonScalarBackward { shape: self.shape().to_vec() });
        }
        run_backward(self, vec![1.0])
    }

    /// Computes gradients with respect to every leaf this tensor depends on, seeding the pass with `grad`.
    pub fn backward_with(&self, grad: &Tensor) -> Result<(), Error> {
        if grad.shape() != self.shape() {
            return Err(Error::ShapeMismatch { expected: self.shape().to_vec(), actual: grad.shape().to_vec() });
        }
        run_backward(self, grad.to_vec())
    }
}

fn run_backward(root: &Tensor, seed: Vec<f64>) -> Result<(), Error> {
    let root_node = match root.edge() {
        None => return Err(Error::BackwardWithoutGradient),
        Some(Edge::Leaf(leaf)) => return leaf.accumulate_grad(seed),
        Some(Edge::Interior(node)) => node,
    };

    let mut pending = HashMap::<*const Node, Vec<f64>>::new();
    pending.insert(Rc::as_ptr(&root_node), seed);
    for node in topological_order(&root_node) {
        let Some(grad) = pending.remove(&Rc::as_ptr(&node)) else {
            continue;
        };
        for (edge, input_grad) in node.inputs.iter().zip(node.op.apply(grad.as_slice())) {
            match edge {
                None => {}
                Some(Edge::Leaf(leaf)) => leaf.accumulate_grad(input_grad)?,
                Some(Edge::Interior(input)) => match pending.get_mut(&Rc::as_ptr(input)) {
                    Some(accumulated) => accumulated.iter_mut().zip(input_grad).for_each(|(lhs, rhs)| *lhs += rhs),
                    None => {
                        pending.insert(Rc::as_ptr(input), input_grad);
                    }
                },
            }
        }
    }
    Ok(())
}

/// Orders the nodes reachable from `root` so that every node precedes the nodes it depends on.
fn topological_order(root: &Rc<Node>) -> Vec<Rc<Node>> {
    let mut visited = HashSet::<*const Node>::new();
    let mut post_order = Vec::new();
    let mut stack = vec![(root.clone(), false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            post_order.push(node);
            continue;
        }
        if !visited.insert(Rc::as_ptr(&node)) {
            continue;
        }
        stack.push((node.clone(), true));
        for edge in node.inputs.iter().flatten() {
            if let Edge::Interior(input) = edge {
                if !visited.contains(&Rc::as_ptr(input)) {
                    stack.push((input.clone(), false));
                }
            }
        }
    }
    post_order.reverse();
    post_order
}
