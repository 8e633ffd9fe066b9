use thiserror::Error;

use crate::sharding::ShardingError;

#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    #[error("{0}")]
    ShardingError(#[from] ShardingError),

    #[error("shape {shape:?} holds {expected_count} element(s), but got {actual_count} value(s)")]
    ElementCountMismatch { shape: Vec<usize>, expected_count: usize, actual_count: usize },

    #[error("expected shape {expected:?} but got {actual:?}")]
    ShapeMismatch { expected: Vec<usize>, actual: Vec<usize> },

    #[error("cannot view a tensor with shape {from:?} as {to:?}")]
    InvalidView { from: Vec<usize>, to: Vec<usize> },

    #[error("fill value must be a rank-0 tensor, but got shape {shape:?}")]
    NonScalarFillValue { shape: Vec<usize> },

    #[error("a leaf tensor that requires grad cannot be used in an in-place operation")]
    InPlaceOnLeafRequiringGrad,

    #[error("in-place operations on views whose history requires grad are not supported")]
    InPlaceOnViewRequiringGrad,

    #[error("only leaf tensors can change their `requires_grad` flag")]
    RequiresGradOnNonLeaf,

    #[error("tensor does not require grad and has no gradient history")]
    BackwardWithoutGradient,

    #[error("implicit backward seeds are only defined for single-element outputs, but got shape {shape:?}")]
    NonScalarBackward { shape: Vec<usize> },

    #[error("'{operation}' expects operands on the same placement; got {expected} and {actual}")]
    PlacementMismatch { operation: String, expected: String, actual: String },

    #[error("'{operation}' expects an operand that is broadcast on every placement axis, but got {nd_sbp}")]
    NotBroadcast { operation: String, nd_sbp: String },
}
