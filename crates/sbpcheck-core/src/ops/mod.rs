//! Eager operations on local [`Tensor`](crate::tensor::Tensor)s.
//!
//! Out-of-place operations return a new tensor and record a backward node when their input requires gradients.
//! In-place operations (the ones whose names end in `_`) mutate the storage of their receiver, bump its version, and
//! rebase its gradient history.

pub mod arithmetic;
pub mod fill;
