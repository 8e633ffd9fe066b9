use std::fmt::Display;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// Element type of a tensor.
///
/// Tensor values are always stored as `f64`, but every value that enters a tensor (at construction time or through
/// an in-place fill) is first rounded into the domain of the tensor's [`DataType`] using [`DataType::cast`]. This
/// means that, for example, an `F16` tensor can only ever hold values that are exactly representable as `f16`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    F16,
    BF16,
    #[default]
    F32,
    F64,
    I32,
    I64,
}

impl DataType {
    /// Returns `true` for the floating-point data types.
    pub fn is_floating_point(self) -> bool {
        matches!(self, Self::F16 | Self::BF16 | Self::F32 | Self::F64)
    }

    /// Size of one element of this type, in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            Self::F16 | Self::BF16 => 2,
            Self::F32 | Self::I32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }

    /// Rounds `value` into the domain of this type. Integer types truncate toward zero and saturate at their
    /// bounds (`NaN` becomes `0`).
    pub fn cast(self, value: f64) -> f64 {
        match self {
            Self::F16 => f16::from_f64(value).to_f64(),
            Self::BF16 => bf16::from_f64(value).to_f64(),
            Self::F32 => value as f32 as f64,
            Self::F64 => value,
            Self::I32 => value as i32 as f64,
            Self::I64 => value as i64 as f64,
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::F16 => write!(f, "float16"),
            Self::BF16 => write!(f, "bfloat16"),
            Self::F32 => write!(f, "float32"),
            Self::F64 => write!(f, "float64"),
            Self::I32 => write!(f, "int32"),
            Self::I64 => write!(f, "int64"),
        }
    }
}
