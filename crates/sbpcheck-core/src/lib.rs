pub mod autograd;
pub mod errors;
pub mod global;
pub mod ops;
pub mod sharding;
pub mod tensor;
pub mod types;

pub use errors::Error;
pub use global::GlobalTensor;
pub use sharding::{DeviceType, NdSbp, Placement, PlacementRank, Rank, Sbp, ShardingError, ShardingLayout};
pub use tensor::Tensor;
pub use types::DataType;
