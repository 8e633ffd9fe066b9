pub use sbpcheck_core as core;
pub use sbpcheck_harness as harness;

pub mod cli;

pub use sbpcheck_core::errors::Error;
pub use sbpcheck_core::global::GlobalTensor;
pub use sbpcheck_core::sharding::{NdSbp, Placement, Sbp};
pub use sbpcheck_core::tensor::Tensor;
pub use sbpcheck_harness::config::HarnessConfig;
pub use sbpcheck_harness::registry::{RunSummary, TestRegistry};
pub use sbpcheck_harness::suites::default_registry;
