pub mod config;
pub mod core;
pub mod utils;

pub use crate::core::gpu::{GpuMonitor, GpuSample, Metric};
pub use crate::core::job::{JobSnapshot, JobStatus};
pub use crate::core::quantize::QuantizationConfig;
pub use crate::core::service::{JobOptions, JobService};
pub use crate::core::storage::StorageService;
pub use crate::core::version;
