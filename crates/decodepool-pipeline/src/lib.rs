pub mod config;
pub mod manager;
pub mod pipeline;
pub mod pool;
pub mod task;

pub use config::{HardwareBackend, PipelineConfig};
pub use manager::PoolManager;
pub use pipeline::{decode_random_crop, decode_random_crop_partial, PartialBatch, Registries};
pub use pool::{PoolState, PoolStats, ThreadPool};
pub use task::DecodeTask;
