pub mod batch;
pub mod buffer;
pub mod context;
pub mod memory;

pub use batch::TensorBatch;
pub use buffer::Tensor;
pub use context::{DeviceContext, DeviceContextConfig};
pub use memory::{HostStagingBuffer, StagingRing};
