pub mod error;
pub mod registry;
pub mod traits;
pub mod types;

pub use error::{DecodeError, Result, TaskFailure};
pub use registry::RunRegistry;
pub use traits::RoiSource;
pub use types::*;
