pub mod generator;
pub mod manager;

pub use generator::{sample_roi, RandomRoiGenerator};
pub use manager::{GeneratorManager, GeneratorSet};
