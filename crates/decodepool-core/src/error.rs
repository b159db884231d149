use std::fmt;

use thiserror::Error;

use crate::types::MemorySpace;

/// Top-level error type for the decode pipeline.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("CUDA error: {0}")]
    Cuda(String),

    /// Hardware codec handle or state could not be created. Fatal for the
    /// worker that owns the codec.
    #[error("hardware codec error: {0}")]
    Codec(String),

    #[error("image decode error: {0}")]
    ImageDecode(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} memory requested but this build has no device support")]
    DeviceUnavailable(MemorySpace),

    #[error("decode pool has been shut down")]
    PoolShutDown,

    #[error("output slot {index} out of range for a batch of {len}")]
    SlotOutOfRange { index: usize, len: usize },

    #[error("output slot {index} was written twice")]
    SlotOccupied { index: usize },

    #[error("output slot {index} was never written")]
    SlotUnset { index: usize },

    #[error("decode failed for slot {index}: hardware path: {hardware}; software path: {software}")]
    BothPathsFailed {
        index: usize,
        hardware: String,
        software: String,
    },

    #[error("decode task for slot {index} panicked: {message}")]
    TaskPanicked { index: usize, message: String },

    #[error("{} of {total} decode tasks failed{}", .failures.len(), first_failure(.failures))]
    Batch {
        failures: Vec<TaskFailure>,
        total: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    /// Slot indices that failed, if this is a batch failure.
    pub fn failed_slots(&self) -> Vec<usize> {
        match self {
            DecodeError::Batch { failures, .. } => failures.iter().map(|f| f.index).collect(),
            DecodeError::BothPathsFailed { index, .. }
            | DecodeError::TaskPanicked { index, .. } => vec![*index],
            _ => Vec::new(),
        }
    }
}

/// One task's failure inside a batch.
#[derive(Debug)]
pub struct TaskFailure {
    pub index: usize,
    pub error: DecodeError,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}: {}", self.index, self.error)
    }
}

fn first_failure(failures: &[TaskFailure]) -> String {
    failures
        .first()
        .map(|f| format!(" (first: {f})"))
        .unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, DecodeError>;
