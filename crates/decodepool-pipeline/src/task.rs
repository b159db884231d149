use std::sync::Arc;

use decodepool_core::{MemorySpace, Result, RoiSource};
use decodepool_gpu::TensorBatch;

/// One image to decode into one output slot.
///
/// Immutable once built. The pool moves it to exactly one worker, which
/// drops it as soon as the decode returns.
#[derive(Clone)]
pub struct DecodeTask {
    data: Arc<[u8]>,
    out: Arc<TensorBatch>,
    index: usize,
    roi: Option<Arc<dyn RoiSource>>,
    space: MemorySpace,
}

impl DecodeTask {
    /// Fails if `index` is not a slot of `out`.
    pub fn new(
        data: Arc<[u8]>,
        out: Arc<TensorBatch>,
        index: usize,
        roi: Option<Arc<dyn RoiSource>>,
        space: MemorySpace,
    ) -> Result<Self> {
        out.check_index(index)?;
        Ok(Self {
            data,
            out,
            index,
            roi,
            space,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Encoded length in bytes, the scheduling weight.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn output(&self) -> &TensorBatch {
        &self.out
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn roi(&self) -> Option<&dyn RoiSource> {
        self.roi.as_deref()
    }

    pub fn space(&self) -> MemorySpace {
        self.space
    }
}

impl std::fmt::Debug for DecodeTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeTask")
            .field("bytes", &self.data.len())
            .field("index", &self.index)
            .field("crop", &self.roi.is_some())
            .field("space", &self.space)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_rejects_out_of_range_slot() {
        let out = Arc::new(TensorBatch::new(2));
        let data: Arc<[u8]> = Arc::from(vec![1u8, 2, 3]);
        assert!(DecodeTask::new(data.clone(), out.clone(), 1, None, MemorySpace::Host).is_ok());
        assert!(DecodeTask::new(data, out, 2, None, MemorySpace::Host).is_err());
    }

    #[test]
    fn test_len_is_encoded_size() {
        let out = Arc::new(TensorBatch::new(1));
        let task = DecodeTask::new(Arc::from(vec![0u8; 17]), out, 0, None, MemorySpace::Host).unwrap();
        assert_eq!(task.len(), 17);
        assert!(task.roi().is_none());
    }
}
