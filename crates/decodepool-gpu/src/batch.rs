use std::sync::OnceLock;

use decodepool_core::{DecodeError, Result};

use crate::buffer::Tensor;

/// Pre-sized output container for one batch.
///
/// Each slot is written at most once. Workers writing disjoint slots never
/// contend; a second write to the same slot is rejected.
pub struct TensorBatch {
    slots: Vec<OnceLock<Tensor>>,
}

impl TensorBatch {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| OnceLock::new()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Store the decoded tensor for `index`.
    pub fn set(&self, index: usize, tensor: Tensor) -> Result<()> {
        let slot = self.slots.get(index).ok_or(DecodeError::SlotOutOfRange {
            index,
            len: self.slots.len(),
        })?;
        slot.set(tensor)
            .map_err(|_| DecodeError::SlotOccupied { index })
    }

    pub fn get(&self, index: usize) -> Option<&Tensor> {
        self.slots.get(index).and_then(OnceLock::get)
    }

    pub fn is_filled(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|s| s.get().is_some()).count()
    }

    /// Check that `index` can be targeted by a task.
    pub fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.slots.len() {
            return Err(DecodeError::SlotOutOfRange {
                index,
                len: self.slots.len(),
            });
        }
        Ok(())
    }

    /// Every slot in order, `None` where nothing was written.
    pub fn into_slots(self) -> Vec<Option<Tensor>> {
        self.slots.into_iter().map(OnceLock::into_inner).collect()
    }

    /// All tensors in slot order. Fails on the first unset slot.
    pub fn into_tensors(self) -> Result<Vec<Tensor>> {
        self.slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.into_inner().ok_or(DecodeError::SlotUnset { index }))
            .collect()
    }
}

impl std::fmt::Debug for TensorBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorBatch")
            .field("len", &self.len())
            .field("filled", &self.filled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor() -> Tensor {
        Tensor::from_host(vec![0u8; 3], 1, 1).unwrap()
    }

    #[test]
    fn test_slot_written_once() {
        let batch = TensorBatch::new(2);
        batch.set(1, tensor()).unwrap();
        assert!(matches!(
            batch.set(1, tensor()),
            Err(DecodeError::SlotOccupied { index: 1 })
        ));
        assert!(matches!(
            batch.set(2, tensor()),
            Err(DecodeError::SlotOutOfRange { index: 2, len: 2 })
        ));
        assert_eq!(batch.filled(), 1);
    }

    #[test]
    fn test_into_tensors_reports_unset_slot() {
        let batch = TensorBatch::new(2);
        batch.set(0, tensor()).unwrap();
        assert!(matches!(
            batch.into_tensors(),
            Err(DecodeError::SlotUnset { index: 1 })
        ));

        let batch = TensorBatch::new(2);
        batch.set(1, tensor()).unwrap();
        batch.set(0, tensor()).unwrap();
        assert_eq!(batch.into_tensors().unwrap().len(), 2);
    }

    #[test]
    fn test_into_slots_keeps_gaps() {
        let batch = TensorBatch::new(3);
        batch.set(0, tensor()).unwrap();
        batch.set(2, tensor()).unwrap();
        let slots = batch.into_slots();
        assert_eq!(
            slots.iter().map(Option::is_some).collect::<Vec<_>>(),
            vec![true, false, true]
        );
    }
}
