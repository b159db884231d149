use std::sync::atomic::{AtomicU64, Ordering};

use decodepool_core::{DecodeError, Result};

static STAGING_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Alignment for staging allocations (256 bytes covers all codec requirements).
const STAGING_ALIGN: usize = 256;

fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Fixed-size ring of staging resources, handed out in rotation.
///
/// A decoder with two slots uses slot `n % 2` for its `n`-th image, so the
/// host-side work for one image never overwrites the buffer the device may
/// still be reading for the previous one.
#[derive(Debug)]
pub struct StagingRing<T> {
    slots: Vec<T>,
    next: usize,
}

impl<T> StagingRing<T> {
    pub fn new(slots: Vec<T>) -> Result<Self> {
        if slots.is_empty() {
            return Err(DecodeError::InvalidConfig(
                "staging ring needs at least one slot".into(),
            ));
        }
        Ok(Self { slots, next: 0 })
    }

    /// Build a ring of `count` slots with `make(i)`.
    pub fn try_from_fn(count: usize, mut make: impl FnMut(usize) -> Result<T>) -> Result<Self> {
        let slots = (0..count).map(&mut make).collect::<Result<Vec<_>>>()?;
        Self::new(slots)
    }

    /// Take the next slot and advance the rotation. Returns the slot index too.
    pub fn advance(&mut self) -> (usize, &mut T) {
        let index = self.next;
        self.next = (self.next + 1) % self.slots.len();
        (index, &mut self.slots[index])
    }

    /// Index the next call to `advance` will return.
    pub fn peek_index(&self) -> usize {
        self.next
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut()
    }
}

/// Reusable host-side staging memory.
///
/// Grows in 256-byte aligned steps and never shrinks, so a decoder that has
/// seen its largest image stops reallocating. `padding` bytes are reserved
/// on top of every growth.
#[derive(Debug)]
pub struct HostStagingBuffer {
    id: u64,
    data: Vec<u8>,
    len: usize,
    padding: usize,
    reallocations: u64,
}

impl HostStagingBuffer {
    pub fn new(padding: usize) -> Self {
        let id = STAGING_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let capacity = align_up(padding, STAGING_ALIGN);
        Self {
            id,
            data: vec![0u8; capacity],
            len: 0,
            padding,
            reallocations: 0,
        }
    }

    /// Resize the live region to `len` bytes, growing storage if needed.
    /// Contents are unspecified after a resize.
    pub fn prepare(&mut self, len: usize) -> &mut [u8] {
        if len > self.data.len() {
            let new_capacity = align_up(len + self.padding, STAGING_ALIGN);
            self.data.resize(new_capacity, 0);
            self.reallocations += 1;

            tracing::trace!(
                staging_id = self.id,
                capacity = new_capacity,
                "grew host staging buffer"
            );
        }
        self.len = len;
        &mut self.data[..len]
    }

    /// The live region written by the last `prepare`.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of times storage had to grow.
    pub fn reallocations(&self) -> u64 {
        self.reallocations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_rotates() {
        let mut ring = StagingRing::new(vec!['a', 'b']).unwrap();
        assert_eq!(*ring.advance().1, 'a');
        assert_eq!(*ring.advance().1, 'b');
        let (index, slot) = ring.advance();
        assert_eq!((index, *slot), (0, 'a'));
        assert!(StagingRing::<u8>::new(Vec::new()).is_err());
    }

    #[test]
    fn test_staging_grows_aligned_and_keeps_capacity() {
        let mut buf = HostStagingBuffer::new(1000);
        assert_eq!(buf.capacity(), 1024);

        buf.prepare(500);
        assert_eq!(buf.reallocations(), 0);

        buf.prepare(2000);
        assert_eq!(buf.len(), 2000);
        assert_eq!(buf.capacity(), align_up(3000, STAGING_ALIGN));
        assert_eq!(buf.reallocations(), 1);

        buf.prepare(10);
        assert_eq!(buf.as_slice().len(), 10);
        assert_eq!(buf.capacity(), align_up(3000, STAGING_ALIGN));
    }
}
