use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::types::RunId;

type Entry<T> = Arc<Mutex<Option<Arc<T>>>>;

/// Look-up-or-create cache keyed by run identifier.
///
/// The map lock is only held long enough to find or insert a run's entry.
/// Creation happens under the entry's own lock, so concurrent first calls
/// for one run produce exactly one value while other runs proceed freely.
pub struct RunRegistry<T> {
    entries: Mutex<HashMap<RunId, Entry<T>>>,
}

impl<T> RunRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached value for `run_id`, creating it with `create` on
    /// first use. A failed creation leaves nothing cached.
    pub fn get_or_try_create<F>(&self, run_id: RunId, create: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        let entry = self.entries.lock().entry(run_id).or_default().clone();

        let mut slot = entry.lock();
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }
        let created = Arc::new(create()?);
        *slot = Some(created.clone());
        Ok(created)
    }

    /// The cached value, without creating one.
    pub fn get(&self, run_id: RunId) -> Option<Arc<T>> {
        let entry = self.entries.lock().get(&run_id).cloned()?;
        let slot = entry.lock();
        slot.clone()
    }

    /// Forget `run_id`, returning its value if one was created.
    pub fn remove(&self, run_id: RunId) -> Option<Arc<T>> {
        let entry = self.entries.lock().remove(&run_id)?;
        let mut slot = entry.lock();
        slot.take()
    }

    /// Forget every run, returning the created values.
    pub fn drain(&self) -> Vec<Arc<T>> {
        let entries: Vec<_> = self.entries.lock().drain().map(|(_, e)| e).collect();
        entries.into_iter().filter_map(|e| e.lock().take()).collect()
    }

    /// Number of runs with a created value.
    pub fn len(&self) -> usize {
        let entries: Vec<_> = self.entries.lock().values().cloned().collect();
        entries.iter().filter(|e| e.lock().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for RunRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Barrier};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::error::DecodeError;

    #[test]
    fn test_same_run_returns_same_instance() {
        let registry = RunRegistry::new();
        let a = registry.get_or_try_create(RunId(1), || Ok(5u32)).unwrap();
        let b = registry.get_or_try_create(RunId(1), || Ok(7u32)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b, 5);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_failed_creation_is_not_cached() {
        let registry: RunRegistry<u32> = RunRegistry::new();
        let err = registry.get_or_try_create(RunId(9), || {
            Err(DecodeError::InvalidConfig("bad".into()))
        });
        assert!(err.is_err());
        assert!(registry.get(RunId(9)).is_none());
        assert_eq!(*registry.get_or_try_create(RunId(9), || Ok(1)).unwrap(), 1);
    }

    #[test]
    fn test_concurrent_first_calls_create_once() {
        let registry = Arc::new(RunRegistry::new());
        let created = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let created = created.clone();
                thread::spawn(move || {
                    registry
                        .get_or_try_create(RunId(42), || {
                            created.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(10));
                            Ok(String::from("pool"))
                        })
                        .unwrap()
                })
            })
            .collect();

        let values: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(values.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_slow_creation_does_not_block_other_runs() {
        let registry = Arc::new(RunRegistry::new());
        let entered = Arc::new(Barrier::new(2));
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let slow = {
            let registry = registry.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                registry
                    .get_or_try_create(RunId(1), || {
                        entered.wait();
                        release_rx.recv().unwrap();
                        Ok(1u32)
                    })
                    .unwrap()
            })
        };
        entered.wait();

        // Run 1 is mid-creation; run 2 must still be served.
        let (done_tx, done_rx) = mpsc::channel();
        let other = {
            let registry = registry.clone();
            thread::spawn(move || {
                let value = registry.get_or_try_create(RunId(2), || Ok(2u32)).unwrap();
                let missing = registry.get(RunId(3));
                done_tx.send((*value, missing.is_none())).unwrap();
            })
        };
        let served = done_rx.recv_timeout(Duration::from_secs(5));

        release_tx.send(()).unwrap();
        assert_eq!(*slow.join().unwrap(), 1);
        other.join().unwrap();
        assert_eq!(served.unwrap(), (2, true));
    }

    #[test]
    fn test_remove_and_drain() {
        let registry = RunRegistry::new();
        registry.get_or_try_create(RunId(1), || Ok(1u8)).unwrap();
        registry.get_or_try_create(RunId(2), || Ok(2u8)).unwrap();
        assert_eq!(registry.remove(RunId(1)).as_deref(), Some(&1));
        assert_eq!(registry.drain().len(), 1);
        assert!(registry.is_empty());
    }
}
