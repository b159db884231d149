use std::sync::Arc;

use decodepool_core::{MemoryPadding, Result, RunId, RunRegistry};
use decodepool_decode::CodecFactory;
use decodepool_gpu::{DeviceContext, DeviceContextConfig};

use crate::pool::ThreadPool;

/// Registry of decode pools keyed by run identifier.
///
/// A pool is created on the first request for a run and reused, with its
/// original parameters, for every later request.
pub struct PoolManager {
    pools: RunRegistry<ThreadPool>,
    factory: Option<Arc<dyn CodecFactory>>,
}

impl PoolManager {
    /// Pools whose decoders use `factory` for the hardware stage.
    pub fn new(factory: Option<Arc<dyn CodecFactory>>) -> Self {
        Self {
            pools: RunRegistry::new(),
            factory,
        }
    }

    pub fn get_pool(
        &self,
        run_id: RunId,
        num_threads: usize,
        local_rank: usize,
        host_padding: usize,
        device_padding: usize,
    ) -> Result<Arc<ThreadPool>> {
        self.pools.get_or_try_create(run_id, || {
            let ctx = DeviceContext::new(DeviceContextConfig {
                device_ordinal: local_rank,
                require_device: false,
            })?;
            let pool = ThreadPool::new(
                num_threads,
                Arc::new(ctx),
                self.factory.clone(),
                MemoryPadding {
                    host: host_padding,
                    device: device_padding,
                },
            )?;
            tracing::info!(run_id = %run_id, num_threads, local_rank, "created decode pool");
            Ok(pool)
        })
    }

    /// The pool for `run_id`, if one was created.
    pub fn pool(&self, run_id: RunId) -> Option<Arc<ThreadPool>> {
        self.pools.get(run_id)
    }

    /// Shut down and forget the pool for one run.
    pub fn remove(&self, run_id: RunId) -> bool {
        match self.pools.remove(run_id) {
            Some(pool) => {
                pool.shutdown();
                true
            }
            None => false,
        }
    }

    /// Shut down every pool.
    pub fn shutdown_all(&self) {
        for pool in self.pools.drain() {
            pool.shutdown();
        }
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new(Some(Arc::new(decodepool_decode::HostJpegCodecFactory)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolState;

    #[test]
    fn test_same_run_reuses_pool_and_ignores_new_parameters() {
        let manager = PoolManager::default();
        let first = manager.get_pool(RunId(1), 2, 0, 0, 0).unwrap();
        let second = manager.get_pool(RunId(1), 5, 0, 1 << 20, 0).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.num_threads(), 2);
    }

    #[test]
    fn test_failed_creation_is_not_cached() {
        let manager = PoolManager::new(None);
        assert!(manager.get_pool(RunId(2), 0, 0, 0, 0).is_err());
        assert!(manager.pool(RunId(2)).is_none());
        assert_eq!(manager.get_pool(RunId(2), 1, 0, 0, 0).unwrap().num_threads(), 1);
    }

    #[test]
    fn test_remove_and_shutdown_all() {
        let manager = PoolManager::new(None);
        let a = manager.get_pool(RunId(1), 1, 0, 0, 0).unwrap();
        let b = manager.get_pool(RunId(2), 1, 0, 0, 0).unwrap();
        assert_eq!(manager.len(), 2);

        assert!(manager.remove(RunId(1)));
        assert!(!manager.remove(RunId(1)));
        assert_eq!(a.state(), PoolState::ShutDown);

        manager.shutdown_all();
        assert_eq!(b.state(), PoolState::ShutDown);
        assert!(manager.is_empty());
    }
}
