use std::sync::Arc;

use decodepool_core::{DecodeError, Result, RoiSource, RunId};
use decodepool_gpu::{Tensor, TensorBatch};
use decodepool_roi::GeneratorManager;

use crate::config::PipelineConfig;
use crate::manager::PoolManager;
use crate::task::DecodeTask;

/// Pool and generator registries owned by the caller's host layer.
pub struct Registries {
    pub pools: PoolManager,
    pub generators: GeneratorManager,
}

impl Registries {
    pub fn new(pools: PoolManager, generators: GeneratorManager) -> Self {
        Self { pools, generators }
    }

    /// Registries using `config`'s hardware backend and crop seed.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let generators = match config.seed {
            Some(seed) => GeneratorManager::seeded(seed),
            None => GeneratorManager::new(),
        };
        Ok(Self::new(PoolManager::new(config.backend.factory()?), generators))
    }

    /// Tear down one run's pool and generators.
    pub fn remove(&self, run_id: RunId) {
        self.pools.remove(run_id);
        self.generators.remove(run_id);
    }

    pub fn shutdown_all(&self) {
        self.pools.shutdown_all();
        self.generators.clear();
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new(PoolManager::default(), GeneratorManager::new())
    }
}

impl Drop for Registries {
    fn drop(&mut self) {
        self.pools.shutdown_all();
    }
}

/// Outcome of a batch where some images may have failed.
#[derive(Debug)]
pub struct PartialBatch {
    /// One entry per input; `None` for inputs that could not be decoded.
    pub tensors: Vec<Option<Tensor>>,
    /// The aggregate failure report, when any task failed.
    pub error: Option<DecodeError>,
}

impl PartialBatch {
    pub fn decoded(&self) -> usize {
        self.tensors.iter().filter(|t| t.is_some()).count()
    }

    /// Indices of the inputs without an output.
    pub fn failed_slots(&self) -> Vec<usize> {
        self.tensors
            .iter()
            .enumerate()
            .filter_map(|(index, t)| t.is_none().then_some(index))
            .collect()
    }

    /// All tensors, or the batch error if any task failed.
    pub fn into_result(self) -> Result<Vec<Tensor>> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.tensors
            .into_iter()
            .enumerate()
            .map(|(index, t)| t.ok_or(DecodeError::SlotUnset { index }))
            .collect()
    }
}

/// Decode a batch, randomly cropping each image with its slot's generator.
///
/// The pool and generators for `run_id` are created on first use from
/// `config` and reused afterwards. Output `i` corresponds to `inputs[i]`
/// whatever order the tasks ran in. Batches for one run must not overlap.
///
/// Fails as a whole if any image fails; see [`decode_random_crop_partial`]
/// to keep the images that did decode.
pub fn decode_random_crop(
    registries: &Registries,
    inputs: &[Arc<[u8]>],
    run_id: RunId,
    config: &PipelineConfig,
) -> Result<Vec<Tensor>> {
    decode_random_crop_partial(registries, inputs, run_id, config)?.into_result()
}

/// Like [`decode_random_crop`], but task failures are reported next to the
/// successfully decoded slots instead of replacing them.
///
/// Errors that stop the batch from running at all (invalid config, pool
/// creation, a shut-down pool) are still returned as `Err`.
pub fn decode_random_crop_partial(
    registries: &Registries,
    inputs: &[Arc<[u8]>],
    run_id: RunId,
    config: &PipelineConfig,
) -> Result<PartialBatch> {
    config.validate()?;
    if inputs.is_empty() {
        return Ok(PartialBatch {
            tensors: Vec::new(),
            error: None,
        });
    }

    let pool = registries.pools.get_pool(
        run_id,
        config.num_threads,
        config.local_rank,
        config.host_memory_padding,
        config.device_memory_padding,
    )?;
    let generators = match config.crop_config()? {
        Some(crop) => Some(
            registries
                .generators
                .get_generators(run_id, inputs.len(), Some(crop))?,
        ),
        None => None,
    };

    let out = Arc::new(TensorBatch::new(inputs.len()));
    for (index, data) in inputs.iter().enumerate() {
        let roi = generators
            .as_ref()
            .and_then(|set| set.get(index))
            .map(|generator| generator.clone() as Arc<dyn RoiSource>);
        let task = DecodeTask::new(data.clone(), out.clone(), index, roi, config.output_space)?;
        pool.add_task(task)?;
    }

    let error = match pool.run_all(true, config.sort_by_length) {
        Ok(()) => None,
        Err(e @ DecodeError::Batch { .. }) => Some(e),
        Err(e) => return Err(e),
    };

    let out = Arc::try_unwrap(out).map_err(|_| {
        DecodeError::InvalidInput("output batch still referenced after the batch completed".into())
    })?;
    Ok(PartialBatch {
        tensors: out.into_slots(),
        error,
    })
}
