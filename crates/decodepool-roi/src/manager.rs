//! Per-run generator sets.
//!
//! Every batch slot gets its own generator so crop randomness is
//! independent per position, and the set is kept for the lifetime of the
//! run so repeated batches continue the same random streams.

use std::sync::Arc;

use decodepool_core::{CropConfig, DecodeError, Result, RunId, RunRegistry};

use crate::generator::RandomRoiGenerator;

/// Ordered generators, one per batch slot.
#[derive(Debug)]
pub struct GeneratorSet {
    generators: Vec<Arc<RandomRoiGenerator>>,
    constraints: Option<CropConfig>,
}

impl GeneratorSet {
    /// Build `batch_size` independent generators. With a `seed`, slot `i`
    /// is seeded from `(seed, run_id, i)`; otherwise from OS entropy.
    pub fn new(
        run_id: RunId,
        batch_size: usize,
        constraints: Option<CropConfig>,
        seed: Option<u64>,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(DecodeError::InvalidConfig(
                "generator set needs a batch size of at least 1".into(),
            ));
        }

        let generators = (0..batch_size)
            .map(|slot| {
                let generator = match (constraints, seed) {
                    (None, _) => RandomRoiGenerator::unconstrained(),
                    (Some(cfg), Some(seed)) => {
                        RandomRoiGenerator::with_seed(cfg, slot_seed(seed, run_id, slot))?
                    }
                    (Some(cfg), None) => RandomRoiGenerator::new(cfg)?,
                };
                Ok(Arc::new(generator))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            generators,
            constraints,
        })
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&Arc<RandomRoiGenerator>> {
        self.generators.get(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RandomRoiGenerator>> {
        self.generators.iter()
    }

    /// Constraints fixed when the set was created.
    pub fn constraints(&self) -> Option<&CropConfig> {
        self.constraints.as_ref()
    }
}

/// Mixes the base seed, run and slot so neighbouring slots get unrelated
/// streams (splitmix64 finalizer).
fn slot_seed(seed: u64, run_id: RunId, slot: usize) -> u64 {
    let mut z = seed
        ^ run_id.0.rotate_left(17)
        ^ (slot as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Registry of generator sets keyed by run identifier.
///
/// Owned by the host layer and passed in by reference.
pub struct GeneratorManager {
    sets: RunRegistry<GeneratorSet>,
    seed: Option<u64>,
}

impl GeneratorManager {
    pub fn new() -> Self {
        Self {
            sets: RunRegistry::new(),
            seed: None,
        }
    }

    /// Manager whose generators are reproducible from `seed`.
    pub fn seeded(seed: u64) -> Self {
        Self {
            sets: RunRegistry::new(),
            seed: Some(seed),
        }
    }

    /// Generators for `run_id`, created on first call.
    ///
    /// Later calls return the cached set unchanged; `constraints` are fixed
    /// by the first call. A later batch may be smaller than the first (it
    /// uses the leading slots) but not larger.
    pub fn get_generators(
        &self,
        run_id: RunId,
        batch_size: usize,
        constraints: Option<CropConfig>,
    ) -> Result<Arc<GeneratorSet>> {
        let set = self.sets.get_or_try_create(run_id, || {
            let set = GeneratorSet::new(run_id, batch_size, constraints, self.seed)?;
            tracing::info!(
                run_id = %run_id,
                batch_size,
                crop = constraints.is_some(),
                "created ROI generator set"
            );
            Ok(set)
        })?;

        if batch_size > set.len() {
            return Err(DecodeError::InvalidInput(format!(
                "batch of {batch_size} exceeds the {} generators created for run {run_id}",
                set.len()
            )));
        }
        Ok(set)
    }

    /// Drop the generators for one run.
    pub fn remove(&self, run_id: RunId) -> Option<Arc<GeneratorSet>> {
        self.sets.remove(run_id)
    }

    /// Drop every run's generators.
    pub fn clear(&self) {
        self.sets.drain();
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

impl Default for GeneratorManager {
    fn default() -> Self {
        Self::new()
    }
}
