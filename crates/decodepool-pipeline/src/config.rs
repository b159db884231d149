use std::sync::Arc;

use serde::{Deserialize, Serialize};

use decodepool_core::{
    AreaRange, AspectRatioRange, CropConfig, DecodeError, MemorySpace, Result,
};
use decodepool_decode::{CodecFactory, HostJpegCodecFactory};

/// Which codec backs the hardware stage of each worker's decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HardwareBackend {
    /// Host-emulated JPEG engine, always available.
    #[default]
    Host,
    /// nvJPEG hybrid backend. Needs the `nvjpeg` feature and a device.
    NvJpeg,
    /// No hardware stage; every image is decoded in software.
    None,
}

impl HardwareBackend {
    pub fn factory(&self) -> Result<Option<Arc<dyn CodecFactory>>> {
        match self {
            HardwareBackend::Host => Ok(Some(Arc::new(HostJpegCodecFactory))),
            HardwareBackend::NvJpeg => nvjpeg_factory(),
            HardwareBackend::None => Ok(None),
        }
    }
}

#[cfg(feature = "nvjpeg")]
fn nvjpeg_factory() -> Result<Option<Arc<dyn CodecFactory>>> {
    Ok(Some(Arc::new(decodepool_decode::NvJpegCodecFactory)))
}

#[cfg(not(feature = "nvjpeg"))]
fn nvjpeg_factory() -> Result<Option<Arc<dyn CodecFactory>>> {
    Err(DecodeError::InvalidConfig(
        "nvjpeg backend requested but this build has no nvjpeg support".into(),
    ))
}

/// Everything a caller supplies for one decode-and-crop run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker threads per pool.
    pub num_threads: usize,
    /// Device index the pool binds to.
    pub local_rank: usize,
    /// Extra pinned staging bytes reserved by each decoder.
    pub host_memory_padding: usize,
    /// Extra device staging bytes reserved by each decoder.
    pub device_memory_padding: usize,

    // Crop sampling.
    pub aspect_ratio_min: f32,
    pub aspect_ratio_max: f32,
    pub area_min: f32,
    pub area_max: f32,
    pub num_attempts: u32,
    /// Request random crops at all. `false` decodes full images.
    pub crop: bool,

    /// Dispatch larger encoded images first.
    pub sort_by_length: bool,
    /// Where decoded tensors are placed.
    pub output_space: MemorySpace,
    pub backend: HardwareBackend,
    /// Fixed seed for the crop generators; `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let crop = CropConfig::default();
        Self {
            num_threads: 2,
            local_rank: 0,
            host_memory_padding: 0,
            device_memory_padding: 0,
            aspect_ratio_min: crop.aspect_ratio.min,
            aspect_ratio_max: crop.aspect_ratio.max,
            area_min: crop.area.min,
            area_max: crop.area.max,
            num_attempts: crop.num_attempts,
            crop: true,
            sort_by_length: true,
            output_space: MemorySpace::Host,
            backend: HardwareBackend::default(),
            seed: None,
        }
    }
}

impl PipelineConfig {
    /// Decode only, no crop generators.
    pub fn no_crop() -> Self {
        Self {
            crop: false,
            ..Self::default()
        }
    }

    /// Random-resized-crop ranges used for ImageNet-style training input.
    pub fn imagenet_train() -> Self {
        Self {
            num_threads: 4,
            ..Self::default()
        }
    }

    /// Crop constraints, or `None` when cropping is off.
    pub fn crop_config(&self) -> Result<Option<CropConfig>> {
        if !self.crop {
            return Ok(None);
        }
        let config = CropConfig {
            aspect_ratio: AspectRatioRange::new(self.aspect_ratio_min, self.aspect_ratio_max)?,
            area: AreaRange::new(self.area_min, self.area_max)?,
            num_attempts: self.num_attempts,
        };
        config.validate()?;
        Ok(Some(config))
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(DecodeError::InvalidConfig(
                "num_threads must be at least 1".into(),
            ));
        }
        if let MemorySpace::Device(ordinal) = self.output_space {
            if ordinal != self.local_rank {
                return Err(DecodeError::InvalidConfig(format!(
                    "output device {ordinal} differs from local rank {}",
                    self.local_rank
                )));
            }
        }
        self.crop_config()?;
        Ok(())
    }
}
