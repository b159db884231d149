//! Random-resized-crop sampling.
//!
//! A crop is drawn by picking a target area fraction uniformly from the
//! area range and an aspect ratio uniformly in log space from the aspect
//! ratio range (so `r` and `1/r` are equally likely). The candidate is kept
//! when it fits inside the image; otherwise another pair is drawn, up to
//! `num_attempts` times. When every attempt misses, a centered crop is
//! returned whose aspect ratio is the image's own, clamped into the allowed
//! range, so sampling always terminates with a valid rectangle.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use decodepool_core::{CropConfig, Result, Roi, RoiSource};

/// Per-slot crop sampler with its own random state.
///
/// A generator built with [`RandomRoiGenerator::unconstrained`] never
/// produces a crop; `generate_random_roi` returns `None` for it.
pub struct RandomRoiGenerator {
    constraints: Option<CropConfig>,
    rng: Mutex<StdRng>,
    samples: AtomicU64,
}

impl RandomRoiGenerator {
    /// Generator seeded from OS entropy.
    pub fn new(config: CropConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_rng(Some(config), StdRng::from_entropy()))
    }

    /// Generator with a fixed seed, for reproducible crops.
    pub fn with_seed(config: CropConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_rng(Some(config), StdRng::seed_from_u64(seed)))
    }

    /// Generator that never requests a crop.
    pub fn unconstrained() -> Self {
        Self::with_rng(None, StdRng::seed_from_u64(0))
    }

    fn with_rng(constraints: Option<CropConfig>, rng: StdRng) -> Self {
        Self {
            constraints,
            rng: Mutex::new(rng),
            samples: AtomicU64::new(0),
        }
    }

    pub fn constraints(&self) -> Option<&CropConfig> {
        self.constraints.as_ref()
    }

    /// Draw a crop for a `width x height` image, or `None` when this
    /// generator has no constraints or the image is empty.
    pub fn generate_random_roi(&self, width: u32, height: u32) -> Option<Roi> {
        let config = self.constraints.as_ref()?;
        if width == 0 || height == 0 {
            return None;
        }
        self.samples.fetch_add(1, Ordering::Relaxed);
        let mut rng = self.rng.lock();
        Some(sample_roi(&mut *rng, width, height, config))
    }

    /// Number of crops drawn so far.
    pub fn samples_drawn(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

impl RoiSource for RandomRoiGenerator {
    fn sample(&self, image_width: u32, image_height: u32) -> Option<Roi> {
        self.generate_random_roi(image_width, image_height)
    }
}

impl std::fmt::Debug for RandomRoiGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomRoiGenerator")
            .field("constraints", &self.constraints)
            .field("samples", &self.samples_drawn())
            .finish()
    }
}

/// Sample one crop rectangle. `width` and `height` must be non-zero.
pub fn sample_roi<R: Rng + ?Sized>(rng: &mut R, width: u32, height: u32, config: &CropConfig) -> Roi {
    let image_area = width as f64 * height as f64;
    let log_min = (config.aspect_ratio.min as f64).ln();
    let log_max = (config.aspect_ratio.max as f64).ln();
    let area_min = config.area.min as f64;
    let area_max = config.area.max as f64;

    for _ in 0..config.num_attempts.max(1) {
        let target_area = image_area * rng.gen_range(area_min..=area_max);
        let ratio = rng.gen_range(log_min..=log_max).exp();

        let w = (target_area * ratio).sqrt().round();
        let h = (target_area / ratio).sqrt().round();
        if w < 1.0 || h < 1.0 || w > width as f64 || h > height as f64 {
            continue;
        }

        let (w, h) = (w as u32, h as u32);
        let x = rng.gen_range(0..=width - w);
        let y = rng.gen_range(0..=height - h);
        return Roi::new(x, y, w, h);
    }

    center_crop(width, height, config)
}

/// Centered crop with the image's aspect ratio clamped into the allowed range.
fn center_crop(width: u32, height: u32, config: &CropConfig) -> Roi {
    let in_ratio = width as f64 / height as f64;
    let min_ratio = config.aspect_ratio.min as f64;
    let max_ratio = config.aspect_ratio.max as f64;

    let (w, h) = if in_ratio < min_ratio {
        (width, ((width as f64 / min_ratio).round() as u32).clamp(1, height))
    } else if in_ratio > max_ratio {
        (((height as f64 * max_ratio).round() as u32).clamp(1, width), height)
    } else {
        (width, height)
    };

    Roi::new((width - w) / 2, (height - h) / 2, w, h)
}

#[cfg(test)]
mod tests {
    use decodepool_core::{AreaRange, AspectRatioRange};

    use super::*;

    fn config(ar: (f32, f32), area: (f32, f32)) -> CropConfig {
        CropConfig {
            aspect_ratio: AspectRatioRange::new(ar.0, ar.1).unwrap(),
            area: AreaRange::new(area.0, area.1).unwrap(),
            num_attempts: 10,
        }
    }

    #[test]
    fn test_roi_always_inside_image() {
        let mut rng = StdRng::seed_from_u64(7);
        let cfg = CropConfig::default();
        for &(w, h) in &[(1, 1), (1, 500), (500, 1), (3, 7), (224, 224), (1920, 1080)] {
            for _ in 0..200 {
                let roi = sample_roi(&mut rng, w, h, &cfg);
                assert!(roi.fits_within(w, h), "{roi:?} outside {w}x{h}");
            }
        }
    }

    #[test]
    fn test_extreme_ranges_terminate_with_valid_roi() {
        let mut rng = StdRng::seed_from_u64(1);
        // Aspect ratio far from any image shape forces the fallback.
        let cfg = config((50.0, 100.0), (0.9, 1.0));
        let roi = sample_roi(&mut rng, 100, 100, &cfg);
        assert!(roi.fits_within(100, 100));
        assert_eq!(roi.width, 100);
        assert_eq!(roi.height, 2);
        assert_eq!(roi.y, 49);
    }

    #[test]
    fn test_fallback_keeps_in_range_image_whole() {
        let cfg = config((0.5, 2.0), (1.0, 1.0));
        assert_eq!(center_crop(300, 200, &cfg), Roi::full(300, 200));
        // 4:1 image clamped to 2:1.
        assert_eq!(center_crop(400, 100, &cfg), Roi::new(100, 0, 200, 100));
        // 1:4 image clamped to 1:2.
        assert_eq!(center_crop(100, 400, &cfg), Roi::new(0, 100, 100, 200));
    }

    #[test]
    fn test_fixed_area_fraction() {
        let mut rng = StdRng::seed_from_u64(3);
        let cfg = config((0.75, 4.0 / 3.0), (0.5, 0.5));
        let (w, h) = (640u32, 480u32);
        let target = 0.5 * (w * h) as f64;
        for _ in 0..100 {
            let roi = sample_roi(&mut rng, w, h, &cfg);
            let rel = (roi.area() as f64 - target).abs() / target;
            assert!(rel < 0.01, "area {} too far from {target}", roi.area());
        }
    }

    #[test]
    fn test_unconstrained_generator_requests_no_crop() {
        let generator = RandomRoiGenerator::unconstrained();
        assert!(generator.generate_random_roi(100, 100).is_none());
        assert_eq!(generator.samples_drawn(), 0);
    }

    #[test]
    fn test_seeded_generators_are_reproducible() {
        let cfg = CropConfig::default();
        let a = RandomRoiGenerator::with_seed(cfg, 11).unwrap();
        let b = RandomRoiGenerator::with_seed(cfg, 11).unwrap();
        for _ in 0..20 {
            assert_eq!(a.generate_random_roi(640, 480), b.generate_random_roi(640, 480));
        }
        assert_eq!(a.samples_drawn(), 20);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = CropConfig::default();
        cfg.num_attempts = 0;
        assert!(RandomRoiGenerator::new(cfg).is_err());
    }
}
