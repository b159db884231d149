use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, Result};

/// Output images are always interleaved RGB.
pub const OUTPUT_CHANNELS: usize = 3;

/// Maximum number of components a JPEG frame header may declare.
pub const MAX_COMPONENTS: usize = 4;

/// Integer crop rectangle in pixel coordinates of the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The rectangle covering a whole `width x height` image.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Non-empty and fully inside a `width x height` image.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x as u64 + self.width as u64 <= width as u64
            && self.y as u64 + self.height as u64 <= height as u64
    }
}

/// Allowed crop aspect ratios, expressed as `width / height`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AspectRatioRange {
    pub min: f32,
    pub max: f32,
}

impl AspectRatioRange {
    pub fn new(min: f32, max: f32) -> Result<Self> {
        let range = Self { min, max };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.min.is_finite() && self.max.is_finite()) || self.min <= 0.0 || self.min > self.max
        {
            return Err(DecodeError::InvalidConfig(format!(
                "aspect ratio range must satisfy 0 < min <= max, got [{}, {}]",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

impl Default for AspectRatioRange {
    fn default() -> Self {
        Self {
            min: 3.0 / 4.0,
            max: 4.0 / 3.0,
        }
    }
}

/// Allowed crop area, as a fraction of the source image area.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AreaRange {
    pub min: f32,
    pub max: f32,
}

impl AreaRange {
    pub fn new(min: f32, max: f32) -> Result<Self> {
        let range = Self { min, max };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.min.is_finite() && self.max.is_finite())
            || self.min <= 0.0
            || self.min > self.max
            || self.max > 1.0
        {
            return Err(DecodeError::InvalidConfig(format!(
                "area range must satisfy 0 < min <= max <= 1, got [{}, {}]",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

impl Default for AreaRange {
    fn default() -> Self {
        Self { min: 0.08, max: 1.0 }
    }
}

/// Constraints for random-resized-crop sampling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropConfig {
    pub aspect_ratio: AspectRatioRange,
    pub area: AreaRange,
    /// Resampling attempts before falling back to a centered crop.
    pub num_attempts: u32,
}

impl CropConfig {
    pub fn validate(&self) -> Result<()> {
        self.aspect_ratio.validate()?;
        self.area.validate()?;
        if self.num_attempts == 0 {
            return Err(DecodeError::InvalidConfig(
                "num_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            aspect_ratio: AspectRatioRange::default(),
            area: AreaRange::default(),
            num_attempts: 10,
        }
    }
}

/// Where a decoded tensor lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySpace {
    #[default]
    Host,
    /// Device memory on the given ordinal.
    Device(usize),
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySpace::Host => write!(f, "host"),
            MemorySpace::Device(ordinal) => write!(f, "device:{ordinal}"),
        }
    }
}

/// Pre-reservation hints for codec staging memory, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryPadding {
    pub host: usize,
    pub device: usize,
}

/// Opaque identifier grouping repeated batch invocations that share a pool
/// and a generator set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub u64);

impl RunId {
    /// Stable id for one program instance: the same inputs always hash to
    /// the same id, within and across processes.
    pub fn derive(mode: &str, num_threads: usize, op_name: &str, local_rank: usize) -> Self {
        let mut hash = Fnv64::new();
        hash.write(mode.as_bytes());
        hash.write(&[0xff]);
        hash.write(&(num_threads as u64).to_le_bytes());
        hash.write(op_name.as_bytes());
        hash.write(&[0xff]);
        hash.write(&(local_rank as u64).to_le_bytes());
        RunId(hash.finish())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// FNV-1a, 64-bit.
struct Fnv64(u64);

impl Fnv64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    fn new() -> Self {
        Self(Self::OFFSET)
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::PRIME);
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

/// Chroma layout reported by a JPEG header probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChromaSubsampling {
    Css444,
    Css422,
    Css420,
    Css440,
    Css411,
    Css410,
    Gray,
    Unknown,
}

/// Result of parsing just an image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub components: u8,
    pub subsampling: ChromaSubsampling,
    /// Per-component widths; only the first `components` entries are valid.
    pub widths: [u32; MAX_COMPONENTS],
    pub heights: [u32; MAX_COMPONENTS],
}

impl ImageInfo {
    /// Full-resolution width (component 0).
    pub fn width(&self) -> u32 {
        self.widths[0]
    }

    /// Full-resolution height (component 0).
    pub fn height(&self) -> u32 {
        self.heights[0]
    }
}

/// Decoded pixels held in host memory before placement in a tensor.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl RawImage {
    /// Copy out a sub-rectangle. The ROI must fit within the image.
    pub fn crop(&self, roi: &Roi) -> RawImage {
        let channels = self.channels as usize;
        let src_stride = self.width as usize * channels;
        let row_len = roi.width as usize * channels;
        let mut data = Vec::with_capacity(row_len * roi.height as usize);
        for row in roi.y..roi.bottom() {
            let start = row as usize * src_stride + roi.x as usize * channels;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }
        RawImage {
            data,
            width: roi.width,
            height: roi.height,
            channels: self.channels,
        }
    }
}
