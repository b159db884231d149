use thiserror::Error;

use decodepool_core::{ImageInfo, MemoryPadding, MemorySpace, Result, Roi};
use decodepool_gpu::{DeviceContext, Tensor};

/// Status reported by a hardware codec call.
///
/// Any non-success status sends the image to the software path; it is
/// never surfaced to the caller on its own.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecStatus {
    #[error("bad bitstream: {0}")]
    BadStream(String),

    #[error("not supported by the hardware path: {0}")]
    Unsupported(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("codec internal error: {0}")]
    Internal(String),
}

impl CodecStatus {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            CodecStatus::BadStream(_) => "bad_stream",
            CodecStatus::Unsupported(_) => "unsupported",
            CodecStatus::InvalidParameter(_) => "invalid_parameter",
            CodecStatus::AllocationFailed(_) => "allocation_failed",
            CodecStatus::ExecutionFailed(_) => "execution_failed",
            CodecStatus::Internal(_) => "internal",
        }
    }
}

/// Per-image decode parameters. Output is always interleaved RGB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeParams {
    /// Crop applied during decode. `None` decodes the whole image.
    pub roi: Option<Roi>,
}

/// A two-phase hardware image decoder.
///
/// One instance belongs to one worker thread. Implementations own their
/// staging resources and alternate between (at least) two host staging
/// slots, so `decode_host` for image `n` never overwrites the slot
/// `decode_device` is still consuming for image `n - 1`.
pub trait HardwareCodec: Send {
    /// Human-readable name for tracing.
    fn name(&self) -> &str;

    /// Whether `decode_device` can write a tensor placed in `space`.
    /// Checked before any decoding work is done for an image.
    fn supports_output(&self, space: MemorySpace) -> bool {
        let _ = space;
        true
    }

    /// Parse just the header.
    fn image_info(&mut self, data: &[u8]) -> std::result::Result<ImageInfo, CodecStatus>;

    /// Host phase: parse the stream and entropy-decode into the next
    /// staging slot.
    fn decode_host(
        &mut self,
        data: &[u8],
        params: &DecodeParams,
    ) -> std::result::Result<(), CodecStatus>;

    /// Device phase: transfer the slot filled by the last `decode_host` and
    /// finish decoding into `out`, which is already sized for the output.
    fn decode_device(
        &mut self,
        ctx: &DeviceContext,
        out: &mut Tensor,
    ) -> std::result::Result<(), CodecStatus>;
}

/// Creates one codec per worker thread.
pub trait CodecFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Failure here is fatal for the worker being started.
    fn create(&self, ctx: &DeviceContext, padding: MemoryPadding) -> Result<Box<dyn HardwareCodec>>;
}
