//! Per-thread decoder.
//!
//! Every image goes through at most three stages:
//!
//! ```text
//!   Probe ──Probed──▶ Hardware ──Decoded──▶ done (hardware)
//!     │                  │
//!     └──Retry──┐  ┌─Retry┘
//!               ▼  ▼
//!             Software ──Decoded──▶ done (software)
//!                  └─────Failed───▶ abort (both paths failed)
//! ```
//!
//! Each stage returns an [`Outcome`]; [`transition`] maps the current stage
//! and its outcome to the next step, so the fallback policy lives in one
//! table instead of being spread over nested error handling.

use std::sync::Arc;

use thiserror::Error;

use decodepool_core::{DecodeError, ImageInfo, MemoryPadding, MemorySpace, Result, RoiSource};
use decodepool_gpu::{DeviceContext, Tensor, TensorBatch};

use crate::codec::{CodecFactory, CodecStatus, DecodeParams, HardwareCodec};
use crate::image::SoftwareDecoder;

/// Which path produced an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodePath {
    Hardware,
    Software,
}

impl DecodePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodePath::Hardware => "hardware",
            DecodePath::Software => "software",
        }
    }
}

/// Why an image left the hardware path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FallbackReason {
    #[error("no hardware codec configured")]
    NoHardwareCodec,

    #[error("probe failed: {0}")]
    Probe(CodecStatus),

    #[error("host phase failed: {0}")]
    HostPhase(CodecStatus),

    #[error("codec cannot write {0} output")]
    OutputSpace(MemorySpace),

    #[error("output allocation failed: {0}")]
    Allocation(String),

    #[error("device phase failed: {0}")]
    DevicePhase(CodecStatus),
}

impl FallbackReason {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FallbackReason::NoHardwareCodec => "no_codec",
            FallbackReason::Probe(status) => status.label(),
            FallbackReason::HostPhase(status) => status.label(),
            FallbackReason::OutputSpace(_) => "unsupported_output",
            FallbackReason::Allocation(_) => "allocation",
            FallbackReason::DevicePhase(status) => status.label(),
        }
    }
}

#[derive(Debug)]
enum Stage {
    Probe,
    Hardware(ImageInfo),
    Software(FallbackReason),
}

#[derive(Debug)]
enum Outcome {
    Probed(ImageInfo),
    Decoded(Tensor),
    Retry(FallbackReason),
    Failed(DecodeError),
}

#[derive(Debug)]
enum Transition {
    Next(Stage),
    Done(Tensor, DecodePath),
    Abort(DecodeError),
}

fn transition(index: usize, stage: &Stage, outcome: Outcome) -> Transition {
    match (stage, outcome) {
        (Stage::Probe, Outcome::Probed(info)) => Transition::Next(Stage::Hardware(info)),
        (Stage::Probe | Stage::Hardware(_), Outcome::Retry(reason)) => {
            Transition::Next(Stage::Software(reason))
        }
        (Stage::Hardware(_), Outcome::Decoded(tensor)) => {
            Transition::Done(tensor, DecodePath::Hardware)
        }
        (Stage::Software(_), Outcome::Decoded(tensor)) => {
            Transition::Done(tensor, DecodePath::Software)
        }
        (Stage::Software(reason), Outcome::Failed(err)) => {
            Transition::Abort(DecodeError::BothPathsFailed {
                index,
                hardware: reason.to_string(),
                software: err.to_string(),
            })
        }
        (_, Outcome::Failed(err)) => Transition::Abort(err),
        (stage, outcome) => Transition::Abort(DecodeError::Codec(format!(
            "unexpected {outcome:?} in stage {stage:?}"
        ))),
    }
}

/// Per-decoder counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub hardware_decoded: u64,
    pub software_decoded: u64,
    pub fallbacks: u64,
    pub failed: u64,
}

/// Decodes one image at a time, owned by exactly one worker thread.
pub struct Decoder {
    ctx: Arc<DeviceContext>,
    hardware: Option<Box<dyn HardwareCodec>>,
    software: SoftwareDecoder,
    stats: DecoderStats,
}

impl Decoder {
    /// Create the decoder for the calling thread. A codec that cannot be
    /// created is fatal for this worker; `factory = None` decodes
    /// everything in software.
    pub fn new(
        ctx: Arc<DeviceContext>,
        factory: Option<&dyn CodecFactory>,
        padding: MemoryPadding,
    ) -> Result<Self> {
        ctx.bind_to_thread()?;
        let hardware = factory
            .map(|factory| factory.create(&ctx, padding))
            .transpose()?;

        tracing::debug!(
            codec = hardware.as_ref().map(|c| c.name()).unwrap_or("none"),
            host_padding = padding.host,
            device_padding = padding.device,
            "decoder ready"
        );

        Ok(Self {
            ctx,
            hardware,
            software: SoftwareDecoder::new(),
            stats: DecoderStats::default(),
        })
    }

    pub fn has_hardware(&self) -> bool {
        self.hardware.is_some()
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Decode `data` into `out[index]`, cropped when `roi` yields a
    /// rectangle, placed in `space`.
    ///
    /// The slot is always written on success. An error means both paths
    /// failed or the slot itself was unusable.
    pub fn run(
        &mut self,
        data: &[u8],
        out: &TensorBatch,
        index: usize,
        roi: Option<&dyn RoiSource>,
        space: MemorySpace,
    ) -> Result<DecodePath> {
        out.check_index(index)?;

        let mut stage = Stage::Probe;
        loop {
            let outcome = match &stage {
                Stage::Probe => self.probe(data),
                Stage::Hardware(info) => self.decode_hardware(data, *info, roi, space),
                Stage::Software(_) => self.decode_software(data, roi, space),
            };

            match transition(index, &stage, outcome) {
                Transition::Next(next) => {
                    if let Stage::Software(reason) = &next {
                        self.stats.fallbacks += 1;
                        metrics::counter!(
                            "decodepool_hardware_fallback_total",
                            "reason" => reason.label()
                        )
                        .increment(1);
                        tracing::debug!(index, bytes = data.len(), %reason, "falling back to software decode");
                    }
                    stage = next;
                }
                Transition::Done(tensor, path) => {
                    out.set(index, tensor)?;
                    match path {
                        DecodePath::Hardware => self.stats.hardware_decoded += 1,
                        DecodePath::Software => self.stats.software_decoded += 1,
                    }
                    metrics::counter!("decodepool_images_decoded_total", "path" => path.as_str())
                        .increment(1);
                    return Ok(path);
                }
                Transition::Abort(err) => {
                    self.stats.failed += 1;
                    return Err(err);
                }
            }
        }
    }

    fn probe(&mut self, data: &[u8]) -> Outcome {
        let Some(codec) = self.hardware.as_mut() else {
            return Outcome::Retry(FallbackReason::NoHardwareCodec);
        };
        match codec.image_info(data) {
            Ok(info) => Outcome::Probed(info),
            Err(status) => Outcome::Retry(FallbackReason::Probe(status)),
        }
    }

    fn decode_hardware(
        &mut self,
        data: &[u8],
        info: ImageInfo,
        roi: Option<&dyn RoiSource>,
        space: MemorySpace,
    ) -> Outcome {
        let Some(codec) = self.hardware.as_mut() else {
            return Outcome::Retry(FallbackReason::NoHardwareCodec);
        };
        if !codec.supports_output(space) {
            return Outcome::Retry(FallbackReason::OutputSpace(space));
        }

        let params = DecodeParams {
            roi: roi.and_then(|source| source.sample(info.width(), info.height())),
        };
        let (width, height) = params
            .roi
            .map(|r| (r.width, r.height))
            .unwrap_or((info.width(), info.height()));

        let mut tensor = match Tensor::alloc(&self.ctx, space, height, width) {
            Ok(tensor) => tensor,
            Err(e) => return Outcome::Retry(FallbackReason::Allocation(e.to_string())),
        };
        if let Err(status) = codec.decode_host(data, &params) {
            return Outcome::Retry(FallbackReason::HostPhase(status));
        }
        if let Err(status) = codec.decode_device(&self.ctx, &mut tensor) {
            return Outcome::Retry(FallbackReason::DevicePhase(status));
        }
        Outcome::Decoded(tensor)
    }

    fn decode_software(
        &self,
        data: &[u8],
        roi: Option<&dyn RoiSource>,
        space: MemorySpace,
    ) -> Outcome {
        match self.software.decode_random_crop(&self.ctx, data, roi, space) {
            Ok(tensor) => Outcome::Decoded(tensor),
            Err(e) => Outcome::Failed(e),
        }
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("device", &self.ctx.device_ordinal())
            .field("hardware", &self.hardware.as_ref().map(|c| c.name()))
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use decodepool_core::{ChromaSubsampling, MAX_COMPONENTS};

    use super::*;

    fn info() -> ImageInfo {
        ImageInfo {
            components: 3,
            subsampling: ChromaSubsampling::Css420,
            widths: [8; MAX_COMPONENTS],
            heights: [8; MAX_COMPONENTS],
        }
    }

    fn tensor() -> Tensor {
        Tensor::from_host(vec![0u8; 3], 1, 1).unwrap()
    }

    #[test]
    fn test_probe_success_moves_to_hardware() {
        let next = transition(0, &Stage::Probe, Outcome::Probed(info()));
        assert!(matches!(next, Transition::Next(Stage::Hardware(_))));
    }

    #[test]
    fn test_retry_moves_to_software() {
        let reason = FallbackReason::Probe(CodecStatus::BadStream("x".into()));
        let from_probe = transition(0, &Stage::Probe, Outcome::Retry(reason.clone()));
        assert!(matches!(from_probe, Transition::Next(Stage::Software(r)) if r == reason));

        let from_hw = transition(
            0,
            &Stage::Hardware(info()),
            Outcome::Retry(FallbackReason::DevicePhase(CodecStatus::ExecutionFailed("y".into()))),
        );
        assert!(matches!(from_hw, Transition::Next(Stage::Software(_))));
    }

    #[test]
    fn test_decoded_reports_path() {
        let hw = transition(0, &Stage::Hardware(info()), Outcome::Decoded(tensor()));
        assert!(matches!(hw, Transition::Done(_, DecodePath::Hardware)));

        let sw = transition(
            0,
            &Stage::Software(FallbackReason::NoHardwareCodec),
            Outcome::Decoded(tensor()),
        );
        assert!(matches!(sw, Transition::Done(_, DecodePath::Software)));
    }

    #[test]
    fn test_software_failure_reports_both_stages() {
        let next = transition(
            4,
            &Stage::Software(FallbackReason::HostPhase(CodecStatus::Unsupported("cmyk".into()))),
            Outcome::Failed(DecodeError::ImageDecode("corrupt".into())),
        );
        match next {
            Transition::Abort(DecodeError::BothPathsFailed {
                index,
                hardware,
                software,
            }) => {
                assert_eq!(index, 4);
                assert!(hardware.contains("cmyk"));
                assert!(software.contains("corrupt"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_software_stage_never_retries() {
        let next = transition(
            0,
            &Stage::Software(FallbackReason::NoHardwareCodec),
            Outcome::Retry(FallbackReason::NoHardwareCodec),
        );
        assert!(matches!(next, Transition::Abort(_)));
    }

    #[test]
    fn test_bad_slot_fails_before_decoding() {
        let ctx = Arc::new(DeviceContext::host_only());
        let mut decoder = Decoder::new(ctx, None, MemoryPadding::default()).unwrap();
        let out = TensorBatch::new(1);
        let err = decoder
            .run(b"whatever", &out, 3, None, MemorySpace::Host)
            .unwrap_err();
        assert!(matches!(err, DecodeError::SlotOutOfRange { index: 3, len: 1 }));
        assert_eq!(decoder.stats(), DecoderStats::default());
    }
}
