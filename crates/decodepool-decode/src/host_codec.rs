//! Host-emulated hardware JPEG codec.
//!
//! Behaves like a hardware JPEG engine from the decoder's point of view:
//! it accepts only what such an engine accepts (8-bit Huffman sequential
//! frames with gray, 4:4:4, 4:2:2 or 4:2:0 layouts), splits work into a
//! host phase that entropy-decodes into a rotating pinned-style staging slot
//! and a device phase that writes the ROI into the destination tensor.
//! Everything runs on the CPU, so it is always available and the tests use
//! it as the hardware path.

use image::ImageFormat;

use decodepool_core::{ChromaSubsampling, ImageInfo, MemoryPadding, Result, Roi, OUTPUT_CHANNELS};
use decodepool_gpu::{DeviceContext, HostStagingBuffer, StagingRing, Tensor};

use crate::codec::{CodecFactory, CodecStatus, DecodeParams, HardwareCodec};
use crate::jpeg::{probe_jpeg, FrameHeader};

/// Staging slots per codec; two is enough to keep image `n + 1`'s host
/// phase off the slot image `n`'s device phase reads.
const STAGING_SLOTS: usize = 2;

/// Host phase output waiting for the device phase.
#[derive(Debug, Clone, Copy)]
struct Staged {
    slot: usize,
    width: u32,
    height: u32,
    roi: Roi,
}

pub struct HostJpegCodec {
    staging: StagingRing<HostStagingBuffer>,
    staged: Option<Staged>,
    decoded: u64,
}

impl HostJpegCodec {
    pub fn new(padding: MemoryPadding) -> Result<Self> {
        let staging =
            StagingRing::try_from_fn(STAGING_SLOTS, |_| Ok(HostStagingBuffer::new(padding.host)))?;
        Ok(Self {
            staging,
            staged: None,
            decoded: 0,
        })
    }

    /// Images finished by the device phase.
    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    /// Slot the next host phase will fill.
    pub fn next_slot(&self) -> usize {
        self.staging.peek_index()
    }

    fn check_supported(frame: &FrameHeader) -> std::result::Result<(), CodecStatus> {
        if !frame.kind.is_sequential_huffman() {
            return Err(CodecStatus::Unsupported(format!(
                "{:?} frames",
                frame.kind
            )));
        }
        if frame.precision != 8 {
            return Err(CodecStatus::Unsupported(format!(
                "{}-bit sample precision",
                frame.precision
            )));
        }
        match frame.subsampling() {
            ChromaSubsampling::Gray
            | ChromaSubsampling::Css444
            | ChromaSubsampling::Css422
            | ChromaSubsampling::Css420 => Ok(()),
            other => Err(CodecStatus::Unsupported(format!(
                "chroma subsampling {other:?} with {} components",
                frame.components.len()
            ))),
        }
    }
}

impl HardwareCodec for HostJpegCodec {
    fn name(&self) -> &str {
        "host-jpeg"
    }

    fn image_info(&mut self, data: &[u8]) -> std::result::Result<ImageInfo, CodecStatus> {
        let frame = probe_jpeg(data)?;
        Self::check_supported(&frame)?;
        Ok(frame.image_info())
    }

    fn decode_host(
        &mut self,
        data: &[u8],
        params: &DecodeParams,
    ) -> std::result::Result<(), CodecStatus> {
        let frame = probe_jpeg(data)?;
        Self::check_supported(&frame)?;

        let roi = params.roi.unwrap_or(Roi::full(frame.width, frame.height));
        if !roi.fits_within(frame.width, frame.height) {
            return Err(CodecStatus::InvalidParameter(format!(
                "ROI {roi:?} outside {}x{} image",
                frame.width, frame.height
            )));
        }

        let rgb = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
            .map_err(|e| CodecStatus::ExecutionFailed(e.to_string()))?
            .to_rgb8();
        let (width, height) = rgb.dimensions();
        if (width, height) != (frame.width, frame.height) {
            return Err(CodecStatus::BadStream(format!(
                "frame header says {}x{}, scan decoded {width}x{height}",
                frame.width, frame.height
            )));
        }

        let pixels = rgb.as_raw();
        let (slot, buffer) = self.staging.advance();
        buffer.prepare(pixels.len()).copy_from_slice(pixels);
        self.staged = Some(Staged {
            slot,
            width,
            height,
            roi,
        });
        Ok(())
    }

    fn decode_device(
        &mut self,
        ctx: &DeviceContext,
        out: &mut Tensor,
    ) -> std::result::Result<(), CodecStatus> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| CodecStatus::InvalidParameter("device phase without host phase".into()))?;
        let Staged {
            slot,
            width,
            height: _,
            roi,
        } = staged;

        if out.shape() != [roi.height as usize, roi.width as usize, OUTPUT_CHANNELS] {
            return Err(CodecStatus::InvalidParameter(format!(
                "output shape {:?} does not match ROI {}x{}",
                out.shape(),
                roi.width,
                roi.height
            )));
        }
        let source = self
            .staging
            .get(slot)
            .ok_or_else(|| CodecStatus::Internal(format!("staging slot {slot} missing")))?
            .as_slice();

        let src_pitch = width as usize * OUTPUT_CHANNELS;
        let row_len = roi.width as usize * OUTPUT_CHANNELS;
        let rows = (roi.y..roi.bottom()).map(|row| {
            let start = row as usize * src_pitch + roi.x as usize * OUTPUT_CHANNELS;
            &source[start..start + row_len]
        });

        match out.host_data_mut() {
            Some(dst) => {
                for (dst_row, src_row) in dst.chunks_exact_mut(row_len).zip(rows) {
                    dst_row.copy_from_slice(src_row);
                }
            }
            None => {
                let packed: Vec<u8> = rows.flatten().copied().collect();
                out.copy_from_host(ctx, &packed)
                    .map_err(|e| CodecStatus::ExecutionFailed(e.to_string()))?;
            }
        }

        self.decoded += 1;
        Ok(())
    }
}

impl std::fmt::Debug for HostJpegCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostJpegCodec")
            .field("staging_slots", &self.staging.len())
            .field("next_slot", &self.next_slot())
            .field("decoded", &self.decoded)
            .finish()
    }
}

/// Builds one [`HostJpegCodec`] per worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostJpegCodecFactory;

impl CodecFactory for HostJpegCodecFactory {
    fn name(&self) -> &str {
        "host-jpeg"
    }

    fn create(&self, _ctx: &DeviceContext, padding: MemoryPadding) -> Result<Box<dyn HardwareCodec>> {
        Ok(Box::new(HostJpegCodec::new(padding)?))
    }
}
