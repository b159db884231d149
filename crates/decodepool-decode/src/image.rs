use decodepool_core::{DecodeError, MemorySpace, RawImage, Result, RoiSource, OUTPUT_CHANNELS};
use decodepool_gpu::{DeviceContext, Tensor};

/// CPU decode through the `image` crate.
///
/// Handles every format the crate was built with (JPEG, PNG) including the
/// JPEG variants the hardware path rejects. Output is always interleaved RGB.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareDecoder;

impl SoftwareDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode the whole image to RGB.
    pub fn decode(&self, data: &[u8]) -> Result<RawImage> {
        let img = image::load_from_memory(data)
            .map_err(|e| DecodeError::ImageDecode(e.to_string()))?;

        let rgb = img.to_rgb8();
        let width = rgb.width();
        let height = rgb.height();
        if width == 0 || height == 0 {
            return Err(DecodeError::ImageDecode(format!(
                "decoded an empty {width}x{height} image"
            )));
        }

        Ok(RawImage {
            data: rgb.into_raw(),
            width,
            height,
            channels: OUTPUT_CHANNELS as u32,
        })
    }

    /// Decode, crop with a ROI drawn against the decoded size, and place the
    /// result in `space`.
    pub fn decode_random_crop(
        &self,
        ctx: &DeviceContext,
        data: &[u8],
        roi: Option<&dyn RoiSource>,
        space: MemorySpace,
    ) -> Result<Tensor> {
        let decoded = self.decode(data)?;

        let pixels = match roi.and_then(|source| source.sample(decoded.width, decoded.height)) {
            Some(roi) if roi.fits_within(decoded.width, decoded.height) => decoded.crop(&roi),
            Some(roi) => {
                return Err(DecodeError::InvalidInput(format!(
                    "ROI {roi:?} outside decoded {}x{} image",
                    decoded.width, decoded.height
                )))
            }
            None => decoded,
        };

        if space == MemorySpace::Host {
            return Tensor::from_host(pixels.data, pixels.height, pixels.width);
        }
        let mut tensor = Tensor::alloc(ctx, space, pixels.height, pixels.width)?;
        tensor.copy_from_host(ctx, &pixels.data)?;
        Ok(tensor)
    }
}
