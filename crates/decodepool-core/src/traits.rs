use crate::types::Roi;

/// Source of crop rectangles for one batch slot.
///
/// Decoders only see this trait; the random generator lives in
/// `decodepool-roi`. `None` means no crop was requested for the slot, which
/// is different from a crop that happens to cover the whole image.
pub trait RoiSource: Send + Sync {
    fn sample(&self, image_width: u32, image_height: u32) -> Option<Roi>;
}
