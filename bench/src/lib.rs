//! Synthetic inputs shared by the decode benchmarks.

use std::io::Cursor;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::{ImageResult, RgbImage};

/// A gradient JPEG of the given size.
pub fn synthetic_jpeg(width: u32, height: u32, quality: u8) -> ImageResult<Arc<[u8]>> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(&img)?;
    Ok(Arc::from(out.into_inner()))
}

/// `count` JPEGs cycling through a few common training-set sizes.
pub fn mixed_batch(count: usize) -> ImageResult<Vec<Arc<[u8]>>> {
    const SIZES: [(u32, u32); 4] = [(500, 375), (640, 480), (333, 500), (1024, 768)];
    (0..count)
        .map(|i| {
            let (w, h) = SIZES[i % SIZES.len()];
            synthetic_jpeg(w, h, 90)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_batch_is_jpeg() {
        let batch = mixed_batch(5).unwrap();
        assert_eq!(batch.len(), 5);
        assert!(batch.iter().all(|d| d.starts_with(&[0xFF, 0xD8])));
    }
}
