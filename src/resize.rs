//! Aspect-preserving variant generation.
//!
//! The long side of the source is scaled to exactly the size class target and
//! the short side follows the same ratio, rounded to the nearest pixel. Small
//! sources are upscaled; there is no cropping and no letterboxing.

use crate::SizeClass;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView, ImageError};
use thiserror::Error;

/// JPEG quality used for every variant.
pub const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Error)]
pub enum ResizeError {
    #[error("source is not a decodable image: {0}")]
    Decode(#[source] ImageError),

    #[error("failed to encode variant: {0}")]
    Encode(#[source] ImageError),
}

#[derive(Debug, Clone)]
pub struct ResizeResult {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Output dimensions for a `width` x `height` source in the given size class.
pub fn target_dimensions(width: u32, height: u32, size: SizeClass) -> (u32, u32) {
    let target = size.target();
    let long = width.max(height);
    let short = width.min(height);
    let scaled_short = ((u64::from(target) * u64::from(short) + u64::from(long) / 2)
        / u64::from(long.max(1))) as u32;
    let scaled_short = scaled_short.clamp(1, target);

    if width >= height {
        (target, scaled_short)
    } else {
        (scaled_short, target)
    }
}

/// Decode `source`, scale it into `size` and re-encode it as JPEG.
///
/// This is CPU bound; async callers should run it on a blocking thread.
pub fn resize(source: &[u8], size: SizeClass) -> Result<ResizeResult, ResizeError> {
    let original = image::load_from_memory(source).map_err(ResizeError::Decode)?;
    let (width, height) = target_dimensions(original.width(), original.height(), size);

    // Catmull-Rom is a bicubic kernel; the image crate widens its support when
    // shrinking, which gives area-aware anti-aliasing with pixel-centre sampling.
    let scaled = original.resize_exact(width, height, FilterType::CatmullRom);
    let bytes = encode_jpeg(&scaled)?;

    Ok(ResizeResult {
        bytes,
        width,
        height,
    })
}

fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>, ResizeError> {
    // JPEG has no alpha channel.
    let rgb = img.to_rgb8();
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .map_err(ResizeError::Encode)?;
    Ok(bytes)
}
