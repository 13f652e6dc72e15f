//! Codec adapter: decodes encoded image bytes into bitmaps.
//!
//! Decoding is pure and stateless. Corrupt or unsupported bytes yield a
//! [`DecodeError`], never a partial bitmap.
//!
//! # Thumbnail Decoding
//!
//! [`decode_thumbnail`] bounds the largest dimension of the produced
//! bitmap. Sources already within the bound decode as-is; larger sources
//! are resampled immediately after decode and the full-resolution buffer
//! is released before the result leaves this module, which keeps the
//! resident footprint of a small request proportional to the requested
//! size rather than the source size.

use std::io::Cursor;

use image::{DynamicImage, GenericImageView, ImageReader};
use thiserror::Error;

/// Errors that can occur while decoding image bytes.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Corrupt bytes or an unsupported container format.
    #[error("unsupported or corrupt image data: {0}")]
    Invalid(#[from] image::ImageError),

    /// I/O error while sniffing the container format.
    #[error("failed to read image header: {0}")]
    Header(#[from] std::io::Error),

    /// The decode worker was torn down before producing a bitmap.
    #[error("decode interrupted: {0}")]
    Interrupted(String),
}

/// Decodes encoded bytes into a full-resolution bitmap.
///
/// The container format is sniffed from the byte content, so no file
/// extension or content type is required.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, DecodeError> {
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    Ok(reader.decode()?)
}

/// Decodes encoded bytes into a bitmap whose larger dimension is at most
/// `max_dimension` pixels.
///
/// Aspect ratio is preserved. Sources already within the bound are
/// returned at their native size; decoding never enlarges.
pub fn decode_thumbnail(bytes: &[u8], max_dimension: u32) -> Result<DynamicImage, DecodeError> {
    let max_dimension = max_dimension.max(1);
    let image = decode(bytes)?;
    if within_bound(&image, max_dimension) {
        return Ok(image);
    }
    Ok(image.thumbnail(max_dimension, max_dimension))
}

/// Resamples a bitmap so its larger dimension is at most `max_dimension`
/// pixels, preserving aspect ratio.
///
/// A bitmap already within the bound is returned as a copy at its native
/// size; downsampling never enlarges.
pub fn downsample(image: &DynamicImage, max_dimension: u32) -> DynamicImage {
    let max_dimension = max_dimension.max(1);
    if within_bound(image, max_dimension) {
        return image.clone();
    }
    image.thumbnail(max_dimension, max_dimension)
}

/// True when the bitmap's larger dimension already satisfies the bound.
pub fn within_bound(image: &DynamicImage, max_dimension: u32) -> bool {
    let (width, height) = image.dimensions();
    width.max(height) <= max_dimension
}

/// Cost of a decoded bitmap for cache accounting.
///
/// Uses the decoded byte footprint (width x height x bytes per pixel).
pub fn bitmap_cost(image: &DynamicImage) -> u64 {
    image.as_bytes().len() as u64
}
