//! Longest-edge fitting of downloaded images

use super::fetch::FetchError;
use bytes::Bytes;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView};
use tracing::debug;

/// Fit `raw` inside a `max_dimension` square
///
/// The bytes are always decoded, so anything that is not an image fails
/// with [`FetchError::Decode`]. Images already within bounds, and any image
/// when `max_dimension` is 0, are returned byte-for-byte. Larger images are
/// scaled so the longest edge equals `max_dimension` and re-encoded as PNG.
pub fn fit_within(raw: Bytes, max_dimension: u32) -> Result<Bytes, FetchError> {
    let decoded = image::load_from_memory(&raw).map_err(|e| FetchError::Decode(e.to_string()))?;
    let (width, height) = decoded.dimensions();
    let longest = width.max(height);

    if max_dimension == 0 || longest <= max_dimension {
        return Ok(raw);
    }

    let (target_width, target_height) = scaled_size(width, height, max_dimension);
    debug!(
        from = %format!("{}x{}", width, height),
        to = %format!("{}x{}", target_width, target_height),
        "Resizing image"
    );

    let resized = decoded.resize_exact(target_width, target_height, FilterType::Triangle);
    encode_png(resized).map(Bytes::from)
}

/// Scale so the longest edge becomes `max_edge`, flooring the other edge
pub fn scaled_size(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    let longest = u64::from(width.max(height));
    if longest == 0 {
        return (width, height);
    }
    let scale = |edge: u32| ((u64::from(edge) * u64::from(max_edge)) / longest).max(1) as u32;
    (scale(width), scale(height))
}

fn encode_png(image: DynamicImage) -> Result<Vec<u8>, FetchError> {
    // PNG has no float pixel formats
    let image = match image.color() {
        ColorType::Rgb32F | ColorType::Rgba32F => DynamicImage::ImageRgba8(image.to_rgba8()),
        _ => image,
    };

    let mut out = Vec::new();
    let encoder = PngEncoder::new_with_quality(&mut out, CompressionType::Default, PngFilter::Adaptive);
    image
        .write_with_encoder(encoder)
        .map_err(|e| FetchError::Encode(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    fn encoded(width: u32, height: u32, format: ImageFormat) -> Bytes {
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }));
        let mut out = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut out), format)
            .expect("encode test image");
        Bytes::from(out)
    }

    #[test]
    fn test_scaled_size_floors() {
        assert_eq!(scaled_size(256, 128, 128), (128, 64));
        assert_eq!(scaled_size(100, 300, 64), (21, 64));
        assert_eq!(scaled_size(1000, 3, 10), (10, 1));
        assert_eq!(scaled_size(333, 333, 100), (100, 100));
    }

    #[test]
    fn test_small_image_passes_through() -> Result<(), FetchError> {
        let raw = encoded(40, 30, ImageFormat::Jpeg);
        let out = fit_within(raw.clone(), 64)?;
        assert_eq!(out, raw);
        Ok(())
    }

    #[test]
    fn test_zero_bound_passes_through() -> Result<(), FetchError> {
        let raw = encoded(400, 300, ImageFormat::Png);
        assert_eq!(fit_within(raw.clone(), 0)?, raw);
        Ok(())
    }

    #[test]
    fn test_large_image_is_resized_to_png() -> Result<(), FetchError> {
        let raw = encoded(300, 150, ImageFormat::Jpeg);
        let out = fit_within(raw, 100)?;

        assert_eq!(image::guess_format(&out).ok(), Some(ImageFormat::Png));
        let decoded = image::load_from_memory(&out).expect("decode output");
        assert_eq!(decoded.dimensions(), (100, 50));
        Ok(())
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        let result = fit_within(Bytes::from_static(b"<html>not an image</html>"), 64);
        assert!(matches!(result, Err(FetchError::Decode(_))));
    }
}
