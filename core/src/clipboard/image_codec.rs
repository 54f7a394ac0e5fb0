//! Image downscale/recompress pipeline for oversized pasteboard images
//! (`spec.md` §4.5/§6 `max_image_dimension_px`, `max_raw_size_for_compression`,
//! `max_attachment_bytes`).

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{imageops::FilterType, DynamicImage, ImageFormat as ImgFormat, RgbaImage};

use crate::ports::NotificationSink;
use crate::protocol::constants::{MAX_ATTACHMENT_BYTES, MAX_IMAGE_DIMENSION_PX, MAX_RAW_SIZE_FOR_COMPRESSION};
use crate::protocol::envelope::{ClipboardContent, ImageFormat};
use crate::{Error, Result};

/// JPEG quality levels tried in order once the PNG-encoded image exceeds
/// `max_raw_size_for_compression` (`spec.md` §4.5: "0.85 to 0.4 in steps of
/// 0.1"), expressed as the `image` crate's 0-100 quality scale.
const JPEG_QUALITY_STEPS: &[u8] = &[85, 75, 65, 55, 45, 40];

fn encode_png(dynamic: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    dynamic
        .write_to(&mut Cursor::new(&mut bytes), ImgFormat::Png)
        .map_err(|e| Error::Clipboard(format!("image encode failed: {e}")))?;
    Ok(bytes)
}

fn encode_jpeg(dynamic: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut bytes, quality);
    encoder
        .encode_image(dynamic)
        .map_err(|e| Error::Clipboard(format!("image encode failed: {e}")))?;
    Ok(bytes)
}

/// Encode an `arboard` RGBA image into a `ClipboardContent::Image`
/// (`spec.md` §4.5):
/// 1. Downscale to `max_image_dimension_px` on the longest edge.
/// 2. Encode as PNG; if that already fits under `max_raw_size_for_compression`,
///    keep it.
/// 3. Otherwise recompress as JPEG at decreasing quality until the result
///    fits under `max_attachment_bytes`.
/// 4. If no quality step fits, drop the item entirely: `Ok(None)`, with
///    `notifications` (if given) told about the oversized item.
pub fn encode_arboard_image(
    image: arboard::ImageData<'_>,
    notifications: Option<&dyn NotificationSink>,
) -> Result<Option<ClipboardContent>> {
    let width = image.width as u32;
    let height = image.height as u32;
    let rgba = RgbaImage::from_raw(width, height, image.bytes.into_owned())
        .ok_or_else(|| Error::Clipboard("malformed pasteboard image buffer".to_string()))?;
    let mut dynamic = DynamicImage::ImageRgba8(rgba);

    let longest_edge = width.max(height);
    if longest_edge > MAX_IMAGE_DIMENSION_PX {
        let scale = MAX_IMAGE_DIMENSION_PX as f64 / longest_edge as f64;
        let new_w = ((width as f64) * scale).round().max(1.0) as u32;
        let new_h = ((height as f64) * scale).round().max(1.0) as u32;
        dynamic = dynamic.resize(new_w, new_h, FilterType::Lanczos3);
    }

    let png_bytes = encode_png(&dynamic)?;

    let (bytes, format) = if (png_bytes.len() as u64) <= MAX_RAW_SIZE_FOR_COMPRESSION {
        (png_bytes, ImageFormat::Png)
    } else {
        let mut chosen = None;
        for &quality in JPEG_QUALITY_STEPS {
            let jpeg_bytes = encode_jpeg(&dynamic, quality)?;
            if (jpeg_bytes.len() as u64) <= MAX_ATTACHMENT_BYTES {
                chosen = Some(jpeg_bytes);
                break;
            }
        }
        match chosen {
            Some(jpeg_bytes) => (jpeg_bytes, ImageFormat::Jpeg),
            None => {
                tracing::warn!(
                    width,
                    height,
                    "oversized clipboard image could not be compressed under max_attachment_bytes, dropping"
                );
                if let Some(sink) = notifications {
                    sink.notify("Item too large", "This image is too large to sync.");
                }
                return Ok(None);
            }
        }
    };

    Ok(Some(ClipboardContent::Image {
        pixel_width: dynamic.width(),
        pixel_height: dynamic.height(),
        byte_size: bytes.len() as u64,
        format,
        alt_text: None,
        bytes,
        thumbnail: None,
        local_path: None,
    }))
}

/// Decode encoded image bytes back into an owned `arboard::ImageData` for
/// writing to the pasteboard.
pub fn decode_to_arboard(bytes: &[u8]) -> Result<arboard::ImageData<'static>> {
    let dynamic = image::load_from_memory(bytes)
        .map_err(|e| Error::Clipboard(format!("image decode failed: {e}")))?;
    let rgba = dynamic.to_rgba8();
    let (width, height) = rgba.dimensions();

    Ok(arboard::ImageData {
        width: width as usize,
        height: height as usize,
        bytes: std::borrow::Cow::Owned(rgba.into_raw()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_rgba(width: u32, height: u32) -> arboard::ImageData<'static> {
        let bytes = vec![255u8; (width * height * 4) as usize];
        arboard::ImageData {
            width: width as usize,
            height: height as usize,
            bytes: std::borrow::Cow::Owned(bytes),
        }
    }

    /// Pixel data that defeats PNG's filter/deflate compression, so the
    /// pipeline's raw-size gate actually trips in tests.
    fn noisy_rgba(width: u32, height: u32) -> arboard::ImageData<'static> {
        use rand::RngCore;
        let mut bytes = vec![0u8; (width * height * 4) as usize];
        rand::thread_rng().fill_bytes(&mut bytes);
        arboard::ImageData {
            width: width as usize,
            height: height as usize,
            bytes: std::borrow::Cow::Owned(bytes),
        }
    }

    #[test]
    fn small_image_not_downscaled() {
        let content = encode_arboard_image(solid_rgba(10, 10), None).unwrap().unwrap();
        if let ClipboardContent::Image { pixel_width, pixel_height, .. } = content {
            assert_eq!(pixel_width, 10);
            assert_eq!(pixel_height, 10);
        } else {
            panic!("expected image content");
        }
    }

    #[test]
    fn oversized_image_downscaled_to_max_dimension() {
        let content = encode_arboard_image(solid_rgba(4000, 2000), None).unwrap().unwrap();
        if let ClipboardContent::Image { pixel_width, pixel_height, .. } = content {
            assert!(pixel_width.max(pixel_height) <= MAX_IMAGE_DIMENSION_PX);
        } else {
            panic!("expected image content");
        }
    }

    #[test]
    fn encode_then_decode_roundtrips_dimensions() {
        let content = encode_arboard_image(solid_rgba(8, 8), None).unwrap().unwrap();
        if let ClipboardContent::Image { bytes, .. } = content {
            let decoded = decode_to_arboard(&bytes).unwrap();
            assert_eq!(decoded.width, 8);
            assert_eq!(decoded.height, 8);
        } else {
            panic!("expected image content");
        }
    }

    #[test]
    fn incompressible_image_over_raw_threshold_falls_back_to_jpeg() {
        let content = encode_arboard_image(noisy_rgba(MAX_IMAGE_DIMENSION_PX, MAX_IMAGE_DIMENSION_PX), None)
            .unwrap()
            .unwrap();
        if let ClipboardContent::Image { format, byte_size, .. } = content {
            assert_eq!(format, ImageFormat::Jpeg);
            assert!(byte_size <= MAX_ATTACHMENT_BYTES);
        } else {
            panic!("expected image content");
        }
    }
}
