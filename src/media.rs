//! Photo compression for vehicle pictures.

use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_MAX_DIMENSION: u32 = 1024;
pub const DEFAULT_QUALITY: u8 = 70;
/// Refuse inputs larger than this before decoding.
const MAX_INPUT_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedImage {
    pub data_url: String,
    pub width: u32,
    pub height: u32,
    pub bytes: usize,
    pub original_bytes: usize,
}

/// Extract the raw bytes of a `data:image/...;base64,` URL.
pub fn parse_data_url_image(source: &str) -> Option<Vec<u8>> {
    let trimmed = source.trim();
    if !trimmed.starts_with("data:image/") {
        return None;
    }
    let (header, payload) = trimmed.split_once(',')?;
    if !header.ends_with(";base64") {
        return None;
    }
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .ok()
}

/// Accept either a data URL or bare base64.
pub fn decode_image_source(source: &str) -> Result<Vec<u8>, String> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Err("Image source is empty".into());
    }
    if trimmed.starts_with("data:") {
        return parse_data_url_image(trimmed).ok_or_else(|| "Invalid image data URL".to_string());
    }
    base64::engine::general_purpose::STANDARD
        .decode(trimmed)
        .map_err(|e| format!("Invalid base64 image: {e}"))
}

/// Downscale so the longest side is at most `max_dimension` and re-encode
/// as JPEG at `quality` (1-100).
pub fn compress_image(
    bytes: &[u8],
    max_dimension: u32,
    quality: u8,
) -> Result<CompressedImage, String> {
    if bytes.is_empty() {
        return Err("Image is empty".into());
    }
    if bytes.len() > MAX_INPUT_BYTES {
        return Err(format!(
            "Image is too large ({} bytes, limit {MAX_INPUT_BYTES})",
            bytes.len()
        ));
    }
    let max_dimension = max_dimension.max(16);
    let quality = quality.clamp(1, 100);

    let decoded = image::load_from_memory(bytes).map_err(|e| format!("image decode: {e}"))?;
    let (src_w, src_h) = (decoded.width(), decoded.height());
    if src_w == 0 || src_h == 0 {
        return Err("Image has invalid dimensions".into());
    }

    let resized = if src_w > max_dimension || src_h > max_dimension {
        decoded.resize(max_dimension, max_dimension, FilterType::Triangle)
    } else {
        decoded
    };
    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());

    let mut encoded = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut encoded, quality))
        .map_err(|e| format!("jpeg encode: {e}"))?;

    debug!(
        src_w,
        src_h,
        width = rgb.width(),
        height = rgb.height(),
        original_bytes = bytes.len(),
        bytes = encoded.len(),
        "Image compressed"
    );

    Ok(CompressedImage {
        data_url: format!(
            "data:image/jpeg;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&encoded)
        ),
        width: rgb.width(),
        height: rgb.height(),
        bytes: encoded.len(),
        original_bytes: bytes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 200])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn large_images_are_downscaled_preserving_aspect() {
        let result = compress_image(&png(2048, 1024), DEFAULT_MAX_DIMENSION, DEFAULT_QUALITY)
            .unwrap();
        assert_eq!((result.width, result.height), (1024, 512));
        assert!(result.data_url.starts_with("data:image/jpeg;base64,"));

        let jpeg = parse_data_url_image(&result.data_url).unwrap();
        assert_eq!(jpeg.len(), result.bytes);
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn small_images_keep_their_size() {
        let result = compress_image(&png(300, 200), DEFAULT_MAX_DIMENSION, 80).unwrap();
        assert_eq!((result.width, result.height), (300, 200));
    }

    #[test]
    fn portrait_images_limit_height() {
        let result = compress_image(&png(600, 1800), 900, DEFAULT_QUALITY).unwrap();
        assert_eq!((result.width, result.height), (300, 900));
    }

    #[test]
    fn data_url_and_bare_base64_are_accepted() {
        let bytes = png(10, 10);
        let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
        assert_eq!(
            decode_image_source(&format!("data:image/png;base64,{b64}")).unwrap(),
            bytes
        );
        assert_eq!(decode_image_source(&b64).unwrap(), bytes);
        assert!(decode_image_source("data:text/plain;base64,aGk=").is_err());
        assert!(decode_image_source("").is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(compress_image(b"not an image", 1024, 70).is_err());
        assert!(compress_image(&[], 1024, 70).is_err());
    }
}
