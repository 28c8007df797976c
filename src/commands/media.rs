use serde_json::Value;

use super::{payload_object, to_value};
use crate::{media, value_i64, value_str};

/// Compress an uploaded picture (data URL or bare base64) to a JPEG data URL.
pub async fn media_compress_image(arg0: Option<Value>) -> Result<Value, String> {
    let payload = payload_object(arg0, "source");
    let source = value_str(&payload, &["source", "image", "dataUrl", "data_url"])
        .ok_or("Missing image source")?;
    let max_dimension = value_i64(&payload, &["maxDimension", "max_dimension"])
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(media::DEFAULT_MAX_DIMENSION);
    let quality = value_i64(&payload, &["quality"])
        .and_then(|v| u8::try_from(v).ok())
        .unwrap_or(media::DEFAULT_QUALITY);

    let bytes = media::decode_image_source(&source)?;
    let compressed = media::compress_image(&bytes, max_dimension, quality)?;
    to_value(&compressed)
}
