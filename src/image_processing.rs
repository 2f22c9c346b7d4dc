use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat};
use tracing::{debug, warn};

use crate::config::ImagePrepConfig;
use crate::error::GenerationError;

/// Base64 grows payloads by roughly a third.
const BASE64_OVERHEAD: f64 = 1.33;

/// Inline, transport-ready image.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedImage {
    pub data_uri: String,
    pub mime_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// True when the original bytes were sent as-is.
    pub passthrough: bool,
}

/// Largest size with the same aspect ratio that fits inside the bounds.
/// Sizes already within bounds are returned unchanged.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    let max_width = max_width.max(1);
    let max_height = max_height.max(1);
    if width <= max_width && height <= max_height {
        return (width, height);
    }
    let scale = f64::min(
        max_width as f64 / width as f64,
        max_height as f64 / height as f64,
    );
    let new_width = ((width as f64 * scale).round() as u32).clamp(1, max_width);
    let new_height = ((height as f64 * scale).round() as u32).clamp(1, max_height);
    (new_width, new_height)
}

pub fn estimated_payload_bytes(width: u32, height: u32, quality: f32) -> u64 {
    (width as f64 * height as f64 * 3.0 * quality as f64 * BASE64_OVERHEAD) as u64
}

/// Reads a local image, bounds its size and quality, and wraps it as a data URI.
///
/// Decode or encode failures fall back to the original bytes at their native
/// format; only an unreadable file is an error.
pub async fn prepare_image(
    path: &Path,
    config: &ImagePrepConfig,
) -> Result<PreparedImage, GenerationError> {
    let bytes = tokio::fs::read(path).await.map_err(|err| {
        GenerationError::ImageConversion(format!("read {} failed: {err}", path.display()))
    })?;

    let encode_config = config.clone();
    let encode_bytes = bytes.clone();
    let encoded =
        tokio::task::spawn_blocking(move || reencode_jpeg(&encode_bytes, &encode_config))
            .await
            .map_err(|err| GenerationError::ImageConversion(err.to_string()))
            .and_then(|result| result);

    match encoded {
        Ok((jpeg, width, height)) => {
            debug!(
                path = %path.display(),
                width,
                height,
                actual_bytes = jpeg.len(),
                estimated_bytes = estimated_payload_bytes(width, height, config.quality),
                "prepared source image"
            );
            Ok(PreparedImage {
                data_uri: encode_data_uri("image/jpeg", &jpeg),
                mime_type: "image/jpeg".to_string(),
                width: Some(width),
                height: Some(height),
                passthrough: false,
            })
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "re-encode failed, sending original bytes");
            let mime_type = detect_mime_type(&bytes)
                .or_else(|| mime_from_extension(path))
                .unwrap_or("application/octet-stream");
            Ok(PreparedImage {
                data_uri: encode_data_uri(mime_type, &bytes),
                mime_type: mime_type.to_string(),
                width: None,
                height: None,
                passthrough: true,
            })
        }
    }
}

fn reencode_jpeg(
    bytes: &[u8],
    config: &ImagePrepConfig,
) -> Result<(Vec<u8>, u32, u32), GenerationError> {
    let image = image::load_from_memory(bytes)
        .map_err(|err| GenerationError::ImageConversion(format!("decode image failed: {err}")))?;
    let (width, height) = image.dimensions();
    let (target_width, target_height) =
        fit_within(width, height, config.max_width, config.max_height);
    let image = if (target_width, target_height) == (width, height) {
        image
    } else {
        image.resize_exact(target_width, target_height, FilterType::Lanczos3)
    };

    let rgb = image.to_rgb8();
    let quality = (config.quality.clamp(0.01, 1.0) * 100.0).round() as u8;
    let mut output = Vec::new();
    JpegEncoder::new_with_quality(&mut output, quality)
        .encode_image(&rgb)
        .map_err(|err| GenerationError::ImageConversion(format!("encode jpeg failed: {err}")))?;
    Ok((output, rgb.width(), rgb.height()))
}

pub fn encode_data_uri(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", STANDARD.encode(bytes))
}

/// Splits a `data:<mime>;base64,<payload>` URI into its media type and bytes.
pub fn decode_data_uri(uri: &str) -> Option<(String, Vec<u8>)> {
    let rest = uri.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime_type = header.strip_suffix(";base64")?;
    let bytes = STANDARD.decode(payload.trim()).ok()?;
    let mime_type = if mime_type.is_empty() {
        "application/octet-stream"
    } else {
        mime_type
    };
    Some((mime_type.to_string(), bytes))
}

pub fn detect_mime_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if bytes.starts_with(b"BM") {
        return Some("image/bmp");
    }
    None
}

pub fn mime_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let format = ImageFormat::from_extension(&ext)?;
    Some(format.to_mime_type())
}

pub fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type.to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        "image/avif" => "avif",
        _ => "bin",
    }
}
