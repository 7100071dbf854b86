use crate::errors::{Result, VistaSegError};
use crate::session::DEFAULT_ORIGINAL_NAME;
use image::{DynamicImage, ImageFormat, ImageReader, RgbImage};
use std::fs;
use std::io::Cursor;
use std::path::Path;

pub const PREVIEW_SIZE: u32 = 512;

/// Decodes an uploaded payload. Pixel-count limits are lifted so large
/// microscopy scans still decode.
pub fn decode_image(raw: &[u8]) -> Result<DynamicImage> {
    let mut reader = ImageReader::new(Cursor::new(raw))
        .with_guessed_format()
        .map_err(|e| VistaSegError::Decode {
            source: image::ImageError::IoError(e),
        })?;
    reader.no_limits();
    reader.decode().map_err(|source| VistaSegError::Decode { source })
}

/// Persists an upload as the session's source image, overwriting any
/// previous one. Nothing is written when the payload does not decode.
pub fn store(raw: &[u8], destination: &Path) -> Result<RgbImage> {
    let image = decode_image(raw)?.into_rgb8();

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| VistaSegError::file_system(parent, "upload directory creation", e))?;
    }

    image
        .save_with_format(destination, ImageFormat::Png)
        .map_err(|e| VistaSegError::ImageProcessing {
            path: destination.display().to_string(),
            operation: "source image save".to_string(),
            source: Box::new(e),
        })?;

    tracing::info!(
        path = %destination.display(),
        width = image.width(),
        height = image.height(),
        "source image stored"
    );
    Ok(image)
}

/// Loads the stored source image.
pub fn load_source_image(path: &Path) -> Result<RgbImage> {
    if !path.is_file() {
        return Err(VistaSegError::MissingOutput {
            path: path.to_path_buf(),
        });
    }
    let image = image::open(path).map_err(|e| VistaSegError::ImageProcessing {
        path: path.display().to_string(),
        operation: "source image load".to_string(),
        source: Box::new(e),
    })?;
    Ok(image.into_rgb8())
}

/// PNG thumbnail bounded by `PREVIEW_SIZE` on both sides. Never upscales.
pub fn preview_png(path: &Path) -> Result<Vec<u8>> {
    let image = DynamicImage::ImageRgb8(load_source_image(path)?);
    let preview = if image.width() > PREVIEW_SIZE || image.height() > PREVIEW_SIZE {
        image.thumbnail(PREVIEW_SIZE, PREVIEW_SIZE)
    } else {
        image
    };

    let mut bytes = Cursor::new(Vec::new());
    preview
        .write_to(&mut bytes, ImageFormat::Png)
        .map_err(|e| VistaSegError::ImageProcessing {
            path: path.display().to_string(),
            operation: "preview encode".to_string(),
            source: Box::new(e),
        })?;
    Ok(bytes.into_inner())
}

/// Name used for download payloads: the upload's file name up to its first dot.
pub fn original_stem(file_name: Option<&str>) -> String {
    file_name
        .and_then(|name| Path::new(name).file_name())
        .and_then(|name| name.to_str())
        .and_then(|name| name.split('.').next())
        .map(str::trim)
        .filter(|stem| !stem.is_empty())
        .unwrap_or(DEFAULT_ORIGINAL_NAME)
        .to_string()
}
