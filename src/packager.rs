use crate::errors::{Result, VistaSegError};
use crate::label_mask::read_label_mask;
use crate::metadata::derive;
use crate::session::CompletedRun;
use crate::traits::ColorStrategy;
use crate::upload::load_source_image;
use crate::visualization::compose;
use std::fs;
use std::path::Path;

pub const MIME_TIFF: &str = "image/tiff";
pub const MIME_JSON: &str = "application/json";
pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_PNG: &str = "image/png";

/// A downloadable artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub file_name: String,
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

impl Payload {
    pub fn write_into(&self, dir: &Path) -> Result<std::path::PathBuf> {
        let path = dir.join(&self.file_name);
        fs::write(&path, &self.bytes)
            .map_err(|e| VistaSegError::file_system(&path, "payload write", e))?;
        Ok(path)
    }
}

/// Builds download payloads from a successful run. Every call reads the
/// current artifacts again; nothing is cached between calls.
#[derive(Debug, Clone)]
pub struct DownloadPackager {
    run: CompletedRun,
}

impl DownloadPackager {
    pub const fn new(run: CompletedRun) -> Self {
        Self { run }
    }

    /// Label mask bytes exactly as the tool wrote them.
    pub fn mask_payload(&self) -> Result<Payload> {
        let path = self.run.workspace.label_mask_path();
        let bytes = fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => VistaSegError::MissingOutput { path: path.clone() },
            _ => VistaSegError::file_system(&path, "label mask read", e),
        })?;

        Ok(Payload {
            file_name: format!("{}_mask.tif", self.run.original_name),
            mime: MIME_TIFF,
            bytes,
        })
    }

    pub fn metadata_payload(&self) -> Result<Payload> {
        let mask = read_label_mask(&self.run.workspace.label_mask_path())?;
        Ok(Payload {
            file_name: format!("{}_meta.json", self.run.original_name),
            mime: MIME_JSON,
            bytes: derive(&mask).to_json_bytes()?,
        })
    }

    pub fn visualization_payload<C: ColorStrategy>(&self, colors: &mut C) -> Result<Payload> {
        let source = load_source_image(&self.run.workspace.source_image_path())?;
        let mask = read_label_mask(&self.run.workspace.label_mask_path())?;
        let composition = compose(&source, &mask, colors)?;

        Ok(Payload {
            file_name: format!("{}_visualization.jpg", self.run.original_name),
            mime: MIME_JPEG,
            bytes: composition.to_jpeg()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label_mask::{write_label_mask, LabelMask};
    use crate::mocks::FixedPalette;
    use crate::session::SessionWorkspace;
    use image::{GenericImageView, Luma, Rgb, RgbImage};
    use tempfile::TempDir;

    fn completed_run(temp_dir: &TempDir) -> Result<CompletedRun> {
        let workspace = SessionWorkspace::new(temp_dir.path());
        workspace.prepare()?;
        RgbImage::from_pixel(4, 4, Rgb([100, 100, 100])).save(workspace.source_image_path())?;
        let mask = LabelMask::from_fn(4, 4, |x, y| Luma([u32::from(x < 2 && y < 2)]));
        write_label_mask(&mask, &workspace.label_mask_path())?;

        Ok(CompletedRun {
            workspace,
            original_name: "cells".to_string(),
            generation: 1,
        })
    }

    #[test]
    fn test_mask_payload_is_raw_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let run = completed_run(&temp_dir)?;
        let expected = fs::read(run.workspace.label_mask_path())?;

        let payload = DownloadPackager::new(run).mask_payload()?;

        assert_eq!(payload.file_name, "cells_mask.tif");
        assert_eq!(payload.mime, "image/tiff");
        assert_eq!(payload.bytes, expected);
        Ok(())
    }

    #[test]
    fn test_metadata_payload() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let payload = DownloadPackager::new(completed_run(&temp_dir)?).metadata_payload()?;

        let value: serde_json::Value = serde_json::from_slice(&payload.bytes)?;
        assert_eq!(payload.file_name, "cells_meta.json");
        assert_eq!(payload.mime, "application/json");
        assert_eq!(value, serde_json::json!({"image_size": [4, 4], "contours": 1}));
        Ok(())
    }

    #[test]
    fn test_visualization_payload() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let packager = DownloadPackager::new(completed_run(&temp_dir)?);

        let payload = packager.visualization_payload(&mut FixedPalette::new(Rgb([200, 0, 0])))?;
        let decoded = image::load_from_memory(&payload.bytes)?;

        assert_eq!(payload.file_name, "cells_visualization.jpg");
        assert_eq!(payload.mime, "image/jpeg");
        assert_eq!(decoded.dimensions(), (4, 4));
        Ok(())
    }

    #[test]
    fn test_missing_mask_is_missing_output() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let run = completed_run(&temp_dir)?;
        fs::remove_file(run.workspace.label_mask_path())?;
        let packager = DownloadPackager::new(run);

        assert!(matches!(
            packager.mask_payload(),
            Err(VistaSegError::MissingOutput { .. })
        ));
        assert!(matches!(
            packager.metadata_payload(),
            Err(VistaSegError::MissingOutput { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_write_into_directory() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let payload = Payload {
            file_name: "x_meta.json".to_string(),
            mime: MIME_JSON,
            bytes: b"{}".to_vec(),
        };
        let path = payload.write_into(temp_dir.path())?;
        assert_eq!(fs::read(path)?, b"{}");
        Ok(())
    }
}
