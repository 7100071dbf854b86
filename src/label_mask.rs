use crate::errors::{Result, VistaSegError};
use image::{ImageBuffer, Luma};
use num_traits::ToPrimitive;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::ColorType;

/// Single-channel instance raster. 0 is background, every positive value
/// is one instance.
pub type LabelMask = ImageBuffer<Luma<u32>, Vec<u32>>;

/// Reads the label mask written by the segmentation tool, as-is.
pub fn read_label_mask(path: &Path) -> Result<LabelMask> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => VistaSegError::MissingOutput {
            path: path.to_path_buf(),
        },
        _ => VistaSegError::file_system(path, "label mask open", e),
    })?;

    let format_error = |reason: String| VistaSegError::LabelMaskFormat {
        path: path.to_path_buf(),
        reason,
    };

    let mut decoder = Decoder::new(BufReader::new(file))
        .map_err(|e| format_error(e.to_string()))?
        .with_limits(Limits::unlimited());

    let color_type = decoder.colortype().map_err(|e| format_error(e.to_string()))?;
    if !matches!(color_type, ColorType::Gray(_)) {
        return Err(format_error(format!(
            "expected a single-channel raster, found {color_type:?}"
        )));
    }

    let (width, height) = decoder
        .dimensions()
        .map_err(|e| format_error(e.to_string()))?;
    let data = decoder
        .read_image()
        .map_err(|e| format_error(e.to_string()))?;

    let labels = match data {
        DecodingResult::U8(data) => widen(data),
        DecodingResult::U16(data) => widen(data),
        DecodingResult::U32(data) => Some(data),
        DecodingResult::U64(data) => widen(data),
        DecodingResult::I8(data) => widen(data),
        DecodingResult::I16(data) => widen(data),
        DecodingResult::I32(data) => widen(data),
        DecodingResult::I64(data) => widen(data),
        DecodingResult::F32(data) => widen_integral(data),
        DecodingResult::F64(data) => widen_integral(data),
    }
    .ok_or_else(|| {
        format_error("labels must be non-negative integers below 2^32".to_string())
    })?;

    let mask = ImageBuffer::from_raw(width, height, labels)
        .ok_or_else(|| format_error("sample count does not match dimensions".to_string()))?;

    tracing::debug!(path = %path.display(), width, height, "label mask read");
    Ok(mask)
}

/// Writes a mask as an unsigned 32-bit grayscale TIFF.
pub fn write_label_mask(mask: &LabelMask, path: &Path) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| VistaSegError::file_system(path, "label mask create", e))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file))?;
    encoder.write_image::<colortype::Gray32>(mask.width(), mask.height(), mask.as_raw())?;
    Ok(())
}

fn widen<T: ToPrimitive + Send>(data: Vec<T>) -> Option<Vec<u32>> {
    data.into_par_iter().map(|v| v.to_u32()).collect()
}

fn widen_integral<T: num_traits::Float + Send>(data: Vec<T>) -> Option<Vec<u32>> {
    data.into_par_iter()
        .map(|v| if v.fract().is_zero() { v.to_u32() } else { None })
        .collect()
}

/// Summary of the labels present in a mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelStats {
    pub max_label: u32,
    pub instance_count: usize,
}

impl LabelStats {
    pub fn from_mask(mask: &LabelMask) -> Self {
        let max_label = mask.as_raw().par_iter().copied().max().unwrap_or(0);
        let instance_count = instance_ids(mask).len();
        Self {
            max_label,
            instance_count,
        }
    }

    /// True when labels are exactly 1..=max with no gaps.
    pub fn is_dense(&self) -> bool {
        self.max_label as usize == self.instance_count
    }
}

/// Distinct non-zero labels in ascending order.
pub fn instance_ids(mask: &LabelMask) -> BTreeSet<u32> {
    mask.as_raw()
        .par_iter()
        .copied()
        .filter(|&label| label != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_tiff<C>(path: &Path, width: u32, height: u32, data: &[C::Inner])
    where
        C: colortype::ColorType,
        [C::Inner]: tiff::encoder::TiffValue,
    {
        let mut encoder = TiffEncoder::new(BufWriter::new(File::create(path).unwrap())).unwrap();
        encoder.write_image::<C>(width, height, data).unwrap();
    }

    #[test]
    fn test_round_trip_u32() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("label.tif");
        let mask = LabelMask::from_raw(3, 2, vec![0, 1, 1, 70_000, 0, 2]).unwrap();

        write_label_mask(&mask, &path)?;
        assert_eq!(read_label_mask(&path)?, mask);
        Ok(())
    }

    #[test]
    fn test_u16_mask_is_widened() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("label.tif");
        write_tiff::<colortype::Gray16>(&path, 2, 2, &[0u16, 5, 65535, 1]);

        let mask = read_label_mask(&path)?;
        assert_eq!(mask.as_raw(), &vec![0, 5, 65535, 1]);
        Ok(())
    }

    #[test]
    fn test_float_mask_with_integral_values_is_accepted() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("label.tif");
        write_tiff::<colortype::Gray32Float>(&path, 2, 1, &[0.0f32, 3.0]);

        assert_eq!(read_label_mask(&path)?.as_raw(), &vec![0, 3]);
        Ok(())
    }

    #[test]
    fn test_fractional_or_negative_labels_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let fractional = temp_dir.path().join("fractional.tif");
        let negative = temp_dir.path().join("negative.tif");
        write_tiff::<colortype::Gray32Float>(&fractional, 2, 1, &[0.0f32, 1.5]);
        write_tiff::<colortype::GrayI32>(&negative, 2, 1, &[0i32, -4]);

        for path in [fractional, negative] {
            assert!(matches!(
                read_label_mask(&path),
                Err(VistaSegError::LabelMaskFormat { .. })
            ));
        }
    }

    #[test]
    fn test_rgb_tiff_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("rgb.tif");
        write_tiff::<colortype::RGB8>(&path, 1, 1, &[1u8, 2, 3]);

        assert!(matches!(
            read_label_mask(&path),
            Err(VistaSegError::LabelMaskFormat { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_missing_output() {
        let temp_dir = TempDir::new().unwrap();
        let result = read_label_mask(&temp_dir.path().join("absent.tif"));
        assert!(matches!(result, Err(VistaSegError::MissingOutput { .. })));
    }

    #[test]
    fn test_stats_and_density() {
        let dense = LabelMask::from_raw(4, 1, vec![0, 1, 2, 2]).unwrap();
        let gappy = LabelMask::from_raw(4, 1, vec![0, 1, 7, 7]).unwrap();
        let empty = LabelMask::new(3, 3);

        let stats = LabelStats::from_mask(&dense);
        assert_eq!((stats.max_label, stats.instance_count), (2, 2));
        assert!(stats.is_dense());

        let stats = LabelStats::from_mask(&gappy);
        assert_eq!((stats.max_label, stats.instance_count), (7, 2));
        assert!(!stats.is_dense());

        assert!(LabelStats::from_mask(&empty).is_dense());
        assert!(instance_ids(&empty).is_empty());
    }
}
