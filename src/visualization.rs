use crate::errors::{Result, VistaSegError};
use crate::label_mask::{instance_ids, LabelMask};
use crate::traits::ColorStrategy;
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::map::map_colors2;
use rayon::prelude::*;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;

pub const SOURCE_WEIGHT: f64 = 0.7;
pub const OVERLAY_WEIGHT: f64 = 0.3;
pub const BLEND_OFFSET: f64 = 0.0;

pub type Palette = BTreeMap<u32, Rgb<u8>>;

/// Products of one visualization request.
#[derive(Debug, Clone)]
pub struct Composition {
    pub palette: Palette,
    pub overlay: RgbImage,
    pub blended: RgbImage,
}

impl Composition {
    pub fn to_jpeg(&self) -> Result<Vec<u8>> {
        let mut bytes = Cursor::new(Vec::new());
        self.blended
            .write_to(&mut bytes, ImageFormat::Jpeg)
            .map_err(|e| VistaSegError::ImageProcessing {
                path: "visualization".to_string(),
                operation: "jpeg encode".to_string(),
                source: Box::new(e),
            })?;
        Ok(bytes.into_inner())
    }
}

/// Overlays randomly colored instances onto the source image.
///
/// A mask whose size differs from the source is first resampled with
/// nearest-neighbor so no label value is invented.
pub fn compose<C: ColorStrategy>(
    source: &RgbImage,
    mask: &LabelMask,
    colors: &mut C,
) -> Result<Composition> {
    let (width, height) = source.dimensions();
    if mask.dimensions() != (width, height) {
        tracing::info!(
            from = ?mask.dimensions(),
            to = ?(width, height),
            "resizing label mask to source resolution"
        );
    }

    let mask = reconcile_shape(mask, width, height);
    let palette = assign_palette(&instance_ids(&mask), colors);
    let overlay = build_overlay(&mask, &palette);
    let blended = blend(source, &overlay)?;

    Ok(Composition {
        palette,
        overlay,
        blended,
    })
}

pub fn reconcile_shape(mask: &LabelMask, width: u32, height: u32) -> Cow<'_, LabelMask> {
    if mask.dimensions() == (width, height) {
        Cow::Borrowed(mask)
    } else {
        Cow::Owned(resize_nearest(mask, width, height))
    }
}

/// Nearest-neighbor resampling by index mapping, `src = floor(dst * src_len / dst_len)`.
/// Every output value is copied from the input, so labels survive exactly.
fn resize_nearest(mask: &LabelMask, width: u32, height: u32) -> LabelMask {
    let (src_width, src_height) = mask.dimensions();
    if src_width == 0 || src_height == 0 {
        return LabelMask::new(width, height);
    }

    let nearest = |dst: u32, dst_len: u32, src_len: u32| -> usize {
        let src = u64::from(dst) * u64::from(src_len) / u64::from(dst_len);
        src.min(u64::from(src_len) - 1) as usize
    };
    let columns: Vec<usize> = (0..width)
        .map(|x| nearest(x, width, src_width))
        .collect();

    let source = mask.as_raw();
    let mut labels = vec![0u32; width as usize * height as usize];
    if width > 0 {
        labels
            .par_chunks_mut(width as usize)
            .enumerate()
            .for_each(|(y, row)| {
                let offset = nearest(y as u32, height, src_height) * src_width as usize;
                for (label, &x) in row.iter_mut().zip(&columns) {
                    *label = source[offset + x];
                }
            });
    }

    LabelMask::from_raw(width, height, labels).unwrap_or_else(|| LabelMask::new(width, height))
}

/// One color per instance, drawn in ascending label order.
pub fn assign_palette<C: ColorStrategy>(ids: &BTreeSet<u32>, colors: &mut C) -> Palette {
    ids.iter().map(|&id| (id, colors.next_color())).collect()
}

/// Zero raster with every labeled pixel painted in its instance color.
pub fn build_overlay(mask: &LabelMask, palette: &Palette) -> RgbImage {
    let mut overlay = RgbImage::new(mask.width(), mask.height());
    overlay
        .par_chunks_mut(3)
        .zip(mask.as_raw().par_iter())
        .for_each(|(pixel, label)| {
            if let Some(Rgb(color)) = palette.get(label) {
                pixel.copy_from_slice(color);
            }
        });
    overlay
}

/// `SOURCE_WEIGHT * source + OVERLAY_WEIGHT * overlay + BLEND_OFFSET`, per
/// channel, rounded and saturated to u8.
pub fn blend(source: &RgbImage, overlay: &RgbImage) -> Result<RgbImage> {
    if source.dimensions() != overlay.dimensions() {
        return Err(VistaSegError::Validation {
            field: "overlay".to_string(),
            reason: format!(
                "is {:?} but the source image is {:?}",
                overlay.dimensions(),
                source.dimensions()
            ),
        });
    }

    Ok(map_colors2(source, overlay, |Rgb(s), Rgb(o)| {
        Rgb([
            add_weighted(s[0], o[0]),
            add_weighted(s[1], o[1]),
            add_weighted(s[2], o[2]),
        ])
    }))
}

fn add_weighted(source: u8, overlay: u8) -> u8 {
    let value =
        SOURCE_WEIGHT * f64::from(source) + OVERLAY_WEIGHT * f64::from(overlay) + BLEND_OFFSET;
    value.round().clamp(0.0, 255.0) as u8
}
