//! Imaging helpers: contrast stretching, 8-bit conversion and PNG output.
//!
//! 8-bit output reserves value `0` for nodata; valid pixels map onto
//! `1..=255`. PNG output carries an alpha channel so nodata renders
//! transparent.

use std::io::Cursor;

use bytes::Bytes;
use image::{GrayAlphaImage, ImageFormat, LumaA, Rgba, RgbaImage};
use ndarray::Array2;

use crate::error::TileError;

/// Linearly map `in_range` onto `out_range`, clipping to `out_range`.
///
/// A zero-width input range maps everything to the lower output bound.
/// NaN stays NaN.
pub fn contrast_stretch(
    data: &Array2<f64>,
    in_range: (f64, f64),
    out_range: (f64, f64),
) -> Array2<f64> {
    let (in_lo, in_hi) = in_range;
    let (out_lo, out_hi) = out_range;
    let width = in_hi - in_lo;
    data.mapv(|v| {
        let normalized = if width != 0.0 { (v - in_lo) / width } else { 0.0 * v };
        out_lo + normalized.clamp(0.0, 1.0) * (out_hi - out_lo)
    })
}

/// Scale `data` from `[min, max]` to `1..=255`; NaN becomes `0`.
pub fn to_uint8(data: &Array2<f64>, min: f64, max: f64) -> Array2<u8> {
    contrast_stretch(data, (min, max), (1.0, 255.0)).mapv(|v| {
        if v.is_nan() {
            0
        } else {
            v.round() as u8
        }
    })
}

/// Encode one (grayscale) or three (RGB) 8-bit channels as PNG.
///
/// Pixels flagged in `mask` are transparent. Without a mask, pixels whose
/// channels are all `0` are transparent.
pub fn encode_png(channels: &[Array2<u8>], mask: Option<&Array2<bool>>) -> Result<Bytes, TileError> {
    let Some(first) = channels.first() else {
        return Err(TileError::Encode("no channels to encode".to_string()));
    };
    let (rows, cols) = first.dim();
    if channels.iter().any(|c| c.dim() != (rows, cols)) || mask.is_some_and(|m| m.dim() != (rows, cols)) {
        return Err(TileError::Encode("channel shapes differ".to_string()));
    }
    let (width, height) = (
        u32::try_from(cols).map_err(|e| TileError::Encode(e.to_string()))?,
        u32::try_from(rows).map_err(|e| TileError::Encode(e.to_string()))?,
    );

    let transparent = |r: usize, c: usize| match mask {
        Some(m) => m[[r, c]],
        None => channels.iter().all(|ch| ch[[r, c]] == 0),
    };
    let alpha = |r: usize, c: usize| if transparent(r, c) { 0 } else { 255 };

    let mut out = Cursor::new(Vec::new());
    let written = match channels {
        [gray] => GrayAlphaImage::from_fn(width, height, |x, y| {
            let (r, c) = (y as usize, x as usize);
            LumaA([gray[[r, c]], alpha(r, c)])
        })
        .write_to(&mut out, ImageFormat::Png),
        [red, green, blue] => RgbaImage::from_fn(width, height, |x, y| {
            let (r, c) = (y as usize, x as usize);
            Rgba([red[[r, c]], green[[r, c]], blue[[r, c]], alpha(r, c)])
        })
        .write_to(&mut out, ImageFormat::Png),
        _ => {
            return Err(TileError::Encode(format!(
                "expected 1 or 3 channels, got {}",
                channels.len()
            )))
        }
    };
    written.map_err(|e| TileError::Encode(e.to_string()))?;

    Ok(Bytes::from(out.into_inner()))
}
