//! Warped virtual views.
//!
//! A [`WarpedView`] presents a source dataset on a grid in another CRS
//! without materializing it. Reads map every requested output pixel back to
//! the source: output pixel → view pixel → view CRS → source CRS → source
//! pixel, then sample the source with the view's warp kernel.
//!
//! Two kernels are involved in a read, mirroring a GDAL warped VRT:
//! - the **warp** kernel (fixed per view) interpolates source pixels at a
//!   view pixel position;
//! - the **read** kernel (per call) resamples view pixels into the output
//!   shape: `nearest` snaps to view pixel centers, `linear`/`cubic` sample
//!   the exact output pixel center, `average` averages a sub-sample grid.
//!
//! Source pixels equal to nodata, NaN, or flagged by the source mask are
//! invalid inputs. Output pixels outside the source footprint, or with no
//! valid input under the kernel, come back invalid in [`WarpedRead::valid`].

use ndarray::Array2;

use crate::error::RasterError;

use super::{Affine, Crs, CrsTransform, RasterDataset, Resampling, Window};

/// Maximum sub-samples per axis for `average` reads.
const MAX_AVERAGE_SAMPLES: usize = 4;

/// Extra source pixels read around the sampled footprint.
const KERNEL_MARGIN: usize = 2;

/// Result of a warped read.
#[derive(Debug, Clone, PartialEq)]
pub struct WarpedRead {
    pub data: Array2<f64>,
    /// Alpha band: `true` where the output pixel holds valid data
    pub valid: Array2<bool>,
}

/// Source pixels read for one warped read, with their validity.
struct SourceBuffer {
    values: Array2<f64>,
    valid: Array2<bool>,
    /// Source pixel origin of the buffer
    origin: (f64, f64),
    /// Buffer pixels per source pixel `(x, y)`
    scale: (f64, f64),
}

impl SourceBuffer {
    fn dims(&self) -> (isize, isize) {
        let (h, w) = self.values.dim();
        (h as isize, w as isize)
    }

    #[inline]
    fn at(&self, row: isize, col: isize) -> Option<f64> {
        let (h, w) = self.dims();
        let r = row.clamp(0, h - 1) as usize;
        let c = col.clamp(0, w - 1) as usize;
        self.valid[[r, c]].then(|| self.values[[r, c]])
    }

    /// Weighted sum over valid neighbours, renormalized by their weight.
    fn weighted(&self, taps: impl Iterator<Item = (isize, isize, f64)>) -> Option<f64> {
        let mut sum = 0.0;
        let mut weight = 0.0;
        for (r, c, w) in taps {
            if w == 0.0 {
                continue;
            }
            if let Some(v) = self.at(r, c) {
                sum += v * w;
                weight += w;
            }
        }
        (weight.abs() > 1e-12).then(|| sum / weight)
    }

    /// Sample at buffer position `(x, y)`; pixel `k` covers `[k, k + 1)`.
    fn sample(&self, x: f64, y: f64, kernel: Resampling, footprint: (f64, f64)) -> Option<f64> {
        match kernel {
            Resampling::Nearest => self.at(y.floor() as isize, x.floor() as isize),
            Resampling::Linear => {
                let (fx, fy) = (x - 0.5, y - 0.5);
                let (x0, y0) = (fx.floor(), fy.floor());
                let (tx, ty) = (fx - x0, fy - y0);
                let (x0, y0) = (x0 as isize, y0 as isize);
                self.weighted(
                    [
                        (y0, x0, (1.0 - tx) * (1.0 - ty)),
                        (y0, x0 + 1, tx * (1.0 - ty)),
                        (y0 + 1, x0, (1.0 - tx) * ty),
                        (y0 + 1, x0 + 1, tx * ty),
                    ]
                    .into_iter(),
                )
            }
            Resampling::Cubic => {
                let (fx, fy) = (x - 0.5, y - 0.5);
                let (x0, y0) = (fx.floor(), fy.floor());
                let (tx, ty) = (fx - x0, fy - y0);
                let (x0, y0) = (x0 as isize, y0 as isize);
                let taps = (-1..=2).flat_map(move |j| {
                    (-1..=2).map(move |i| {
                        (
                            y0 + j,
                            x0 + i,
                            cubic_weight(i as f64 - tx) * cubic_weight(j as f64 - ty),
                        )
                    })
                });
                self.weighted(taps)
            }
            Resampling::Average => {
                let (hx, hy) = (footprint.0.max(1.0) / 2.0, footprint.1.max(1.0) / 2.0);
                let c0 = (x - hx).floor() as isize;
                let c1 = (x + hx).ceil() as isize;
                let r0 = (y - hy).floor() as isize;
                let r1 = (y + hy).ceil() as isize;
                let taps = (r0..r1).flat_map(move |r| {
                    (c0..c1).filter_map(move |c| {
                        let (cx, cy) = (c as f64 + 0.5, r as f64 + 0.5);
                        (cx >= x - hx && cx <= x + hx && cy >= y - hy && cy <= y + hy)
                            .then_some((r, c, 1.0))
                    })
                });
                self.weighted(taps)
                    .or_else(|| self.at(y.floor() as isize, x.floor() as isize))
            }
        }
    }
}

/// Keys cubic convolution kernel with `a = -0.5`.
fn cubic_weight(t: f64) -> f64 {
    let a = -0.5;
    let t = t.abs();
    if t <= 1.0 {
        (a + 2.0) * t.powi(3) - (a + 3.0) * t.powi(2) + 1.0
    } else if t < 2.0 {
        a * t.powi(3) - 5.0 * a * t.powi(2) + 8.0 * a * t - 4.0 * a
    } else {
        0.0
    }
}

// =============================================================================
// WarpedView
// =============================================================================

/// A reprojected virtual view over a source dataset.
pub struct WarpedView<'a> {
    source: &'a dyn RasterDataset,
    crs: Crs,
    transform: Affine,
    shape: (usize, usize),
    warp_resampling: Resampling,
    to_source: CrsTransform,
}

impl<'a> WarpedView<'a> {
    /// Create a view of `source` on the grid `transform` x `shape` (rows, cols)
    /// in `crs`, warping with `warp_resampling`.
    pub fn new(
        source: &'a dyn RasterDataset,
        crs: Crs,
        transform: Affine,
        shape: (usize, usize),
        warp_resampling: Resampling,
    ) -> Result<Self, RasterError> {
        if transform.inverse().is_none() {
            return Err(RasterError::InvalidWindow(format!(
                "singular view transform {:?}",
                transform
            )));
        }
        let to_source = CrsTransform::new(crs, *source.crs())?;
        Ok(Self {
            source,
            crs,
            transform,
            shape,
            warp_resampling,
            to_source,
        })
    }

    pub fn crs(&self) -> Crs {
        self.crs
    }

    pub fn transform(&self) -> Affine {
        self.transform
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Read `window` of the view into `out_shape`, resampling with `resampling`.
    pub fn read(
        &self,
        window: Window,
        out_shape: (usize, usize),
        resampling: Resampling,
    ) -> Result<WarpedRead, RasterError> {
        window.check_within(self.shape)?;
        let (out_h, out_w) = out_shape;
        if out_h == 0 || out_w == 0 {
            return Err(RasterError::InvalidWindow(format!(
                "empty output shape {:?}",
                out_shape
            )));
        }

        let scale_r = window.height as f64 / out_h as f64;
        let scale_c = window.width as f64 / out_w as f64;
        let (sub_r, sub_c) = match resampling {
            Resampling::Average => (
                (scale_r.ceil() as usize).clamp(1, MAX_AVERAGE_SAMPLES),
                (scale_c.ceil() as usize).clamp(1, MAX_AVERAGE_SAMPLES),
            ),
            _ => (1, 1),
        };

        // Source pixel position of every sample, None outside the source
        let src_inverse = self.source.transform().inverse().ok_or_else(|| {
            RasterError::Read(format!("singular transform on {}", self.source.handle()))
        })?;
        let (src_h, src_w) = self.source.shape();
        let samples_per_pixel = sub_r * sub_c;
        let mut positions: Vec<Option<(f64, f64)>> =
            Vec::with_capacity(out_h * out_w * samples_per_pixel);

        for i in 0..out_h {
            for j in 0..out_w {
                for si in 0..sub_r {
                    for sj in 0..sub_c {
                        let mut row =
                            window.row_off as f64 + (i as f64 + (si as f64 + 0.5) / sub_r as f64) * scale_r;
                        let mut col =
                            window.col_off as f64 + (j as f64 + (sj as f64 + 0.5) / sub_c as f64) * scale_c;
                        if resampling == Resampling::Nearest {
                            row = row.floor() + 0.5;
                            col = col.floor() + 0.5;
                        }
                        let (x, y) = self.transform.apply(col, row);
                        let position = self
                            .to_source
                            .transform_point(x, y)
                            .ok()
                            .map(|(sx, sy)| src_inverse.apply(sx, sy))
                            .filter(|(c, r)| {
                                *c >= 0.0 && *r >= 0.0 && *c < src_w as f64 && *r < src_h as f64
                            });
                        positions.push(position);
                    }
                }
            }
        }

        let fill = self.source.nodata().unwrap_or(0.0);
        let mut data = Array2::from_elem(out_shape, fill);
        let mut valid = Array2::from_elem(out_shape, false);

        let Some(buffer) = self.read_source(&positions, out_shape, (sub_r, sub_c))? else {
            return Ok(WarpedRead { data, valid });
        };

        // View pixel size in buffer pixels, for the average warp kernel
        let footprint = self.footprint(&positions, &buffer, window, out_shape, (sub_r, sub_c));

        for i in 0..out_h {
            for j in 0..out_w {
                let base = (i * out_w + j) * samples_per_pixel;
                let mut sum = 0.0;
                let mut count = 0usize;
                for position in positions[base..base + samples_per_pixel].iter().flatten() {
                    let bx = (position.0 - buffer.origin.0) * buffer.scale.0;
                    let by = (position.1 - buffer.origin.1) * buffer.scale.1;
                    if let Some(v) = buffer.sample(bx, by, self.warp_resampling, footprint) {
                        sum += v;
                        count += 1;
                    }
                }
                if count > 0 {
                    data[[i, j]] = sum / count as f64;
                    valid[[i, j]] = true;
                }
            }
        }

        Ok(WarpedRead { data, valid })
    }

    /// Read the source region touched by `positions`, decimated to roughly
    /// twice the sampling density. `None` if no sample hits the source.
    fn read_source(
        &self,
        positions: &[Option<(f64, f64)>],
        out_shape: (usize, usize),
        sub: (usize, usize),
    ) -> Result<Option<SourceBuffer>, RasterError> {
        let (src_h, src_w) = self.source.shape();
        let Some((min_c, min_r, max_c, max_r)) = positions.iter().flatten().fold(
            None,
            |acc: Option<(f64, f64, f64, f64)>, &(c, r)| {
                Some(match acc {
                    None => (c, r, c, r),
                    Some((a, b, x, y)) => (a.min(c), b.min(r), x.max(c), y.max(r)),
                })
            },
        ) else {
            return Ok(None);
        };

        let c0 = (min_c.floor() as usize).saturating_sub(KERNEL_MARGIN);
        let r0 = (min_r.floor() as usize).saturating_sub(KERNEL_MARGIN);
        let c1 = (max_c.floor() as usize + 1 + KERNEL_MARGIN).min(src_w);
        let r1 = (max_r.floor() as usize + 1 + KERNEL_MARGIN).min(src_h);
        let region = Window::new(r0, c0, r1 - r0, c1 - c0);

        let read_h = region.height.min(2 * out_shape.0 * sub.0).max(1);
        let read_w = region.width.min(2 * out_shape.1 * sub.1).max(1);
        let values = self.source.read_window(region, (read_h, read_w))?;
        let mask = self.source.read_mask(region, (read_h, read_w))?;

        let nodata = self.source.nodata();
        let valid = Array2::from_shape_fn((read_h, read_w), |(r, c)| {
            let v = values[[r, c]];
            let is_nodata = match nodata {
                Some(nd) if nd.is_nan() => v.is_nan(),
                Some(nd) => v == nd,
                None => false,
            };
            !v.is_nan() && !is_nodata && mask.as_ref().map_or(true, |m| m[[r, c]])
        });

        Ok(Some(SourceBuffer {
            values,
            valid,
            origin: (c0 as f64, r0 as f64),
            scale: (
                read_w as f64 / region.width as f64,
                read_h as f64 / region.height as f64,
            ),
        }))
    }

    /// Approximate size of one view pixel in buffer pixels.
    fn footprint(
        &self,
        positions: &[Option<(f64, f64)>],
        buffer: &SourceBuffer,
        window: Window,
        out_shape: (usize, usize),
        sub: (usize, usize),
    ) -> (f64, f64) {
        if self.warp_resampling != Resampling::Average {
            return (1.0, 1.0);
        }
        let (mut min_c, mut min_r) = (f64::INFINITY, f64::INFINITY);
        let (mut max_c, mut max_r) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for &(c, r) in positions.iter().flatten() {
            min_c = min_c.min(c);
            max_c = max_c.max(c);
            min_r = min_r.min(r);
            max_r = max_r.max(r);
        }
        let view_cols = window.width as f64 * (out_shape.1 * sub.1 - 1).max(1) as f64
            / (out_shape.1 * sub.1) as f64;
        let view_rows = window.height as f64 * (out_shape.0 * sub.0 - 1).max(1) as f64
            / (out_shape.0 * sub.0) as f64;
        (
            ((max_c - min_c) / view_cols * buffer.scale.0).max(1.0),
            ((max_r - min_r) / view_rows * buffer.scale.1).max(1.0),
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
