//! Dataset statistics and metadata.
//!
//! [`StatisticsEngine`] computes the per-dataset [`Metadata`] record used for
//! colorization and stretching. Two modes are available:
//!
//! - **Exact**: read the whole band (optionally downsampled to `max_shape`),
//!   compute statistics directly and percentiles by sorting.
//! - **Chunked**: walk the native block windows in parallel, feeding a
//!   [`TDigest`] and [`RunningStats`] per block and merging the results.
//!   Selected automatically for rasters above the large-raster threshold.
//!
//! Bounds and convex hull are always reported in WGS84.

mod digest;
mod hull;
mod summary;

use ndarray::{Array2, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::StatsError;
use crate::raster::crs::DEFAULT_DENSIFY_POINTS;
use crate::raster::{Bounds, Crs, CrsTransform, RasterDataset, Window};

pub use digest::{TDigest, DEFAULT_COMPRESSION};
pub use hull::{convex_hull, hull_candidates, pixel_corners, polygon_area, ConvexHull};
pub use summary::RunningStats;

/// Default pixel count above which chunked mode is used (one Sentinel-2 tile).
pub const DEFAULT_LARGE_RASTER_THRESHOLD: u64 = 10_980 * 10_980;

/// Percentiles reported in [`Metadata::percentiles`].
pub const PERCENTILES: std::ops::RangeInclusive<u32> = 1..=99;

// =============================================================================
// Metadata
// =============================================================================

/// Immutable summary of one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// WGS84 bounds
    pub bounds: Bounds,
    /// `(min, max)` of valid pixels
    pub range: (f64, f64),
    pub mean: f64,
    /// Population standard deviation
    pub stdev: f64,
    /// Percentiles 1 to 99, non-decreasing
    pub percentiles: Vec<f64>,
    /// Share of valid pixels, in percent
    pub valid_percentage: f64,
    /// WGS84 convex hull of the valid-data footprint
    pub convex_hull: ConvexHull,
    pub nodata: Option<f64>,
    /// Free-form caller metadata
    pub metadata: serde_json::Value,
}

impl Metadata {
    /// Value of percentile `p` (1 to 99).
    pub fn percentile(&self, p: u32) -> Option<f64> {
        if !PERCENTILES.contains(&p) {
            return None;
        }
        self.percentiles.get(p as usize - 1).copied()
    }
}

/// Options for [`StatisticsEngine::compute`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataOptions {
    /// Caller metadata stored verbatim
    pub extra: Option<serde_json::Value>,
    /// Force (`Some(true)`) or forbid (`Some(false)`) chunked mode
    pub use_chunks: Option<bool>,
    /// Downsample to at most `(rows, cols)` in exact mode
    pub max_shape: Option<(usize, usize)>,
}

// =============================================================================
// Accumulation
// =============================================================================

/// Statistics gathered over part of a raster.
#[derive(Debug, Clone, Default)]
struct Accumulator {
    total: u64,
    stats: RunningStats,
    digest: TDigest,
    hull: Vec<(f64, f64)>,
}

impl Accumulator {
    fn merge(mut self, other: Accumulator) -> Accumulator {
        self.total += other.total;
        self.stats.merge(&other.stats);
        self.digest.merge(&other.digest);
        self.hull.extend(other.hull);
        self.hull = convex_hull(std::mem::take(&mut self.hull));
        self
    }
}

/// Validity of each pixel: not nodata, finite, and not masked out.
fn valid_pixels(
    data: &Array2<f64>,
    nodata: Option<f64>,
    mask: Option<&Array2<bool>>,
) -> Array2<bool> {
    let mut valid = data.mapv(|v| {
        v.is_finite()
            && match nodata {
                Some(nd) => v != nd,
                None => true,
            }
    });
    if let Some(mask) = mask {
        Zip::from(&mut valid).and(mask).for_each(|v, m| *v &= *m);
    }
    valid
}

/// Percentile of sorted data with linear interpolation between ranks.
fn sorted_percentile(sorted: &[f64], p: f64) -> f64 {
    let position = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = position.floor() as usize;
    let hi = position.ceil() as usize;
    sorted[lo] + (position - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Clamp a percentile sequence to be non-decreasing.
fn monotone(mut values: Vec<f64>) -> Vec<f64> {
    for i in 1..values.len() {
        if values[i] < values[i - 1] {
            values[i] = values[i - 1];
        }
    }
    values
}

// =============================================================================
// StatisticsEngine
// =============================================================================

/// Computes [`Metadata`] for datasets.
#[derive(Debug, Clone)]
pub struct StatisticsEngine {
    large_raster_threshold: u64,
    compression: f64,
}

impl Default for StatisticsEngine {
    fn default() -> Self {
        Self::new(DEFAULT_LARGE_RASTER_THRESHOLD)
    }
}

impl StatisticsEngine {
    pub fn new(large_raster_threshold: u64) -> Self {
        Self {
            large_raster_threshold,
            compression: DEFAULT_COMPRESSION,
        }
    }

    /// Compute metadata for `dataset`.
    ///
    /// # Errors
    /// - `ConflictingOptions` if `use_chunks` and `max_shape` are combined
    /// - `NoValidData` if no pixel is valid
    /// - `Raster` if reads or transformations fail
    pub fn compute(
        &self,
        dataset: &dyn RasterDataset,
        options: &MetadataOptions,
    ) -> Result<Metadata, StatsError> {
        if options.use_chunks == Some(true) && options.max_shape.is_some() {
            return Err(StatsError::ConflictingOptions(
                "use_chunks and max_shape cannot be used together".to_string(),
            ));
        }

        let (height, width) = dataset.shape();
        let pixels = height as u64 * width as u64;
        let mut use_chunks = options
            .use_chunks
            .unwrap_or(options.max_shape.is_none() && pixels > self.large_raster_threshold);

        if dataset.nodata().is_none() && !dataset.has_mask() {
            warn!(
                handle = %dataset.handle(),
                "Raster has no nodata value and no mask band; no data will be masked"
            );
        }

        let windows = if use_chunks {
            match dataset.block_windows() {
                Some(windows) if !windows.is_empty() => Some(windows),
                _ => {
                    warn!(
                        handle = %dataset.handle(),
                        "No block layout available, falling back to exact statistics; \
                         this may be slow for large rasters"
                    );
                    use_chunks = false;
                    None
                }
            }
        } else {
            None
        };

        info!(
            handle = %dataset.handle(),
            height,
            width,
            chunked = use_chunks,
            "Computing raster metadata"
        );

        let (accumulated, percentiles) = match windows {
            Some(windows) => {
                let mut acc = self.accumulate_blocks(dataset, &windows)?;
                let percentiles = PERCENTILES
                    .map(|p| acc.digest.quantile(p as f64 / 100.0).unwrap_or(f64::NAN))
                    .collect();
                (acc, percentiles)
            }
            None => self.accumulate_exact(dataset, options.max_shape)?,
        };

        let (Some(mean), Some(stdev), Some(range)) = (
            accumulated.stats.mean(),
            accumulated.stats.stdev(),
            accumulated.stats.range(),
        ) else {
            return Err(StatsError::NoValidData {
                handle: dataset.handle().to_string(),
            });
        };

        let to_wgs84 = CrsTransform::new(*dataset.crs(), Crs::WGS84)?;
        let bounds = to_wgs84.transform_bounds(&dataset.bounds(), DEFAULT_DENSIFY_POINTS)?;
        let convex_hull =
            ConvexHull::from_vertices(&convex_hull(accumulated.hull)).reproject(&to_wgs84)?;

        Ok(Metadata {
            bounds,
            range,
            mean,
            stdev,
            percentiles: monotone(percentiles),
            valid_percentage: accumulated.stats.count() as f64 / accumulated.total as f64 * 100.0,
            convex_hull,
            nodata: dataset.nodata(),
            metadata: options
                .extra
                .clone()
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
        })
    }

    /// Whole-band statistics with exact percentiles.
    fn accumulate_exact(
        &self,
        dataset: &dyn RasterDataset,
        max_shape: Option<(usize, usize)>,
    ) -> Result<(Accumulator, Vec<f64>), StatsError> {
        let (height, width) = dataset.shape();
        let out_shape = match max_shape {
            Some((rows, cols)) => (height.min(rows.max(1)), width.min(cols.max(1))),
            None => (height, width),
        };
        let window = Window::full((height, width));
        let data = dataset.read_window(window, out_shape)?;
        let mask = dataset.read_mask(window, out_shape)?;
        let valid = valid_pixels(&data, dataset.nodata(), mask.as_ref());

        // Pixel size grows with the downsampling factor
        let transform = dataset.transform().scaled(
            width as f64 / out_shape.1 as f64,
            height as f64 / out_shape.0 as f64,
        );

        let mut values: Vec<f64> = data
            .iter()
            .zip(valid.iter())
            .filter_map(|(v, ok)| ok.then_some(*v))
            .collect();
        let mut stats = RunningStats::new();
        stats.extend(values.iter().copied());

        values.sort_by(f64::total_cmp);
        let percentiles = if values.is_empty() {
            Vec::new()
        } else {
            PERCENTILES
                .map(|p| sorted_percentile(&values, p as f64))
                .collect()
        };

        let candidates = hull_candidates(valid.view());
        let hull = convex_hull(pixel_corners(&candidates, (0, 0), &transform));

        Ok((
            Accumulator {
                total: (out_shape.0 * out_shape.1) as u64,
                stats,
                digest: TDigest::new(self.compression),
                hull,
            },
            percentiles,
        ))
    }

    /// Per-block statistics merged across all block windows.
    fn accumulate_blocks(
        &self,
        dataset: &dyn RasterDataset,
        windows: &[Window],
    ) -> Result<Accumulator, StatsError> {
        let nodata = dataset.nodata();
        let transform = dataset.transform();

        windows
            .par_iter()
            .map(|window| -> Result<Accumulator, StatsError> {
                let data = dataset.read_window(*window, window.shape())?;
                let mask = dataset.read_mask(*window, window.shape())?;
                let valid = valid_pixels(&data, nodata, mask.as_ref());

                let mut acc = Accumulator {
                    total: (window.height * window.width) as u64,
                    digest: TDigest::new(self.compression),
                    ..Default::default()
                };
                for (v, ok) in data.iter().zip(valid.iter()) {
                    if *ok {
                        acc.stats.push(*v);
                        acc.digest.push(*v);
                    }
                }

                let candidates = hull_candidates(valid.view());
                acc.hull = convex_hull(pixel_corners(
                    &candidates,
                    (window.row_off, window.col_off),
                    &transform,
                ));
                Ok(acc)
            })
            .try_reduce(Accumulator::default, |a, b| Ok(a.merge(b)))
    }
}

// =============================================================================
// Tests
// =============================================================================
