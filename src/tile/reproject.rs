//! Tile reprojection and windowing.
//!
//! [`TileReprojector`] turns a dataset plus requested target bounds into a
//! masked grid of the requested size:
//!
//! 1. reproject the dataset bounds into the target CRS and reject tiles the
//!    dataset barely covers, before any pixel is decoded;
//! 2. derive a stable target resolution from the reprojected corners;
//! 3. pick the warp and read kernels;
//! 4. build a padded [`WarpedView`] over the tile bounds and read the
//!    unpadded window at the tile size;
//! 5. mask pixels outside the footprint and pixels equal to nodata.

use tracing::{debug, warn};

use crate::error::{RasterError, TileError};
use crate::raster::crs::DEFAULT_DENSIFY_POINTS;
use crate::raster::{
    Affine, Bounds, Crs, CrsTransform, RasterDataset, Resampling, WarpedView, Window,
};

use super::grid::{RasterTile, TileSize};

/// Default minimum share of a tile the dataset has to cover.
pub const DEFAULT_OUT_OF_BOUNDS_THRESHOLD: f64 = 0.01;

/// Default margin, in view pixels, added around the tile bounds.
pub const DEFAULT_VRT_PADDING: usize = 2;

/// Edge samples used when reprojecting full dataset bounds.
const FULL_BOUNDS_DENSIFY_POINTS: usize = 100;

/// Reprojection settings shared by all tile reads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReprojectOptions {
    pub target_crs: Crs,
    /// Warp kernel when the output is finer than the source
    pub upsampling: Resampling,
    /// Read kernel when the output is coarser than the source
    pub downsampling: Resampling,
    pub out_of_bounds_threshold: f64,
    pub vrt_padding: usize,
    /// Sample the view at tile resolution when the tile is finer than the
    /// dataset
    pub native_resolution_fallback: bool,
}

impl Default for ReprojectOptions {
    fn default() -> Self {
        Self {
            target_crs: Crs::WEB_MERCATOR,
            upsampling: Resampling::Linear,
            downsampling: Resampling::Nearest,
            out_of_bounds_threshold: DEFAULT_OUT_OF_BOUNDS_THRESHOLD,
            vrt_padding: DEFAULT_VRT_PADDING,
            native_resolution_fallback: true,
        }
    }
}

/// Grid of a reprojected dataset: transform and `(rows, cols)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetGrid {
    pub transform: Affine,
    pub width: usize,
    pub height: usize,
}

impl TargetGrid {
    /// Pixel size `(x, y)`, both positive.
    pub fn resolution(&self) -> (f64, f64) {
        (self.transform.a.abs(), self.transform.e.abs())
    }
}

/// Target grid for a dataset reprojected from `src_crs` to `dst_crs`.
///
/// The resolution comes from the inner box spanned by the four reprojected
/// corners, so that pixel counts stay stable for rotated or sheared
/// footprints. It is then applied to the densified full bounds.
pub fn default_transform(
    src_crs: Crs,
    dst_crs: Crs,
    width: usize,
    height: usize,
    bounds: &Bounds,
) -> Result<TargetGrid, RasterError> {
    let forward = CrsTransform::new(src_crs, dst_crs)?;
    let full = forward.transform_bounds(bounds, FULL_BOUNDS_DENSIFY_POINTS)?;

    let sw = forward.transform_point(bounds.west, bounds.south)?;
    let nw = forward.transform_point(bounds.west, bounds.north)?;
    let se = forward.transform_point(bounds.east, bounds.south)?;
    let ne = forward.transform_point(bounds.east, bounds.north)?;
    let inner = Bounds::new(
        sw.0.max(nw.0),
        sw.1.max(se.1),
        se.0.min(ne.0),
        nw.1.min(ne.1),
    );
    let reference = if inner.is_valid() { inner } else { full };

    let res_x = reference.width() / width.max(1) as f64;
    let res_y = reference.height() / height.max(1) as f64;
    if !(res_x > 0.0 && res_y > 0.0) {
        return Err(RasterError::Transform(format!(
            "degenerate target resolution for bounds {:?}",
            bounds.to_array()
        )));
    }

    let out_width = ((full.width() / res_x).ceil() as usize).max(1);
    let out_height = ((full.height() / res_y).ceil() as usize).max(1);
    let transform = Affine::new(res_x, 0.0, full.west, 0.0, -res_y, full.north);
    Ok(TargetGrid {
        transform,
        width: out_width,
        height: out_height,
    })
}

/// Share of `tile` covered by `dataset`, in `[0, 1]`.
pub fn coverage_ratio(dataset: &Bounds, tile: &Bounds) -> f64 {
    let tile_area = tile.area();
    if tile_area <= 0.0 {
        return 0.0;
    }
    dataset
        .intersection(tile)
        .map_or(0.0, |overlap| (overlap.area() / tile_area).min(1.0))
}

/// Reads reprojected, masked tiles from datasets.
#[derive(Debug, Clone, Default)]
pub struct TileReprojector {
    options: ReprojectOptions,
}

impl TileReprojector {
    pub fn new(options: ReprojectOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ReprojectOptions {
        &self.options
    }

    /// Dataset bounds in the target CRS.
    pub fn target_bounds(&self, dataset: &dyn RasterDataset) -> Result<Bounds, RasterError> {
        CrsTransform::new(*dataset.crs(), self.options.target_crs)?
            .transform_bounds(&dataset.bounds(), DEFAULT_DENSIFY_POINTS)
    }

    /// Read `bounds` (target CRS) of `dataset` into a `tile_size` grid.
    ///
    /// # Errors
    /// - [`TileError::OutOfBounds`] if the dataset covers less than the
    ///   configured share of the tile; no pixel is read in that case
    /// - [`TileError::Raster`] if a transform or read fails
    pub fn reproject_tile(
        &self,
        dataset: &dyn RasterDataset,
        bounds: Option<Bounds>,
        tile_size: TileSize,
        preserve_values: bool,
    ) -> Result<RasterTile, TileError> {
        if tile_size.is_empty() {
            return Err(TileError::InvalidRequest(format!(
                "tile size must be positive, got {}x{}",
                tile_size.width, tile_size.height
            )));
        }
        let options = &self.options;
        let dataset_bounds = self.target_bounds(dataset)?;
        let tile_bounds = bounds.unwrap_or(dataset_bounds);
        if !tile_bounds.is_valid() {
            return Err(TileError::InvalidRequest(format!(
                "invalid tile bounds {:?}",
                tile_bounds.to_array()
            )));
        }

        let coverage = coverage_ratio(&dataset_bounds, &tile_bounds);
        if coverage < options.out_of_bounds_threshold {
            return Err(TileError::OutOfBounds {
                coverage,
                threshold: options.out_of_bounds_threshold,
            });
        }

        let (height, width) = dataset.shape();
        let grid = default_transform(
            *dataset.crs(),
            options.target_crs,
            width,
            height,
            &dataset.bounds(),
        )?;
        let mut resolution = grid.resolution();

        let tile_res = (
            tile_bounds.width() / tile_size.width as f64,
            tile_bounds.height() / tile_size.height as f64,
        );

        // Zoomed in past the native resolution: the view is sampled at tile
        // resolution, so the read just picks view pixels
        let zoomed_in = options.native_resolution_fallback
            && (tile_res.0 < resolution.0 || tile_res.1 < resolution.1);
        if zoomed_in {
            debug!(
                handle = %dataset.handle(),
                tile_res = ?tile_res,
                native_res = ?resolution,
                "Using tile resolution for warped view"
            );
            resolution = tile_res;
        }

        let (warp_kernel, read_kernel) = if preserve_values {
            (Resampling::Nearest, Resampling::Nearest)
        } else if zoomed_in {
            (options.upsampling, Resampling::Nearest)
        } else {
            (options.upsampling, options.downsampling)
        };

        let view_width = ((tile_bounds.width() / resolution.0).round() as usize).max(1);
        let view_height = ((tile_bounds.height() / resolution.1).round() as usize).max(1);
        let pad = options.vrt_padding;

        let unpadded = Affine::from_bounds(&tile_bounds, view_width, view_height);
        let (origin_x, origin_y) = unpadded.apply(-(pad as f64), -(pad as f64));
        let view_transform = Affine::new(
            unpadded.a,
            unpadded.b,
            origin_x,
            unpadded.d,
            unpadded.e,
            origin_y,
        );

        let view = WarpedView::new(
            dataset,
            options.target_crs,
            view_transform,
            (view_height + 2 * pad, view_width + 2 * pad),
            warp_kernel,
        )?;
        let window = Window::new(pad, pad, view_height, view_width);
        let read = view.read(window, tile_size.shape(), read_kernel)?;

        let nodata = dataset.nodata();
        if nodata.is_none() && !dataset.has_mask() {
            warn!(
                handle = %dataset.handle(),
                "Dataset has neither nodata value nor mask band; no pixels are masked"
            );
        }

        let mut mask = read.valid.mapv(|valid| !valid);
        if let Some(nd) = nodata {
            mask.zip_mut_with(&read.data, |m, &v| {
                *m |= if nd.is_nan() { v.is_nan() } else { v == nd };
            });
        }

        Ok(RasterTile::new(read.data, mask, dataset.dtype())?)
    }
}
