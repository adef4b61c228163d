//! Raster I/O collaborator.
//!
//! The tile and statistics engines never touch files directly. They open
//! datasets through a [`RasterDriver`] and read pixels through the
//! [`RasterDataset`] trait, which exposes just what they need:
//!
//! - native CRS, affine transform, shape, bounds, nodata and data type
//! - the native block layout (for chunked statistics)
//! - windowed band reads into an explicit output shape
//! - an optional per-pixel validity band
//!
//! Two backends ship with the crate: [`MemoryDriver`] for in-process arrays
//! and [`GeoTiffDriver`] for local GeoTIFF files. [`warp::WarpedView`] builds
//! reprojected virtual views on top of either.

pub mod crs;
pub mod geotiff;
pub mod memory;
pub mod registry;
pub mod warp;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::RasterError;

pub use crs::{Crs, CrsTransform};
pub use geotiff::GeoTiffDriver;
pub use memory::{MemoryDriver, MemoryRaster};
pub use registry::DatasetRegistry;
pub use warp::{WarpedRead, WarpedView};

// =============================================================================
// Dataset handle
// =============================================================================

/// Opaque locator of one raster resource (a path or URI).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetHandle(String);

impl DatasetHandle {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatasetHandle {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DatasetHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Geometry
// =============================================================================

/// Axis-aligned rectangle `(west, south, east, north)` in some CRS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl Bounds {
    pub const fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    /// Area, zero for inverted or degenerate rectangles.
    pub fn area(&self) -> f64 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Finite with a positive extent on both axes.
    pub fn is_valid(&self) -> bool {
        [self.west, self.south, self.east, self.north]
            .iter()
            .all(|v| v.is_finite())
            && self.east > self.west
            && self.north > self.south
    }

    /// Overlapping part of two rectangles, `None` if they do not overlap.
    pub fn intersection(&self, other: &Bounds) -> Option<Bounds> {
        let overlap = Bounds::new(
            self.west.max(other.west),
            self.south.max(other.south),
            self.east.min(other.east),
            self.north.min(other.north),
        );
        (overlap.width() > 0.0 && overlap.height() > 0.0).then_some(overlap)
    }

    /// Smallest rectangle holding every point, `None` for an empty input.
    pub fn from_points(points: impl IntoIterator<Item = (f64, f64)>) -> Option<Bounds> {
        points
            .into_iter()
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .fold(None, |acc: Option<Bounds>, (x, y)| {
                Some(match acc {
                    None => Bounds::new(x, y, x, y),
                    Some(b) => Bounds::new(b.west.min(x), b.south.min(y), b.east.max(x), b.north.max(y)),
                })
            })
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.west, self.south, self.east, self.north]
    }
}

/// Affine pixel-to-world transform.
///
/// `x = a * col + b * row + c`, `y = d * col + e * row + f`, where `(col, row)`
/// are pixel coordinates with `(0, 0)` at the outer corner of the first pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl Affine {
    pub const fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
        Self { a, b, c, d, e, f }
    }

    pub const fn from_coefficients(coefficients: [f64; 6]) -> Self {
        let [a, b, c, d, e, f] = coefficients;
        Self::new(a, b, c, d, e, f)
    }

    /// North-up transform mapping a `width x height` grid onto `bounds`.
    pub fn from_bounds(bounds: &Bounds, width: usize, height: usize) -> Self {
        Self::new(
            bounds.width() / width as f64,
            0.0,
            bounds.west,
            0.0,
            -bounds.height() / height as f64,
            bounds.north,
        )
    }

    /// World coordinates of pixel position `(col, row)`.
    #[inline]
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.a * col + self.b * row + self.c,
            self.d * col + self.e * row + self.f,
        )
    }

    pub fn determinant(&self) -> f64 {
        self.a * self.e - self.b * self.d
    }

    /// Inverse transform (world to pixel), `None` if singular.
    pub fn inverse(&self) -> Option<Affine> {
        let det = self.determinant();
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let ia = self.e / det;
        let ib = -self.b / det;
        let id = -self.d / det;
        let ie = self.a / det;
        Some(Affine::new(
            ia,
            ib,
            -(ia * self.c + ib * self.f),
            id,
            ie,
            -(id * self.c + ie * self.f),
        ))
    }

    /// Pixel size along columns and rows, always positive.
    pub fn resolution(&self) -> (f64, f64) {
        (self.a.hypot(self.d), self.b.hypot(self.e))
    }

    /// Same origin with pixels scaled by `(sx, sy)`.
    pub fn scaled(&self, sx: f64, sy: f64) -> Affine {
        Affine::new(
            self.a * sx,
            self.b * sy,
            self.c,
            self.d * sx,
            self.e * sy,
            self.f,
        )
    }

    /// Bounds of a `width x height` grid under this transform.
    pub fn bounds(&self, width: usize, height: usize) -> Bounds {
        let (w, h) = (width as f64, height as f64);
        let corners = [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)].map(|(c, r)| self.apply(c, r));
        Bounds::from_points(corners).unwrap_or(Bounds::new(0.0, 0.0, 0.0, 0.0))
    }
}

/// Rectangular pixel window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    pub row_off: usize,
    pub col_off: usize,
    pub height: usize,
    pub width: usize,
}

impl Window {
    pub const fn new(row_off: usize, col_off: usize, height: usize, width: usize) -> Self {
        Self {
            row_off,
            col_off,
            height,
            width,
        }
    }

    /// Window covering a whole `(height, width)` raster.
    pub const fn full(shape: (usize, usize)) -> Self {
        Self::new(0, 0, shape.0, shape.1)
    }

    pub const fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub const fn is_empty(&self) -> bool {
        self.height == 0 || self.width == 0
    }

    /// Check the window lies within a `(height, width)` raster.
    pub fn check_within(&self, shape: (usize, usize)) -> Result<(), RasterError> {
        if self.is_empty()
            || self.row_off + self.height > shape.0
            || self.col_off + self.width > shape.1
        {
            return Err(RasterError::InvalidWindow(format!(
                "{:?} does not fit a {}x{} raster",
                self, shape.0, shape.1
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Pixel types and resampling
// =============================================================================

/// Element type of a raster band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    UInt8,
    Int8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
    Float64,
}

impl DataType {
    pub fn name(self) -> &'static str {
        match self {
            DataType::UInt8 => "uint8",
            DataType::Int8 => "int8",
            DataType::UInt16 => "uint16",
            DataType::Int16 => "int16",
            DataType::UInt32 => "uint32",
            DataType::Int32 => "int32",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// One-byte tag used in cache entries.
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        [
            DataType::UInt8,
            DataType::Int8,
            DataType::UInt16,
            DataType::Int16,
            DataType::UInt32,
            DataType::Int32,
            DataType::Float32,
            DataType::Float64,
        ]
        .into_iter()
        .find(|dt| dt.tag() == tag)
    }
}

/// Resampling kernel used when reading or warping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    Nearest,
    Linear,
    Cubic,
    Average,
}

impl Resampling {
    pub fn as_str(self) -> &'static str {
        match self {
            Resampling::Nearest => "nearest",
            Resampling::Linear => "linear",
            Resampling::Cubic => "cubic",
            Resampling::Average => "average",
        }
    }
}

impl fmt::Display for Resampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resampling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(Resampling::Nearest),
            "linear" | "bilinear" => Ok(Resampling::Linear),
            "cubic" => Ok(Resampling::Cubic),
            "average" => Ok(Resampling::Average),
            other => Err(format!(
                "unknown resampling method '{}' (expected nearest, linear, cubic or average)",
                other
            )),
        }
    }
}

// =============================================================================
// Collaborator traits
// =============================================================================

/// An opened raster dataset. Only the first band is exposed.
pub trait RasterDataset: Send + Sync {
    fn handle(&self) -> &DatasetHandle;

    fn crs(&self) -> &Crs;

    fn transform(&self) -> Affine;

    /// `(height, width)` in pixels.
    fn shape(&self) -> (usize, usize);

    fn nodata(&self) -> Option<f64>;

    fn dtype(&self) -> DataType;

    /// Native bounds in the dataset CRS.
    fn bounds(&self) -> Bounds {
        let (height, width) = self.shape();
        self.transform().bounds(width, height)
    }

    /// Whether the dataset carries a per-pixel validity band.
    fn has_mask(&self) -> bool {
        false
    }

    /// Native block windows, `None` when the layout is unknown.
    fn block_windows(&self) -> Option<Vec<Window>>;

    /// Read `window` of the band into an array of `out_shape`.
    fn read_window(
        &self,
        window: Window,
        out_shape: (usize, usize),
    ) -> Result<Array2<f64>, RasterError>;

    /// Read the validity band (`true` = valid) if the dataset has one.
    fn read_mask(
        &self,
        _window: Window,
        _out_shape: (usize, usize),
    ) -> Result<Option<Array2<bool>>, RasterError> {
        Ok(None)
    }
}

/// Opens datasets by handle.
pub trait RasterDriver: Send + Sync {
    fn open(&self, handle: &DatasetHandle) -> Result<Arc<dyn RasterDataset>, RasterError>;
}

/// Nearest-neighbour resize of a 2-D array, shared by the backends.
pub(crate) fn resize_nearest<T: Copy>(
    source: ArrayView2<'_, T>,
    out_shape: (usize, usize),
) -> Array2<T> {
    let (src_h, src_w) = source.dim();
    if (src_h, src_w) == out_shape {
        return source.to_owned();
    }
    let (out_h, out_w) = out_shape;
    let sy = src_h as f64 / out_h as f64;
    let sx = src_w as f64 / out_w as f64;
    Array2::from_shape_fn(out_shape, |(r, c)| {
        let sr = (((r as f64 + 0.5) * sy) as usize).min(src_h - 1);
        let sc = (((c as f64 + 0.5) * sx) as usize).min(src_w - 1);
        source[[sr, sc]]
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_bounds_intersection() {
        let a = Bounds::new(0.0, 0.0, 10.0, 10.0);
        let b = Bounds::new(5.0, -5.0, 15.0, 5.0);
        assert_eq!(a.intersection(&b), Some(Bounds::new(5.0, 0.0, 10.0, 5.0)));

        let c = Bounds::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.intersection(&c), None);
        assert_eq!(Bounds::new(1.0, 1.0, 0.0, 0.0).area(), 0.0);
    }

    #[test]
    fn test_affine_roundtrip_and_bounds() {
        let bounds = Bounds::new(100.0, 200.0, 356.0, 456.0);
        let t = Affine::from_bounds(&bounds, 256, 128);
        assert_relative_eq!(t.a, 1.0);
        assert_relative_eq!(t.e, -2.0);
        assert_eq!(t.bounds(256, 128), bounds);

        let inv = t.inverse().unwrap();
        let (col, row) = inv.apply(150.5, 300.0);
        assert_relative_eq!(col, 50.5);
        assert_relative_eq!(row, 78.0);
        assert_eq!(t.resolution(), (1.0, 2.0));
    }

    #[test]
    fn test_singular_affine_has_no_inverse() {
        assert!(Affine::new(0.0, 0.0, 1.0, 0.0, 0.0, 1.0).inverse().is_none());
    }

    #[test]
    fn test_window_check() {
        let w = Window::new(10, 10, 20, 20);
        assert!(w.check_within((30, 30)).is_ok());
        assert!(w.check_within((29, 30)).is_err());
        assert!(Window::new(0, 0, 0, 5).check_within((10, 10)).is_err());
    }

    #[test]
    fn test_resampling_parse() {
        assert_eq!("Linear".parse::<Resampling>().unwrap(), Resampling::Linear);
        assert_eq!("bilinear".parse::<Resampling>().unwrap(), Resampling::Linear);
        assert_eq!(Resampling::Average.to_string(), "average");
        assert!("lanczos".parse::<Resampling>().is_err());
    }

    #[test]
    fn test_dtype_tags() {
        for dt in [DataType::UInt8, DataType::Int32, DataType::Float64] {
            assert_eq!(DataType::from_tag(dt.tag()), Some(dt));
        }
        assert_eq!(DataType::from_tag(42), None);
        assert!(DataType::Float32.is_float());
        assert_eq!(DataType::UInt16.name(), "uint16");
    }

    #[test]
    fn test_resize_nearest() {
        let a = array![[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0]];
        let down = resize_nearest(a.view(), (1, 2));
        assert_eq!(down, array![[6.0, 8.0]]);
        let same = resize_nearest(a.view(), (2, 4));
        assert_eq!(same, a);
    }
}
