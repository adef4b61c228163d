//! Masked grids and tile requests.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

use crate::error::RasterError;
use crate::raster::{Bounds, DataType, DatasetHandle};

/// Default tile edge length in pixels.
pub const DEFAULT_TILE_SIZE: usize = 256;

// =============================================================================
// Tile Size
// =============================================================================

/// Output size of a tile in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileSize {
    pub width: usize,
    pub height: usize,
}

impl TileSize {
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub const fn square(edge: usize) -> Self {
        Self::new(edge, edge)
    }

    /// Array shape `(rows, cols)`.
    pub const fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl Default for TileSize {
    fn default() -> Self {
        Self::square(DEFAULT_TILE_SIZE)
    }
}

impl fmt::Display for TileSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Parses `WIDTHxHEIGHT` or a single edge length.
impl FromStr for TileSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid tile size '{}' (expected WIDTHxHEIGHT)", s))
        };
        match s.split_once(['x', 'X']) {
            Some((width, height)) => Ok(Self::new(parse(width)?, parse(height)?)),
            None => parse(s).map(Self::square),
        }
    }
}

// =============================================================================
// Raster Tile
// =============================================================================

/// A decoded tile: numeric grid plus validity mask (`true` = invalid).
///
/// Both arrays always share one shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterTile {
    data: Array2<f64>,
    mask: Array2<bool>,
    dtype: DataType,
}

impl RasterTile {
    pub fn new(data: Array2<f64>, mask: Array2<bool>, dtype: DataType) -> Result<Self, RasterError> {
        if data.dim() != mask.dim() {
            return Err(RasterError::InvalidWindow(format!(
                "mask shape {:?} does not match data shape {:?}",
                mask.dim(),
                data.dim()
            )));
        }
        Ok(Self { data, mask, dtype })
    }

    /// A tile with nothing masked.
    pub fn unmasked(data: Array2<f64>, dtype: DataType) -> Self {
        let mask = Array2::from_elem(data.dim(), false);
        Self { data, mask, dtype }
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn mask(&self) -> &Array2<bool> {
        &self.mask
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn valid_count(&self) -> usize {
        self.mask.iter().filter(|m| !**m).count()
    }

    /// Copy of the grid with masked pixels set to NaN.
    pub fn masked_data(&self) -> Array2<f64> {
        let mut out = self.data.clone();
        Zip::from(&mut out).and(&self.mask).for_each(|v, &m| {
            if m {
                *v = f64::NAN;
            }
        });
        out
    }

    pub fn into_parts(self) -> (Array2<f64>, Array2<bool>, DataType) {
        (self.data, self.mask, self.dtype)
    }
}

// =============================================================================
// Tile Request
// =============================================================================

/// Parameters of one tile retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct TileRequest {
    pub handle: DatasetHandle,
    /// Bounds in the target CRS; `None` requests a preview of the whole dataset
    pub bounds: Option<Bounds>,
    pub tile_size: TileSize,
    /// Use nearest-neighbour resampling throughout (categorical data)
    pub preserve_values: bool,
}

impl TileRequest {
    pub fn new(handle: impl Into<DatasetHandle>) -> Self {
        Self {
            handle: handle.into(),
            bounds: None,
            tile_size: TileSize::default(),
            preserve_values: false,
        }
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn with_tile_size(mut self, tile_size: TileSize) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn preserve_values(mut self, preserve: bool) -> Self {
        self.preserve_values = preserve;
        self
    }
}
