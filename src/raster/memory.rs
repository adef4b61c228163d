//! In-memory raster backend.
//!
//! [`MemoryRaster`] holds a georeferenced band as an `ndarray` array, with an
//! optional block layout and validity band. [`MemoryDriver`] resolves handles
//! to registered rasters. Embedders use it for computed rasters; the test
//! suites use it as a deterministic stand-in for files.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use ndarray::{s, Array2};

use crate::error::RasterError;

use super::{
    resize_nearest, Affine, Crs, DataType, DatasetHandle, RasterDataset, RasterDriver, Window,
};

/// A georeferenced single-band raster held in memory.
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    handle: DatasetHandle,
    data: Array2<f64>,
    crs: Crs,
    transform: Affine,
    nodata: Option<f64>,
    dtype: DataType,
    block_shape: Option<(usize, usize)>,
    mask: Option<Array2<bool>>,
}

impl MemoryRaster {
    pub fn new(
        handle: impl Into<DatasetHandle>,
        data: Array2<f64>,
        crs: Crs,
        transform: Affine,
    ) -> Self {
        Self {
            handle: handle.into(),
            data,
            crs,
            transform,
            nodata: None,
            dtype: DataType::Float64,
            block_shape: None,
            mask: None,
        }
    }

    pub fn with_nodata(mut self, nodata: f64) -> Self {
        self.nodata = Some(nodata);
        self
    }

    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Expose a native block layout of `(rows, cols)` blocks.
    pub fn with_blocks(mut self, rows: usize, cols: usize) -> Self {
        self.block_shape = Some((rows.max(1), cols.max(1)));
        self
    }

    /// Attach a validity band (`true` = valid). Must match the data shape.
    pub fn with_mask(mut self, mask: Array2<bool>) -> Result<Self, RasterError> {
        if mask.dim() != self.data.dim() {
            return Err(RasterError::InvalidWindow(format!(
                "mask shape {:?} does not match data shape {:?}",
                mask.dim(),
                self.data.dim()
            )));
        }
        self.mask = Some(mask);
        Ok(self)
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }
}

impl RasterDataset for MemoryRaster {
    fn handle(&self) -> &DatasetHandle {
        &self.handle
    }

    fn crs(&self) -> &Crs {
        &self.crs
    }

    fn transform(&self) -> Affine {
        self.transform
    }

    fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    fn dtype(&self) -> DataType {
        self.dtype
    }

    fn has_mask(&self) -> bool {
        self.mask.is_some()
    }

    fn block_windows(&self) -> Option<Vec<Window>> {
        let (bh, bw) = self.block_shape?;
        let (height, width) = self.data.dim();
        let mut windows = Vec::new();
        for row_off in (0..height).step_by(bh) {
            for col_off in (0..width).step_by(bw) {
                windows.push(Window::new(
                    row_off,
                    col_off,
                    bh.min(height - row_off),
                    bw.min(width - col_off),
                ));
            }
        }
        Some(windows)
    }

    fn read_window(
        &self,
        window: Window,
        out_shape: (usize, usize),
    ) -> Result<Array2<f64>, RasterError> {
        window.check_within(self.shape())?;
        let view = self.data.slice(s![
            window.row_off..window.row_off + window.height,
            window.col_off..window.col_off + window.width
        ]);
        Ok(resize_nearest(view, out_shape))
    }

    fn read_mask(
        &self,
        window: Window,
        out_shape: (usize, usize),
    ) -> Result<Option<Array2<bool>>, RasterError> {
        let Some(mask) = &self.mask else {
            return Ok(None);
        };
        window.check_within(self.shape())?;
        let view = mask.slice(s![
            window.row_off..window.row_off + window.height,
            window.col_off..window.col_off + window.width
        ]);
        Ok(Some(resize_nearest(view, out_shape)))
    }
}

/// Driver resolving handles to registered [`MemoryRaster`]s.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    rasters: RwLock<HashMap<DatasetHandle, Arc<MemoryRaster>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raster under its handle, replacing any previous one.
    pub fn insert(&self, raster: MemoryRaster) -> DatasetHandle {
        let handle = raster.handle.clone();
        self.rasters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.clone(), Arc::new(raster));
        handle
    }

    pub fn remove(&self, handle: &DatasetHandle) -> bool {
        self.rasters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(handle)
            .is_some()
    }
}

impl RasterDriver for MemoryDriver {
    fn open(&self, handle: &DatasetHandle) -> Result<Arc<dyn RasterDataset>, RasterError> {
        let rasters = self.rasters.read().unwrap_or_else(PoisonError::into_inner);
        match rasters.get(handle) {
            Some(raster) => Ok(raster.clone() as Arc<dyn RasterDataset>),
            None => Err(RasterError::open(handle.as_str(), "no such dataset")),
        }
    }
}
