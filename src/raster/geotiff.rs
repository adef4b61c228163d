//! GeoTIFF backend: opens local files through a [`FileRangeReader`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::Array2;

use crate::error::{IoError, RasterError};
use crate::format::tiff::SampleFormat;
use crate::format::{BlockLayout, GeoTiffReader};
use crate::io::{FileRangeReader, RangeReader};

use super::{
    resize_nearest, Affine, Crs, DataType, DatasetHandle, RasterDataset, RasterDriver, Window,
};

/// A GeoTIFF opened for reading.
#[derive(Debug)]
pub struct GeoTiffDataset {
    handle: DatasetHandle,
    reader: GeoTiffReader,
    crs: Crs,
    transform: Affine,
    dtype: DataType,
}

impl GeoTiffDataset {
    /// Open a dataset over any range reader.
    pub fn open(
        handle: DatasetHandle,
        reader: Arc<dyn RangeReader>,
    ) -> Result<Self, RasterError> {
        let tiff = GeoTiffReader::open(reader).map_err(|e| RasterError::open(handle.as_str(), e))?;

        let georef = tiff.georeference();
        let crs = georef.epsg.map(Crs::epsg).ok_or_else(|| {
            RasterError::open(handle.as_str(), "GeoKey directory has no EPSG code")
        })?;
        let transform = Affine::from_coefficients(georef.transform);

        let dtype = match tiff.sample_type() {
            (SampleFormat::Uint, 8) => DataType::UInt8,
            (SampleFormat::Int, 8) => DataType::Int8,
            (SampleFormat::Uint, 16) => DataType::UInt16,
            (SampleFormat::Int, 16) => DataType::Int16,
            (SampleFormat::Uint, 32) => DataType::UInt32,
            (SampleFormat::Int, 32) => DataType::Int32,
            (SampleFormat::Float, 32) => DataType::Float32,
            _ => DataType::Float64,
        };

        Ok(Self {
            handle,
            reader: tiff,
            crs,
            transform,
            dtype,
        })
    }

    pub fn layout(&self) -> BlockLayout {
        self.reader.layout()
    }
}

impl RasterDataset for GeoTiffDataset {
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
        (self.reader.height() as usize, self.reader.width() as usize)
    }

    fn nodata(&self) -> Option<f64> {
        self.reader.nodata()
    }

    fn dtype(&self) -> DataType {
        self.dtype
    }

    fn block_windows(&self) -> Option<Vec<Window>> {
        Some(
            self.reader
                .block_windows()
                .into_iter()
                .map(|(row_off, col_off, height, width)| {
                    Window::new(row_off, col_off, height, width)
                })
                .collect(),
        )
    }

    fn read_window(
        &self,
        window: Window,
        out_shape: (usize, usize),
    ) -> Result<Array2<f64>, RasterError> {
        window.check_within(self.shape())?;
        let region = self.reader.read_region(
            window.row_off,
            window.col_off,
            window.height,
            window.width,
        )?;
        Ok(resize_nearest(region.view(), out_shape))
    }
}

/// Driver opening handles as local GeoTIFF paths.
///
/// Relative handles are resolved against an optional root directory.
#[derive(Debug, Clone, Default)]
pub struct GeoTiffDriver {
    root: Option<PathBuf>,
}

impl GeoTiffDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, handle: &DatasetHandle) -> PathBuf {
        let path = Path::new(handle.as_str());
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl RasterDriver for GeoTiffDriver {
    fn open(&self, handle: &DatasetHandle) -> Result<Arc<dyn RasterDataset>, RasterError> {
        let path = self.resolve(handle);
        let reader = FileRangeReader::open(&path).map_err(|e| match e {
            IoError::NotFound(_) => RasterError::open(
                handle.as_str(),
                format!("no such file: {}", path.display()),
            ),
            other => RasterError::open(handle.as_str(), other),
        })?;
        let dataset = GeoTiffDataset::open(handle.clone(), Arc::new(reader))?;
        Ok(Arc::new(dataset))
    }
}
