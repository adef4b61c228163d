//! Test utilities for integration tests.
//!
//! This module provides fixture builders for in-memory rasters, a counting
//! driver that records how often datasets are opened and read, and a builder
//! for GeoTIFF files with various layouts.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use ndarray::Array2;

use rastertile::error::RasterError;
use rastertile::raster::{
    Affine, Bounds, Crs, DataType, DatasetHandle, MemoryDriver, MemoryRaster, RasterDataset,
    RasterDriver, Window,
};

// =============================================================================
// Logging
// =============================================================================

static TRACING: Once = Once::new();

/// Install a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn keys(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// In-memory fixtures
// =============================================================================

/// Web-Mercator extent used by most fixtures: a 256 km square east of the
/// prime meridian.
pub fn mercator_bounds() -> Bounds {
    Bounds::new(0.0, 0.0, 256_000.0, 256_000.0)
}

/// 256x256 Int16 raster with nodata 10000.
///
/// The left half holds a gradient, the right half is nodata.
pub fn half_nodata_raster(handle: &str) -> MemoryRaster {
    let data = Array2::from_shape_fn((256, 256), |(r, c)| {
        if c < 128 {
            (r + c) as f64
        } else {
            10_000.0
        }
    });
    MemoryRaster::new(
        handle,
        data,
        Crs::WEB_MERCATOR,
        Affine::from_bounds(&mercator_bounds(), 256, 256),
    )
    .with_nodata(10_000.0)
    .with_dtype(DataType::Int16)
}

/// Raster filled with `value` everywhere, sharing the fixture extent.
pub fn constant_raster(handle: &str, shape: (usize, usize), value: f64) -> MemoryRaster {
    MemoryRaster::new(
        handle,
        Array2::from_elem(shape, value),
        Crs::WEB_MERCATOR,
        Affine::from_bounds(&mercator_bounds(), shape.1, shape.0),
    )
}

/// Deterministic noisy raster for statistics tests.
pub fn noise_raster(handle: &str, shape: (usize, usize), block: usize) -> MemoryRaster {
    let mut state: u64 = 0x2545_f491_4f6c_dd1d;
    let data = Array2::from_shape_simple_fn(shape, || {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state % 10_000) as f64 / 10.0
    });
    MemoryRaster::new(
        handle,
        data,
        Crs::WEB_MERCATOR,
        Affine::from_bounds(&mercator_bounds(), shape.1, shape.0),
    )
    .with_nodata(-9999.0)
    .with_dtype(DataType::Float32)
    .with_blocks(block, block)
}

// =============================================================================
// Counting driver
// =============================================================================

/// Dataset wrapper counting `read_window` calls.
pub struct CountingRaster {
    inner: Arc<dyn RasterDataset>,
    reads: Arc<AtomicUsize>,
}

impl RasterDataset for CountingRaster {
    fn handle(&self) -> &DatasetHandle {
        self.inner.handle()
    }

    fn crs(&self) -> &Crs {
        self.inner.crs()
    }

    fn transform(&self) -> Affine {
        self.inner.transform()
    }

    fn shape(&self) -> (usize, usize) {
        self.inner.shape()
    }

    fn nodata(&self) -> Option<f64> {
        self.inner.nodata()
    }

    fn dtype(&self) -> DataType {
        self.inner.dtype()
    }

    fn has_mask(&self) -> bool {
        self.inner.has_mask()
    }

    fn block_windows(&self) -> Option<Vec<Window>> {
        self.inner.block_windows()
    }

    fn read_window(
        &self,
        window: Window,
        out_shape: (usize, usize),
    ) -> Result<Array2<f64>, RasterError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_window(window, out_shape)
    }

    fn read_mask(
        &self,
        window: Window,
        out_shape: (usize, usize),
    ) -> Result<Option<Array2<bool>>, RasterError> {
        self.inner.read_mask(window, out_shape)
    }
}

/// Memory driver that counts opens and pixel reads.
#[derive(Default)]
pub struct CountingDriver {
    inner: MemoryDriver,
    opens: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
}

impl CountingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, raster: MemoryRaster) -> DatasetHandle {
        self.inner.insert(raster)
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl RasterDriver for CountingDriver {
    fn open(&self, handle: &DatasetHandle) -> Result<Arc<dyn RasterDataset>, RasterError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.open(handle)?;
        Ok(Arc::new(CountingRaster {
            inner,
            reads: Arc::clone(&self.reads),
        }))
    }
}

// =============================================================================
// GeoTIFF Builder
// =============================================================================

/// Sample encoding of a generated GeoTIFF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    U8,
    I16,
    F32,
}

impl SampleKind {
    fn bits(self) -> u16 {
        match self {
            SampleKind::U8 => 8,
            SampleKind::I16 => 16,
            SampleKind::F32 => 32,
        }
    }

    fn format(self) -> u16 {
        match self {
            SampleKind::U8 => 1,
            SampleKind::I16 => 2,
            SampleKind::F32 => 3,
        }
    }
}

#[derive(Clone, Copy)]
pub enum ByteOrderType {
    LittleEndian,
    BigEndian,
}

/// Builder for single-band GeoTIFF files.
pub struct GeoTiffBuilder {
    data: Array2<f64>,
    sample: SampleKind,
    byte_order: ByteOrderType,
    is_bigtiff: bool,
    tile: Option<(u32, u32)>,
    rows_per_strip: Option<u32>,
    deflate: bool,
    origin: (f64, f64),
    pixel_size: (f64, f64),
    epsg: u16,
    nodata: Option<String>,
}

// Field types
const SHORT: u16 = 3;
const LONG: u16 = 4;
const ASCII: u16 = 2;
const DOUBLE: u16 = 12;
const LONG8: u16 = 16;

struct Entry {
    tag: u16,
    field_type: u16,
    count: u64,
    payload: Vec<u8>,
}

impl GeoTiffBuilder {
    /// Start a builder for `data` georeferenced at `origin` (top-left corner)
    /// with square pixels of `pixel_size`.
    pub fn new(data: Array2<f64>, epsg: u16, origin: (f64, f64), pixel_size: f64) -> Self {
        Self {
            data,
            sample: SampleKind::F32,
            byte_order: ByteOrderType::LittleEndian,
            is_bigtiff: false,
            tile: None,
            rows_per_strip: None,
            deflate: false,
            origin,
            pixel_size: (pixel_size, pixel_size),
            epsg,
            nodata: None,
        }
    }

    pub fn with_sample(mut self, sample: SampleKind) -> Self {
        self.sample = sample;
        self
    }

    pub fn with_byte_order(mut self, order: ByteOrderType) -> Self {
        self.byte_order = order;
        self
    }

    pub fn with_bigtiff(mut self, is_bigtiff: bool) -> Self {
        self.is_bigtiff = is_bigtiff;
        self
    }

    pub fn tiled(mut self, width: u32, height: u32) -> Self {
        self.tile = Some((width, height));
        self
    }

    pub fn with_rows_per_strip(mut self, rows: u32) -> Self {
        self.rows_per_strip = Some(rows);
        self
    }

    pub fn with_deflate(mut self, deflate: bool) -> Self {
        self.deflate = deflate;
        self
    }

    pub fn with_nodata(mut self, nodata: &str) -> Self {
        self.nodata = Some(nodata.to_string());
        self
    }

    /// Build the file contents.
    pub fn build(self) -> Vec<u8> {
        let (height, width) = self.data.dim();
        let blocks = self.encode_blocks();

        let mut entries = vec![
            self.short_entry(256, &[width as u64]),
            self.long_entry(257, &[height as u64]),
            self.short_entry(258, &[self.sample.bits() as u64]),
            self.short_entry(259, &[if self.deflate { 8 } else { 1 }]),
            self.short_entry(262, &[1]),
            self.short_entry(277, &[1]),
            self.short_entry(339, &[self.sample.format() as u64]),
            self.double_entry(33550, &[self.pixel_size.0, self.pixel_size.1, 0.0]),
            self.double_entry(33922, &[0.0, 0.0, 0.0, self.origin.0, self.origin.1, 0.0]),
        ];

        let geographic = self.epsg == 4326;
        let geokeys = [
            1,
            1,
            0,
            3,
            1024,
            0,
            1,
            if geographic { 2 } else { 1 },
            1025,
            0,
            1,
            1,
            if geographic { 2048 } else { 3072 },
            0,
            1,
            self.epsg as u64,
        ];
        entries.push(self.short_entry(34735, &geokeys));

        if let Some(nodata) = &self.nodata {
            let mut text = nodata.clone().into_bytes();
            text.push(0);
            entries.push(Entry {
                tag: 42113,
                field_type: ASCII,
                count: text.len() as u64,
                payload: text,
            });
        }

        let counts: Vec<u64> = blocks.iter().map(|b| b.len() as u64).collect();
        let (offsets_tag, counts_tag) = match self.tile {
            Some((tw, th)) => {
                entries.push(self.long_entry(322, &[tw as u64]));
                entries.push(self.long_entry(323, &[th as u64]));
                (324, 325)
            }
            None => {
                entries.push(self.long_entry(278, &[self.strip_rows() as u64]));
                (273, 279)
            }
        };
        // Offsets are patched once the layout is known
        entries.push(self.offset_entry(offsets_tag, &vec![0; blocks.len()]));
        entries.push(self.offset_entry(counts_tag, &counts));
        entries.sort_by_key(|e| e.tag);

        // Layout: header, IFD, out-of-line values, pixel blocks
        let header_size: u64 = if self.is_bigtiff { 16 } else { 8 };
        let entry_size: u64 = if self.is_bigtiff { 20 } else { 12 };
        let inline_size = if self.is_bigtiff { 8 } else { 4 };
        let ifd_size = if self.is_bigtiff {
            8 + entries.len() as u64 * entry_size + 8
        } else {
            2 + entries.len() as u64 * entry_size + 4
        };

        let mut cursor = header_size + ifd_size;
        let mut value_offsets = Vec::with_capacity(entries.len());
        for entry in &entries {
            if entry.payload.len() > inline_size {
                value_offsets.push(Some(cursor));
                cursor += entry.payload.len() as u64;
                cursor += cursor % 2;
            } else {
                value_offsets.push(None);
            }
        }

        let mut block_offsets = Vec::with_capacity(blocks.len());
        let mut block_cursor = cursor;
        for block in &blocks {
            block_offsets.push(block_cursor);
            block_cursor += block.len() as u64;
        }
        let patched = self.offset_entry(offsets_tag, &block_offsets);
        if let Some(entry) = entries.iter_mut().find(|e| e.tag == offsets_tag) {
            entry.payload = patched.payload;
        }

        // Header
        let mut out = Vec::with_capacity(block_cursor as usize);
        match self.byte_order {
            ByteOrderType::LittleEndian => out.extend_from_slice(b"II"),
            ByteOrderType::BigEndian => out.extend_from_slice(b"MM"),
        }
        if self.is_bigtiff {
            self.put(&mut out, 43, 2);
            self.put(&mut out, 8, 2);
            self.put(&mut out, 0, 2);
            self.put(&mut out, header_size, 8);
        } else {
            self.put(&mut out, 42, 2);
            self.put(&mut out, header_size, 4);
        }

        // IFD
        let count_size = if self.is_bigtiff { 8 } else { 2 };
        self.put(&mut out, entries.len() as u64, count_size);
        for (entry, offset) in entries.iter().zip(&value_offsets) {
            self.put(&mut out, entry.tag as u64, 2);
            self.put(&mut out, entry.field_type as u64, 2);
            self.put(&mut out, entry.count, if self.is_bigtiff { 8 } else { 4 });
            match offset {
                Some(offset) => self.put(&mut out, *offset, inline_size),
                None => {
                    out.extend_from_slice(&entry.payload);
                    out.extend(std::iter::repeat(0).take(inline_size - entry.payload.len()));
                }
            }
        }
        self.put(&mut out, 0, if self.is_bigtiff { 8 } else { 4 });

        // Out-of-line values
        for (entry, offset) in entries.iter().zip(&value_offsets) {
            if let Some(offset) = offset {
                out.resize(*offset as usize, 0);
                out.extend_from_slice(&entry.payload);
            }
        }
        out.resize(cursor as usize, 0);

        for block in blocks {
            out.extend_from_slice(&block);
        }
        out
    }

    fn strip_rows(&self) -> u32 {
        let height = self.data.nrows() as u32;
        self.rows_per_strip.unwrap_or(height).clamp(1, height)
    }

    fn encode_blocks(&self) -> Vec<Vec<u8>> {
        let (height, width) = self.data.dim();
        let mut windows = Vec::new();
        match self.tile {
            Some((tw, th)) => {
                let (tw, th) = (tw as usize, th as usize);
                for row in (0..height).step_by(th) {
                    for col in (0..width).step_by(tw) {
                        // Tiles are stored full size, padded with zeros
                        windows.push((row, col, th, tw));
                    }
                }
            }
            None => {
                let rows = self.strip_rows() as usize;
                for row in (0..height).step_by(rows) {
                    windows.push((row, 0, rows.min(height - row), width));
                }
            }
        }

        windows
            .into_iter()
            .map(|(row, col, rows, cols)| {
                let mut raw = Vec::new();
                for r in row..row + rows {
                    for c in col..col + cols {
                        let value = self.data.get((r, c)).copied().unwrap_or(0.0);
                        self.put_sample(&mut raw, value);
                    }
                }
                if self.deflate {
                    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                    encoder.write_all(&raw).unwrap();
                    encoder.finish().unwrap()
                } else {
                    raw
                }
            })
            .collect()
    }

    fn put_sample(&self, out: &mut Vec<u8>, value: f64) {
        let bytes: Vec<u8> = match (self.sample, self.byte_order) {
            (SampleKind::U8, _) => vec![value as u8],
            (SampleKind::I16, ByteOrderType::LittleEndian) => (value as i16).to_le_bytes().to_vec(),
            (SampleKind::I16, ByteOrderType::BigEndian) => (value as i16).to_be_bytes().to_vec(),
            (SampleKind::F32, ByteOrderType::LittleEndian) => (value as f32).to_le_bytes().to_vec(),
            (SampleKind::F32, ByteOrderType::BigEndian) => (value as f32).to_be_bytes().to_vec(),
        };
        out.extend(bytes);
    }

    fn put(&self, out: &mut Vec<u8>, value: u64, size: usize) {
        write_value(out, self.byte_order, value, size);
    }

    fn short_entry(&self, tag: u16, values: &[u64]) -> Entry {
        let mut payload = Vec::new();
        for v in values {
            self.put(&mut payload, *v, 2);
        }
        Entry {
            tag,
            field_type: SHORT,
            count: values.len() as u64,
            payload,
        }
    }

    fn long_entry(&self, tag: u16, values: &[u64]) -> Entry {
        let mut payload = Vec::new();
        for v in values {
            self.put(&mut payload, *v, 4);
        }
        Entry {
            tag,
            field_type: LONG,
            count: values.len() as u64,
            payload,
        }
    }

    fn offset_entry(&self, tag: u16, values: &[u64]) -> Entry {
        if !self.is_bigtiff {
            return self.long_entry(tag, values);
        }
        let mut payload = Vec::new();
        for v in values {
            self.put(&mut payload, *v, 8);
        }
        Entry {
            tag,
            field_type: LONG8,
            count: values.len() as u64,
            payload,
        }
    }

    fn double_entry(&self, tag: u16, values: &[f64]) -> Entry {
        let mut payload = Vec::new();
        for v in values {
            self.put(&mut payload, v.to_bits(), 8);
        }
        Entry {
            tag,
            field_type: DOUBLE,
            count: values.len() as u64,
            payload,
        }
    }
}

fn write_value(data: &mut Vec<u8>, byte_order: ByteOrderType, value: u64, size: usize) {
    match byte_order {
        ByteOrderType::LittleEndian => match size {
            1 => data.push(value as u8),
            2 => data.extend(&(value as u16).to_le_bytes()),
            4 => data.extend(&(value as u32).to_le_bytes()),
            8 => data.extend(&value.to_le_bytes()),
            _ => {}
        },
        ByteOrderType::BigEndian => match size {
            1 => data.push(value as u8),
            2 => data.extend(&(value as u16).to_be_bytes()),
            4 => data.extend(&(value as u32).to_be_bytes()),
            8 => data.extend(&value.to_be_bytes()),
            _ => {}
        },
    }
}

/// Check for the classic TIFF magic.
pub fn is_tiff_magic(data: &[u8]) -> bool {
    data.len() >= 4 && (&data[..4] == b"II*\0" || &data[..4] == b"MM\0*")
}
