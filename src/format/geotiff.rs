//! Single-band GeoTIFF reader.
//!
//! Reads the structure of the first IFD of a GeoTIFF: dimensions, block layout
//! (tiles or strips), sample type, compression, georeferencing and the GDAL
//! nodata tag. Pixel access decodes whole blocks and converts the first band
//! to `f64`.
//!
//! # Supported files
//!
//! - Classic TIFF and BigTIFF, either byte order
//! - Tiled or striped layout, chunky or planar configuration
//! - No compression or Deflate (with optional horizontal predictor)
//! - 8/16/32-bit integer and 32/64-bit float samples
//!
//! Anything else is rejected when the file is opened, never mid-read.

use std::io::Read;
use std::sync::Arc;

use flate2::read::ZlibDecoder;
use ndarray::Array2;

use crate::error::TiffError;
use crate::io::RangeReader;

use super::tiff::{
    geokeys, parse_ifd_chain, ByteOrder, Compression, Ifd, SampleFormat, TiffTag, ValueReader,
};

// =============================================================================
// Structure
// =============================================================================

/// How pixel data is split into independently stored blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLayout {
    Tiled { width: u32, height: u32 },
    Striped { rows_per_strip: u32 },
}

/// Georeferencing read from the GeoTIFF tags.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoReference {
    /// Affine coefficients `(a, b, c, d, e, f)`:
    /// `x = a * col + b * row + c`, `y = d * col + e * row + f`
    pub transform: [f64; 6],

    /// EPSG code from the GeoKey directory, `None` when user-defined or absent
    pub epsg: Option<u16>,
}

/// Block window `(row_off, col_off, rows, cols)` clipped to the image.
pub type BlockWindow = (usize, usize, usize, usize);

/// Reader for the first image of a GeoTIFF.
pub struct GeoTiffReader {
    reader: Arc<dyn RangeReader>,
    byte_order: ByteOrder,
    width: u32,
    height: u32,
    samples_per_pixel: u16,
    bits_per_sample: u16,
    sample_format: SampleFormat,
    compression: Compression,
    horizontal_predictor: bool,
    planar: bool,
    layout: BlockLayout,
    offsets: Vec<u64>,
    byte_counts: Vec<u64>,
    georef: GeoReference,
    nodata: Option<f64>,
}

impl std::fmt::Debug for GeoTiffReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoTiffReader")
            .field("identifier", &self.reader.identifier())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layout", &self.layout)
            .field("compression", &self.compression)
            .finish()
    }
}

impl GeoTiffReader {
    /// Parse the file structure and load block offset arrays.
    pub fn open(reader: Arc<dyn RangeReader>) -> Result<Self, TiffError> {
        let (header, ifds) = parse_ifd_chain(reader.as_ref())?;
        let ifd = ifds.into_iter().next().ok_or(TiffError::MissingTag("IFD"))?;
        let values = ValueReader::new(reader.as_ref(), &header);

        let width = required_u64(&values, &ifd, TiffTag::ImageWidth, "ImageWidth")? as u32;
        let height = required_u64(&values, &ifd, TiffTag::ImageLength, "ImageLength")? as u32;
        if width == 0 || height == 0 {
            return Err(TiffError::InvalidTagValue {
                tag: "ImageWidth",
                message: format!("empty image {}x{}", width, height),
            });
        }

        let samples_per_pixel =
            optional_u64(&values, &ifd, TiffTag::SamplesPerPixel, "SamplesPerPixel")?.unwrap_or(1)
                as u16;
        let bits_per_sample = match ifd.get_entry_by_tag(TiffTag::BitsPerSample) {
            Some(entry) => values
                .read_u64_array(entry, "BitsPerSample")?
                .first()
                .copied()
                .unwrap_or(1) as u16,
            None => 1,
        };
        let sample_format = match ifd.get_entry_by_tag(TiffTag::SampleFormat) {
            Some(entry) => {
                let raw = values
                    .read_u64_array(entry, "SampleFormat")?
                    .first()
                    .copied()
                    .unwrap_or(1) as u16;
                SampleFormat::from_u16(raw).ok_or_else(|| {
                    TiffError::UnsupportedSampleFormat(format!("SampleFormat {}", raw))
                })?
            }
            None => SampleFormat::Uint,
        };
        check_sample_type(sample_format, bits_per_sample)?;

        let raw_compression =
            optional_u64(&values, &ifd, TiffTag::Compression, "Compression")?.unwrap_or(1) as u16;
        let compression = Compression::from_u16(raw_compression)
            .filter(|c| c.is_supported())
            .ok_or_else(|| {
                TiffError::UnsupportedCompression(
                    Compression::from_u16(raw_compression)
                        .map(|c| c.name().to_string())
                        .unwrap_or_else(|| format!("unknown ({})", raw_compression)),
                )
            })?;

        let predictor = optional_u64(&values, &ifd, TiffTag::Predictor, "Predictor")?.unwrap_or(1);
        let horizontal_predictor = match predictor {
            1 => false,
            2 if sample_format != SampleFormat::Float => true,
            other => {
                return Err(TiffError::UnsupportedSampleFormat(format!(
                    "predictor {} with {:?} samples",
                    other, sample_format
                )))
            }
        };
        let planar = optional_u64(
            &values,
            &ifd,
            TiffTag::PlanarConfiguration,
            "PlanarConfiguration",
        )?
        .unwrap_or(1)
            == 2;

        let (layout, offsets_tag, counts_tag) = match (
            ifd.get_entry_by_tag(TiffTag::TileWidth),
            ifd.get_entry_by_tag(TiffTag::TileLength),
        ) {
            (Some(w), Some(h)) => (
                BlockLayout::Tiled {
                    width: values.read_u64(w, "TileWidth")? as u32,
                    height: values.read_u64(h, "TileLength")? as u32,
                },
                (TiffTag::TileOffsets, "TileOffsets"),
                (TiffTag::TileByteCounts, "TileByteCounts"),
            ),
            _ => {
                let rows_per_strip =
                    optional_u64(&values, &ifd, TiffTag::RowsPerStrip, "RowsPerStrip")?
                        .map(|r| (r as u32).min(height))
                        .unwrap_or(height);
                (
                    BlockLayout::Striped { rows_per_strip },
                    (TiffTag::StripOffsets, "StripOffsets"),
                    (TiffTag::StripByteCounts, "StripByteCounts"),
                )
            }
        };

        let offsets = match ifd.get_entry_by_tag(offsets_tag.0) {
            Some(entry) => values.read_u64_array(entry, offsets_tag.1)?,
            None => return Err(TiffError::MissingTag(offsets_tag.1)),
        };
        let byte_counts = match ifd.get_entry_by_tag(counts_tag.0) {
            Some(entry) => values.read_u64_array(entry, counts_tag.1)?,
            None => return Err(TiffError::MissingTag(counts_tag.1)),
        };

        let georef = read_georeference(&values, &ifd)?;
        let nodata = match ifd.get_entry_by_tag(TiffTag::GdalNodata) {
            Some(entry) => parse_nodata(&values.read_string(entry, "GdalNodata")?),
            None => None,
        };

        let tiff = GeoTiffReader {
            reader,
            byte_order: header.byte_order,
            width,
            height,
            samples_per_pixel,
            bits_per_sample,
            sample_format,
            compression,
            horizontal_predictor,
            planar,
            layout,
            offsets,
            byte_counts,
            georef,
            nodata,
        };

        let expected = tiff.blocks_per_band();
        if tiff.offsets.len() < expected || tiff.byte_counts.len() < expected {
            return Err(TiffError::InvalidTagValue {
                tag: offsets_tag.1,
                message: format!(
                    "expected {} blocks, got {} offsets and {} byte counts",
                    expected,
                    tiff.offsets.len(),
                    tiff.byte_counts.len()
                ),
            });
        }

        Ok(tiff)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn georeference(&self) -> &GeoReference {
        &self.georef
    }

    pub fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    pub fn sample_type(&self) -> (SampleFormat, u16) {
        (self.sample_format, self.bits_per_sample)
    }

    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    pub fn identifier(&self) -> &str {
        self.reader.identifier()
    }

    /// Nominal block size `(rows, cols)`.
    fn block_shape(&self) -> (usize, usize) {
        match self.layout {
            BlockLayout::Tiled { width, height } => {
                (height.max(1) as usize, width.max(1) as usize)
            }
            BlockLayout::Striped { rows_per_strip } => {
                (rows_per_strip.max(1) as usize, self.width as usize)
            }
        }
    }

    fn blocks_grid(&self) -> (usize, usize) {
        let (bh, bw) = self.block_shape();
        (
            (self.height as usize).div_ceil(bh),
            (self.width as usize).div_ceil(bw),
        )
    }

    fn blocks_per_band(&self) -> usize {
        let (down, across) = self.blocks_grid();
        down * across
    }

    /// All block windows in row-major order, clipped to the image extent.
    pub fn block_windows(&self) -> Vec<BlockWindow> {
        let (bh, bw) = self.block_shape();
        let (down, across) = self.blocks_grid();
        let (height, width) = (self.height as usize, self.width as usize);

        let mut windows = Vec::with_capacity(down * across);
        for by in 0..down {
            for bx in 0..across {
                let row_off = by * bh;
                let col_off = bx * bw;
                windows.push((
                    row_off,
                    col_off,
                    bh.min(height - row_off),
                    bw.min(width - col_off),
                ));
            }
        }
        windows
    }

    /// Decode block `index` of the first band into a row-major `f64` buffer.
    ///
    /// Tiles always decode to the full tile size; the last strip holds only
    /// the remaining rows.
    fn read_block(&self, index: usize) -> Result<(usize, usize, Vec<f64>), TiffError> {
        let (bh, bw) = self.block_shape();
        let rows = match self.layout {
            BlockLayout::Tiled { .. } => bh,
            BlockLayout::Striped { .. } => bh.min(self.height as usize - (index * bh)),
        };

        let offset = self.offsets[index];
        let length = self.byte_counts[index] as usize;
        let raw = self.reader.read_exact_at(offset, length)?;

        let bytes_per_sample = (self.bits_per_sample / 8) as usize;
        let samples_in_pixel = if self.planar {
            1
        } else {
            self.samples_per_pixel as usize
        };
        let pixel_stride = bytes_per_sample * samples_in_pixel;
        let needed = rows * bw * pixel_stride;

        let mut data = match self.compression {
            Compression::Deflate | Compression::AdobeDeflate => inflate(&raw, needed, index)?,
            _ => raw.to_vec(),
        };
        if data.len() < needed {
            return Err(TiffError::Decode {
                index,
                message: format!("block holds {} bytes, expected {}", data.len(), needed),
            });
        }

        if self.horizontal_predictor {
            undo_horizontal_predictor(
                &mut data[..needed],
                bw,
                samples_in_pixel,
                bytes_per_sample,
                self.byte_order,
            );
        }

        let mut values = Vec::with_capacity(rows * bw);
        for pixel in data[..needed].chunks_exact(pixel_stride) {
            values.push(self.decode_sample(&pixel[..bytes_per_sample]));
        }
        Ok((rows, bw, values))
    }

    fn decode_sample(&self, bytes: &[u8]) -> f64 {
        let order = self.byte_order;
        match (self.sample_format, self.bits_per_sample) {
            (SampleFormat::Uint, 8) => bytes[0] as f64,
            (SampleFormat::Int, 8) => bytes[0] as i8 as f64,
            (SampleFormat::Uint, 16) => order.read_u16(bytes) as f64,
            (SampleFormat::Int, 16) => order.read_u16(bytes) as i16 as f64,
            (SampleFormat::Uint, 32) => order.read_u32(bytes) as f64,
            (SampleFormat::Int, 32) => order.read_u32(bytes) as i32 as f64,
            (SampleFormat::Float, 32) => order.read_f32(bytes) as f64,
            (SampleFormat::Float, 64) => order.read_f64(bytes),
            // Rejected in open()
            _ => f64::NAN,
        }
    }

    /// Read a region of the first band at native resolution.
    pub fn read_region(
        &self,
        row_off: usize,
        col_off: usize,
        rows: usize,
        cols: usize,
    ) -> Result<Array2<f64>, TiffError> {
        let (height, width) = (self.height as usize, self.width as usize);
        if rows == 0 || cols == 0 || row_off + rows > height || col_off + cols > width {
            return Err(TiffError::InvalidTagValue {
                tag: "ImageWidth",
                message: format!(
                    "region ({}, {}, {}, {}) outside {}x{} image",
                    row_off, col_off, rows, cols, height, width
                ),
            });
        }

        let (bh, bw) = self.block_shape();
        let (_, across) = self.blocks_grid();
        let mut out = Array2::<f64>::zeros((rows, cols));

        for by in row_off / bh..=(row_off + rows - 1) / bh {
            for bx in col_off / bw..=(col_off + cols - 1) / bw {
                let (block_rows, block_cols, block) = self.read_block(by * across + bx)?;
                let block_row0 = by * bh;
                let block_col0 = bx * bw;

                let r_start = row_off.max(block_row0);
                let r_end = (row_off + rows).min(block_row0 + block_rows);
                let c_start = col_off.max(block_col0);
                let c_end = (col_off + cols).min(block_col0 + block_cols);

                for r in r_start..r_end {
                    let src = (r - block_row0) * block_cols;
                    for c in c_start..c_end {
                        out[[r - row_off, c - col_off]] = block[src + c - block_col0];
                    }
                }
            }
        }

        Ok(out)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn optional_u64<R: RangeReader + ?Sized>(
    values: &ValueReader<'_, R>,
    ifd: &Ifd,
    tag: TiffTag,
    name: &'static str,
) -> Result<Option<u64>, TiffError> {
    ifd.get_entry_by_tag(tag)
        .map(|entry| values.read_u64(entry, name))
        .transpose()
}

fn required_u64<R: RangeReader + ?Sized>(
    values: &ValueReader<'_, R>,
    ifd: &Ifd,
    tag: TiffTag,
    name: &'static str,
) -> Result<u64, TiffError> {
    optional_u64(values, ifd, tag, name)?.ok_or(TiffError::MissingTag(name))
}

fn check_sample_type(format: SampleFormat, bits: u16) -> Result<(), TiffError> {
    match (format, bits) {
        (SampleFormat::Uint | SampleFormat::Int, 8 | 16 | 32) | (SampleFormat::Float, 32 | 64) => {
            Ok(())
        }
        _ => Err(TiffError::UnsupportedSampleFormat(format!(
            "{:?} with {} bits per sample",
            format, bits
        ))),
    }
}

/// Reverse TIFF predictor 2 in place, row by row.
fn undo_horizontal_predictor(
    data: &mut [u8],
    cols: usize,
    samples: usize,
    bytes_per_sample: usize,
    order: ByteOrder,
) {
    let row_len = cols * samples * bytes_per_sample;
    for row in data.chunks_exact_mut(row_len) {
        for i in samples..cols * samples {
            let cur = i * bytes_per_sample;
            let prev = (i - samples) * bytes_per_sample;
            match bytes_per_sample {
                1 => row[cur] = row[cur].wrapping_add(row[prev]),
                2 => {
                    let v = order
                        .read_u16(&row[cur..])
                        .wrapping_add(order.read_u16(&row[prev..]));
                    let out = match order {
                        ByteOrder::LittleEndian => v.to_le_bytes(),
                        ByteOrder::BigEndian => v.to_be_bytes(),
                    };
                    row[cur..cur + 2].copy_from_slice(&out);
                }
                4 => {
                    let v = order
                        .read_u32(&row[cur..])
                        .wrapping_add(order.read_u32(&row[prev..]));
                    let out = match order {
                        ByteOrder::LittleEndian => v.to_le_bytes(),
                        ByteOrder::BigEndian => v.to_be_bytes(),
                    };
                    row[cur..cur + 4].copy_from_slice(&out);
                }
                _ => {}
            }
        }
    }
}

fn read_georeference<R: RangeReader + ?Sized>(
    values: &ValueReader<'_, R>,
    ifd: &Ifd,
) -> Result<GeoReference, TiffError> {
    let keys = match ifd.get_entry_by_tag(TiffTag::GeoKeyDirectory) {
        Some(entry) => values.read_u64_array(entry, "GeoKeyDirectory")?,
        None => Vec::new(),
    };
    let geokey = |id: u16| -> Option<u16> {
        // Header is 4 shorts, then (key, location, count, value) quadruples
        keys.get(4..)?
            .chunks_exact(4)
            .find(|k| k[0] == id as u64 && k[1] == 0)
            .map(|k| k[3] as u16)
    };

    let mut transform = if let Some(entry) = ifd.get_entry_by_tag(TiffTag::ModelTransformation) {
        let m = values.read_f64_array(entry, "ModelTransformation")?;
        if m.len() < 8 {
            return Err(TiffError::InvalidTagValue {
                tag: "ModelTransformation",
                message: format!("expected 16 values, got {}", m.len()),
            });
        }
        [m[0], m[1], m[3], m[4], m[5], m[7]]
    } else {
        let scale = ifd
            .get_entry_by_tag(TiffTag::ModelPixelScale)
            .map(|e| values.read_f64_array(e, "ModelPixelScale"))
            .transpose()?;
        let tiepoint = ifd
            .get_entry_by_tag(TiffTag::ModelTiepoint)
            .map(|e| values.read_f64_array(e, "ModelTiepoint"))
            .transpose()?;
        match (scale, tiepoint) {
            (Some(s), Some(t)) if s.len() >= 2 && t.len() >= 6 => {
                let (i, j, x, y) = (t[0], t[1], t[3], t[4]);
                [s[0], 0.0, x - i * s[0], 0.0, -s[1], y + j * s[1]]
            }
            _ => {
                return Err(TiffError::MissingGeoreference(
                    "no ModelTransformation or ModelPixelScale/ModelTiepoint pair".to_string(),
                ))
            }
        }
    };

    if geokey(geokeys::GT_RASTER_TYPE) == Some(geokeys::RASTER_PIXEL_IS_POINT) {
        // Shift the reference from the pixel center to its corner
        let [a, b, c, d, e, f] = transform;
        transform = [a, b, c - (a + b) / 2.0, d, e, f - (d + e) / 2.0];
    }

    let epsg = [geokeys::PROJECTED_CS_TYPE, geokeys::GEOGRAPHIC_TYPE]
        .into_iter()
        .filter_map(geokey)
        .find(|code| *code != 0 && *code != geokeys::USER_DEFINED);

    Ok(GeoReference { transform, epsg })
}

fn parse_nodata(text: &str) -> Option<f64> {
    text.trim().trim_end_matches('\0').parse::<f64>().ok()
}

// =============================================================================
// Tests
// =============================================================================

/// Inflate a zlib block, stopping after `limit` bytes of output.
fn inflate(raw: &[u8], limit: usize, index: usize) -> Result<Vec<u8>, TiffError> {
    let mut out = Vec::with_capacity(limit);
    ZlibDecoder::new(raw)
        .take(limit as u64)
        .read_to_end(&mut out)
        .map_err(|e| TiffError::Decode {
            index,
            message: e.to_string(),
        })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nodata() {
        assert_eq!(parse_nodata("-9999"), Some(-9999.0));
        assert_eq!(parse_nodata(" 10000 "), Some(10000.0));
        assert!(parse_nodata("nan").unwrap().is_nan());
        assert_eq!(parse_nodata("none"), None);
    }

    #[test]
    fn test_check_sample_type() {
        assert!(check_sample_type(SampleFormat::Uint, 16).is_ok());
        assert!(check_sample_type(SampleFormat::Float, 64).is_ok());
        assert!(check_sample_type(SampleFormat::Float, 16).is_err());
        assert!(check_sample_type(SampleFormat::Int, 64).is_err());
        assert!(check_sample_type(SampleFormat::Uint, 1).is_err());
    }

    #[test]
    fn test_undo_horizontal_predictor_u8() {
        let mut row = vec![10u8, 1, 1, 253];
        undo_horizontal_predictor(&mut row, 4, 1, 1, ByteOrder::LittleEndian);
        assert_eq!(row, vec![10, 11, 12, 9]);
    }

    #[test]
    fn test_undo_horizontal_predictor_u16() {
        let mut row = Vec::new();
        for v in [1000u16, 5, 65535] {
            row.extend_from_slice(&v.to_le_bytes());
        }
        undo_horizontal_predictor(&mut row, 3, 1, 2, ByteOrder::LittleEndian);
        let decoded: Vec<u16> = row
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(decoded, vec![1000, 1005, 1004]);
    }

    #[test]
    fn test_inflate_stops_at_block_size() {
        use flate2::write::ZlibEncoder;
        use std::io::Write;

        // 4 MiB of zeros compresses to a few KiB
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::best());
        encoder.write_all(&vec![0u8; 4 << 20]).unwrap();
        let bomb = encoder.finish().unwrap();

        let out = inflate(&bomb, 1024, 0).unwrap();
        assert_eq!(out.len(), 1024);

        // Short blocks come back short; the caller checks the length
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(&[7u8; 100]).unwrap();
        let short = inflate(&encoder.finish().unwrap(), 1024, 3).unwrap();
        assert_eq!(short, vec![7u8; 100]);

        let err = inflate(b"not zlib", 1024, 5).unwrap_err();
        assert!(matches!(err, TiffError::Decode { index: 5, .. }));
    }
}
