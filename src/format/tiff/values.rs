//! TIFF tag value reading.
//!
//! Values are either stored inline in the IFD entry or at an offset in the
//! file. Arrays (block offsets, GeoTIFF model tags, the GeoKey directory)
//! are fetched with a single range read.

use bytes::Bytes;

use crate::error::TiffError;
use crate::io::RangeReader;

use super::parser::{ByteOrder, IfdEntry, TiffHeader};
use super::tags::FieldType;

// =============================================================================
// ValueReader
// =============================================================================

/// Reads tag values respecting the file's byte order and layout.
pub struct ValueReader<'a, R: RangeReader + ?Sized> {
    reader: &'a R,
    header: &'a TiffHeader,
}

impl<'a, R: RangeReader + ?Sized> ValueReader<'a, R> {
    pub fn new(reader: &'a R, header: &'a TiffHeader) -> Self {
        Self { reader, header }
    }

    #[inline]
    pub fn byte_order(&self) -> ByteOrder {
        self.header.byte_order
    }

    /// Raw bytes of an entry's value, inline or fetched from its offset.
    pub fn read_bytes(&self, entry: &IfdEntry) -> Result<Bytes, TiffError> {
        let size = entry
            .value_byte_size()
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        if entry.is_inline {
            Ok(Bytes::copy_from_slice(
                &entry.value_offset_bytes[..size as usize],
            ))
        } else {
            let offset = entry.value_offset(self.header.byte_order);
            Ok(self.reader.read_exact_at(offset, size as usize)?)
        }
    }

    /// Read a single unsigned integer value.
    pub fn read_u64(&self, entry: &IfdEntry, tag: &'static str) -> Result<u64, TiffError> {
        if let Some(value) = entry.inline_u64(self.header.byte_order) {
            return Ok(value);
        }
        let values = self.read_u64_array(entry, tag)?;
        match values.as_slice() {
            [value] => Ok(*value),
            _ => Err(TiffError::InvalidTagValue {
                tag,
                message: format!("expected a single value, got {}", values.len()),
            }),
        }
    }

    /// Read an array of unsigned integers (Byte, Short, Long or Long8).
    ///
    /// This is how block offsets and byte counts are loaded.
    pub fn read_u64_array(
        &self,
        entry: &IfdEntry,
        tag: &'static str,
    ) -> Result<Vec<u64>, TiffError> {
        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;
        if entry.count == 0 {
            return Ok(Vec::new());
        }

        let bytes = self.read_bytes(entry)?;
        let order = self.header.byte_order;
        let stride = field_type.size_in_bytes();
        let chunks = bytes.chunks_exact(stride);

        let values = match field_type {
            FieldType::Byte => chunks.map(|c| c[0] as u64).collect(),
            FieldType::Short => chunks.map(|c| order.read_u16(c) as u64).collect(),
            FieldType::Long => chunks.map(|c| order.read_u32(c) as u64).collect(),
            FieldType::Long8 => chunks.map(|c| order.read_u64(c)).collect(),
            other => {
                return Err(TiffError::InvalidTagValue {
                    tag,
                    message: format!("expected an unsigned integer type, got {:?}", other),
                })
            }
        };
        Ok(values)
    }

    /// Read an array of numbers as f64, whatever their storage type.
    ///
    /// GeoTIFF model tags are Double, but some writers use Float or Rational.
    pub fn read_f64_array(
        &self,
        entry: &IfdEntry,
        tag: &'static str,
    ) -> Result<Vec<f64>, TiffError> {
        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;
        if entry.count == 0 {
            return Ok(Vec::new());
        }

        let bytes = self.read_bytes(entry)?;
        let order = self.header.byte_order;
        let chunks = bytes.chunks_exact(field_type.size_in_bytes());

        let values = match field_type {
            FieldType::Double => chunks.map(|c| order.read_f64(c)).collect(),
            FieldType::Float => chunks.map(|c| order.read_f32(c) as f64).collect(),
            FieldType::Rational => chunks
                .map(|c| order.read_u32(&c[..4]) as f64 / order.read_u32(&c[4..]) as f64)
                .collect(),
            FieldType::SRational => chunks
                .map(|c| {
                    order.read_u32(&c[..4]) as i32 as f64 / order.read_u32(&c[4..]) as i32 as f64
                })
                .collect(),
            FieldType::Byte | FieldType::Short | FieldType::Long | FieldType::Long8 => self
                .read_u64_array(entry, tag)?
                .into_iter()
                .map(|v| v as f64)
                .collect(),
            other => {
                return Err(TiffError::InvalidTagValue {
                    tag,
                    message: format!("expected a numeric type, got {:?}", other),
                })
            }
        };
        Ok(values)
    }

    /// Read an ASCII value, stripping the trailing NUL.
    pub fn read_string(&self, entry: &IfdEntry, tag: &'static str) -> Result<String, TiffError> {
        if entry.field_type != Some(FieldType::Ascii) {
            return Err(TiffError::InvalidTagValue {
                tag,
                message: format!("expected Ascii, got {:?}", entry.field_type),
            });
        }

        let bytes = self.read_bytes(entry)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

// =============================================================================
// Tests
// =============================================================================
