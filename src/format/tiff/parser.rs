//! TIFF header and IFD parsing.
//!
//! Handles classic TIFF and BigTIFF. A GeoTIFF is an ordinary TIFF whose
//! first IFD carries the georeferencing tags, so only the header and the
//! directory chain need to be understood here; value decoding lives in
//! [`super::values`].
//!
//! ```text
//! Classic TIFF: II|MM, 42, u32 first IFD offset, entries are 12 bytes
//! BigTIFF:      II|MM, 43, 8, 0, u64 first IFD offset, entries are 20 bytes
//! ```

use crate::error::TiffError;
use crate::io::RangeReader;

use super::tags::{FieldType, TiffTag};

// =============================================================================
// Constants
// =============================================================================

const BYTE_ORDER_LITTLE_ENDIAN: u16 = 0x4949;
const BYTE_ORDER_BIG_ENDIAN: u16 = 0x4D4D;
const VERSION_TIFF: u16 = 42;
const VERSION_BIGTIFF: u16 = 43;

/// Size of classic TIFF header in bytes
pub const TIFF_HEADER_SIZE: usize = 8;

/// Size of BigTIFF header in bytes
pub const BIGTIFF_HEADER_SIZE: usize = 16;

/// Upper bound on the IFD chain length, guards against offset cycles
const MAX_IFDS: usize = 64;

// =============================================================================
// ByteOrder
// =============================================================================

/// Byte order (endianness) of a TIFF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// "II"
    LittleEndian,
    /// "MM"
    BigEndian,
}

impl ByteOrder {
    #[inline]
    fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
        let mut out = [0u8; N];
        let n = bytes.len().min(N);
        out[..n].copy_from_slice(&bytes[..n]);
        out
    }

    /// Read a u16 from the start of `bytes`. Short input is zero-padded.
    #[inline]
    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        let raw = Self::array::<2>(bytes);
        match self {
            ByteOrder::LittleEndian => u16::from_le_bytes(raw),
            ByteOrder::BigEndian => u16::from_be_bytes(raw),
        }
    }

    /// Read a u32 from the start of `bytes`. Short input is zero-padded.
    #[inline]
    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        let raw = Self::array::<4>(bytes);
        match self {
            ByteOrder::LittleEndian => u32::from_le_bytes(raw),
            ByteOrder::BigEndian => u32::from_be_bytes(raw),
        }
    }

    /// Read a u64 from the start of `bytes`. Short input is zero-padded.
    #[inline]
    pub fn read_u64(self, bytes: &[u8]) -> u64 {
        let raw = Self::array::<8>(bytes);
        match self {
            ByteOrder::LittleEndian => u64::from_le_bytes(raw),
            ByteOrder::BigEndian => u64::from_be_bytes(raw),
        }
    }

    #[inline]
    pub fn read_f32(self, bytes: &[u8]) -> f32 {
        f32::from_bits(self.read_u32(bytes))
    }

    #[inline]
    pub fn read_f64(self, bytes: &[u8]) -> f64 {
        f64::from_bits(self.read_u64(bytes))
    }
}

// =============================================================================
// TiffHeader
// =============================================================================

/// Parsed TIFF file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiffHeader {
    /// Byte order for all multi-byte values in the file
    pub byte_order: ByteOrder,

    /// Whether this is a BigTIFF file (64-bit offsets)
    pub is_bigtiff: bool,

    /// Offset to the first IFD in the file
    pub first_ifd_offset: u64,
}

impl TiffHeader {
    /// Parse a TIFF header from raw bytes.
    ///
    /// `bytes` must hold at least 8 bytes, 16 for BigTIFF. `file_size` is
    /// used to reject first-IFD offsets that point outside the file.
    pub fn parse(bytes: &[u8], file_size: u64) -> Result<Self, TiffError> {
        if bytes.len() < TIFF_HEADER_SIZE {
            return Err(TiffError::FileTooSmall {
                required: TIFF_HEADER_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }

        // Magic is compared as raw bytes, independent of order
        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        let byte_order = match magic {
            BYTE_ORDER_LITTLE_ENDIAN => ByteOrder::LittleEndian,
            BYTE_ORDER_BIG_ENDIAN => ByteOrder::BigEndian,
            _ => return Err(TiffError::InvalidMagic(magic)),
        };

        let (is_bigtiff, first_ifd_offset) = match byte_order.read_u16(&bytes[2..4]) {
            VERSION_TIFF => (false, byte_order.read_u32(&bytes[4..8]) as u64),
            VERSION_BIGTIFF => {
                if bytes.len() < BIGTIFF_HEADER_SIZE {
                    return Err(TiffError::FileTooSmall {
                        required: BIGTIFF_HEADER_SIZE as u64,
                        actual: bytes.len() as u64,
                    });
                }
                let offset_size = byte_order.read_u16(&bytes[4..6]);
                if offset_size != 8 {
                    return Err(TiffError::InvalidBigTiffOffsetSize(offset_size));
                }
                (true, byte_order.read_u64(&bytes[8..16]))
            }
            version => return Err(TiffError::InvalidVersion(version)),
        };

        if first_ifd_offset >= file_size {
            return Err(TiffError::InvalidIfdOffset(first_ifd_offset));
        }

        Ok(TiffHeader {
            byte_order,
            is_bigtiff,
            first_ifd_offset,
        })
    }

    /// Size of an IFD entry: 12 bytes classic, 20 bytes BigTIFF.
    #[inline]
    pub const fn ifd_entry_size(&self) -> usize {
        if self.is_bigtiff {
            20
        } else {
            12
        }
    }

    /// Size of the entry count field at the start of an IFD.
    #[inline]
    pub const fn ifd_count_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            2
        }
    }

    /// Size of the offset fields (value/offset and next IFD).
    #[inline]
    pub const fn offset_size(&self) -> usize {
        if self.is_bigtiff {
            8
        } else {
            4
        }
    }
}

// =============================================================================
// IfdEntry
// =============================================================================

/// A single 12/20-byte directory entry.
///
/// The value/offset field is kept raw; whether it holds the value itself
/// or a pointer depends on the field type and count.
#[derive(Debug, Clone, PartialEq)]
pub struct IfdEntry {
    pub tag_id: u16,
    pub field_type: Option<FieldType>,
    pub field_type_raw: u16,
    pub count: u64,
    pub value_offset_bytes: Vec<u8>,
    pub is_inline: bool,
}

impl IfdEntry {
    fn parse(bytes: &[u8], header: &TiffHeader) -> Self {
        let order = header.byte_order;
        let tag_id = order.read_u16(&bytes[0..2]);
        let field_type_raw = order.read_u16(&bytes[2..4]);
        let field_type = FieldType::from_u16(field_type_raw);

        let (count, value_start) = if header.is_bigtiff {
            (order.read_u64(&bytes[4..12]), 12)
        } else {
            (order.read_u32(&bytes[4..8]) as u64, 8)
        };
        let value_offset_bytes = bytes[value_start..value_start + header.offset_size()].to_vec();
        let is_inline = field_type
            .map(|ft| ft.fits_inline(count, header.is_bigtiff))
            .unwrap_or(false);

        IfdEntry {
            tag_id,
            field_type,
            field_type_raw,
            count,
            value_offset_bytes,
            is_inline,
        }
    }

    /// Total byte size of the value, `None` for unknown field types.
    pub fn value_byte_size(&self) -> Option<u64> {
        self.field_type
            .map(|ft| ft.size_in_bytes() as u64 * self.count)
    }

    /// Offset of an out-of-line value.
    pub fn value_offset(&self, order: ByteOrder) -> u64 {
        if self.value_offset_bytes.len() == 8 {
            order.read_u64(&self.value_offset_bytes)
        } else {
            order.read_u32(&self.value_offset_bytes) as u64
        }
    }

    /// Inline scalar as u64, for unsigned integer entries with count 1.
    pub fn inline_u64(&self, order: ByteOrder) -> Option<u64> {
        if !self.is_inline || self.count != 1 {
            return None;
        }
        let bytes = &self.value_offset_bytes;
        match self.field_type? {
            FieldType::Byte => Some(bytes[0] as u64),
            FieldType::Short => Some(order.read_u16(bytes) as u64),
            FieldType::Long => Some(order.read_u32(bytes) as u64),
            FieldType::Long8 => Some(order.read_u64(bytes)),
            _ => None,
        }
    }

    /// Inline scalar as u32, for Byte/Short/Long entries with count 1.
    pub fn inline_u32(&self, order: ByteOrder) -> Option<u32> {
        match self.field_type? {
            FieldType::Long8 => None,
            _ => self.inline_u64(order).map(|v| v as u32),
        }
    }
}

// =============================================================================
// Ifd
// =============================================================================

/// A parsed Image File Directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Ifd {
    pub entries: Vec<IfdEntry>,
    pub next_ifd_offset: u64,
}

impl Ifd {
    /// Byte length of an IFD holding `entry_count` entries.
    pub fn calculate_size(entry_count: u64, header: &TiffHeader) -> usize {
        header.ifd_count_size()
            + entry_count as usize * header.ifd_entry_size()
            + header.offset_size()
    }

    /// Parse an IFD from bytes starting at its entry count.
    pub fn parse(bytes: &[u8], header: &TiffHeader) -> Result<Self, TiffError> {
        let count_size = header.ifd_count_size();
        if bytes.len() < count_size {
            return Err(TiffError::FileTooSmall {
                required: count_size as u64,
                actual: bytes.len() as u64,
            });
        }

        let order = header.byte_order;
        let entry_count = if header.is_bigtiff {
            order.read_u64(&bytes[..8])
        } else {
            order.read_u16(&bytes[..2]) as u64
        };

        let required = Self::calculate_size(entry_count, header);
        if bytes.len() < required {
            return Err(TiffError::FileTooSmall {
                required: required as u64,
                actual: bytes.len() as u64,
            });
        }

        let entry_size = header.ifd_entry_size();
        let entries = (0..entry_count as usize)
            .map(|i| {
                let start = count_size + i * entry_size;
                IfdEntry::parse(&bytes[start..start + entry_size], header)
            })
            .collect();

        let next_start = count_size + entry_count as usize * entry_size;
        let next_ifd_offset = if header.is_bigtiff {
            order.read_u64(&bytes[next_start..])
        } else {
            order.read_u32(&bytes[next_start..]) as u64
        };

        Ok(Ifd {
            entries,
            next_ifd_offset,
        })
    }

    pub fn get_entry(&self, tag_id: u16) -> Option<&IfdEntry> {
        self.entries.iter().find(|e| e.tag_id == tag_id)
    }

    pub fn get_entry_by_tag(&self, tag: TiffTag) -> Option<&IfdEntry> {
        self.get_entry(tag.as_u16())
    }
}

/// Read the header and every IFD of the chain.
pub fn parse_ifd_chain<R: RangeReader + ?Sized>(
    reader: &R,
) -> Result<(TiffHeader, Vec<Ifd>), TiffError> {
    let header_len = (BIGTIFF_HEADER_SIZE as u64).min(reader.size()) as usize;
    let header_bytes = reader.read_exact_at(0, header_len)?;
    let header = TiffHeader::parse(&header_bytes, reader.size())?;

    let mut ifds = Vec::new();
    let mut offset = header.first_ifd_offset;

    while offset != 0 && ifds.len() < MAX_IFDS {
        if offset >= reader.size() {
            return Err(TiffError::InvalidIfdOffset(offset));
        }
        let count_bytes = reader.read_exact_at(offset, header.ifd_count_size())?;
        let entry_count = if header.is_bigtiff {
            header.byte_order.read_u64(&count_bytes)
        } else {
            header.byte_order.read_u16(&count_bytes) as u64
        };

        let ifd_size = Ifd::calculate_size(entry_count, &header);
        let ifd_bytes = reader.read_exact_at(offset, ifd_size)?;
        let ifd = Ifd::parse(&ifd_bytes, &header)?;

        offset = ifd.next_ifd_offset;
        ifds.push(ifd);
    }

    Ok((header, ifds))
}

// =============================================================================
// Tests
// =============================================================================
