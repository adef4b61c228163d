//! TIFF tag and field type definitions.
//!
//! This module defines the vocabulary for GeoTIFF parsing, including:
//! - Field types that determine how values are encoded
//! - Tag IDs for image structure and georeferencing
//! - Compression and sample format identifiers
//!
//! The definitions support both classic TIFF and BigTIFF formats.

// =============================================================================
// TIFF Field Types
// =============================================================================

/// TIFF field types that determine how values are encoded.
///
/// Each field type has a fixed size in bytes, which decides whether a value
/// fits inline in an IFD entry and how arrays are strided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FieldType {
    /// Unsigned 8-bit integer
    Byte = 1,

    /// 8-bit ASCII character
    Ascii = 2,

    /// Unsigned 16-bit integer
    Short = 3,

    /// Unsigned 32-bit integer
    Long = 4,

    /// Two Longs: numerator and denominator
    Rational = 5,

    /// Signed 8-bit integer
    SByte = 6,

    /// Undefined byte data
    Undefined = 7,

    /// Signed 16-bit integer
    SShort = 8,

    /// Signed 32-bit integer
    SLong = 9,

    /// Two SLongs: numerator and denominator
    SRational = 10,

    /// IEEE single precision float
    Float = 11,

    /// IEEE double precision float (GeoTIFF model tags)
    Double = 12,

    /// Unsigned 64-bit integer - BigTIFF only
    Long8 = 16,

    /// Signed 64-bit integer - BigTIFF only
    SLong8 = 17,
}

impl FieldType {
    /// Size of a single value of this type in bytes.
    #[inline]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            FieldType::Byte | FieldType::Ascii | FieldType::SByte | FieldType::Undefined => 1,
            FieldType::Short | FieldType::SShort => 2,
            FieldType::Long | FieldType::SLong | FieldType::Float => 4,
            FieldType::Rational
            | FieldType::SRational
            | FieldType::Double
            | FieldType::Long8
            | FieldType::SLong8 => 8,
        }
    }

    /// Create a FieldType from its numeric value.
    ///
    /// Returns `None` for unknown type values.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(FieldType::Byte),
            2 => Some(FieldType::Ascii),
            3 => Some(FieldType::Short),
            4 => Some(FieldType::Long),
            5 => Some(FieldType::Rational),
            6 => Some(FieldType::SByte),
            7 => Some(FieldType::Undefined),
            8 => Some(FieldType::SShort),
            9 => Some(FieldType::SLong),
            10 => Some(FieldType::SRational),
            11 => Some(FieldType::Float),
            12 => Some(FieldType::Double),
            16 => Some(FieldType::Long8),
            17 => Some(FieldType::SLong8),
            _ => None,
        }
    }

    /// Maximum bytes stored inline in a classic TIFF IFD entry.
    pub const INLINE_THRESHOLD_TIFF: usize = 4;

    /// Maximum bytes stored inline in a BigTIFF IFD entry.
    pub const INLINE_THRESHOLD_BIGTIFF: usize = 8;

    /// Check if a value with this type and count fits inline in an entry.
    #[inline]
    pub fn fits_inline(self, count: u64, is_bigtiff: bool) -> bool {
        let total_size = self.size_in_bytes() as u64 * count;
        let threshold = if is_bigtiff {
            Self::INLINE_THRESHOLD_BIGTIFF as u64
        } else {
            Self::INLINE_THRESHOLD_TIFF as u64
        };
        total_size <= threshold
    }
}

// =============================================================================
// TIFF Tags
// =============================================================================

/// TIFF tag IDs relevant to raster parsing.
///
/// Only the tags needed for image structure, block access and georeferencing
/// are listed. Unknown tags are kept in the IFD but never interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TiffTag {
    // -------------------------------------------------------------------------
    // Basic Image Structure
    // -------------------------------------------------------------------------
    ImageWidth = 256,
    ImageLength = 257,
    BitsPerSample = 258,
    Compression = 259,
    PhotometricInterpretation = 262,
    SamplesPerPixel = 277,
    PlanarConfiguration = 284,
    Predictor = 317,
    ExtraSamples = 338,
    SampleFormat = 339,

    // -------------------------------------------------------------------------
    // Strip Organization
    // -------------------------------------------------------------------------
    StripOffsets = 273,
    RowsPerStrip = 278,
    StripByteCounts = 279,

    // -------------------------------------------------------------------------
    // Tile Organization
    // -------------------------------------------------------------------------
    TileWidth = 322,
    TileLength = 323,
    TileOffsets = 324,
    TileByteCounts = 325,

    // -------------------------------------------------------------------------
    // GeoTIFF
    // -------------------------------------------------------------------------
    /// Pixel size in model units (ScaleX, ScaleY, ScaleZ)
    ModelPixelScale = 33550,

    /// Raster-to-model tie points (I, J, K, X, Y, Z)*
    ModelTiepoint = 33922,

    /// Full 4x4 raster-to-model transformation matrix
    ModelTransformation = 34264,

    /// GeoKey directory (header + key entries)
    GeoKeyDirectory = 34735,

    /// Double-valued GeoKey parameters
    GeoDoubleParams = 34736,

    /// ASCII GeoKey parameters
    GeoAsciiParams = 34737,

    // -------------------------------------------------------------------------
    // GDAL private tags
    // -------------------------------------------------------------------------
    GdalMetadata = 42112,

    /// Nodata value as an ASCII string
    GdalNodata = 42113,
}

impl TiffTag {
    /// Create a TiffTag from its numeric value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            256 => Some(TiffTag::ImageWidth),
            257 => Some(TiffTag::ImageLength),
            258 => Some(TiffTag::BitsPerSample),
            259 => Some(TiffTag::Compression),
            262 => Some(TiffTag::PhotometricInterpretation),
            273 => Some(TiffTag::StripOffsets),
            277 => Some(TiffTag::SamplesPerPixel),
            278 => Some(TiffTag::RowsPerStrip),
            279 => Some(TiffTag::StripByteCounts),
            284 => Some(TiffTag::PlanarConfiguration),
            317 => Some(TiffTag::Predictor),
            322 => Some(TiffTag::TileWidth),
            323 => Some(TiffTag::TileLength),
            324 => Some(TiffTag::TileOffsets),
            325 => Some(TiffTag::TileByteCounts),
            338 => Some(TiffTag::ExtraSamples),
            339 => Some(TiffTag::SampleFormat),
            33550 => Some(TiffTag::ModelPixelScale),
            33922 => Some(TiffTag::ModelTiepoint),
            34264 => Some(TiffTag::ModelTransformation),
            34735 => Some(TiffTag::GeoKeyDirectory),
            34736 => Some(TiffTag::GeoDoubleParams),
            34737 => Some(TiffTag::GeoAsciiParams),
            42112 => Some(TiffTag::GdalMetadata),
            42113 => Some(TiffTag::GdalNodata),
            _ => None,
        }
    }

    /// Get the numeric tag ID.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

// =============================================================================
// Compression Values
// =============================================================================

/// TIFF compression scheme identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Compression {
    None = 1,
    Lzw = 5,
    Jpeg = 7,
    Deflate = 8,
    PackBits = 32773,
    AdobeDeflate = 32946,
    Zstd = 50000,
}

impl Compression {
    /// Create a Compression from its numeric value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Compression::None),
            5 => Some(Compression::Lzw),
            7 => Some(Compression::Jpeg),
            8 => Some(Compression::Deflate),
            32773 => Some(Compression::PackBits),
            32946 => Some(Compression::AdobeDeflate),
            50000 => Some(Compression::Zstd),
            _ => None,
        }
    }

    /// Check if blocks with this compression can be decoded.
    #[inline]
    pub const fn is_supported(self) -> bool {
        matches!(
            self,
            Compression::None | Compression::Deflate | Compression::AdobeDeflate
        )
    }

    /// Get a human-readable name for the compression scheme.
    pub const fn name(self) -> &'static str {
        match self {
            Compression::None => "None",
            Compression::Lzw => "LZW",
            Compression::Jpeg => "JPEG",
            Compression::Deflate => "Deflate",
            Compression::PackBits => "PackBits",
            Compression::AdobeDeflate => "Adobe Deflate",
            Compression::Zstd => "ZSTD",
        }
    }
}

// =============================================================================
// Sample Format
// =============================================================================

/// Interpretation of sample bits (SampleFormat tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    Uint,
    Int,
    Float,
}

impl SampleFormat {
    /// Create a SampleFormat from its numeric value.
    ///
    /// Value 4 ("undefined") is read as unsigned integer data, like libtiff does.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 | 4 => Some(SampleFormat::Uint),
            2 => Some(SampleFormat::Int),
            3 => Some(SampleFormat::Float),
            _ => None,
        }
    }
}

// =============================================================================
// GeoKeys
// =============================================================================

/// GeoKey IDs read from the GeoKeyDirectory.
pub mod geokeys {
    /// 1 = projected, 2 = geographic
    pub const GT_MODEL_TYPE: u16 = 1024;
    /// 1 = PixelIsArea, 2 = PixelIsPoint
    pub const GT_RASTER_TYPE: u16 = 1025;
    pub const GEOGRAPHIC_TYPE: u16 = 2048;
    pub const PROJECTED_CS_TYPE: u16 = 3072;

    /// Key value meaning "user-defined"
    pub const USER_DEFINED: u16 = 32767;
    pub const RASTER_PIXEL_IS_POINT: u16 = 2;
}

// =============================================================================
// Tests
// =============================================================================
