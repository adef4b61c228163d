//! TIFF container parsing.
//!
//! - **Byte order**: declared in the header (II or MM); every multi-byte
//!   value is read through [`ByteOrder`].
//! - **Classic TIFF vs BigTIFF**: 32-bit vs 64-bit offsets, handled
//!   transparently.
//! - **Inline vs offset values**: small values live inside the IFD entry,
//!   larger ones at an offset the entry points to.

mod parser;
mod tags;
mod values;

pub use parser::{
    parse_ifd_chain, ByteOrder, Ifd, IfdEntry, TiffHeader, BIGTIFF_HEADER_SIZE, TIFF_HEADER_SIZE,
};
pub use tags::{geokeys, Compression, FieldType, SampleFormat, TiffTag};
pub use values::ValueReader;
