//! Raster file format parsers.
//!
//! GeoTIFF is the only on-disk format. [`tiff`] understands the container
//! (header, IFDs, tag values) and [`geotiff`] turns the first image into
//! georeferenced pixel blocks.

pub mod geotiff;
pub mod tiff;

pub use geotiff::{BlockLayout, GeoReference, GeoTiffReader};
