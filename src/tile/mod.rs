//! Tile service layer.
//!
//! This module turns dataset handles and tile bounds into reprojected,
//! nodata-masked pixel grids, and caches the results.
//!
//! # Architecture
//!
//! The tile service sits between embedders (web/API layers) and the raster
//! collaborator:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           Web / API embedder            │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │              Tile Service               │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │  TileCache   │  │ ExecutionPool   │  │
//! │  │  (zlib, LFU) │  │  (reprojection) │  │
//! │  └──────────────┘  └─────────────────┘  │
//! │  ┌──────────────┐  ┌─────────────────┐  │
//! │  │ Metadata     │  │ Expression      │  │
//! │  │ Store        │  │ Sandbox         │  │
//! │  └──────────────┘  └─────────────────┘  │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────┐
//! │    DatasetRegistry → RasterDriver       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TileService`]: Main entry point, orchestrates cache, pool and reprojection
//! - [`TileReprojector`]: Reads a target-CRS tile through a padded warped view
//! - [`TileCache`]: Compressed cache of decoded tiles with LFU eviction
//! - [`TileCacheKey`]: Hash of the fully resolved request
//! - [`RasterTile`]: Decoded grid plus validity mask
//! - [`TileRequest`]: Parameters for a tile request
//! - [`xyz`]: Quad-tree tile addressing
//!
//! # Example
//!
//! ```
//! use ndarray::Array2;
//! use rastertile::raster::DataType;
//! use rastertile::tile::{RasterTile, TileCache, TileCacheKey};
//!
//! // Create a cache with 50MB of compressed capacity
//! let cache = TileCache::new(50 * 1024 * 1024, 6);
//!
//! let key = TileCacheKey::from_parts(&("dem", 256, 256)).unwrap();
//! if cache.get(&key).is_none() {
//!     let tile = RasterTile::unmasked(Array2::zeros((256, 256)), DataType::Float32);
//!     cache.put(key.clone(), &tile);
//! }
//! assert!(cache.contains(&key));
//! ```

mod cache;
mod encoder;
mod grid;
mod reproject;
mod service;
pub mod xyz;

pub use cache::{TileCache, TileCacheKey, DEFAULT_COMPRESSION_LEVEL, DEFAULT_TILE_CACHE_CAPACITY};
pub use encoder::{contrast_stretch, encode_png, to_uint8};
pub use grid::{RasterTile, TileRequest, TileSize, DEFAULT_TILE_SIZE};
pub use reproject::{
    coverage_ratio, default_transform, ReprojectOptions, TargetGrid, TileReprojector,
    DEFAULT_OUT_OF_BOUNDS_THRESHOLD, DEFAULT_VRT_PADDING,
};
pub use service::{PendingTile, RgbTile, TileService};
