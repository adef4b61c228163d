//! # rastertile
//!
//! A tile-serving engine for large georeferenced rasters.
//!
//! Given a dataset handle and a requested tile (XYZ address or arbitrary
//! bounds), this library returns a reprojected, resampled, nodata-masked
//! pixel grid. It also computes the summary statistics used for colorization
//! and stretching, and evaluates user band-math expressions in a sandbox.
//!
//! ## Features
//!
//! - **Reprojection**: Reads tiles through a padded warped view in the target CRS
//! - **Statistics**: Exact or block-wise percentiles, mean, stdev and valid-data hull
//! - **Compressed caching**: zlib-compressed decoded tiles with LFU eviction
//! - **Worker pool**: Bounded parallel execution with automatic recovery
//! - **Band math**: Whitelisted expression grammar with a time budget
//! - **GeoTIFF**: Native range-based reader for tiled and striped GeoTIFF/BigTIFF
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`io`] - Byte-range readers
//! - [`mod@format`] - TIFF container and GeoTIFF parsing
//! - [`raster`] - Dataset abstraction, CRS transforms, warped views and drivers
//! - [`stats`] - Statistics engine
//! - [`expr`] - Expression sandbox
//! - [`pool`] - Execution pool
//! - [`store`] - Metadata store interface
//! - [`tile`] - Tile service, reprojection, caching and encoding
//! - [`config`] - Configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rastertile::{Config, GeoTiffDriver, InMemoryMetadataStore, MetadataStore, TileService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     config.validate()?;
//!
//!     let driver = Arc::new(GeoTiffDriver::new());
//!     let store = Arc::new(InMemoryMetadataStore::with_keys(["product", "band"]));
//!     store
//!         .insert(
//!             &["s2".to_string(), "red".to_string()],
//!             &"/data/s2_red.tif".into(),
//!             None,
//!         )
//!         .await?;
//!
//!     let service = TileService::from_config(&config, driver, store);
//!     let keys = vec!["s2".to_string(), "red".to_string()];
//!     let tile = service.get_tile_xyz(&keys, 10, 550, 335, None, false).await?;
//!     println!("{} valid pixels", tile.valid_count());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod expr;
pub mod format;
pub mod io;
pub mod pool;
pub mod raster;
pub mod stats;
pub mod store;
pub mod tile;

// Re-export commonly used types
pub use config::Config;
pub use error::{
    ExpressionError, IoError, PoolError, RasterError, StatsError, StoreError, TiffError, TileError,
};
pub use expr::ExpressionSandbox;
pub use io::{BytesReader, FileRangeReader, RangeReader};
pub use pool::{ExecutionPool, PendingTask};
pub use raster::{
    Affine, Bounds, Crs, DataType, DatasetHandle, DatasetRegistry, GeoTiffDriver, MemoryDriver,
    MemoryRaster, RasterDataset, RasterDriver, Resampling, Window,
};
pub use stats::{Metadata, MetadataOptions, StatisticsEngine};
pub use store::{InMemoryMetadataStore, MetadataStore};
pub use tile::{
    PendingTile, RasterTile, ReprojectOptions, RgbTile, TileCache, TileCacheKey, TileReprojector,
    TileRequest, TileService, TileSize,
};
