//! Configuration management for rastertile.
//!
//! This module provides a flexible configuration system that supports:
//! - Command-line arguments via clap
//! - Environment variables with `RASTERTILE_` prefix
//! - Sensible defaults for all settings
//!
//! # Example
//!
//! ```ignore
//! use clap::Parser;
//! use rastertile::config::Config;
//!
//! // Parse from command line and environment
//! let config = Config::parse();
//! config.validate()?;
//!
//! println!("Tile cache budget: {} bytes", config.tile_cache_size);
//! ```
//!
//! # Environment Variables
//!
//! - `RASTERTILE_TILE_CACHE_SIZE` - Compressed tile cache budget (default: 490MiB)
//! - `RASTERTILE_CACHE_COMPRESS_LEVEL` - zlib level 0-9 (default: 9)
//! - `RASTERTILE_UPSAMPLING_METHOD` - Warp kernel (default: linear)
//! - `RASTERTILE_DOWNSAMPLING_METHOD` - Read kernel when zoomed out (default: nearest)
//! - `RASTERTILE_USE_MULTIPROCESSING` - Parallel worker pool (default: true)
//! - `RASTERTILE_WORKERS` - Worker pool size (default: 3)
//! - `RASTERTILE_LARGE_RASTER_THRESHOLD` - Pixel count switching to chunked statistics
//! - `RASTERTILE_OUT_OF_BOUNDS_THRESHOLD` - Minimum tile coverage (default: 0.01)
//! - `RASTERTILE_EXPRESSION_TIMEOUT_MS` - Band-math time budget (default: 2000)
//! - `RASTERTILE_VRT_PADDING` - Warped view margin in pixels (default: 2)
//! - `RASTERTILE_TARGET_CRS` - Tile CRS (default: EPSG:3857)
//! - `RASTERTILE_DEFAULT_TILE_SIZE` - Tile size (default: 256x256)
//! - `RASTERTILE_FANOUT_WORKERS` - Concurrent band retrievals (default: 3)
//! - `RASTERTILE_DATASET_CACHE` - Open datasets kept (default: 100)

use clap::{ArgAction, Parser};

use crate::expr::DEFAULT_EXPRESSION_TIMEOUT;
use crate::pool::DEFAULT_WORKERS;
use crate::raster::registry::DEFAULT_DATASET_CACHE_CAPACITY;
use crate::raster::{Crs, Resampling};
use crate::stats::DEFAULT_LARGE_RASTER_THRESHOLD;
use crate::tile::{
    TileSize, DEFAULT_COMPRESSION_LEVEL, DEFAULT_OUT_OF_BOUNDS_THRESHOLD,
    DEFAULT_TILE_CACHE_CAPACITY, DEFAULT_VRT_PADDING,
};

// =============================================================================
// Default Values
// =============================================================================

/// Default number of concurrent band retrievals per composite request.
pub const DEFAULT_FANOUT_WORKERS: usize = 3;

/// Default expression timeout in milliseconds.
pub const DEFAULT_EXPRESSION_TIMEOUT_MS: u64 = DEFAULT_EXPRESSION_TIMEOUT.as_millis() as u64;

// =============================================================================
// Byte sizes
// =============================================================================

/// Parse a byte size such as `1048576`, `100MB` or `490MiB`.
pub fn parse_byte_size(s: &str) -> Result<usize, String> {
    let trimmed = s.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let value: usize = digits
        .parse()
        .map_err(|_| format!("invalid byte size '{}'", s))?;

    let multiplier: usize = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1_000,
        "kib" | "k" => 1 << 10,
        "mb" => 1_000_000,
        "mib" | "m" => 1 << 20,
        "gb" => 1_000_000_000,
        "gib" | "g" => 1 << 30,
        other => return Err(format!("unknown size unit '{}' in '{}'", other, s)),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("byte size '{}' is too large", s))
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// rastertile - reprojected tiles and statistics for georeferenced rasters.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "rastertile")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    // =========================================================================
    // Cache Configuration
    // =========================================================================
    /// Compressed tile cache budget (e.g. 490MiB).
    #[arg(long, default_value_t = DEFAULT_TILE_CACHE_CAPACITY, value_parser = parse_byte_size, env = "RASTERTILE_TILE_CACHE_SIZE")]
    pub tile_cache_size: usize,

    /// zlib compression level for cached tiles (0-9).
    #[arg(long, default_value_t = DEFAULT_COMPRESSION_LEVEL, env = "RASTERTILE_CACHE_COMPRESS_LEVEL")]
    pub cache_compress_level: u32,

    /// Number of opened datasets to keep.
    #[arg(long, default_value_t = DEFAULT_DATASET_CACHE_CAPACITY, env = "RASTERTILE_DATASET_CACHE")]
    pub dataset_cache: usize,

    // =========================================================================
    // Reprojection Configuration
    // =========================================================================
    /// Resampling kernel when tiles are finer than the source.
    #[arg(long, default_value = "linear", env = "RASTERTILE_UPSAMPLING_METHOD")]
    pub upsampling_method: Resampling,

    /// Resampling kernel when tiles are coarser than the source.
    #[arg(long, default_value = "nearest", env = "RASTERTILE_DOWNSAMPLING_METHOD")]
    pub downsampling_method: Resampling,

    /// CRS tiles are served in.
    #[arg(long, default_value = "EPSG:3857", env = "RASTERTILE_TARGET_CRS")]
    pub target_crs: Crs,

    /// Tile size used when a request does not give one (WIDTHxHEIGHT).
    #[arg(long, default_value = "256x256", env = "RASTERTILE_DEFAULT_TILE_SIZE")]
    pub default_tile_size: TileSize,

    /// Minimum share of a tile the dataset has to cover (0-1].
    #[arg(long, default_value_t = DEFAULT_OUT_OF_BOUNDS_THRESHOLD, env = "RASTERTILE_OUT_OF_BOUNDS_THRESHOLD")]
    pub out_of_bounds_threshold: f64,

    /// Margin around warped views, in pixels.
    #[arg(long, default_value_t = DEFAULT_VRT_PADDING, env = "RASTERTILE_VRT_PADDING")]
    pub vrt_padding: usize,

    /// Sample the warped view at tile resolution when zoomed in past the
    /// native resolution.
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "RASTERTILE_NATIVE_RESOLUTION_FALLBACK")]
    pub native_resolution_fallback: bool,

    // =========================================================================
    // Execution Configuration
    // =========================================================================
    /// Run reprojection on a parallel worker pool.
    ///
    /// When disabled, or when the pool cannot start, a single worker is used.
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "RASTERTILE_USE_MULTIPROCESSING")]
    pub use_multiprocessing: bool,

    /// Worker pool size.
    #[arg(long, default_value_t = DEFAULT_WORKERS, env = "RASTERTILE_WORKERS")]
    pub workers: usize,

    /// Concurrent band retrievals per composite request.
    #[arg(long, default_value_t = DEFAULT_FANOUT_WORKERS, env = "RASTERTILE_FANOUT_WORKERS")]
    pub fanout_workers: usize,

    // =========================================================================
    // Statistics and Expressions
    // =========================================================================
    /// Pixel count above which statistics are computed block by block.
    #[arg(long, default_value_t = DEFAULT_LARGE_RASTER_THRESHOLD, env = "RASTERTILE_LARGE_RASTER_THRESHOLD")]
    pub large_raster_threshold: u64,

    /// Wall-clock budget for one band-math expression, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_EXPRESSION_TIMEOUT_MS, env = "RASTERTILE_EXPRESSION_TIMEOUT_MS")]
    pub expression_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tile_cache_size: DEFAULT_TILE_CACHE_CAPACITY,
            cache_compress_level: DEFAULT_COMPRESSION_LEVEL,
            dataset_cache: DEFAULT_DATASET_CACHE_CAPACITY,
            upsampling_method: Resampling::Linear,
            downsampling_method: Resampling::Nearest,
            target_crs: Crs::WEB_MERCATOR,
            default_tile_size: TileSize::default(),
            out_of_bounds_threshold: DEFAULT_OUT_OF_BOUNDS_THRESHOLD,
            vrt_padding: DEFAULT_VRT_PADDING,
            native_resolution_fallback: true,
            use_multiprocessing: true,
            workers: DEFAULT_WORKERS,
            fanout_workers: DEFAULT_FANOUT_WORKERS,
            large_raster_threshold: DEFAULT_LARGE_RASTER_THRESHOLD,
            expression_timeout_ms: DEFAULT_EXPRESSION_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.tile_cache_size == 0 {
            return Err("tile_cache_size must be greater than 0".to_string());
        }
        if self.cache_compress_level > 9 {
            return Err("cache_compress_level must be between 0 and 9".to_string());
        }
        if self.dataset_cache == 0 {
            return Err("dataset_cache must be greater than 0".to_string());
        }

        if self.default_tile_size.is_empty() {
            return Err("default_tile_size must be positive in both dimensions".to_string());
        }
        if !(self.out_of_bounds_threshold > 0.0 && self.out_of_bounds_threshold <= 1.0) {
            return Err("out_of_bounds_threshold must be in (0, 1]".to_string());
        }

        if self.workers == 0 {
            return Err("workers must be greater than 0".to_string());
        }
        if self.fanout_workers == 0 {
            return Err("fanout_workers must be greater than 0".to_string());
        }

        if self.large_raster_threshold == 0 {
            return Err("large_raster_threshold must be greater than 0".to_string());
        }
        if self.expression_timeout_ms == 0 {
            return Err("expression_timeout_ms must be greater than 0".to_string());
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
