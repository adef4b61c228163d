//! Tile Service for orchestrating tile retrieval.
//!
//! The TileService is the main entry point for tile requests. It wires:
//! - Metadata store lookups (dataset keys to handles, lazy metadata)
//! - Cache lookups
//! - Dataset access via the registry
//! - Reprojection in the execution pool
//! - Result caching
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          TileService                             │
//! │  ┌──────────────────────────────────────────────────────────┐    │
//! │  │                      get_tile()                          │    │
//! │  │  1. Hash request      3. Reproject in ExecutionPool       │    │
//! │  │  2. Check cache       4. Cache & return                   │    │
//! │  └──────────────────────────────────────────────────────────┘    │
//! │        │                 │                  │                    │
//! │        ▼                 ▼                  ▼                    │
//! │  ┌───────────┐   ┌────────────────┐   ┌────────────────────┐     │
//! │  │ TileCache │   │ DatasetRegistry│   │  TileReprojector   │     │
//! │  └───────────┘   └────────────────┘   └────────────────────┘     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Composite requests (`compute_tile`, `rgb_tile`) fan their band
//! retrievals out over at most `fanout_workers` concurrent tasks and join
//! them into fixed slots before combining.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use ndarray::{Array2, Zip};
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{ExpressionError, PoolError, TileError};
use crate::expr::ExpressionSandbox;
use crate::pool::{ExecutionPool, PendingTask};
use crate::raster::{
    Bounds, Crs, CrsTransform, DataType, DatasetHandle, DatasetRegistry, RasterDriver,
};
use crate::stats::{Metadata, MetadataOptions, StatisticsEngine};
use crate::store::MetadataStore;

use super::cache::{TileCache, TileCacheKey};
use super::encoder::{encode_png, to_uint8};
use super::grid::{RasterTile, TileRequest, TileSize};
use super::reproject::{ReprojectOptions, TileReprojector};
use super::xyz;

/// Percentiles used as the default RGB stretch range.
const RGB_STRETCH_PERCENTILES: (u32, u32) = (2, 98);

// =============================================================================
// Pending Tile
// =============================================================================

/// Handle to a tile being retrieved in the background.
///
/// Resolves immediately when the tile was already cached.
pub struct PendingTile(PendingTask<Result<RasterTile, TileError>>);

impl PendingTile {
    /// Whether the tile was available when the handle was created.
    pub fn is_ready(&self) -> bool {
        self.0.is_ready()
    }
}

impl Future for PendingTile {
    type Output = Result<RasterTile, TileError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|result| result.map_err(TileError::from).and_then(|tile| tile))
    }
}

// =============================================================================
// RGB Tile
// =============================================================================

/// Three contrast-stretched 8-bit channels and their combined mask.
#[derive(Debug, Clone, PartialEq)]
pub struct RgbTile {
    /// Red, green and blue, in that order
    pub channels: [Array2<u8>; 3],
    /// `true` where any band is invalid
    pub mask: Array2<bool>,
}

impl RgbTile {
    pub fn to_png(&self) -> Result<bytes::Bytes, TileError> {
        encode_png(&self.channels, Some(&self.mask))
    }
}

// =============================================================================
// Single-flight
// =============================================================================

/// State for an in-flight tile retrieval.
struct InFlightState {
    /// Notification for waiters
    notify: Notify,
    /// Result of the retrieval (set when complete)
    result: Mutex<Option<Result<RasterTile, TileError>>>,
}

type InFlightMap = Mutex<HashMap<TileCacheKey, Arc<InFlightState>>>;

enum Role {
    Leader(Arc<InFlightState>),
    Follower(Arc<InFlightState>),
    Cached(RasterTile),
}

/// Removes the in-flight entry and wakes waiters, also when the leader is
/// cancelled before finishing.
struct FlightGuard<'a> {
    in_flight: &'a InFlightMap,
    key: TileCacheKey,
    state: Arc<InFlightState>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.state))
        {
            in_flight.remove(&self.key);
        }
        drop(in_flight);
        self.state.notify.notify_waiters();
    }
}

/// Fully resolved request, hashed into the cache key.
#[derive(Serialize)]
struct CacheKeyParts<'a> {
    handle: &'a str,
    bounds: Option<[f64; 4]>,
    tile_size: [usize; 2],
    preserve_values: bool,
    upsampling: &'static str,
    downsampling: &'static str,
    target_crs: u16,
}

// =============================================================================
// Tile Service
// =============================================================================

/// Service for retrieving, caching and combining tiles.
///
/// Cloning is cheap; clones share the cache, pool and registry.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use rastertile::{Config, GeoTiffDriver, InMemoryMetadataStore, TileRequest, TileService};
///
/// let store = Arc::new(InMemoryMetadataStore::with_keys(["sensor", "band"]));
/// let service = TileService::from_config(&Config::default(), Arc::new(GeoTiffDriver::new()), store);
///
/// let tile = service.get_tile(TileRequest::new("/data/dem.tif")).await?;
/// println!("{} valid pixels", tile.valid_count());
/// ```
#[derive(Clone)]
pub struct TileService {
    registry: Arc<DatasetRegistry>,
    store: Arc<dyn MetadataStore>,
    cache: Arc<TileCache>,
    pool: ExecutionPool,
    reprojector: Arc<TileReprojector>,
    stats: Arc<StatisticsEngine>,
    sandbox: ExpressionSandbox,
    in_flight: Arc<InFlightMap>,
    fanout_workers: usize,
    default_tile_size: TileSize,
}

impl TileService {
    /// Create a service with default settings.
    pub fn new(driver: Arc<dyn RasterDriver>, store: Arc<dyn MetadataStore>) -> Self {
        Self::from_config(&Config::default(), driver, store)
    }

    pub fn from_config(
        config: &Config,
        driver: Arc<dyn RasterDriver>,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        let reproject = ReprojectOptions {
            target_crs: config.target_crs,
            upsampling: config.upsampling_method,
            downsampling: config.downsampling_method,
            out_of_bounds_threshold: config.out_of_bounds_threshold,
            vrt_padding: config.vrt_padding,
            native_resolution_fallback: config.native_resolution_fallback,
        };
        Self {
            registry: Arc::new(DatasetRegistry::with_capacity(driver, config.dataset_cache)),
            store,
            cache: Arc::new(TileCache::new(
                config.tile_cache_size,
                config.cache_compress_level,
            )),
            pool: ExecutionPool::new(config.workers, config.use_multiprocessing),
            reprojector: Arc::new(TileReprojector::new(reproject)),
            stats: Arc::new(StatisticsEngine::new(config.large_raster_threshold)),
            sandbox: ExpressionSandbox::new(Duration::from_millis(config.expression_timeout_ms)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            fanout_workers: config.fanout_workers.max(1),
            default_tile_size: config.default_tile_size,
        }
    }

    pub fn registry(&self) -> &Arc<DatasetRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn pool(&self) -> &ExecutionPool {
        &self.pool
    }

    pub fn default_tile_size(&self) -> TileSize {
        self.default_tile_size
    }

    /// Cache key of the fully resolved request.
    pub fn cache_key(&self, request: &TileRequest) -> Result<TileCacheKey, TileError> {
        let options = self.reprojector.options();
        // Adding 0.0 folds -0.0 into 0.0
        let bounds = request
            .bounds
            .map(|b| b.to_array().map(|v| v + 0.0));
        TileCacheKey::from_parts(&CacheKeyParts {
            handle: request.handle.as_str(),
            bounds,
            tile_size: [request.tile_size.width, request.tile_size.height],
            preserve_values: request.preserve_values,
            upsampling: options.upsampling.as_str(),
            downsampling: options.downsampling.as_str(),
            target_crs: options.target_crs.code(),
        })
        .map_err(|e| TileError::InvalidRequest(format!("cannot hash tile request: {}", e)))
    }

    // =========================================================================
    // Tiles
    // =========================================================================

    /// Get a tile, using the cache when available.
    ///
    /// On a miss the tile is reprojected in the execution pool and cached.
    /// Concurrent misses for the same request share one retrieval.
    ///
    /// # Errors
    ///
    /// - [`TileError::OutOfBounds`] if the dataset barely covers the tile;
    ///   callers should serve a blank tile
    /// - [`TileError::Raster`] if the dataset cannot be opened or read
    /// - [`TileError::Pool`] if the execution pool failed twice
    pub async fn get_tile(&self, request: TileRequest) -> Result<RasterTile, TileError> {
        let key = self.cache_key(&request)?;

        if let Some(tile) = self.cache.get(&key) {
            debug!(handle = %request.handle, "Tile cache hit");
            return Ok(tile);
        }

        loop {
            let role = {
                let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
                match in_flight.get(&key) {
                    Some(state) => Role::Follower(state.clone()),
                    // A leader may have finished since the first lookup
                    None => match self.cache.get(&key) {
                        Some(tile) => Role::Cached(tile),
                        None => {
                            let state = Arc::new(InFlightState {
                                notify: Notify::new(),
                                result: Mutex::new(None),
                            });
                            in_flight.insert(key.clone(), state.clone());
                            Role::Leader(state)
                        }
                    },
                }
            };

            let state = match role {
                Role::Cached(tile) => return Ok(tile),
                Role::Leader(state) => return self.lead_retrieval(key, request, state).await,
                Role::Follower(state) => state,
            };

            // Register for the wake-up before looking at the result
            let notified = state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = Self::take_result(&state) {
                return result;
            }
            notified.await;
            if let Some(result) = Self::take_result(&state) {
                return result;
            }
            // Leader was cancelled: retry, possibly as the new leader
        }
    }

    fn take_result(state: &InFlightState) -> Option<Result<RasterTile, TileError>> {
        state
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn lead_retrieval(
        &self,
        key: TileCacheKey,
        request: TileRequest,
        state: Arc<InFlightState>,
    ) -> Result<RasterTile, TileError> {
        let guard = FlightGuard {
            in_flight: self.in_flight.as_ref(),
            key: key.clone(),
            state: state.clone(),
        };

        debug!(handle = %request.handle, "Tile cache miss");
        let result = self.retrieve(request).await;

        if let Ok(tile) = &result {
            self.cache.put(key, tile);
        }
        *state.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(result.clone());
        drop(guard);

        result
    }

    /// Reproject a tile in the pool without consulting the cache.
    pub async fn retrieve(&self, request: TileRequest) -> Result<RasterTile, TileError> {
        let registry = self.registry.clone();
        let reprojector = self.reprojector.clone();
        let task = move || -> Result<RasterTile, TileError> {
            let dataset = registry.get(&request.handle)?;
            reprojector.reproject_tile(
                dataset.as_ref(),
                request.bounds,
                request.tile_size,
                request.preserve_values,
            )
        };
        self.pool.submit(task).await?
    }

    /// Start retrieving a tile and return immediately.
    ///
    /// Cache hits give an already resolved handle. Misses start in the
    /// background when called inside a Tokio runtime, and otherwise when
    /// the handle is first polled.
    pub fn get_tile_async(&self, request: TileRequest) -> PendingTile {
        let key = match self.cache_key(&request) {
            Ok(key) => key,
            Err(e) => return PendingTile(PendingTask::ready(Err(e))),
        };
        if let Some(tile) = self.cache.get(&key) {
            debug!(handle = %request.handle, "Tile cache hit");
            return PendingTile(PendingTask::ready(Ok(tile)));
        }

        let service = self.clone();
        let retrieval = async move { service.get_tile(request).await };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = runtime.spawn(retrieval);
                PendingTile(PendingTask::from_future(async move {
                    handle
                        .await
                        .map_err(|e| PoolError::Unavailable(format!("tile task failed: {}", e)))
                }))
            }
            Err(_) => PendingTile(PendingTask::from_future(async move { Ok(retrieval.await) })),
        }
    }

    /// Get quad-tree tile `z/x/y` of the dataset registered under `keys`.
    pub async fn get_tile_xyz(
        &self,
        keys: &[String],
        z: u8,
        x: u32,
        y: u32,
        tile_size: Option<TileSize>,
        preserve_values: bool,
    ) -> Result<RasterTile, TileError> {
        let bounds = self.xyz_bounds(z, x, y)?;
        let handle = self.store.get_handle(keys).await?;
        let request = TileRequest::new(handle)
            .with_bounds(bounds)
            .with_tile_size(tile_size.unwrap_or(self.default_tile_size))
            .preserve_values(preserve_values);
        self.get_tile(request).await
    }

    /// Tile `z/x/y` bounds in the target CRS.
    fn xyz_bounds(&self, z: u8, x: u32, y: u32) -> Result<Bounds, TileError> {
        let bounds = xyz::tile_bounds(z, x, y)?;
        let target = self.reprojector.options().target_crs;
        if target == Crs::WEB_MERCATOR {
            return Ok(bounds);
        }
        Ok(CrsTransform::new(Crs::WEB_MERCATOR, target)?
            .transform_bounds(&bounds, crate::raster::crs::DEFAULT_DENSIFY_POINTS)?)
    }

    /// Tile of the dataset registered under `keys`.
    async fn band_tile(
        &self,
        keys: &[String],
        bounds: Option<Bounds>,
        tile_size: TileSize,
    ) -> Result<RasterTile, TileError> {
        let handle = self.store.get_handle(keys).await?;
        let mut request = TileRequest::new(handle).with_tile_size(tile_size);
        request.bounds = bounds;
        self.get_tile(request).await
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Metadata of the dataset under `keys`, computed and stored on first use.
    pub async fn get_metadata(&self, keys: &[String]) -> Result<Metadata, TileError> {
        if let Some(metadata) = self.store.get_metadata(keys).await? {
            return Ok(metadata);
        }

        let handle = self.store.get_handle(keys).await?;
        info!(handle = %handle, "Metadata missing, computing on demand");
        let metadata = self
            .compute_metadata(&handle, MetadataOptions::default())
            .await?;
        self.store
            .insert(keys, &handle, Some(metadata.clone()))
            .await?;
        Ok(metadata)
    }

    /// Compute metadata for `handle` in the execution pool.
    pub async fn compute_metadata(
        &self,
        handle: &DatasetHandle,
        options: MetadataOptions,
    ) -> Result<Metadata, TileError> {
        let registry = self.registry.clone();
        let stats = self.stats.clone();
        let task_handle = handle.clone();
        let task = move || -> Result<Metadata, TileError> {
            let dataset = registry.get(&task_handle)?;
            Ok(stats.compute(dataset.as_ref(), &options)?)
        };

        let metadata = self.pool.submit(task).await??;
        info!(
            handle = %handle,
            valid_percentage = metadata.valid_percentage,
            "Computed metadata"
        );
        Ok(metadata)
    }

    // =========================================================================
    // Composites
    // =========================================================================

    /// Evaluate a band-math expression over in-memory operands.
    pub fn evaluate_expression(
        &self,
        expression: &str,
        operands: &HashMap<String, Array2<f64>>,
    ) -> Result<Array2<f64>, ExpressionError> {
        self.sandbox.evaluate(expression, operands)
    }

    /// Combine several datasets with a band-math expression.
    ///
    /// `operands` maps expression names (`v1`, `v2`, ...) to dataset keys.
    /// The expression is validated before any band is read. The result
    /// is masked wherever an operand is masked or the value is not finite.
    pub async fn compute_tile(
        &self,
        expression: &str,
        operands: &BTreeMap<String, Vec<String>>,
        bounds: Option<Bounds>,
        tile_size: Option<TileSize>,
    ) -> Result<RasterTile, TileError> {
        let names: Vec<&str> = operands.keys().map(String::as_str).collect();
        self.sandbox.compile(expression, &names)?;

        let tile_size = tile_size.unwrap_or(self.default_tile_size);
        let jobs: Vec<(String, Vec<String>)> = operands
            .iter()
            .map(|(name, keys)| (name.clone(), keys.clone()))
            .collect();

        let tiles = self
            .fan_out(jobs.len(), |service, index| {
                let keys = jobs[index].1.clone();
                async move { service.band_tile(&keys, bounds, tile_size).await }
            })
            .await?;

        let mut mask = Array2::from_elem(tile_size.shape(), false);
        let mut arrays = HashMap::with_capacity(tiles.len());
        for ((name, _), tile) in jobs.into_iter().zip(tiles) {
            mask.zip_mut_with(tile.mask(), |m, &t| *m |= t);
            arrays.insert(name, tile.masked_data());
        }

        let sandbox = self.sandbox.clone();
        let expression = expression.to_string();
        let data = tokio::task::spawn_blocking(move || sandbox.evaluate(&expression, &arrays))
            .await
            .map_err(|e| PoolError::Unavailable(format!("expression task failed: {}", e)))??;

        Zip::from(&mut mask).and(&data).for_each(|m, v| *m |= !v.is_finite());
        Ok(RasterTile::new(data, mask, DataType::Float64)?)
    }

    /// Combine three datasets into an RGB tile.
    ///
    /// Each band is stretched from its range (default: the dataset's 2nd to
    /// 98th percentile) onto `1..=255`. Bands keep their slot regardless of
    /// completion order.
    pub async fn rgb_tile(
        &self,
        keys: [Vec<String>; 3],
        bounds: Option<Bounds>,
        tile_size: Option<TileSize>,
        stretch_ranges: [Option<(f64, f64)>; 3],
    ) -> Result<RgbTile, TileError> {
        let tile_size = tile_size.unwrap_or(self.default_tile_size);

        let bands = self
            .fan_out(3, |service, index| {
                let band_keys = keys[index].clone();
                let stretch = stretch_ranges[index];
                async move {
                    let tile = service.band_tile(&band_keys, bounds, tile_size).await?;
                    let range = match stretch {
                        Some(range) => range,
                        None => {
                            let metadata = service.get_metadata(&band_keys).await?;
                            let (lo, hi) = RGB_STRETCH_PERCENTILES;
                            (
                                metadata.percentile(lo).unwrap_or(metadata.range.0),
                                metadata.percentile(hi).unwrap_or(metadata.range.1),
                            )
                        }
                    };
                    Ok::<_, TileError>((tile, range))
                }
            })
            .await?;

        let mut mask = Array2::from_elem(tile_size.shape(), false);
        let mut channels = Vec::with_capacity(3);
        for (tile, (lo, hi)) in &bands {
            mask.zip_mut_with(tile.mask(), |m, &t| *m |= t);
            channels.push(to_uint8(&tile.masked_data(), *lo, *hi));
        }
        let channels: [Array2<u8>; 3] = channels
            .try_into()
            .map_err(|_| TileError::InvalidRequest("expected three bands".to_string()))?;

        Ok(RgbTile { channels, mask })
    }

    /// Run `count` jobs with at most `fanout_workers` in flight. Results keep
    /// job order; the first failure aborts the rest.
    async fn fan_out<T, F, Fut>(&self, count: usize, job: F) -> Result<Vec<T>, TileError>
    where
        T: Send + 'static,
        F: Fn(TileService, usize) -> Fut,
        Fut: Future<Output = Result<T, TileError>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.fanout_workers));
        let mut set = JoinSet::new();
        for index in 0..count {
            let semaphore = semaphore.clone();
            let task = job(self.clone(), index);
            set.spawn(async move {
                match semaphore.acquire_owned().await {
                    Ok(_permit) => task.await.map(|value| (index, value)),
                    Err(e) => Err(TileError::Pool(PoolError::Unavailable(e.to_string()))),
                }
            });
        }

        let mut slots: Vec<Option<T>> = (0..count).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            let (index, value) = joined
                .map_err(|e| PoolError::Unavailable(format!("band task failed: {}", e)))??;
            slots[index] = Some(value);
        }
        slots
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| TileError::Pool(PoolError::Unavailable("band task lost".to_string())))
            })
            .collect()
    }

    // =========================================================================
    // Cache
    // =========================================================================

    /// Get tile cache statistics.
    ///
    /// Returns `(current_size, capacity, entry_count)`.
    pub fn cache_stats(&self) -> (usize, usize, usize) {
        (self.cache.size(), self.cache.capacity(), self.cache.len())
    }

    /// Clear the tile cache.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
