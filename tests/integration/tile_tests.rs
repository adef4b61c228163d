//! Tile retrieval integration tests.
//!
//! Tests verify:
//! - Nodata masking on reprojected tiles
//! - Out-of-bounds rejection before any pixel read
//! - Cache idempotence and single-flight deduplication
//! - XYZ addressing across CRSs
//! - LFU eviction under a small budget

use std::sync::Arc;

use approx::assert_relative_eq;
use ndarray::Array2;

use rastertile::raster::{Affine, Bounds, Crs, DataType, MemoryDriver, MemoryRaster};
use rastertile::store::{InMemoryMetadataStore, MetadataStore};
use rastertile::tile::{RasterTile, TileCache, TileCacheKey, TileRequest, TileService, TileSize};
use rastertile::{Config, TileError};

use super::test_utils::{
    constant_raster, half_nodata_raster, init_tracing, keys, mercator_bounds, CountingDriver,
};

fn counting_service() -> (Arc<CountingDriver>, TileService) {
    init_tracing();
    let driver = Arc::new(CountingDriver::new());
    let service = TileService::new(driver.clone(), Arc::new(InMemoryMetadataStore::new()));
    (driver, service)
}

fn full_request(handle: &str) -> TileRequest {
    TileRequest::new(handle)
        .with_bounds(mercator_bounds())
        .with_tile_size(TileSize::square(256))
        .preserve_values(true)
}

// =============================================================================
// Masking
// =============================================================================

#[tokio::test]
async fn test_half_nodata_tile() {
    let (driver, service) = counting_service();
    let handle = driver.insert(half_nodata_raster("mem://half"));

    let tile = service.get_tile(full_request(handle.as_str())).await.unwrap();

    assert_eq!(tile.shape(), (256, 256));
    assert_eq!(tile.dtype(), DataType::Int16);
    assert_eq!(tile.valid_count(), 128 * 256);
    assert!(tile.mask()[[0, 200]]);
    assert!(!tile.mask()[[10, 20]]);
    assert_eq!(tile.data()[[10, 20]], 30.0);
    assert!(tile.masked_data()[[255, 255]].is_nan());
}

#[tokio::test]
async fn test_preview_without_bounds() {
    let (driver, service) = counting_service();
    let handle = driver.insert(half_nodata_raster("mem://half"));

    let request = TileRequest::new(handle).with_tile_size(TileSize::square(64));
    let tile = service.get_tile(request).await.unwrap();

    assert_eq!(tile.shape(), (64, 64));
    let valid_share = tile.valid_count() as f64 / (64.0 * 64.0);
    assert!((valid_share - 0.5).abs() < 0.05, "valid share {}", valid_share);
}

#[tokio::test]
async fn test_rectangular_tile_size() {
    let (driver, service) = counting_service();
    let handle = driver.insert(constant_raster("mem://flat", (64, 64), 7.0));

    let request = TileRequest::new(handle)
        .with_bounds(mercator_bounds())
        .with_tile_size(TileSize::new(128, 32));
    let tile = service.get_tile(request).await.unwrap();

    assert_eq!(tile.shape(), (32, 128));
    assert!(tile.data().iter().all(|v| *v == 7.0));
}

// =============================================================================
// Out of Bounds
// =============================================================================

#[tokio::test]
async fn test_out_of_bounds_reads_nothing() {
    let (driver, service) = counting_service();
    let handle = driver.insert(half_nodata_raster("mem://half"));

    let far_away = Bounds::new(5_000_000.0, 5_000_000.0, 5_100_000.0, 5_100_000.0);
    let err = service
        .get_tile(TileRequest::new(handle).with_bounds(far_away))
        .await
        .unwrap_err();

    assert!(err.is_out_of_bounds());
    assert_eq!(driver.read_count(), 0);
}

#[tokio::test]
async fn test_sliver_below_threshold() {
    let (driver, service) = counting_service();
    let handle = driver.insert(half_nodata_raster("mem://half"));

    // 0.5% of the tile overlaps the dataset
    let tile = Bounds::new(255_000.0, 0.0, 455_000.0, 256_000.0);
    let err = service
        .get_tile(TileRequest::new(handle).with_bounds(tile))
        .await
        .unwrap_err();

    match err {
        TileError::OutOfBounds {
            coverage,
            threshold,
        } => {
            assert!(coverage < threshold);
            assert_relative_eq!(coverage, 1_000.0 / 200_000.0, epsilon = 1e-9);
        }
        other => panic!("unexpected error: {other}"),
    }
}

// =============================================================================
// Caching
// =============================================================================

#[tokio::test]
async fn test_repeated_requests_hit_cache() {
    let (driver, service) = counting_service();
    let handle = driver.insert(half_nodata_raster("mem://half"));

    let first = service.get_tile(full_request(handle.as_str())).await.unwrap();
    let reads = driver.read_count();
    assert!(reads > 0);

    let second = service.get_tile(full_request(handle.as_str())).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(driver.read_count(), reads);

    // A different tile size is a different entry
    let smaller = full_request(handle.as_str()).with_tile_size(TileSize::square(128));
    service.get_tile(smaller).await.unwrap();
    assert!(driver.read_count() > reads);
    assert_eq!(service.cache_stats().2, 2);
}

#[tokio::test]
async fn test_dataset_opened_once() {
    let (driver, service) = counting_service();
    let handle = driver.insert(half_nodata_raster("mem://half"));

    for edge in [64, 128, 256] {
        let request = full_request(handle.as_str()).with_tile_size(TileSize::square(edge));
        service.get_tile(request).await.unwrap();
    }
    assert_eq!(driver.open_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_read_once() {
    // Reads needed for one tile
    let (reference, reference_service) = counting_service();
    let handle = reference.insert(half_nodata_raster("mem://half"));
    reference_service
        .get_tile(full_request(handle.as_str()))
        .await
        .unwrap();
    let reads_per_tile = reference.read_count();

    let (driver, service) = counting_service();
    let handle = driver.insert(half_nodata_raster("mem://half"));
    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let service = service.clone();
            let request = full_request(handle.as_str());
            tokio::spawn(async move { service.get_tile(request).await })
        })
        .collect();

    let mut tiles = Vec::new();
    for task in tasks {
        tiles.push(task.await.unwrap().unwrap());
    }
    assert!(tiles.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(driver.read_count(), reads_per_tile);
}

#[tokio::test]
async fn test_get_tile_async_resolves() {
    let (driver, service) = counting_service();
    let handle = driver.insert(half_nodata_raster("mem://half"));

    let pending = service.get_tile_async(full_request(handle.as_str()));
    let tile = pending.await.unwrap();
    assert_eq!(tile.valid_count(), 128 * 256);

    let hit = service.get_tile_async(full_request(handle.as_str()));
    assert!(hit.is_ready());
}

#[test]
fn test_lfu_eviction_keeps_popular_tiles() {
    let tile = |seed: u64| {
        // Incompressible enough that three tiles overflow the budget
        let mut state = seed | 1;
        let data = Array2::from_shape_simple_fn((32, 32), || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as f64
        });
        RasterTile::unmasked(data, DataType::Float64)
    };

    let sizing = TileCache::new(usize::MAX, 9);
    sizing.put(TileCacheKey::from_parts("sizing").unwrap(), &tile(1));
    let entry_size = sizing.size();

    let cache = TileCache::new(entry_size * 5 / 2, 9);
    let popular = TileCacheKey::from_parts("popular").unwrap();
    let cold = TileCacheKey::from_parts("cold").unwrap();
    cache.put(popular.clone(), &tile(1));
    cache.put(cold.clone(), &tile(2));
    for _ in 0..3 {
        assert!(cache.get(&popular).is_some());
    }

    cache.put(TileCacheKey::from_parts("new").unwrap(), &tile(3));
    assert!(cache.contains(&popular));
    assert!(!cache.contains(&cold));
    assert!(cache.size() <= cache.capacity());
}

// =============================================================================
// XYZ
// =============================================================================

async fn geographic_service() -> TileService {
    init_tracing();
    let driver = MemoryDriver::new();
    let raster = MemoryRaster::new(
        "mem://geo",
        Array2::from_elem((100, 100), 1.0),
        Crs::WGS84,
        Affine::from_bounds(&Bounds::new(0.0, 0.0, 10.0, 10.0), 100, 100),
    )
    .with_nodata(-1.0);
    let handle = driver.insert(raster);

    let store = InMemoryMetadataStore::with_keys(["name"]);
    store.insert(&keys(&["geo"]), &handle, None).await.unwrap();
    TileService::new(Arc::new(driver), Arc::new(store))
}

#[tokio::test]
async fn test_xyz_tile_reprojects_geographic_source() {
    let service = geographic_service().await;

    // z=5 tile 16/15 spans 0..11.25 E and 0..~11.18 N
    let tile = service
        .get_tile_xyz(&keys(&["geo"]), 5, 16, 15, None, false)
        .await
        .unwrap();

    assert_eq!(tile.shape(), (256, 256));
    let valid = tile.valid_count();
    assert!(valid > 256 * 256 / 2, "valid {}", valid);
    assert!(valid < 256 * 256);
    // South-west corner is inside the dataset, north-east corner is not
    assert!(!tile.mask()[[250, 5]]);
    assert!(tile.mask()[[2, 253]]);
    for (value, masked) in tile.data().iter().zip(tile.mask()) {
        if !masked {
            assert_relative_eq!(*value, 1.0, epsilon = 1e-9);
        }
    }
}

#[tokio::test]
async fn test_xyz_outside_dataset() {
    let service = geographic_service().await;
    let err = service
        .get_tile_xyz(&keys(&["geo"]), 5, 0, 0, None, false)
        .await
        .unwrap_err();
    assert!(err.is_out_of_bounds());
}

#[tokio::test]
async fn test_xyz_invalid_address() {
    let service = geographic_service().await;
    let err = service
        .get_tile_xyz(&keys(&["geo"]), 2, 9, 0, None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, TileError::InvalidRequest(_)));

    let err = service
        .get_tile_xyz(&keys(&["missing"]), 5, 16, 15, None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, TileError::Store(_)));
}

#[tokio::test]
async fn test_service_from_config_uses_default_tile_size() {
    init_tracing();
    let driver = MemoryDriver::new();
    let raster = MemoryRaster::new(
        "mem://geo",
        Array2::from_elem((100, 100), 1.0),
        Crs::WGS84,
        Affine::from_bounds(&Bounds::new(0.0, 0.0, 10.0, 10.0), 100, 100),
    );
    let handle = driver.insert(raster);
    let store = InMemoryMetadataStore::with_keys(["name"]);
    store.insert(&keys(&["geo"]), &handle, None).await.unwrap();

    let config = Config {
        default_tile_size: TileSize::square(64),
        workers: 1,
        use_multiprocessing: false,
        ..Config::default()
    };
    config.validate().unwrap();
    let service = TileService::from_config(&config, Arc::new(driver), Arc::new(store));

    let tile = service
        .get_tile_xyz(&keys(&["geo"]), 5, 16, 15, None, true)
        .await
        .unwrap();
    assert_eq!(tile.shape(), (64, 64));
}
