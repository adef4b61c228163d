//! Metadata integration tests.
//!
//! Tests verify:
//! - Lazy metadata computation and persistence
//! - Chunked statistics agree with exact statistics
//! - Datasets without valid data are rejected
//! - Convex hull and bounds of the valid footprint

use std::collections::HashMap;
use std::sync::Arc;

use approx::assert_relative_eq;
use ndarray::Array2;

use rastertile::error::StatsError;
use rastertile::raster::{Affine, Bounds, Crs, MemoryDriver, MemoryRaster, RasterDriver};
use rastertile::stats::{MetadataOptions, StatisticsEngine};
use rastertile::store::{InMemoryMetadataStore, MetadataStore};
use rastertile::tile::TileService;
use rastertile::TileError;

use super::test_utils::{
    constant_raster, half_nodata_raster, init_tracing, keys, mercator_bounds, noise_raster,
    CountingDriver,
};

#[tokio::test]
async fn test_lazy_metadata_is_persisted() {
    init_tracing();
    let driver = Arc::new(CountingDriver::new());
    let handle = driver.insert(half_nodata_raster("mem://half"));
    let store = Arc::new(InMemoryMetadataStore::with_keys(["name"]));
    store.insert(&keys(&["half"]), &handle, None).await.unwrap();

    let service = TileService::new(driver.clone(), store.clone());
    let metadata = service.get_metadata(&keys(&["half"])).await.unwrap();

    assert_eq!(metadata.range, (0.0, 382.0));
    assert_relative_eq!(metadata.valid_percentage, 50.0);
    assert_eq!(metadata.nodata, Some(10_000.0));
    assert_eq!(metadata.percentiles.len(), 99);
    assert!(metadata.percentiles.windows(2).all(|p| p[0] <= p[1]));

    let stored = store.get_metadata(&keys(&["half"])).await.unwrap();
    assert_eq!(stored.as_ref(), Some(&metadata));

    // Served from the store afterwards
    let reads = driver.read_count();
    let again = service.get_metadata(&keys(&["half"])).await.unwrap();
    assert_eq!(again, metadata);
    assert_eq!(driver.read_count(), reads);
}

#[tokio::test]
async fn test_all_nodata_dataset_rejected() {
    init_tracing();
    let driver = MemoryDriver::new();
    let handle = driver.insert(constant_raster("mem://empty", (32, 32), 0.0).with_nodata(0.0));
    let service = TileService::new(Arc::new(driver), Arc::new(InMemoryMetadataStore::new()));

    let err = service
        .compute_metadata(&handle, MetadataOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TileError::Stats(StatsError::NoValidData { .. })
    ));
    assert!(err.to_string().contains("does not contain any valid data"));
}

/// 400x400 raster with skewed values inside a disc and nodata outside, in
/// 64x64 blocks so the footprint spans many partial blocks.
fn disc_raster(handle: &str) -> MemoryRaster {
    let (size, radius) = (400usize, 170.0);
    let center = size as f64 / 2.0;
    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    let data = Array2::from_shape_fn((size, size), |(r, c)| {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let (dy, dx) = (r as f64 + 0.5 - center, c as f64 + 0.5 - center);
        if dx.hypot(dy) > radius {
            return -9999.0;
        }
        let u = (state % 1_000_000) as f64 / 1_000_000.0;
        1.0 + 100.0 * u * u
    });
    MemoryRaster::new(
        handle,
        data,
        Crs::WEB_MERCATOR,
        Affine::from_bounds(&mercator_bounds(), size, size),
    )
    .with_nodata(-9999.0)
    .with_blocks(64, 64)
}

#[test]
fn test_chunked_statistics_close_to_exact() {
    init_tracing();
    let driver = MemoryDriver::new();
    let handle = driver.insert(disc_raster("mem://disc"));
    let dataset = driver.open(&handle).unwrap();
    let engine = StatisticsEngine::default();

    let exact = engine
        .compute(
            dataset.as_ref(),
            &MetadataOptions {
                use_chunks: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
    let chunked = engine
        .compute(
            dataset.as_ref(),
            &MetadataOptions {
                use_chunks: Some(true),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(exact.range, chunked.range);
    assert_relative_eq!(exact.mean, chunked.mean, max_relative = 1e-9);
    assert_relative_eq!(exact.stdev, chunked.stdev, max_relative = 1e-9);
    assert_relative_eq!(exact.valid_percentage, chunked.valid_percentage);
    assert!(exact.valid_percentage > 50.0 && exact.valid_percentage < 60.0);

    for p in 1..=99 {
        let a = exact.percentile(p).unwrap();
        let b = chunked.percentile(p).unwrap();
        assert!(
            (a - b).abs() <= 0.02 * a.abs(),
            "percentile {}: exact {} chunked {}",
            p,
            a,
            b
        );
    }

    // Per-block hulls merge into the hull of the whole footprint
    let exact_area = exact.convex_hull.area();
    let chunked_area = chunked.convex_hull.area();
    assert!(exact_area > 0.0);
    assert!(
        (exact_area - chunked_area).abs() <= 0.02 * exact_area,
        "hull area: exact {} chunked {}",
        exact_area,
        chunked_area
    );
}

#[test]
fn test_large_raster_threshold_selects_chunks() {
    let driver = MemoryDriver::new();
    let handle = driver.insert(noise_raster("mem://noise", (100, 100), 32));
    let dataset = driver.open(&handle).unwrap();

    // A tiny threshold forces block-wise processing; results stay consistent
    let small = StatisticsEngine::new(10).compute(dataset.as_ref(), &MetadataOptions::default());
    let large = StatisticsEngine::new(u64::MAX).compute(dataset.as_ref(), &MetadataOptions::default());
    let (small, large) = (small.unwrap(), large.unwrap());
    assert_eq!(small.range, large.range);
    assert_relative_eq!(small.mean, large.mean, max_relative = 1e-9);
}

#[test]
fn test_conflicting_options() {
    let driver = MemoryDriver::new();
    let handle = driver.insert(noise_raster("mem://noise", (16, 16), 8));
    let dataset = driver.open(&handle).unwrap();

    let err = StatisticsEngine::default()
        .compute(
            dataset.as_ref(),
            &MetadataOptions {
                use_chunks: Some(true),
                max_shape: Some((8, 8)),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, StatsError::ConflictingOptions(_)));
}

#[test]
fn test_hull_and_bounds_in_wgs84() {
    let driver = MemoryDriver::new();
    // Valid data only in the lower-left quadrant of a 1x1 degree raster
    let data = Array2::from_shape_fn((100, 100), |(r, c)| {
        if r >= 50 && c < 50 {
            1.0
        } else {
            -1.0
        }
    });
    let raster = MemoryRaster::new(
        "mem://quadrant",
        data,
        Crs::WGS84,
        Affine::from_bounds(&Bounds::new(10.0, 20.0, 11.0, 21.0), 100, 100),
    )
    .with_nodata(-1.0);
    let handle = driver.insert(raster);
    let dataset = driver.open(&handle).unwrap();

    let metadata = StatisticsEngine::default()
        .compute(dataset.as_ref(), &MetadataOptions::default())
        .unwrap();

    assert_relative_eq!(metadata.bounds.west, 10.0, epsilon = 1e-9);
    assert_relative_eq!(metadata.bounds.north, 21.0, epsilon = 1e-9);
    assert_relative_eq!(metadata.valid_percentage, 25.0);
    assert_relative_eq!(metadata.convex_hull.area(), 0.25, epsilon = 1e-6);
}

#[test]
fn test_extra_metadata_roundtrips_through_json() {
    let driver = MemoryDriver::new();
    let handle = driver.insert(noise_raster("mem://noise", (16, 16), 8));
    let dataset = driver.open(&handle).unwrap();

    let extra = serde_json::json!({ "sensor": "S2A", "band": 4 });
    let metadata = StatisticsEngine::default()
        .compute(
            dataset.as_ref(),
            &MetadataOptions {
                extra: Some(extra.clone()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(metadata.metadata, extra);

    let json = serde_json::to_string(&metadata).unwrap();
    let parsed: rastertile::Metadata = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.metadata, extra);
    assert_eq!(parsed.range, metadata.range);
}

#[tokio::test]
async fn test_store_filters_datasets() {
    let store = InMemoryMetadataStore::new();
    store.create(&keys(&["product", "band"])).await.unwrap();
    store
        .insert(&keys(&["s2", "red"]), &"mem://s2_red".into(), None)
        .await
        .unwrap();
    store
        .insert(&keys(&["s2", "nir"]), &"mem://s2_nir".into(), None)
        .await
        .unwrap();
    store
        .insert(&keys(&["l8", "red"]), &"mem://l8_red".into(), None)
        .await
        .unwrap();

    let filter = HashMap::from([("band".to_string(), "red".to_string())]);
    let reds = store.get_datasets(&filter).await.unwrap();
    assert_eq!(reds.len(), 2);
    assert!(reds.contains_key(&keys(&["l8", "red"])));

    store.delete(&keys(&["l8", "red"])).await.unwrap();
    assert_eq!(store.get_datasets(&HashMap::new()).await.unwrap().len(), 2);
}
