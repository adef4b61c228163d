//! Band-math and composite integration tests.
//!
//! Tests verify:
//! - Expressions outside the grammar are rejected with a generic message
//! - Compute tiles combine operand masks and mask non-finite results
//! - Rejected expressions never trigger a band read
//! - RGB composites keep channel order and stretch per band

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use approx::assert_relative_eq;
use ndarray::{array, Array2};

use rastertile::error::ExpressionError;
use rastertile::expr::ExpressionSandbox;
use rastertile::raster::{Affine, Crs, MemoryRaster};
use rastertile::store::{InMemoryMetadataStore, MetadataStore};
use rastertile::tile::{TileService, TileSize};
use rastertile::TileError;

use super::test_utils::{init_tracing, keys, mercator_bounds, CountingDriver};

// =============================================================================
// Sandbox
// =============================================================================

fn operands() -> HashMap<String, Array2<f64>> {
    HashMap::from([
        ("v1".to_string(), array![[1.0, 2.0], [3.0, 4.0]]),
        ("v2".to_string(), array![[4.0, 3.0], [2.0, 1.0]]),
    ])
}

#[test]
fn test_disallowed_constructs() {
    let sandbox = ExpressionSandbox::default();
    let attempts = [
        "v1.real",
        "v1[0]",
        "[v1, v2]",
        "{v1: v2}",
        "lambda x: x",
        "v1 if v1 else v2",
        "v1 and v2",
        "not v1",
        "v1 < v2 < v1",
        "x = v1",
        "'v1'",
        "True",
        "__import__('os')",
        "abs(v1, key=v2)",
        "[x for x in v1]",
    ];
    for text in attempts {
        let err = sandbox.evaluate(text, &operands()).unwrap_err();
        assert_eq!(
            err.public_message(),
            "error while evaluating expression",
            "expression {:?} gave {:?}",
            text,
            err
        );
    }
}

#[test]
fn test_rejection_kinds() {
    let sandbox = ExpressionSandbox::default();
    let ops = operands();

    assert!(matches!(
        sandbox.evaluate("foo(v1)", &ops),
        Err(ExpressionError::UnknownFunction(_))
    ));
    assert!(matches!(
        sandbox.evaluate("v3 + 1", &ops),
        Err(ExpressionError::UnknownName(_))
    ));
    assert!(matches!(
        sandbox.evaluate("sqrt(v1, v2)", &ops),
        Err(ExpressionError::Arity { .. })
    ));
    assert!(matches!(
        sandbox.evaluate("v1 +", &ops),
        Err(ExpressionError::Parse { .. })
    ));
    assert!(matches!(
        sandbox.evaluate("1 + 2", &ops),
        Err(ExpressionError::ScalarResult)
    ));
}

#[test]
fn test_whitelisted_functions() {
    let sandbox = ExpressionSandbox::default();
    let result = sandbox
        .evaluate("where(v1 > v2, maximum(v1, v2), -1) + abs(-2)", &operands())
        .unwrap();
    assert_eq!(result, array![[1.0, 1.0], [5.0, 6.0]]);

    let bits = sandbox.evaluate("(v1 > 1) & (v2 > 1)", &operands()).unwrap();
    assert_eq!(bits, array![[0.0, 1.0], [1.0, 0.0]]);
}

#[test]
fn test_timeout_is_reported_generically() {
    let sandbox = ExpressionSandbox::new(Duration::ZERO);
    let big = HashMap::from([("v1".to_string(), Array2::<f64>::ones((512, 512)))]);
    let err = sandbox
        .evaluate("sqrt(v1) * sqrt(v1) + sqrt(v1) * sqrt(v1)", &big)
        .unwrap_err();
    assert!(matches!(err, ExpressionError::Timeout(_)));
    assert_eq!(err.public_message(), "expression evaluation timed out");
}

// =============================================================================
// Compute tiles
// =============================================================================

/// 64x64 band filled with `value`, `nodata` in rows 0..8 and `zero` in rows
/// 40..48.
fn band(handle: &str, value: f64, zero_rows: bool) -> MemoryRaster {
    let data = Array2::from_shape_fn((64, 64), |(r, _)| match r {
        0..=7 => -1.0,
        40..=47 if zero_rows => 0.0,
        _ => value,
    });
    MemoryRaster::new(
        handle,
        data,
        Crs::WEB_MERCATOR,
        Affine::from_bounds(&mercator_bounds(), 64, 64),
    )
    .with_nodata(-1.0)
}

async fn ndvi_service() -> (Arc<CountingDriver>, TileService) {
    init_tracing();
    let driver = Arc::new(CountingDriver::new());
    let store = InMemoryMetadataStore::with_keys(["band"]);
    for (name, value) in [("red", 10.0), ("nir", 30.0)] {
        let handle = driver.insert(band(&format!("mem://{}", name), value, true));
        store.insert(&keys(&[name]), &handle, None).await.unwrap();
    }
    let service = TileService::new(driver.clone(), Arc::new(store));
    (driver, service)
}

fn ndvi_operands() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([
        ("v1".to_string(), keys(&["red"])),
        ("v2".to_string(), keys(&["nir"])),
    ])
}

#[tokio::test]
async fn test_ndvi_tile() {
    let (_, service) = ndvi_service().await;

    let tile = service
        .compute_tile(
            "(v2 - v1) / (v2 + v1)",
            &ndvi_operands(),
            Some(mercator_bounds()),
            Some(TileSize::square(64)),
        )
        .await
        .unwrap();

    assert_eq!(tile.shape(), (64, 64));
    assert_relative_eq!(tile.data()[[20, 20]], 0.5, epsilon = 1e-9);
    assert!(!tile.mask()[[20, 20]]);
    // Operand nodata
    assert!(tile.mask()[[4, 30]]);
    // 0 / 0
    assert!(tile.mask()[[44, 30]]);
    assert!(tile.valid_count() < 64 * 64 - 2 * 64 * 6);
}

#[tokio::test]
async fn test_invalid_expression_reads_nothing() {
    let (driver, service) = ndvi_service().await;

    for text in ["v1.__class__", "v1 + v3", "exec(v1)"] {
        let err = service
            .compute_tile(text, &ndvi_operands(), Some(mercator_bounds()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TileError::Expression(_)), "{:?}", err);
    }
    assert_eq!(driver.read_count(), 0);
    assert_eq!(driver.open_count(), 0);
}

#[tokio::test]
async fn test_compute_tile_missing_operand_dataset() {
    let (_, service) = ndvi_service().await;
    let operands = BTreeMap::from([
        ("v1".to_string(), keys(&["red"])),
        ("v2".to_string(), keys(&["swir"])),
    ]);
    let err = service
        .compute_tile("v1 - v2", &operands, Some(mercator_bounds()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, TileError::Store(_)));
}

// =============================================================================
// RGB
// =============================================================================

#[tokio::test]
async fn test_rgb_composite_channel_order() {
    init_tracing();
    let driver = Arc::new(CountingDriver::new());
    let store = InMemoryMetadataStore::with_keys(["band"]);
    for (name, value) in [("r", 10.0), ("g", 5.0), ("b", 0.5)] {
        let handle = driver.insert(band(&format!("mem://{}", name), value, false));
        store.insert(&keys(&[name]), &handle, None).await.unwrap();
    }
    let service = TileService::new(driver, Arc::new(store));

    let rgb = service
        .rgb_tile(
            [keys(&["r"]), keys(&["g"]), keys(&["b"])],
            Some(mercator_bounds()),
            Some(TileSize::square(64)),
            [Some((0.0, 10.0)); 3],
        )
        .await
        .unwrap();

    assert_eq!(rgb.channels[0][[20, 20]], 255);
    assert_eq!(rgb.channels[1][[20, 20]], 128);
    assert_eq!(rgb.channels[2][[20, 20]], 14);
    // Nodata rows are masked and zeroed in every channel
    assert!(rgb.mask[[4, 20]]);
    assert!(rgb.channels.iter().all(|c| c[[4, 20]] == 0));

    let png = rgb.to_png().unwrap();
    let decoded = image::load_from_memory(&png).unwrap().to_rgba8();
    assert_eq!(decoded.get_pixel(20, 20).0, [255, 128, 14, 255]);
    assert_eq!(decoded.get_pixel(20, 4)[3], 0);
}
