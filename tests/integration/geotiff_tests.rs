//! GeoTIFF backend integration tests.
//!
//! Tests verify:
//! - Striped, tiled, Deflate and BigTIFF layouts decode to the same pixels
//! - Georeferencing, CRS and GDAL nodata are read from the tags
//! - Files on disk serve tiles and statistics through the service
//! - Broken files fail with an open error naming the dataset

use std::path::Path;
use std::sync::Arc;

use approx::assert_relative_eq;
use ndarray::Array2;

use rastertile::error::RasterError;
use rastertile::io::BytesReader;
use rastertile::raster::geotiff::GeoTiffDataset;
use rastertile::raster::{
    Crs, DataType, DatasetHandle, GeoTiffDriver, RasterDataset, RasterDriver, Window,
};
use rastertile::stats::MetadataOptions;
use rastertile::store::InMemoryMetadataStore;
use rastertile::tile::{TileRequest, TileService, TileSize};

use super::test_utils::{init_tracing, is_tiff_magic, ByteOrderType, GeoTiffBuilder, SampleKind};

/// 40x50 gradient with a nodata corner.
fn gradient() -> Array2<f64> {
    Array2::from_shape_fn((40, 50), |(r, c)| {
        if r < 4 && c < 4 {
            -9999.0
        } else {
            (r * 50 + c) as f64
        }
    })
}

fn builder() -> GeoTiffBuilder {
    GeoTiffBuilder::new(gradient(), 3857, (100_000.0, 200_000.0), 30.0)
        .with_sample(SampleKind::F32)
        .with_nodata("-9999")
}

fn open_bytes(bytes: Vec<u8>) -> GeoTiffDataset {
    let reader = BytesReader::new(bytes, "mem://fixture.tif");
    GeoTiffDataset::open(DatasetHandle::new("mem://fixture.tif"), Arc::new(reader)).unwrap()
}

fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> String {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path.display().to_string()
}

// =============================================================================
// Layouts
// =============================================================================

#[test]
fn test_striped_file_structure() {
    let bytes = builder().build();
    assert!(is_tiff_magic(&bytes));
    let dataset = open_bytes(bytes);

    assert_eq!(dataset.shape(), (40, 50));
    assert_eq!(*dataset.crs(), Crs::WEB_MERCATOR);
    assert_eq!(dataset.nodata(), Some(-9999.0));
    assert_eq!(dataset.dtype(), DataType::Float32);

    let bounds = dataset.bounds();
    assert_relative_eq!(bounds.west, 100_000.0);
    assert_relative_eq!(bounds.north, 200_000.0);
    assert_relative_eq!(bounds.east, 101_500.0);
    assert_relative_eq!(bounds.south, 198_800.0);
}

#[test]
fn test_layouts_decode_identically() {
    let expected = gradient();
    let variants = [
        ("strips", builder().with_rows_per_strip(7).build()),
        ("tiles", builder().tiled(16, 16).build()),
        (
            "deflate tiles",
            builder().tiled(32, 16).with_deflate(true).build(),
        ),
        (
            "bigtiff big-endian",
            builder()
                .with_bigtiff(true)
                .with_byte_order(ByteOrderType::BigEndian)
                .with_rows_per_strip(5)
                .build(),
        ),
    ];

    for (name, bytes) in variants {
        let dataset = open_bytes(bytes);
        let window = Window::full(dataset.shape());
        let data = dataset.read_window(window, window.shape()).unwrap();
        assert_eq!(data, expected, "{} decoded differently", name);
    }
}

#[test]
fn test_block_windows_cover_image() {
    let dataset = open_bytes(builder().tiled(16, 16).build());
    let windows = dataset.block_windows().unwrap();

    // 3 block rows x 4 block columns, clipped at the edges
    assert_eq!(windows.len(), 12);
    let pixels: usize = windows.iter().map(|w| w.height * w.width).sum();
    assert_eq!(pixels, 40 * 50);
    assert_eq!(windows[11], Window::new(32, 48, 8, 2));
}

#[test]
fn test_integer_samples_and_decimated_reads() {
    let data = Array2::from_shape_fn((16, 16), |(r, c)| (r as f64) - (c as f64));
    let bytes = GeoTiffBuilder::new(data.clone(), 4326, (10.0, 50.0), 0.25)
        .with_sample(SampleKind::I16)
        .build();
    let dataset = open_bytes(bytes);

    assert_eq!(*dataset.crs(), Crs::WGS84);
    assert_eq!(dataset.dtype(), DataType::Int16);
    assert_eq!(dataset.nodata(), None);

    let half = dataset
        .read_window(Window::full((16, 16)), (8, 8))
        .unwrap();
    assert_eq!(half.dim(), (8, 8));
    // Nearest decimation samples odd pixels
    assert_eq!(half[[0, 0]], data[[1, 1]]);
    assert_eq!(half[[3, 5]], data[[7, 11]]);
}

#[test]
fn test_u8_samples() {
    let data = Array2::from_shape_fn((8, 8), |(r, c)| (r * 8 + c) as f64);
    let bytes = GeoTiffBuilder::new(data.clone(), 32633, (500_000.0, 5_000_000.0), 10.0)
        .with_sample(SampleKind::U8)
        .tiled(16, 16)
        .build();
    let dataset = open_bytes(bytes);

    assert_eq!(*dataset.crs(), Crs::epsg(32633));
    assert_eq!(dataset.dtype(), DataType::UInt8);
    let read = dataset.read_window(Window::new(2, 3, 4, 4), (4, 4)).unwrap();
    assert_eq!(read[[0, 0]], 19.0);
    assert_eq!(read[[3, 3]], 46.0);
}

// =============================================================================
// Files on disk
// =============================================================================

#[tokio::test]
async fn test_tile_from_file() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "gradient.tif", &builder().tiled(16, 16).build());

    let service = TileService::new(
        Arc::new(GeoTiffDriver::new()),
        Arc::new(InMemoryMetadataStore::new()),
    );
    let dataset = GeoTiffDriver::new()
        .open(&DatasetHandle::new(path.as_str()))
        .unwrap();

    let request = TileRequest::new(path.as_str())
        .with_bounds(dataset.bounds())
        .with_tile_size(TileSize::new(50, 40))
        .preserve_values(true);
    let tile = service.get_tile(request).await.unwrap();

    assert_eq!(tile.shape(), (40, 50));
    assert_eq!(tile.dtype(), DataType::Float32);
    assert_eq!(tile.valid_count(), 40 * 50 - 16);
    assert!(tile.mask()[[1, 1]]);
    assert_eq!(tile.data()[[10, 20]], 520.0);
}

#[tokio::test]
async fn test_metadata_from_file_uses_blocks() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        dir.path(),
        "gradient.tif",
        &builder().tiled(16, 16).with_deflate(true).build(),
    );
    let service = TileService::new(
        Arc::new(GeoTiffDriver::with_root(dir.path())),
        Arc::new(InMemoryMetadataStore::new()),
    );

    let exact = service
        .compute_metadata(
            &DatasetHandle::new("gradient.tif"),
            MetadataOptions {
                use_chunks: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let chunked = service
        .compute_metadata(
            &DatasetHandle::new(path.as_str()),
            MetadataOptions {
                use_chunks: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(exact.range, (4.0, 1999.0));
    assert_eq!(chunked.range, exact.range);
    assert_relative_eq!(exact.mean, chunked.mean, max_relative = 1e-9);
    assert_relative_eq!(
        exact.valid_percentage,
        100.0 * (2000.0 - 16.0) / 2000.0,
        epsilon = 1e-9
    );
    assert!(exact.bounds.west > 0.89 && exact.bounds.west < 0.9);
}

#[test]
fn test_missing_and_corrupt_files() {
    let dir = tempfile::tempdir().unwrap();
    let driver = GeoTiffDriver::with_root(dir.path());

    let err = driver
        .open(&DatasetHandle::new("missing.tif"))
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, RasterError::Open { ref handle, .. } if handle == "missing.tif"));

    let mut truncated = builder().build();
    truncated.truncate(40);
    write_file(dir.path(), "truncated.tif", &truncated);
    let err = driver
        .open(&DatasetHandle::new("truncated.tif"))
        .map(|_| ())
        .unwrap_err();
    assert!(err.to_string().contains("truncated.tif"));

    write_file(dir.path(), "text.tif", b"definitely not a tiff file");
    let err = driver
        .open(&DatasetHandle::new("text.tif"))
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, RasterError::Open { .. }));
}
