//! Quad-tree tile addressing on the Web-Mercator grid.

use crate::error::TileError;
use crate::raster::Bounds;

/// Half the Web-Mercator world width in meters.
pub const WEB_MERCATOR_EXTENT: f64 = 20_037_508.342_789_244;

/// Highest supported zoom level.
pub const MAX_ZOOM: u8 = 30;

/// Web-Mercator bounds of tile `z/x/y` (`y` counted from the north).
pub fn tile_bounds(z: u8, x: u32, y: u32) -> Result<Bounds, TileError> {
    if z > MAX_ZOOM {
        return Err(TileError::InvalidRequest(format!(
            "zoom level {} exceeds {}",
            z, MAX_ZOOM
        )));
    }
    let tiles = 1u64 << z;
    if u64::from(x) >= tiles || u64::from(y) >= tiles {
        return Err(TileError::InvalidRequest(format!(
            "tile {}/{}/{} is outside the {}x{} grid",
            z, x, y, tiles, tiles
        )));
    }

    let size = 2.0 * WEB_MERCATOR_EXTENT / tiles as f64;
    let west = -WEB_MERCATOR_EXTENT + f64::from(x) * size;
    let north = WEB_MERCATOR_EXTENT - f64::from(y) * size;
    Ok(Bounds::new(west, north - size, west + size, north))
}
