//! Coordinate reference systems and transformations.
//!
//! CRSs are identified by EPSG code. The WGS84 / Web-Mercator pair, which
//! every tile request touches, is transformed in closed form; any other pair
//! goes through `proj4rs` with definitions from `crs-definitions`.

use std::fmt;
use std::str::FromStr;

use proj4rs::proj::Proj;
use serde::{Deserialize, Serialize};

use crate::error::RasterError;

use super::Bounds;

/// WGS84 semi-major axis used by Web Mercator.
const EARTH_RADIUS: f64 = 6_378_137.0;

/// Latitude limit of the Web-Mercator square.
const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

/// Points sampled along each edge by [`CrsTransform::transform_bounds`].
pub const DEFAULT_DENSIFY_POINTS: usize = 21;

// =============================================================================
// Crs
// =============================================================================

/// A coordinate reference system, identified by its EPSG code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Crs {
    code: u16,
}

impl Crs {
    pub const WGS84: Crs = Crs { code: 4326 };
    pub const WEB_MERCATOR: Crs = Crs { code: 3857 };

    pub const fn epsg(code: u16) -> Self {
        Self { code }
    }

    pub const fn code(&self) -> u16 {
        self.code
    }

    /// PROJ.4 definition from the bundled EPSG database.
    pub fn proj_definition(&self) -> Option<&'static str> {
        crs_definitions::from_code(self.code).map(|def| def.proj4)
    }

    /// Whether coordinates are longitude/latitude degrees.
    pub fn is_geographic(&self) -> bool {
        match self.proj_definition() {
            Some(def) => def.contains("+proj=longlat"),
            None => self.code == 4326,
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.code)
    }
}

impl FromStr for Crs {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("EPSG:")
            .or_else(|| trimmed.strip_prefix("epsg:"))
            .unwrap_or(trimmed);
        digits
            .parse::<u16>()
            .map(Crs::epsg)
            .map_err(|_| format!("invalid CRS '{}' (expected EPSG:<code>)", s))
    }
}

impl TryFrom<String> for Crs {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Crs> for String {
    fn from(crs: Crs) -> Self {
        crs.to_string()
    }
}

// =============================================================================
// CrsTransform
// =============================================================================

enum Method {
    Identity,
    LonLatToMercator,
    MercatorToLonLat,
    Proj {
        from: Box<Proj>,
        to: Box<Proj>,
        from_geographic: bool,
        to_geographic: bool,
    },
}

/// Point and bounds transformation between two CRSs.
pub struct CrsTransform {
    src: Crs,
    dst: Crs,
    method: Method,
}

impl fmt::Debug for CrsTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrsTransform")
            .field("src", &self.src)
            .field("dst", &self.dst)
            .finish()
    }
}

impl CrsTransform {
    pub fn new(src: Crs, dst: Crs) -> Result<Self, RasterError> {
        let method = if src == dst {
            Method::Identity
        } else if src == Crs::WGS84 && dst == Crs::WEB_MERCATOR {
            Method::LonLatToMercator
        } else if src == Crs::WEB_MERCATOR && dst == Crs::WGS84 {
            Method::MercatorToLonLat
        } else {
            Method::Proj {
                from: Box::new(load_proj(&src)?),
                to: Box::new(load_proj(&dst)?),
                from_geographic: src.is_geographic(),
                to_geographic: dst.is_geographic(),
            }
        };
        Ok(Self { src, dst, method })
    }

    pub fn src(&self) -> Crs {
        self.src
    }

    pub fn dst(&self) -> Crs {
        self.dst
    }

    /// The transform in the opposite direction.
    pub fn inverse(&self) -> Result<CrsTransform, RasterError> {
        CrsTransform::new(self.dst, self.src)
    }

    pub fn is_identity(&self) -> bool {
        matches!(self.method, Method::Identity)
    }

    /// Transform one point.
    pub fn transform_point(&self, x: f64, y: f64) -> Result<(f64, f64), RasterError> {
        match &self.method {
            Method::Identity => Ok((x, y)),
            Method::LonLatToMercator => Ok(lonlat_to_mercator(x, y)),
            Method::MercatorToLonLat => Ok(mercator_to_lonlat(x, y)),
            Method::Proj {
                from,
                to,
                from_geographic,
                to_geographic,
            } => {
                // proj4rs works in radians for geographic CRSs
                let mut point = if *from_geographic {
                    (x.to_radians(), y.to_radians(), 0.0)
                } else {
                    (x, y, 0.0)
                };
                proj4rs::transform::transform(from, to, &mut point).map_err(|e| {
                    RasterError::Transform(format!(
                        "{} -> {} failed for ({}, {}): {:?}",
                        self.src, self.dst, x, y, e
                    ))
                })?;
                let out = if *to_geographic {
                    (point.0.to_degrees(), point.1.to_degrees())
                } else {
                    (point.0, point.1)
                };
                if out.0.is_finite() && out.1.is_finite() {
                    Ok(out)
                } else {
                    Err(RasterError::Transform(format!(
                        "{} -> {} produced a non-finite point for ({}, {})",
                        self.src, self.dst, x, y
                    )))
                }
            }
        }
    }

    /// Transform a rectangle, sampling `densify` points along each edge.
    ///
    /// Points that fail to transform are skipped; the result bounds all
    /// transformed samples.
    pub fn transform_bounds(&self, bounds: &Bounds, densify: usize) -> Result<Bounds, RasterError> {
        if self.is_identity() {
            return Ok(*bounds);
        }

        let steps = densify.max(2) - 1;
        let mut points = Vec::with_capacity(4 * (steps + 1));
        for i in 0..=steps {
            let t = i as f64 / steps as f64;
            let x = bounds.west + t * bounds.width();
            let y = bounds.south + t * bounds.height();
            points.push((x, bounds.south));
            points.push((x, bounds.north));
            points.push((bounds.west, y));
            points.push((bounds.east, y));
        }

        let transformed = points
            .into_iter()
            .filter_map(|(x, y)| self.transform_point(x, y).ok());
        Bounds::from_points(transformed).ok_or_else(|| {
            RasterError::Transform(format!(
                "none of the bounds {:?} could be transformed from {} to {}",
                bounds.to_array(),
                self.src,
                self.dst
            ))
        })
    }
}

fn load_proj(crs: &Crs) -> Result<Proj, RasterError> {
    let definition = crs.proj_definition().ok_or_else(|| {
        RasterError::Transform(format!("{} is not in the EPSG database", crs))
    })?;
    Proj::from_proj_string(definition)
        .map_err(|e| RasterError::Transform(format!("invalid projection {}: {:?}", crs, e)))
}

/// Closed-form EPSG:4326 to EPSG:3857, latitudes clamped to the Mercator square.
pub fn lonlat_to_mercator(lon: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT).to_radians();
    let x = EARTH_RADIUS * lon.to_radians();
    let y = EARTH_RADIUS * (std::f64::consts::FRAC_PI_4 + lat / 2.0).tan().ln();
    (x, y)
}

/// Closed-form EPSG:3857 to EPSG:4326.
pub fn mercator_to_lonlat(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / EARTH_RADIUS).to_degrees();
    let lat = (2.0 * (y / EARTH_RADIUS).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();
    (lon, lat)
}

// =============================================================================
// Tests
// =============================================================================
