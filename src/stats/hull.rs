//! Convex hull of the valid-data footprint.
//!
//! Only pixels that are the first or last valid pixel of their row or column
//! can contribute a hull vertex, so the validity mask is reduced to those
//! before any geometry is built. Each candidate pixel contributes its four
//! corners in world coordinates.

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::error::RasterError;
use crate::raster::{Affine, CrsTransform};

/// Reduce a validity mask (`true` = valid) to hull candidate pixels `(row, col)`.
pub fn hull_candidates(valid: ArrayView2<'_, bool>) -> Vec<(usize, usize)> {
    let (rows, cols) = valid.dim();
    let mut keep = vec![false; rows * cols];

    for (r, row) in valid.outer_iter().enumerate() {
        let first = row.iter().position(|v| *v);
        let last = row.iter().rposition(|v| *v);
        if let (Some(first), Some(last)) = (first, last) {
            keep[r * cols + first] = true;
            keep[r * cols + last] = true;
        }
    }
    for (c, col) in valid.columns().into_iter().enumerate() {
        let first = col.iter().position(|v| *v);
        let last = col.iter().rposition(|v| *v);
        if let (Some(first), Some(last)) = (first, last) {
            keep[first * cols + c] = true;
            keep[last * cols + c] = true;
        }
    }

    keep.iter()
        .enumerate()
        .filter(|(_, k)| **k)
        .map(|(i, _)| (i / cols, i % cols))
        .collect()
}

/// World coordinates of the corners of candidate pixels, with the pixel
/// indices offset by `(row_off, col_off)`.
pub fn pixel_corners(
    pixels: &[(usize, usize)],
    offset: (usize, usize),
    transform: &Affine,
) -> Vec<(f64, f64)> {
    let mut points = Vec::with_capacity(pixels.len() * 4);
    for &(r, c) in pixels {
        let (row, col) = ((r + offset.0) as f64, (c + offset.1) as f64);
        for (dc, dr) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)] {
            points.push(transform.apply(col + dc, row + dr));
        }
    }
    points
}

fn cross(o: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
}

/// Convex hull (Andrew's monotone chain), counter-clockwise, not closed.
pub fn convex_hull(mut points: Vec<(f64, f64)>) -> Vec<(f64, f64)> {
    points.retain(|(x, y)| x.is_finite() && y.is_finite());
    points.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
    points.dedup();
    if points.len() < 3 {
        return points;
    }

    let mut lower: Vec<(f64, f64)> = Vec::new();
    for &p in &points {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0
        {
            lower.pop();
        }
        lower.push(p);
    }
    let mut upper: Vec<(f64, f64)> = Vec::new();
    for &p in points.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0
        {
            upper.pop();
        }
        upper.push(p);
    }

    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

/// Shoelace area of a simple polygon given by its vertices.
pub fn polygon_area(vertices: &[(f64, f64)]) -> f64 {
    if vertices.len() < 3 {
        return 0.0;
    }
    let twice: f64 = vertices
        .iter()
        .zip(vertices.iter().cycle().skip(1))
        .map(|(a, b)| a.0 * b.1 - b.0 * a.1)
        .sum();
    twice.abs() / 2.0
}

/// GeoJSON polygon holding a convex hull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvexHull {
    #[serde(rename = "type")]
    kind: String,
    coordinates: Vec<Vec<[f64; 2]>>,
}

impl ConvexHull {
    /// Build from hull vertices; the ring is closed on output.
    pub fn from_vertices(vertices: &[(f64, f64)]) -> Self {
        let mut ring: Vec<[f64; 2]> = vertices.iter().map(|&(x, y)| [x, y]).collect();
        if let Some(&first) = ring.first() {
            ring.push(first);
        }
        Self {
            kind: "Polygon".to_string(),
            coordinates: vec![ring],
        }
    }

    /// Vertices without the closing point.
    pub fn vertices(&self) -> Vec<(f64, f64)> {
        let ring = self.coordinates.first().map(Vec::as_slice).unwrap_or(&[]);
        let open = match ring {
            [rest @ .., last] if ring.len() > 1 && Some(last) == ring.first() => rest,
            _ => ring,
        };
        open.iter().map(|p| (p[0], p[1])).collect()
    }

    pub fn area(&self) -> f64 {
        polygon_area(&self.vertices())
    }

    /// Reproject every vertex, re-hulling the result.
    pub fn reproject(&self, transform: &CrsTransform) -> Result<ConvexHull, RasterError> {
        let projected = self
            .vertices()
            .into_iter()
            .map(|(x, y)| transform.transform_point(x, y))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ConvexHull::from_vertices(&convex_hull(projected)))
    }
}
