//! Merging t-digest for streaming quantile estimation.
//!
//! Values are buffered and periodically merged into a sorted list of
//! centroids whose size is bounded by the `k1` scale function
//! `k(q) = δ / 2π · asin(2q − 1)`. Centroids near the tails stay small,
//! so extreme percentiles keep their accuracy. Digests built over separate
//! chunks merge into one.

use std::f64::consts::PI;

/// Default compression δ. Larger is more accurate and uses more memory.
pub const DEFAULT_COMPRESSION: f64 = 500.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Centroid {
    mean: f64,
    weight: f64,
}

/// Streaming approximate quantile digest.
#[derive(Debug, Clone)]
pub struct TDigest {
    compression: f64,
    centroids: Vec<Centroid>,
    buffer: Vec<Centroid>,
    total_weight: f64,
    min: f64,
    max: f64,
}

impl Default for TDigest {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION)
    }
}

impl TDigest {
    pub fn new(compression: f64) -> Self {
        Self {
            compression: compression.max(10.0),
            centroids: Vec::new(),
            buffer: Vec::new(),
            total_weight: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn buffer_limit(&self) -> usize {
        (self.compression as usize) * 10
    }

    /// Add one value. Non-finite values are ignored.
    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.buffer.push(Centroid {
            mean: value,
            weight: 1.0,
        });
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if self.buffer.len() >= self.buffer_limit() {
            self.compress();
        }
    }

    pub fn extend(&mut self, values: impl IntoIterator<Item = f64>) {
        for v in values {
            self.push(v);
        }
    }

    /// Fold another digest into this one.
    pub fn merge(&mut self, other: &TDigest) {
        if other.is_empty() {
            return;
        }
        self.buffer.extend_from_slice(&other.centroids);
        self.buffer.extend_from_slice(&other.buffer);
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.compress();
    }

    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty() && self.buffer.is_empty()
    }

    /// Number of values seen.
    pub fn count(&self) -> f64 {
        self.total_weight + self.buffer.iter().map(|c| c.weight).sum::<f64>()
    }

    fn scale(&self, q: f64) -> f64 {
        self.compression / (2.0 * PI) * (2.0 * q - 1.0).asin()
    }

    fn scale_inverse(&self, k: f64) -> f64 {
        let angle = (k * 2.0 * PI / self.compression).clamp(-PI / 2.0, PI / 2.0);
        (angle.sin() + 1.0) / 2.0
    }

    /// Merge buffered values into the centroid list.
    fn compress(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut all = std::mem::take(&mut self.centroids);
        all.append(&mut self.buffer);
        all.sort_by(|a, b| a.mean.total_cmp(&b.mean));

        let total: f64 = all.iter().map(|c| c.weight).sum();
        let mut merged = Vec::with_capacity(all.len().min(self.compression as usize * 2));
        let mut iter = all.into_iter();
        let Some(mut current) = iter.next() else {
            return;
        };

        let mut weight_so_far = 0.0;
        let mut q_limit = self.scale_inverse(self.scale(0.0) + 1.0);

        for next in iter {
            let q = (weight_so_far + current.weight + next.weight) / total;
            if q <= q_limit {
                let weight = current.weight + next.weight;
                current.mean += (next.mean - current.mean) * next.weight / weight;
                current.weight = weight;
            } else {
                weight_so_far += current.weight;
                merged.push(current);
                q_limit = self.scale_inverse(self.scale(weight_so_far / total) + 1.0);
                current = next;
            }
        }
        merged.push(current);

        self.centroids = merged;
        self.total_weight = total;
    }

    /// Estimate the `q` quantile (`0 <= q <= 1`), `None` for an empty digest.
    pub fn quantile(&mut self, q: f64) -> Option<f64> {
        self.compress();
        let centroids = &self.centroids;
        let first = centroids.first()?;
        let last = centroids.last()?;
        if centroids.len() == 1 {
            return Some(first.mean);
        }

        let q = q.clamp(0.0, 1.0);
        let target = q * self.total_weight;

        // Between the minimum and the centre of the first centroid
        if target < first.weight / 2.0 {
            let t = if first.weight > 0.0 {
                target / (first.weight / 2.0)
            } else {
                0.0
            };
            return Some(self.min + t * (first.mean - self.min));
        }
        if target > self.total_weight - last.weight / 2.0 {
            let tail = self.total_weight - target;
            let t = if last.weight > 0.0 {
                tail / (last.weight / 2.0)
            } else {
                0.0
            };
            return Some(self.max - t * (self.max - last.mean));
        }

        let mut cumulative = first.weight / 2.0;
        for pair in centroids.windows(2) {
            let (left, right) = (pair[0], pair[1]);
            let step = (left.weight + right.weight) / 2.0;
            if target <= cumulative + step {
                let t = if step > 0.0 {
                    (target - cumulative) / step
                } else {
                    0.0
                };
                return Some(left.mean + t * (right.mean - left.mean));
            }
            cumulative += step;
        }
        Some(last.mean)
    }

    pub fn centroid_count(&mut self) -> usize {
        self.compress();
        self.centroids.len()
    }
}
