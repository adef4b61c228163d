//! Compressed tile cache with least-frequently-used eviction.
//!
//! Decoded tiles are stored zlib-compressed: grid and mask independently,
//! together with the data type tag and shape needed to rebuild them.
//! Capacity is a budget on **compressed** bytes, so the number of cached
//! tiles depends on how well the data compresses.
//!
//! # Cache Key
//!
//! [`TileCacheKey`] is the SHA-256 of the canonical JSON form of the fully
//! resolved request (dataset, bounds, tile size, resampling methods, CRS).
//! Equal requests hash equally however they were built.
//!
//! # Eviction
//!
//! Every `get` hit increments the entry's counter. When an insertion would
//! exceed the budget, entries with the lowest counter are evicted first,
//! oldest first among equals. The summed size never exceeds the capacity;
//! tiles larger than the whole budget are not cached.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use ndarray::Array2;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::raster::DataType;

use super::grid::RasterTile;

/// Default cache capacity: 490MB of compressed data
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 490 * 1024 * 1024;

/// Default zlib level
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 9;

// =============================================================================
// Cache Key
// =============================================================================

/// Hash of a canonicalized tile request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileCacheKey(String);

impl TileCacheKey {
    /// Hash the canonical JSON encoding of `parts`.
    ///
    /// Fails when `parts` has no JSON form, e.g. a map with non-string keys.
    pub fn from_parts<T: Serialize + ?Sized>(parts: &T) -> Result<Self, serde_json::Error> {
        // Struct fields serialize in declaration order and maps are sorted
        let canonical = serde_json::to_vec(&serde_json::to_value(parts)?)?;
        Ok(Self(hex::encode(Sha256::digest(&canonical))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Tile Cache
// =============================================================================

#[derive(Debug, Clone)]
struct CacheEntry {
    data: Bytes,
    mask: Bytes,
    dtype: DataType,
    shape: (usize, usize),
    hits: u64,
    /// Insertion order, breaks ties between equal counters
    seq: u64,
}

impl CacheEntry {
    fn size(&self) -> usize {
        self.data.len() + self.mask.len()
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<TileCacheKey, CacheEntry>,
    size: usize,
    next_seq: u64,
}

impl CacheState {
    fn remove(&mut self, key: &TileCacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.size -= entry.size();
        Some(entry)
    }

    /// Remove `key` only if it still holds the entry inserted as `seq`.
    fn remove_if_seq(&mut self, key: &TileCacheKey, seq: u64) -> bool {
        match self.entries.get(key) {
            Some(entry) if entry.seq == seq => self.remove(key).is_some(),
            _ => false,
        }
    }

    fn evict_one(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| (entry.hits, entry.seq))
            .map(|(key, _)| key.clone());
        match victim {
            Some(key) => {
                self.remove(&key);
                debug!(key = key.as_str(), "Evicted tile from cache");
                true
            }
            None => false,
        }
    }
}

/// Size-bounded LFU cache of compressed tiles.
///
/// One mutex guards the whole cache; compression and decompression run
/// outside it.
///
/// # Example
///
/// ```
/// use ndarray::Array2;
/// use rastertile::raster::DataType;
/// use rastertile::tile::{RasterTile, TileCache, TileCacheKey};
///
/// let cache = TileCache::new(1024 * 1024, 6);
/// let key = TileCacheKey::from_parts(&("mem://dem", [0.0, 0.0, 1.0, 1.0])).unwrap();
/// let tile = RasterTile::unmasked(Array2::zeros((16, 16)), DataType::Float32);
///
/// cache.put(key.clone(), &tile);
/// assert_eq!(cache.get(&key), Some(tile));
/// ```
#[derive(Debug)]
pub struct TileCache {
    state: Mutex<CacheState>,
    capacity: usize,
    level: Compression,
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new(DEFAULT_TILE_CACHE_CAPACITY, DEFAULT_COMPRESSION_LEVEL)
    }
}

impl TileCache {
    /// Create a cache holding at most `capacity` compressed bytes.
    pub fn new(capacity: usize, compression_level: u32) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity,
            level: Compression::new(compression_level.min(9)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a tile, counting the access.
    pub fn get(&self, key: &TileCacheKey) -> Option<RasterTile> {
        let entry = {
            let mut state = self.lock();
            let entry = state.entries.get_mut(key)?;
            entry.hits += 1;
            entry.clone()
        };

        match decompress_entry(&entry) {
            Ok(tile) => Some(tile),
            Err(e) => {
                warn!(key = key.as_str(), error = %e, "Dropping corrupt cache entry");
                // A fresh entry may have replaced this one in the meantime
                self.lock().remove_if_seq(key, entry.seq);
                None
            }
        }
    }

    /// Check whether a key is cached without counting an access.
    pub fn contains(&self, key: &TileCacheKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Store a tile. Tiles larger than the capacity are silently skipped.
    pub fn put(&self, key: TileCacheKey, tile: &RasterTile) {
        let (data, mask) = match self.compress(tile) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(key = key.as_str(), error = %e, "Failed to compress tile");
                return;
            }
        };
        let entry_size = data.len() + mask.len();
        if entry_size > self.capacity {
            debug!(
                key = key.as_str(),
                size = entry_size,
                capacity = self.capacity,
                "Tile exceeds cache capacity, not caching"
            );
            return;
        }

        let mut state = self.lock();
        state.remove(&key);
        while state.size + entry_size > self.capacity {
            if !state.evict_one() {
                break;
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.size += entry_size;
        state.entries.insert(
            key,
            CacheEntry {
                data,
                mask,
                dtype: tile.dtype(),
                shape: tile.shape(),
                hits: 0,
                seq,
            },
        );
    }

    pub fn remove(&self, key: &TileCacheKey) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.size = 0;
    }

    /// Compressed bytes currently held.
    pub fn size(&self) -> usize {
        self.lock().size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn compress(&self, tile: &RasterTile) -> std::io::Result<(Bytes, Bytes)> {
        let data: Vec<u8> = tile.data().iter().flat_map(|v| v.to_le_bytes()).collect();
        let mask: Vec<u8> = tile.mask().iter().map(|&m| u8::from(m)).collect();
        Ok((
            Bytes::from(zlib(&data, self.level)?),
            Bytes::from(zlib(&mask, self.level)?),
        ))
    }
}

fn zlib(raw: &[u8], level: Compression) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 4), level);
    encoder.write_all(raw)?;
    encoder.finish()
}

fn unzlib(compressed: &[u8], expected_len: usize) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    ZlibDecoder::new(compressed).read_to_end(&mut out)?;
    if out.len() != expected_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("expected {} bytes, got {}", expected_len, out.len()),
        ));
    }
    Ok(out)
}

fn decompress_entry(entry: &CacheEntry) -> Result<RasterTile, String> {
    let pixels = entry.shape.0 * entry.shape.1;
    let raw_data = unzlib(&entry.data, pixels * 8).map_err(|e| e.to_string())?;
    let raw_mask = unzlib(&entry.mask, pixels).map_err(|e| e.to_string())?;

    let values: Vec<f64> = raw_data
        .chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            f64::from_le_bytes(bytes)
        })
        .collect();
    let flags: Vec<bool> = raw_mask.into_iter().map(|b| b != 0).collect();

    let data = Array2::from_shape_vec(entry.shape, values).map_err(|e| e.to_string())?;
    let mask = Array2::from_shape_vec(entry.shape, flags).map_err(|e| e.to_string())?;
    RasterTile::new(data, mask, entry.dtype).map_err(|e| e.to_string())
}
