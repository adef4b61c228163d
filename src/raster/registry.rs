//! Dataset registry for managing open datasets.
//!
//! The registry provides:
//! - LRU caching of opened datasets to avoid re-parsing file headers
//! - A single place to invalidate datasets whose files changed
//!
//! Opens happen on pool workers, so the registry is synchronous and guarded
//! by a plain mutex. Two workers missing on the same handle may both open
//! it; the second insert simply replaces the first.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;
use tracing::debug;

use crate::error::RasterError;

use super::{DatasetHandle, RasterDataset, RasterDriver};

/// Default number of open datasets kept.
pub const DEFAULT_DATASET_CACHE_CAPACITY: usize = 100;

/// LRU cache of opened datasets in front of a [`RasterDriver`].
pub struct DatasetRegistry {
    driver: Arc<dyn RasterDriver>,
    cache: Mutex<LruCache<DatasetHandle, Arc<dyn RasterDataset>>>,
}

impl DatasetRegistry {
    pub fn new(driver: Arc<dyn RasterDriver>) -> Self {
        Self::with_capacity(driver, DEFAULT_DATASET_CACHE_CAPACITY)
    }

    /// Create a registry keeping at most `capacity` datasets open (minimum 1).
    pub fn with_capacity(driver: Arc<dyn RasterDriver>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            driver,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Get a dataset, opening it if not already cached.
    pub fn get(&self, handle: &DatasetHandle) -> Result<Arc<dyn RasterDataset>, RasterError> {
        if let Some(dataset) = self.lock().get(handle) {
            return Ok(dataset.clone());
        }

        debug!(handle = %handle, "Opening dataset");
        let dataset = self.driver.open(handle)?;
        self.lock().put(handle.clone(), dataset.clone());
        Ok(dataset)
    }

    /// Drop a dataset so the next access reopens it.
    pub fn invalidate(&self, handle: &DatasetHandle) {
        self.lock().pop(handle);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn cached_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<DatasetHandle, Arc<dyn RasterDataset>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ndarray::Array2;

    use crate::raster::{Affine, Bounds, Crs, MemoryDriver, MemoryRaster};

    struct CountingDriver {
        inner: MemoryDriver,
        opens: AtomicUsize,
    }

    impl RasterDriver for CountingDriver {
        fn open(&self, handle: &DatasetHandle) -> Result<Arc<dyn RasterDataset>, RasterError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.inner.open(handle)
        }
    }

    fn driver_with(handles: &[&str]) -> Arc<CountingDriver> {
        let inner = MemoryDriver::new();
        for h in handles {
            let transform = Affine::from_bounds(&Bounds::new(0.0, 0.0, 1.0, 1.0), 2, 2);
            inner.insert(MemoryRaster::new(
                *h,
                Array2::zeros((2, 2)),
                Crs::WGS84,
                transform,
            ));
        }
        Arc::new(CountingDriver {
            inner,
            opens: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_get_caches_datasets() {
        let driver = driver_with(&["a"]);
        let registry = DatasetRegistry::new(driver.clone());

        registry.get(&"a".into()).unwrap();
        registry.get(&"a".into()).unwrap();
        assert_eq!(driver.opens.load(Ordering::SeqCst), 1);
        assert_eq!(registry.cached_count(), 1);

        registry.invalidate(&"a".into());
        registry.get(&"a".into()).unwrap();
        assert_eq!(driver.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_lru_eviction() {
        let driver = driver_with(&["a", "b", "c"]);
        let registry = DatasetRegistry::with_capacity(driver.clone(), 2);

        for h in ["a", "b", "c", "a"] {
            registry.get(&h.into()).unwrap();
        }
        // "a" was evicted by "c" and reopened
        assert_eq!(driver.opens.load(Ordering::SeqCst), 4);
        assert_eq!(registry.cached_count(), 2);
    }

    #[test]
    fn test_open_errors_not_cached() {
        let driver = driver_with(&[]);
        let registry = DatasetRegistry::new(driver.clone());
        assert!(registry.get(&"missing".into()).is_err());
        assert_eq!(registry.cached_count(), 0);
    }
}
