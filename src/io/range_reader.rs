use bytes::Bytes;

use crate::error::IoError;

/// Trait for reading byte ranges from a raster resource.
///
/// This abstraction lets the GeoTIFF parser read headers, tag arrays and
/// individual blocks without loading the whole file. Reads happen on pool
/// worker threads, so the trait is synchronous; implementations must be
/// thread-safe.
pub trait RangeReader: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// Returns an error if the range is out of bounds or if the read fails.
    fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError>;

    /// Get the total size of the resource in bytes.
    fn size(&self) -> u64;

    /// Get a unique identifier for this resource (for logging).
    fn identifier(&self) -> &str;
}

/// A range reader over bytes already held in memory.
#[derive(Debug, Clone)]
pub struct BytesReader {
    data: Bytes,
    identifier: String,
}

impl BytesReader {
    /// Wrap an in-memory buffer.
    pub fn new(data: impl Into<Bytes>, identifier: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            identifier: identifier.into(),
        }
    }
}

impl RangeReader for BytesReader {
    fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        let start = offset as usize;
        let end = start.checked_add(len).unwrap_or(usize::MAX);
        if end > self.data.len() {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size: self.data.len() as u64,
            });
        }
        Ok(self.data.slice(start..end))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
