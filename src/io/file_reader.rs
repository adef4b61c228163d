use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;

use super::RangeReader;
use crate::error::IoError;

/// Local-file implementation of RangeReader.
///
/// The file size is read once on open. Reads seek and read under a mutex,
/// so one handle can be shared by several pool workers.
pub struct FileRangeReader {
    file: Mutex<File>,
    path: PathBuf,
    size: u64,
    identifier: String,
}

impl FileRangeReader {
    /// Open the file at `path`.
    ///
    /// Returns `IoError::NotFound` if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let path = path.as_ref().to_path_buf();
        let identifier = path.display().to_string();

        let file = File::open(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => IoError::NotFound(identifier.clone()),
            _ => IoError::Read(format!("{}: {}", identifier, e)),
        })?;
        let size = file
            .metadata()
            .map_err(|e| IoError::Read(format!("{}: {}", identifier, e)))?
            .len();

        Ok(Self {
            file: Mutex::new(file),
            path,
            size,
            identifier,
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RangeReader for FileRangeReader {
    fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        if offset + len as u64 > self.size {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size: self.size,
            });
        }

        if len == 0 {
            return Ok(Bytes::new());
        }

        let mut buf = vec![0u8; len];
        let mut file = self
            .file
            .lock()
            .map_err(|_| IoError::Read(format!("{}: file handle poisoned", self.identifier)))?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut buf))
            .map_err(|e| IoError::Read(format!("{}: {}", self.identifier, e)))?;

        Ok(Bytes::from(buf))
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
