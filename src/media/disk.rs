//! Content-addressed disk cache for processed images
//!
//! Files are named `<sha256(url) hex>_<max_dimension>.png` inside a single
//! directory that is created on first write.

use crate::error::{Error, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cache file name for a url at a size bound
    pub fn file_name(url: &str, max_dimension: u32) -> String {
        let digest = Sha256::digest(url.as_bytes());
        format!("{}_{}.png", hex::encode(digest), max_dimension)
    }

    pub fn path_for(&self, url: &str, max_dimension: u32) -> PathBuf {
        self.dir.join(Self::file_name(url, max_dimension))
    }

    /// Stored bytes, or `None` on a miss
    pub async fn read(&self, url: &str, max_dimension: u32) -> Result<Option<Bytes>> {
        let path = self.path_for(url, max_dimension);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                debug!(path = ?path, bytes = bytes.len(), "Disk cache hit");
                Ok(Some(Bytes::from(bytes)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!(
                "Failed to read cache file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Store bytes; readers see either the old file or the complete new one
    pub async fn write(&self, url: &str, max_dimension: u32, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            Error::Storage(format!(
                "Failed to create cache dir {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let path = self.path_for(url, max_dimension);
        let temp_path = path.with_extension("png.tmp");
        tokio::fs::write(&temp_path, bytes).await.map_err(|e| {
            Error::Storage(format!(
                "Failed to write cache file {}: {}",
                temp_path.display(),
                e
            ))
        })?;
        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            tokio::fs::remove_file(&temp_path).await.ok();
            return Err(Error::Storage(format!(
                "Failed to move cache file into place {}: {}",
                path.display(),
                e
            )));
        }

        debug!(path = ?path, bytes = bytes.len(), "Stored image in disk cache");
        Ok(())
    }
}
