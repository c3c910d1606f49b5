//! # Image Cache
//!
//! Stores downloaded source material so repeated builds do not hit the
//! network again.
//!
//! ```text
//! <cache>/
//! ├── blobs/sha256/ab/abcd1234...   ← registry layers, by digest
//! └── images/<kind>/<name>          ← downloaded packed images
//! ```
//!
//! Blob writes verify the SHA-256 digest before the data lands, and all
//! writes go through a uniquely named temp file plus rename so a crashed
//! download never leaves a truncated entry behind.

use crate::constants::{BLOB_CACHE_DIR, IMAGE_CACHE_DIR};
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// On-disk cache for layers and downloaded images.
#[derive(Debug)]
pub struct ImageCache {
    root: PathBuf,
}

impl ImageCache {
    /// Opens (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in [BLOB_CACHE_DIR, IMAGE_CACHE_DIR] {
            fs::create_dir_all(root.join(sub)).map_err(|e| Error::CacheInitFailed {
                path: root.clone(),
                reason: e.to_string(),
            })?;
        }
        info!("Image cache at: {}", root.display());
        Ok(Self { root })
    }

    /// Cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Checks if a blob exists.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    /// Reads a blob by digest.
    pub fn get_blob(&self, digest: &str) -> Result<Vec<u8>> {
        fs::read(self.blob_path(digest)).map_err(|_| Error::BlobNotFound {
            digest: digest.to_string(),
        })
    }

    /// Path of a blob.
    ///
    /// # Security
    ///
    /// The algorithm is restricted to the sha2 family and the hash to hex
    /// characters, so a hostile digest cannot name a path outside the cache.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let (algo, hash) = digest.split_once(':').unwrap_or(("sha256", digest));

        let safe_algo = match algo {
            "sha256" | "sha384" | "sha512" => algo,
            _ => {
                warn!("Invalid digest algorithm '{}', defaulting to sha256", algo);
                "sha256"
            }
        };

        let safe_hash: String = hash.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        if safe_hash.is_empty() {
            return self.root.join(BLOB_CACHE_DIR).join("invalid").join("empty");
        }

        let prefix = &safe_hash[..2.min(safe_hash.len())];
        self.root
            .join(BLOB_CACHE_DIR)
            .join(safe_algo)
            .join(prefix)
            .join(&safe_hash)
    }

    /// Stores a blob after verifying its SHA-256 digest.
    pub fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let (algo, expected) = digest.split_once(':').unwrap_or(("sha256", digest));
        if algo != "sha256" {
            return Err(Error::CacheWriteFailed(format!(
                "unsupported digest algorithm '{}': only sha256 is supported",
                algo
            )));
        }

        let computed = hex::encode(Sha256::digest(data));
        if computed != expected {
            return Err(Error::CacheWriteFailed(format!(
                "digest mismatch: expected {}, computed {}",
                expected, computed
            )));
        }

        let path = self.blob_path(digest);
        if path.exists() {
            debug!("Blob {} already cached", digest);
            return Ok(());
        }
        write_atomic(&path, data)?;
        debug!("Cached blob {} ({} bytes)", digest, data.len());
        Ok(())
    }

    /// Path under which a downloaded image of `kind` named `name` lives.
    ///
    /// `name` is sanitized to a single path component.
    pub fn image_path(&self, kind: &str, name: &str) -> PathBuf {
        let safe: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '_' })
            .collect();
        self.root.join(IMAGE_CACHE_DIR).join(kind).join(safe)
    }

    /// Stores a downloaded image and returns its cache path.
    pub fn put_image(&self, kind: &str, name: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.image_path(kind, name);
        write_atomic(&path, data)?;
        Ok(path)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::CacheWriteFailed(e.to_string()))?;
    }
    let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
    fs::write(&temp_path, data).map_err(|e| Error::CacheWriteFailed(e.to_string()))?;
    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::CacheWriteFailed(e.to_string())
    })
}
