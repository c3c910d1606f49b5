//! Layer and archive extraction.
//!
//! ## Security
//!
//! - Entries with absolute paths or `..` components are rejected
//!   ([`Error::PathTraversal`])
//! - Total extracted size is bounded by [`MAX_ROOTFS_SIZE`]
//! - Individual layers are bounded by [`MAX_LAYER_SIZE`]
//!
//! Whiteouts follow the OCI layer rules: `.wh.<name>` deletes `<name>` from
//! lower layers, `.wh..wh..opq` empties the directory it sits in.

use crate::constants::{MAX_LAYER_SIZE, MAX_ROOTFS_SIZE};
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Component, Path};
use tar::Archive;
use tracing::debug;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Applies layers in order onto a root filesystem.
pub struct LayerExtractor<'a> {
    rootfs: &'a Path,
    total_size: u64,
}

impl<'a> LayerExtractor<'a> {
    pub fn new(rootfs: &'a Path) -> Self {
        Self {
            rootfs,
            total_size: 0,
        }
    }

    /// Bytes unpacked so far.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Applies one layer; gzip-compressed and plain tar are both accepted.
    pub fn apply(&mut self, digest: &str, layer: impl Read) -> Result<()> {
        let fail = |e: std::io::Error| Error::LayerExtractionFailed {
            digest: digest.to_string(),
            reason: e.to_string(),
        };

        debug!("Extracting layer: {}", digest);
        let reader = decompress(layer).map_err(fail)?;
        let mut archive = Archive::new(reader);
        archive.set_preserve_permissions(true);
        archive.set_unpack_xattrs(false);

        for entry in archive.entries().map_err(fail)? {
            let mut entry = entry.map_err(fail)?;
            let path = entry.path().map_err(fail)?.into_owned();
            check_path(&path)?;

            let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let parent = self.rootfs.join(path.parent().unwrap_or(Path::new("")));

            if filename == OPAQUE_WHITEOUT {
                clear_dir(&parent);
                continue;
            }
            if let Some(target) = filename.strip_prefix(WHITEOUT_PREFIX) {
                let target_path = parent.join(target);
                if target_path.is_dir() && !target_path.is_symlink() {
                    let _ = fs::remove_dir_all(&target_path);
                } else {
                    let _ = fs::remove_file(&target_path);
                }
                continue;
            }

            self.total_size += entry.size();
            if self.total_size > MAX_ROOTFS_SIZE {
                return Err(Error::ImageTooLarge {
                    size: self.total_size,
                    limit: MAX_ROOTFS_SIZE,
                });
            }

            entry.unpack_in(self.rootfs).map_err(fail)?;
        }
        Ok(())
    }

    /// Applies a layer held in memory, enforcing [`MAX_LAYER_SIZE`].
    pub fn apply_bytes(&mut self, digest: &str, data: &[u8]) -> Result<()> {
        if data.len() > MAX_LAYER_SIZE {
            return Err(Error::ImageTooLarge {
                size: data.len() as u64,
                limit: MAX_LAYER_SIZE as u64,
            });
        }
        self.apply(digest, data)
    }
}

/// Unpacks a plain or gzip tarball into `dst` with the same path checks as
/// layers but no whiteout handling.
pub fn unpack_archive(archive: impl Read, dst: &Path) -> Result<()> {
    let fail = |e: std::io::Error| Error::FetchFailed(format!("unpack archive: {}", e));
    fs::create_dir_all(dst)?;
    let mut archive = Archive::new(decompress(archive).map_err(fail)?);
    for entry in archive.entries().map_err(fail)? {
        let mut entry = entry.map_err(fail)?;
        let path = entry.path().map_err(fail)?.into_owned();
        check_path(&path)?;
        entry.unpack_in(dst).map_err(fail)?;
    }
    Ok(())
}

fn decompress<'r>(input: impl Read + 'r) -> std::io::Result<Box<dyn Read + 'r>> {
    let mut reader = BufReader::new(input);
    let gzip = reader.fill_buf()?.starts_with(&[0x1f, 0x8b]);
    Ok(if gzip {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    })
}

fn check_path(path: &Path) -> Result<()> {
    let bad = path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if bad {
        return Err(Error::PathTraversal {
            path: path.to_string_lossy().to_string(),
        });
    }
    Ok(())
}

fn clear_dir(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let _ = if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
    }
}
