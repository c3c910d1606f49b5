//! `localimage` source: reuse an existing flat tree or packed image.
//!
//! Also used by the sequencer to seed the last stage from the destination
//! when updating in place, and by the remote source once a download lands.

use super::{ConveyorPacker, SourceKind};
use crate::bundle::Bundle;
use crate::error::{Error, Result};
use crate::image::{FsType, PackedImage};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// ConveyorPacker for existing images.
#[derive(Debug, Default)]
pub struct LocalConveyorPacker {
    /// Explicit image path; `None` means the definition's `from` header.
    image: Option<PathBuf>,
    resolved: Option<PathBuf>,
}

impl LocalConveyorPacker {
    /// Packer whose image is named by the definition's `from` header.
    pub fn from_header() -> Self {
        Self::default()
    }

    /// Packer for a fixed image path.
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: Some(image.into()),
            resolved: None,
        }
    }
}

#[async_trait]
impl ConveyorPacker for LocalConveyorPacker {
    fn kind(&self) -> SourceKind {
        SourceKind::LocalImage
    }

    async fn fetch(&mut self, bundle: &Bundle) -> Result<()> {
        let image = match &self.image {
            Some(path) => path.clone(),
            None => PathBuf::from(bundle.recipe.from_ref()),
        };
        if image.as_os_str().is_empty() {
            return Err(Error::FetchFailed("localimage without a from path".to_string()));
        }
        if !image.exists() {
            return Err(Error::FetchFailed(format!(
                "image {} does not exist",
                image.display()
            )));
        }
        self.resolved = Some(image);
        Ok(())
    }

    async fn pack(&mut self, bundle: &mut Bundle) -> Result<()> {
        let image = self
            .resolved
            .clone()
            .ok_or_else(|| Error::PackFailed("local image was not fetched".to_string()))?;

        if image.is_dir() {
            info!(image = %image.display(), "copying flat tree into bundle");
            copy_tree(&image, &bundle.rootfs).await
        } else {
            info!(image = %image.display(), "unpacking packed image into bundle");
            let packed = PackedImage::read(&image)?;
            if let Ok(labels) = packed.labels() {
                for (partition, map) in labels {
                    bundle.partition_labels(&partition).extend(map);
                }
            }
            extract_primary(&packed, &bundle.tmp, &bundle.rootfs).await
        }
    }
}

/// `cp -a src/. dst/`, preserving ownership, modes and links.
async fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    let output = Command::new("cp")
        .arg("-a")
        .arg(src.join("."))
        .arg(dst)
        .output()
        .await?;
    if !output.status.success() {
        return Err(Error::CopyFailed {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Writes the primary partition to `tmp` and unsquashes it onto `rootfs`.
async fn extract_primary(image: &PackedImage, tmp: &Path, rootfs: &Path) -> Result<()> {
    let primary = image.primary_partition()?;
    match primary.fs_type() {
        Some(FsType::Squashfs) => {}
        other => {
            return Err(Error::UnsupportedFilesystem(
                other.map(|t| t.to_string()).unwrap_or_default(),
            ));
        }
    }

    let unsquashfs =
        which::which("unsquashfs").map_err(|_| Error::ToolNotFound("unsquashfs".to_string()))?;
    let squash = tmp.join("primary.squashfs");
    fs::write(&squash, image.read_object(primary)?)?;
    debug!(partition = %squash.display(), "extracted primary partition");

    let output = Command::new(unsquashfs)
        .arg("-f")
        .arg("-d")
        .arg(rootfs)
        .arg(&squash)
        .output()
        .await?;
    let _ = fs::remove_file(&squash);
    if !output.status.success() {
        return Err(Error::PackFailed(format!(
            "unsquashfs: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_flat_tree_is_copied() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("tree");
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::write(src.join("etc/os-release"), "ID=test\n").unwrap();

        let mut bundle = Bundle::new(temp.path(), "sbuild").unwrap();
        let mut packer = LocalConveyorPacker::new(&src);
        packer.fetch(&bundle).await.unwrap();
        packer.pack(&mut bundle).await.unwrap();

        assert_eq!(
            fs::read_to_string(bundle.rootfs.join("etc/os-release")).unwrap(),
            "ID=test\n"
        );
    }

    #[tokio::test]
    async fn test_missing_image_fails_fetch() {
        let temp = TempDir::new().unwrap();
        let bundle = Bundle::new(temp.path(), "sbuild").unwrap();
        let mut packer = LocalConveyorPacker::new(temp.path().join("absent"));
        let err = packer.fetch(&bundle).await.unwrap_err();
        assert!(err.to_string().starts_with("conveyor failed to get"));
    }
}
