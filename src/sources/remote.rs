//! `library` and `shub` sources: download a packed image, then unpack it
//! like a local one.
//!
//! Downloads land in the image cache under `images/<service>/<ref>` and are
//! reused by later builds. Writes stream to a `.part` file that is renamed
//! into place only after the body completed.

use super::local::LocalConveyorPacker;
use super::{ConveyorPacker, RemoteService, SourceKind};
use crate::bundle::Bundle;
use crate::cache::ImageCache;
use crate::constants::{IMAGE_PULL_TIMEOUT, MAX_ROOTFS_SIZE};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Hub API answer for one container.
#[derive(Debug, Deserialize)]
struct ShubManifest {
    image: String,
}

/// ConveyorPacker for remote packed-image services.
pub struct RemoteConveyorPacker {
    service: RemoteService,
    local: Option<LocalConveyorPacker>,
}

impl RemoteConveyorPacker {
    pub fn new(service: RemoteService) -> Self {
        Self {
            service,
            local: None,
        }
    }

    fn cache_kind(&self) -> &'static str {
        match self.service {
            RemoteService::Library => "library",
            RemoteService::Shub => "shub",
        }
    }
}

#[async_trait]
impl ConveyorPacker for RemoteConveyorPacker {
    fn kind(&self) -> SourceKind {
        SourceKind::Remote(self.service)
    }

    async fn fetch(&mut self, bundle: &Bundle) -> Result<()> {
        let cache_root = bundle
            .opts
            .image_cache
            .as_ref()
            .ok_or(Error::UndefinedImageCache)?;
        let cache = ImageCache::open(cache_root)?;
        let reference = bundle.recipe.from_ref().trim_start_matches('/');
        if reference.is_empty() {
            return Err(Error::FetchFailed(format!(
                "{} source without a from reference",
                self.cache_kind()
            )));
        }

        let dest = cache.image_path(self.cache_kind(), reference);
        if dest.exists() {
            info!(image = %dest.display(), "using cached image");
        } else {
            let client = reqwest::Client::builder()
                .timeout(IMAGE_PULL_TIMEOUT)
                .build()
                .map_err(|e| Error::FetchFailed(e.to_string()))?;
            let url = match self.service {
                RemoteService::Library => library_url(&bundle.opts.library_url, reference),
                RemoteService::Shub => shub_image_url(&client, &bundle.opts.shub_url, reference).await?,
            };
            download(&client, &url, reference, &dest).await?;
        }

        let mut local = LocalConveyorPacker::new(dest);
        local.fetch(bundle).await?;
        self.local = Some(local);
        Ok(())
    }

    async fn pack(&mut self, bundle: &mut Bundle) -> Result<()> {
        match self.local.as_mut() {
            Some(local) => local.pack(bundle).await,
            None => Err(Error::PackFailed("remote image was not fetched".to_string())),
        }
    }
}

/// Download URL of a library image.
pub fn library_url(base: &str, reference: &str) -> String {
    format!("{}/v1/imagefile/{}", base.trim_end_matches('/'), reference)
}

async fn shub_image_url(client: &reqwest::Client, base: &str, reference: &str) -> Result<String> {
    let api = format!("{}/api/container/{}", base.trim_end_matches('/'), reference);
    debug!(url = %api, "resolving hub image");
    let manifest: ShubManifest = client
        .get(&api)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| pull_failed(reference, e))?
        .json()
        .await
        .map_err(|e| pull_failed(reference, e))?;
    Ok(manifest.image)
}

/// Streams `url` into `dest`, bounded by [`MAX_ROOTFS_SIZE`].
async fn download(client: &reqwest::Client, url: &str, reference: &str, dest: &Path) -> Result<()> {
    info!(url, "downloading image");
    let mut response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| pull_failed(reference, e))?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::CacheWriteFailed(e.to_string()))?;
    }
    let part = part_path(dest);
    let mut file = tokio::fs::File::create(&part)
        .await
        .map_err(|e| Error::CacheWriteFailed(e.to_string()))?;

    let mut written = 0u64;
    let result: Result<()> = async {
        while let Some(chunk) = response.chunk().await.map_err(|e| pull_failed(reference, e))? {
            written += chunk.len() as u64;
            if written > MAX_ROOTFS_SIZE {
                return Err(Error::ImageTooLarge {
                    size: written,
                    limit: MAX_ROOTFS_SIZE,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(e);
    }
    tokio::fs::rename(&part, dest)
        .await
        .map_err(|e| Error::CacheWriteFailed(e.to_string()))?;
    debug!(bytes = written, image = %dest.display(), "download complete");
    Ok(())
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

fn pull_failed(reference: &str, e: reqwest::Error) -> Error {
    Error::ImagePullFailed {
        reference: reference.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_library_url() {
        assert_eq!(
            library_url("https://library.example.org/", "alpine:latest"),
            "https://library.example.org/v1/imagefile/alpine:latest"
        );
    }

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("/cache/images/library/alpine")),
            PathBuf::from("/cache/images/library/alpine.part")
        );
    }

    #[tokio::test]
    async fn test_fetch_without_cache_is_configuration_error() {
        let temp = TempDir::new().unwrap();
        let mut bundle = Bundle::new(temp.path(), "sbuild").unwrap();
        bundle.opts.image_cache = None;
        let mut packer = RemoteConveyorPacker::new(RemoteService::Library);
        let err = packer.fetch(&bundle).await.unwrap_err();
        assert!(matches!(err, Error::UndefinedImageCache));
    }
}
