//! OCI-family sources: registry pulls, `docker save` archives, OCI layout
//! archives and images from the local Docker daemon.
//!
//! ## Registry Pulls
//!
//! 1. Validate the reference (length, character allowlist)
//! 2. Fetch the manifest with timeout, resolving multi-arch indexes to the
//!    host architecture
//! 3. Download missing layers into the image cache (digest-verified)
//!
//! Packing applies the layers in order and turns the image config's
//! `Env`, `Entrypoint` and `Cmd` into an environment script and runscript.

use super::layers::{LayerExtractor, unpack_archive};
use super::{ConveyorPacker, OciTransport, SourceKind};
use crate::bundle::Bundle;
use crate::cache::ImageCache;
use crate::constants::{
    ENVIRONMENT_SCRIPT, IMAGE_PULL_TIMEOUT, MAX_IMAGE_REF_LEN, MAX_LAYER_SIZE, MAX_LAYERS,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciDescriptor, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use serde::Deserialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Where a layer's bytes live after fetch.
#[derive(Debug, Clone)]
enum LayerSource {
    /// Blob in the image cache.
    Cached { cache: PathBuf, digest: String },
    /// File inside an unpacked archive.
    File { path: PathBuf },
}

/// Subset of the OCI image config used for runtime metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub config: ImageRuntimeConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImageRuntimeConfig {
    pub env: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub working_dir: Option<String>,
}

/// ConveyorPacker for OCI-family sources.
pub struct OciConveyorPacker {
    transport: OciTransport,
    layers: Vec<LayerSource>,
    config: ImageConfig,
}

impl OciConveyorPacker {
    pub fn new(transport: OciTransport) -> Self {
        Self {
            transport,
            layers: Vec::new(),
            config: ImageConfig::default(),
        }
    }

    async fn fetch_registry(&mut self, bundle: &Bundle) -> Result<()> {
        let cache_root = bundle
            .opts
            .image_cache
            .as_ref()
            .ok_or(Error::UndefinedImageCache)?;
        let cache = ImageCache::open(cache_root)?;
        let image_ref = bundle.recipe.from_ref().trim_start_matches("//");
        validate_reference(image_ref)?;

        info!("Pulling image: {}", image_ref);
        let reference: Reference = image_ref.parse().map_err(|e| Error::InvalidImageReference {
            reference: image_ref.to_string(),
            reason: format!("{}", e),
        })?;

        let client = Client::new(ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        });
        let auth = RegistryAuth::Anonymous;

        let (manifest, _digest) = tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
            client.pull_manifest(&reference, &auth).await
        })
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("pull manifest for {}", image_ref),
            duration: IMAGE_PULL_TIMEOUT,
        })?
        .map_err(|e| Error::ImagePullFailed {
            reference: image_ref.to_string(),
            reason: e.to_string(),
        })?;

        let (layers, config_desc) = resolve_manifest(&client, &reference, &auth, manifest).await?;
        if layers.len() > MAX_LAYERS {
            return Err(Error::ImagePullFailed {
                reference: image_ref.to_string(),
                reason: format!("too many layers: {} > {}", layers.len(), MAX_LAYERS),
            });
        }

        for layer in &layers {
            if cache.has_blob(&layer.digest) {
                debug!("Layer {} already cached", layer.digest);
            } else {
                debug!("Pulling layer: {} ({} bytes)", layer.digest, layer.size);
                let data = pull_blob(&client, &reference, layer).await?;
                cache.put_blob(&layer.digest, &data)?;
            }
            self.layers.push(LayerSource::Cached {
                cache: cache.root().to_path_buf(),
                digest: layer.digest.clone(),
            });
        }

        let config = pull_blob(&client, &reference, &config_desc).await?;
        self.config = serde_json::from_slice(&config).unwrap_or_default();
        Ok(())
    }

    fn fetch_archive(&mut self, archive: &Path, bundle: &Bundle) -> Result<()> {
        let dir = bundle.tmp.join("archive");
        info!(archive = %archive.display(), "unpacking image archive");
        let file = File::open(archive)
            .map_err(|e| Error::FetchFailed(format!("{}: {}", archive.display(), e)))?;
        unpack_archive(file, &dir)?;

        if dir.join("manifest.json").exists() {
            self.read_docker_layout(&dir)
        } else if dir.join("index.json").exists() {
            self.read_oci_layout(&dir)
        } else {
            Err(Error::FetchFailed(format!(
                "{} is neither a docker nor an OCI archive",
                archive.display()
            )))
        }
    }

    /// `docker save` layout: `manifest.json` lists the config and layer
    /// files relative to the archive root.
    fn read_docker_layout(&mut self, dir: &Path) -> Result<()> {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Entry {
            config: String,
            layers: Vec<String>,
        }

        let entries: Vec<Entry> = serde_json::from_slice(&fs::read(dir.join("manifest.json"))?)?;
        let entry = entries
            .into_iter()
            .next()
            .ok_or_else(|| Error::FetchFailed("archive manifest lists no images".to_string()))?;

        self.config = read_config(&archive_path(dir, &entry.config)?);
        for layer in &entry.layers {
            self.layers.push(LayerSource::File {
                path: archive_path(dir, layer)?,
            });
        }
        Ok(())
    }

    /// OCI image layout: `index.json` → manifest blob → config and layers.
    fn read_oci_layout(&mut self, dir: &Path) -> Result<()> {
        #[derive(Deserialize)]
        struct Descriptor {
            digest: String,
        }
        #[derive(Deserialize)]
        struct Index {
            manifests: Vec<Descriptor>,
        }
        #[derive(Deserialize)]
        struct Manifest {
            config: Descriptor,
            layers: Vec<Descriptor>,
        }

        let blob = |digest: &str| -> Result<PathBuf> {
            let (algo, hex) = digest
                .split_once(':')
                .ok_or_else(|| Error::FetchFailed(format!("bad digest {}", digest)))?;
            archive_path(dir, &format!("blobs/{}/{}", algo, hex))
        };

        let index: Index = serde_json::from_slice(&fs::read(dir.join("index.json"))?)?;
        let first = index
            .manifests
            .first()
            .ok_or_else(|| Error::FetchFailed("OCI index lists no manifests".to_string()))?;
        let manifest: Manifest = serde_json::from_slice(&fs::read(blob(&first.digest)?)?)?;

        self.config = read_config(&blob(&manifest.config.digest)?);
        for layer in &manifest.layers {
            self.layers.push(LayerSource::File {
                path: blob(&layer.digest)?,
            });
        }
        Ok(())
    }

    async fn save_from_daemon(&self, bundle: &Bundle) -> Result<PathBuf> {
        let docker = which::which("docker").map_err(|_| Error::ToolNotFound("docker".to_string()))?;
        let image = bundle.recipe.from_ref().trim_start_matches("//");
        validate_reference(image)?;
        let out = bundle.tmp.join("daemon.tar");

        info!(image, "saving image from docker daemon");
        let status = tokio::process::Command::new(docker)
            .arg("save")
            .arg("-o")
            .arg(&out)
            .arg(image)
            .status()
            .await?;
        if !status.success() {
            return Err(Error::FetchFailed(format!(
                "docker save {} exited with {:?}",
                image,
                status.code()
            )));
        }
        Ok(out)
    }
}

#[async_trait]
impl ConveyorPacker for OciConveyorPacker {
    fn kind(&self) -> SourceKind {
        SourceKind::Oci(self.transport)
    }

    async fn fetch(&mut self, bundle: &Bundle) -> Result<()> {
        self.layers.clear();
        match self.transport {
            OciTransport::Registry => self.fetch_registry(bundle).await,
            OciTransport::DockerArchive | OciTransport::OciArchive => {
                let archive = PathBuf::from(bundle.recipe.from_ref());
                self.fetch_archive(&archive, bundle)
            }
            OciTransport::DockerDaemon => {
                let archive = self.save_from_daemon(bundle).await?;
                self.fetch_archive(&archive, bundle)
            }
        }
    }

    async fn pack(&mut self, bundle: &mut Bundle) -> Result<()> {
        let rootfs = bundle.rootfs.clone();
        let layers = std::mem::take(&mut self.layers);

        let count = layers.len();
        tokio::task::spawn_blocking(move || apply_layers(&rootfs, &layers))
            .await
            .map_err(|e| Error::Internal(format!("layer extraction panicked: {}", e)))??;
        info!(layers = count, rootfs = %bundle.rootfs.display(), "applied image layers");

        write_runtime_metadata(bundle, &self.config.config)
    }
}

fn apply_layers(rootfs: &Path, layers: &[LayerSource]) -> Result<()> {
    let mut extractor = LayerExtractor::new(rootfs);
    for layer in layers {
        match layer {
            LayerSource::Cached { cache, digest } => {
                let data = ImageCache::open(cache)?.get_blob(digest)?;
                extractor.apply_bytes(digest, &data)?;
            }
            LayerSource::File { path } => {
                let file = File::open(path)?;
                extractor.apply(&path.to_string_lossy(), file)?;
            }
        }
    }
    Ok(())
}

/// Writes `env/10-oci.sh` and, unless the definition sets one, a runscript
/// derived from the image's entrypoint and command.
fn write_runtime_metadata(bundle: &mut Bundle, config: &ImageRuntimeConfig) -> Result<()> {
    if let Some(env) = &config.env
        && !env.is_empty()
    {
        let mut script = String::from("#!/bin/sh\n");
        for (key, value) in env.iter().filter_map(|e| e.split_once('=')) {
            script.push_str(&format!("export {}={}\n", key, shell_quote(value)));
        }
        let env_dir = Path::new(ENVIRONMENT_SCRIPT)
            .parent()
            .unwrap_or(Path::new("/"));
        let path = bundle.in_rootfs(env_dir.join("10-oci.sh"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, script)?;
    }

    if bundle.recipe.image_data.runscript.is_empty() {
        bundle.recipe.image_data.runscript = runscript(config);
    }
    Ok(())
}

/// Runscript that runs the entrypoint with the caller's arguments, or with
/// the image command when there are none.
pub fn runscript(config: &ImageRuntimeConfig) -> String {
    let join = |words: &Option<Vec<String>>| {
        words
            .iter()
            .flatten()
            .map(|w| shell_quote(w))
            .collect::<Vec<_>>()
            .join(" ")
    };
    let entrypoint = join(&config.entrypoint);
    let cmd = join(&config.cmd);

    let mut script = String::new();
    if let Some(dir) = config.working_dir.as_deref().filter(|d| !d.is_empty()) {
        script.push_str(&format!("cd {}\n", shell_quote(dir)));
    }
    let with_args = format!("{} \"$@\"", entrypoint).trim().to_string();
    script.push_str(&format!("if [ $# -gt 0 ]; then\n    exec {}\nfi\n", with_args));
    let default = format!("{} {}", entrypoint, cmd).trim().to_string();
    if default.is_empty() {
        script.push_str("exec /bin/sh\n");
    } else {
        script.push_str(&format!("exec {}\n", default));
    }
    script
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn read_config(path: &Path) -> ImageConfig {
    fs::read(path)
        .ok()
        .and_then(|data| serde_json::from_slice(&data).ok())
        .unwrap_or_default()
}

/// Joins an archive-relative path onto `dir`, rejecting traversal.
fn archive_path(dir: &Path, rel: &str) -> Result<PathBuf> {
    if rel.starts_with('/') || rel.split('/').any(|c| c == "..") {
        return Err(Error::PathTraversal {
            path: rel.to_string(),
        });
    }
    Ok(dir.join(rel))
}

fn validate_reference(image_ref: &str) -> Result<()> {
    if image_ref.len() > MAX_IMAGE_REF_LEN {
        return Err(Error::InvalidImageReference {
            reference: image_ref.to_string(),
            reason: format!("exceeds {} bytes", MAX_IMAGE_REF_LEN),
        });
    }
    if image_ref.is_empty()
        || !image_ref
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/:.-_@".contains(c))
    {
        return Err(Error::InvalidImageReference {
            reference: image_ref.to_string(),
            reason: "contains invalid characters".to_string(),
        });
    }
    Ok(())
}

async fn pull_blob(client: &Client, reference: &Reference, desc: &OciDescriptor) -> Result<Vec<u8>> {
    if desc.size > MAX_LAYER_SIZE as i64 {
        return Err(Error::ImageTooLarge {
            size: desc.size as u64,
            limit: MAX_LAYER_SIZE as u64,
        });
    }

    let mut data = Vec::new();
    tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
        client.pull_blob(reference, desc, &mut data).await
    })
    .await
    .map_err(|_| Error::Timeout {
        operation: format!("pull blob {}", desc.digest),
        duration: IMAGE_PULL_TIMEOUT,
    })?
    .map_err(|e| Error::ImagePullFailed {
        reference: reference.to_string(),
        reason: format!("blob {}: {}", desc.digest, e),
    })?;
    Ok(data)
}

/// OCI architecture name of the host.
fn host_arch() -> &'static str {
    if cfg!(target_arch = "x86_64") {
        "amd64"
    } else if cfg!(target_arch = "aarch64") {
        "arm64"
    } else if cfg!(target_arch = "arm") {
        "arm"
    } else {
        "amd64"
    }
}

/// Resolves an image index to the host's manifest and returns the layer
/// and config descriptors.
async fn resolve_manifest(
    client: &Client,
    reference: &Reference,
    auth: &RegistryAuth,
    manifest: OciManifest,
) -> Result<(Vec<OciDescriptor>, OciDescriptor)> {
    let index = match manifest {
        OciManifest::Image(img) => return Ok((img.layers, img.config)),
        OciManifest::ImageIndex(index) => index,
    };

    let arch = host_arch();
    let matching = index
        .manifests
        .iter()
        .find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == arch)
        })
        .ok_or_else(|| {
            let available: Vec<String> = index
                .manifests
                .iter()
                .filter_map(|m| m.platform.as_ref())
                .map(|p| format!("{}/{}", p.os, p.architecture))
                .collect();
            Error::ImagePullFailed {
                reference: reference.to_string(),
                reason: format!(
                    "no manifest for linux/{}. Available: {}",
                    arch,
                    available.join(", ")
                ),
            }
        })?;

    let platform_ref: Reference = format!(
        "{}/{}@{}",
        reference.registry(),
        reference.repository(),
        matching.digest
    )
    .parse()
    .map_err(|e| Error::ImagePullFailed {
        reference: reference.to_string(),
        reason: format!("failed to build digest reference: {}", e),
    })?;

    let (platform_manifest, _) =
        client
            .pull_manifest(&platform_ref, auth)
            .await
            .map_err(|e| Error::ImagePullFailed {
                reference: reference.to_string(),
                reason: format!("failed to pull platform manifest: {}", e),
            })?;

    match platform_manifest {
        OciManifest::Image(img) => Ok((img.layers, img.config)),
        OciManifest::ImageIndex(_) => Err(Error::ImagePullFailed {
            reference: reference.to_string(),
            reason: "nested image index not supported".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runscript_entrypoint_and_cmd() {
        let config = ImageRuntimeConfig {
            entrypoint: Some(vec!["/docker-entrypoint.sh".to_string()]),
            cmd: Some(vec!["nginx".to_string(), "-g".to_string(), "daemon off;".to_string()]),
            ..Default::default()
        };
        let script = runscript(&config);
        assert!(script.contains("exec '/docker-entrypoint.sh' \"$@\""));
        assert!(script.contains("exec '/docker-entrypoint.sh' 'nginx' '-g' 'daemon off;'"));
    }

    #[test]
    fn test_runscript_without_entrypoint() {
        let script = runscript(&ImageRuntimeConfig::default());
        assert!(script.contains("exec \"$@\""));
        assert!(script.ends_with("exec /bin/sh\n"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_archive_path_traversal() {
        assert!(archive_path(Path::new("/x"), "blobs/sha256/ab").is_ok());
        assert!(archive_path(Path::new("/x"), "../etc/passwd").is_err());
        assert!(archive_path(Path::new("/x"), "/etc/passwd").is_err());
    }

    #[test]
    fn test_validate_reference() {
        assert!(validate_reference("alpine:3.18").is_ok());
        assert!(validate_reference("").is_err());
        assert!(validate_reference("alpine;rm").is_err());
        assert!(validate_reference(&"a".repeat(MAX_IMAGE_REF_LEN + 1)).is_err());
    }
}
