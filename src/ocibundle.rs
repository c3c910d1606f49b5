//! # OCI Bundle Materializer
//!
//! Turns a packed image back into a runnable OCI bundle by mounting its
//! primary partition through a loop device.
//!
//! ```text
//! <bundle>/
//! ├── config.json     ← OCI runtime spec (root = rootfs)
//! ├── rootfs/         ← squashfs mounted read-only (+ overlay if writable)
//! └── overlay/        ← only when writable
//!     ├── upper/
//!     └── work/
//! ```
//!
//! ## Acquisition Order
//!
//! ```text
//! open image → descriptor table → loop attach → mount rootfs
//!            → release loop handle (autoclear) → overlay (writable only)
//! ```
//!
//! Once the squashfs is mounted the loop handle is released: the device is
//! autoclear, so it goes away with the last unmount. Any failure rolls back
//! whatever was acquired in reverse order (overlay → mount → loop device →
//! bundle directory) before the error is returned.

use crate::constants::{LOOP_DEVICE_PREFIX, OCI_RUNTIME_SPEC_VERSION};
use crate::error::{Error, Result};
use crate::image::{FsType, PackedImage};
use crate::loopdev::{ImageRef, LoopInfo, LoopMode};
use crate::mount::{MNT_DETACH, MS_NODEV, MS_NOSUID, MS_RDONLY};
use crate::rpc::PrivilegedOps;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// =============================================================================
// OCI Runtime Spec Types
// =============================================================================

/// OCI Runtime Spec (subset written for materialized images).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    pub oci_version: String,
    pub root: OciRoot,
    pub process: OciProcess,
    #[serde(default)]
    pub mounts: Vec<OciMount>,
}

/// OCI root filesystem config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciRoot {
    pub path: String,
    pub readonly: bool,
}

/// OCI process config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciProcess {
    pub terminal: bool,
    pub user: OciUser,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

/// OCI user config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciUser {
    pub uid: u32,
    pub gid: u32,
}

/// OCI mount config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl OciSpec {
    /// Default spec for a materialized image.
    pub fn for_image(readonly: bool) -> Self {
        Self {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            root: OciRoot {
                path: "rootfs".to_string(),
                readonly,
            },
            process: OciProcess {
                terminal: false,
                user: OciUser { uid: 0, gid: 0 },
                args: vec!["/bin/sh".to_string()],
                env: vec![
                    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"
                        .to_string(),
                ],
                cwd: "/".to_string(),
            },
            mounts: vec![OciMount {
                destination: "/proc".to_string(),
                mount_type: "proc".to_string(),
                source: "proc".to_string(),
                options: Vec::new(),
            }],
        }
    }
}

// =============================================================================
// Materializer
// =============================================================================

/// Paths of a materialized bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePaths {
    pub root: PathBuf,
    pub rootfs: PathBuf,
    pub overlay: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub config: PathBuf,
}

impl BundlePaths {
    pub fn new(bundle_path: &Path) -> Self {
        let overlay = bundle_path.join("overlay");
        Self {
            root: bundle_path.to_path_buf(),
            rootfs: bundle_path.join("rootfs"),
            upper: overlay.join("upper"),
            work: overlay.join("work"),
            overlay,
            config: bundle_path.join("config.json"),
        }
    }
}

/// What `create` has acquired so far.
#[derive(Debug, Default)]
struct Acquired {
    directory: bool,
    device: Option<u32>,
    mounted: bool,
    overlay: bool,
}

/// Creates and deletes OCI bundles from packed images through a
/// [`PrivilegedOps`] implementation.
pub struct Materializer<'a> {
    ops: &'a mut dyn PrivilegedOps,
}

impl<'a> Materializer<'a> {
    pub fn new(ops: &'a mut dyn PrivilegedOps) -> Self {
        Self { ops }
    }

    /// Materializes `image` at `bundle_path`.
    pub fn create(&mut self, image: &Path, bundle_path: &Path, writable: bool) -> Result<()> {
        let paths = BundlePaths::new(bundle_path);
        let mut acquired = Acquired::default();

        match self.try_create(image, &paths, writable, &mut acquired) {
            Ok(()) => {
                info!(
                    image = %image.display(),
                    bundle = %bundle_path.display(),
                    writable,
                    "materialized image bundle"
                );
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, bundle = %bundle_path.display(), "rolling back bundle");
                self.rollback(&paths, &acquired);
                Err(e)
            }
        }
    }

    fn try_create(
        &mut self,
        image: &Path,
        paths: &BundlePaths,
        writable: bool,
        acquired: &mut Acquired,
    ) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(image)
            .map_err(|e| Error::InvalidImage {
                path: image.to_path_buf(),
                reason: e.to_string(),
            })?;

        let packed = PackedImage::from_file(&mut file, image)?;
        let part = packed.primary_partition()?;
        match part.fs_type() {
            Some(FsType::Squashfs) => {}
            Some(other) => return Err(Error::UnsupportedFilesystem(other.to_string())),
            None => return Err(Error::NoPrimaryPartition(image.to_path_buf())),
        }
        debug!(offset = part.offset, length = part.length, "primary partition");

        acquired.directory = true;
        self.ops.mkdir(&paths.rootfs, 0o755)?;
        let spec = serde_json::to_string_pretty(&OciSpec::for_image(!writable))?;
        fs::write(&paths.config, spec)?;

        let mode = if writable {
            LoopMode::ReadWrite
        } else {
            LoopMode::ReadOnly
        };
        let info = LoopInfo::read_only(part.offset, part.length);
        let device = match self
            .ops
            .loop_attach(&ImageRef::Fd(file.as_raw_fd()), mode, &info)
        {
            Ok(device) => device,
            Err(e) => {
                if let Error::LoopStatusFailed { device, .. } = &e {
                    acquired.device = Some(*device);
                }
                return Err(e);
            }
        };
        acquired.device = Some(device);

        let source = format!("{}{}", LOOP_DEVICE_PREFIX, device);
        self.ops.mount(
            &source,
            &paths.rootfs,
            "squashfs",
            MS_RDONLY | MS_NOSUID | MS_NODEV,
            "errors=remount-ro",
        )?;
        acquired.mounted = true;

        // The mount now pins the device; releasing our handle lets autoclear
        // detach it on the last unmount.
        self.ops.loop_detach(device)?;
        acquired.device = None;

        if writable {
            self.ops.mkdir(&paths.upper, 0o755)?;
            self.ops.mkdir(&paths.work, 0o755)?;
            let data = format!(
                "lowerdir={},upperdir={},workdir={}",
                paths.rootfs.display(),
                paths.upper.display(),
                paths.work.display()
            );
            self.ops
                .mount("overlay", &paths.rootfs, "overlay", MS_NOSUID | MS_NODEV, &data)?;
            acquired.overlay = true;
        }

        Ok(())
    }

    fn rollback(&mut self, paths: &BundlePaths, acquired: &Acquired) {
        if acquired.overlay
            && let Err(e) = self.ops.unmount(&paths.rootfs, MNT_DETACH)
        {
            warn!(error = %e, "failed to remove overlay");
        }
        if acquired.mounted
            && let Err(e) = self.ops.unmount(&paths.rootfs, MNT_DETACH)
        {
            warn!(error = %e, "failed to unmount rootfs");
        }
        if let Some(device) = acquired.device
            && let Err(e) = self.ops.loop_detach(device)
        {
            warn!(error = %e, device, "failed to detach loop device");
        }
        if acquired.directory
            && let Err(e) = fs::remove_dir_all(&paths.root)
        {
            warn!(error = %e, bundle = %paths.root.display(), "failed to remove bundle");
        }
    }

    /// Reverses [`Materializer::create`]. Every step runs even if an earlier
    /// one failed; the first error is returned.
    pub fn delete(&mut self, bundle_path: &Path) -> Result<()> {
        let paths = BundlePaths::new(bundle_path);
        let mut first: Option<Error> = None;
        let mut keep = |r: Result<()>| {
            if let Err(e) = r {
                warn!(error = %e, bundle = %bundle_path.display(), "bundle teardown step failed");
                first.get_or_insert(e);
            }
        };

        if paths.overlay.exists() {
            debug!("removing overlay");
            keep(self.ops.unmount(&paths.rootfs, MNT_DETACH));
        }
        keep(self.ops.unmount(&paths.rootfs, MNT_DETACH));
        keep(fs::remove_dir_all(&paths.root).map_err(Error::from));

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_paths() {
        let p = BundlePaths::new(Path::new("/b"));
        assert_eq!(p.rootfs, PathBuf::from("/b/rootfs"));
        assert_eq!(p.upper, PathBuf::from("/b/overlay/upper"));
        assert_eq!(p.work, PathBuf::from("/b/overlay/work"));
    }

    #[test]
    fn test_spec_readonly_root() {
        let spec = OciSpec::for_image(true);
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"ociVersion\""));
        assert!(spec.root.readonly);
        assert_eq!(spec.root.path, "rootfs");
    }
}
