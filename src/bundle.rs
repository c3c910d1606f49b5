//! Per-stage working directory.
//!
//! A [`Bundle`] owns one uniquely named directory under the configured
//! temp location:
//!
//! ```text
//! <tmp_dir>/sbuild-<uuid>/
//! ├── rootfs/     ← root filesystem being built
//! └── tmp/        ← scratch space for sources (downloads, archives)
//! ```
//!
//! The bundle is serialized into the engine configuration, so everything
//! the helper needs (paths, recipe, options) is plain data.

use crate::config::Options;
use crate::constants::SYSTEM_PARTITION;
use crate::definition::Definition;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Labels keyed by partition name, then label key.
pub type Labels = BTreeMap<String, BTreeMap<String, String>>;

/// Working directory and accumulated metadata for one build stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    /// Bundle working directory.
    pub path: PathBuf,
    /// Root filesystem being built.
    pub rootfs: PathBuf,
    /// Scratch directory for sources.
    pub tmp: PathBuf,
    /// Recipe for this stage.
    pub recipe: Definition,
    /// Build options.
    pub opts: Options,
    /// Accumulated labels.
    #[serde(default)]
    pub labels: Labels,
}

impl Bundle {
    /// Creates a bundle under `parent` named `<prefix>-<uuid>`.
    pub fn new(parent: &Path, prefix: &str) -> Result<Self> {
        let path = parent.join(format!("{}-{}", prefix, uuid::Uuid::now_v7()));
        let rootfs = path.join("rootfs");
        let tmp = path.join("tmp");

        for dir in [&rootfs, &tmp] {
            fs::create_dir_all(dir).map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to create {}: {}", dir.display(), e),
                ))
            })?;
        }

        debug!(bundle = %path.display(), "created bundle");

        Ok(Self {
            path,
            rootfs,
            tmp,
            recipe: Definition::default(),
            opts: Options::default(),
            labels: Labels::new(),
        })
    }

    /// Root filesystem path.
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Returns true if `section` is selected by the build options.
    pub fn run_section(&self, section: &str) -> bool {
        self.opts
            .sections
            .iter()
            .any(|s| s == "all" || s == section)
    }

    /// Mutable access to the labels of one partition, created on demand.
    pub fn partition_labels(&mut self, partition: &str) -> &mut BTreeMap<String, String> {
        self.labels.entry(partition.to_string()).or_default()
    }

    /// Mutable access to the system partition labels.
    pub fn system_labels(&mut self) -> &mut BTreeMap<String, String> {
        self.partition_labels(SYSTEM_PARTITION)
    }

    /// Joins an image-absolute path (`/etc/hosts`) onto the rootfs.
    pub fn in_rootfs(&self, path: impl AsRef<Path>) -> PathBuf {
        crate::files::add_prefix(&self.rootfs, path.as_ref())
    }
}
