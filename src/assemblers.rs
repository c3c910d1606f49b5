//! Assemblers turn the last stage's bundle into the build artifact.
//!
//! | Format         | Assembler                  | Artifact                      |
//! |----------------|----------------------------|-------------------------------|
//! | `flat-tree`    | [`FlatTreeAssembler`]      | directory (rootfs renamed)    |
//! | `packed-image` | [`PackedImageAssembler`]   | squashfs + labels + definition|
//!
//! The destination has a single writer: only the sequencer calls
//! [`Assembler::assemble`], once, after every stage has finished.

use crate::bundle::Bundle;
use crate::config::OutputFormat;
use crate::constants::SYSTEM_PARTITION;
use crate::error::{Error, Result};
use crate::image::{FsType, ImageWriter, PartType};
use crate::metadata;
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Produces the final artifact at `dest`.
#[async_trait]
pub trait Assembler: Send + Sync {
    async fn assemble(&self, bundle: &mut Bundle, dest: &Path) -> Result<()>;
}

/// Assembler for `format`.
pub fn for_format(format: OutputFormat) -> Box<dyn Assembler> {
    match format {
        OutputFormat::FlatTree => Box::new(FlatTreeAssembler),
        OutputFormat::PackedImage => Box::new(PackedImageAssembler::default()),
    }
}

// =============================================================================
// Flat tree
// =============================================================================

/// Moves the rootfs to the destination.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatTreeAssembler;

#[async_trait]
impl Assembler for FlatTreeAssembler {
    async fn assemble(&self, bundle: &mut Bundle, dest: &Path) -> Result<()> {
        if dest.exists() {
            debug!(dest = %dest.display(), "replacing existing destination");
            if dest.is_dir() {
                fs::remove_dir_all(dest)?;
            } else {
                fs::remove_file(dest)?;
            }
        }
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        info!(dest = %dest.display(), "assembling flat tree");
        match fs::rename(&bundle.rootfs, dest) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                debug!("destination on another filesystem, copying");
                copy_tree(&bundle.rootfs, dest).await?;
            }
            Err(e) => {
                return Err(Error::AssembleFailed(format!(
                    "rename {} to {}: {}",
                    bundle.rootfs.display(),
                    dest.display(),
                    e
                )));
            }
        }
        Ok(())
    }
}

async fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let output = Command::new("cp").arg("-a").arg(src).arg(dst).output().await?;
    if !output.status.success() {
        return Err(Error::AssembleFailed(format!(
            "cp -a {} {}: {}",
            src.display(),
            dst.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

// =============================================================================
// Packed image
// =============================================================================

/// Squashes the rootfs and writes a packed image.
#[derive(Debug, Clone)]
pub struct PackedImageAssembler {
    /// Preferred squashfs compressor, used if `mksquashfs` supports it.
    pub compressor: String,
}

impl Default for PackedImageAssembler {
    fn default() -> Self {
        Self {
            compressor: "gzip".to_string(),
        }
    }
}

impl PackedImageAssembler {
    /// Probes `mksquashfs -help` and returns the flags to pass.
    ///
    /// Old builds lack `-comp`; builds without the preferred compressor
    /// fall back to their default.
    async fn compression_flags(&self, mksquashfs: &Path) -> Vec<String> {
        let output = match Command::new(mksquashfs).arg("-help").output().await {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "cannot probe mksquashfs, using defaults");
                return Vec::new();
            }
        };
        let mut help = String::from_utf8_lossy(&output.stdout).to_string();
        help.push_str(&String::from_utf8_lossy(&output.stderr));
        compression_flags(&help, &self.compressor)
    }
}

/// Flags selecting `compressor` if the `mksquashfs` help text lists it.
pub fn compression_flags(help: &str, compressor: &str) -> Vec<String> {
    if !help.contains("-comp") {
        return Vec::new();
    }
    let supported = help
        .lines()
        .map(str::trim)
        .any(|l| l.split_whitespace().next() == Some(compressor));
    if supported {
        vec!["-comp".to_string(), compressor.to_string()]
    } else {
        Vec::new()
    }
}

#[async_trait]
impl Assembler for PackedImageAssembler {
    async fn assemble(&self, bundle: &mut Bundle, dest: &Path) -> Result<()> {
        let mksquashfs =
            which::which("mksquashfs").map_err(|_| Error::ToolNotFound("mksquashfs".to_string()))?;
        let squash: PathBuf = bundle.tmp.join("rootfs.squashfs");
        let _ = fs::remove_file(&squash);

        let mut cmd = Command::new(&mksquashfs);
        cmd.arg(&bundle.rootfs).arg(&squash).arg("-noappend");
        cmd.args(self.compression_flags(&mksquashfs).await);

        info!(dest = %dest.display(), "squashing root filesystem");
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(Error::AssembleFailed(format!(
                "mksquashfs: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let size = fs::metadata(&squash)?.len();
        metadata::set_image_size(bundle, size);

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let labels = bundle.labels.clone();
        let definition = bundle.recipe.render();
        let dest_owned = dest.to_path_buf();
        let written = tokio::task::spawn_blocking(move || -> Result<u64> {
            ImageWriter::new()
                .add_partition_file(SYSTEM_PARTITION, &squash, FsType::Squashfs, PartType::System)
                .add_labels(&labels)?
                .add_definition(&definition)
                .write(&dest_owned)
        })
        .await
        .map_err(|e| Error::Internal(format!("image writer panicked: {}", e)))??;

        debug!(bytes = written, "packed image written");
        Ok(())
    }
}
