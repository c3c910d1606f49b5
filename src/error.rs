//! Error types for the image build pipeline and privileged engine.
//!
//! Variants are grouped by how the pipeline reacts to them:
//!
//! | Group          | Reaction                                              |
//! |----------------|-------------------------------------------------------|
//! | Configuration  | fatal before any stage does I/O                       |
//! | Privilege      | fatal, never retried                                  |
//! | Resource       | fatal for the operation, reverse-order teardown first |
//! | Transport      | surfaced as an engine failure, pipeline aborts        |
//! | Source / Build | fatal for the stage, bundles still cleaned up         |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Result type alias for build operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Individual steps of the pivot-root sequence used by [`crate::mount::chroot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChrootStep {
    /// Opening a descriptor to the current `/`.
    OpenOldRoot,
    /// `chdir` into the new root.
    ChdirNewRoot,
    /// `pivot_root(".", ".")`.
    PivotRoot,
    /// `fchdir` back to the old root descriptor.
    FchdirOldRoot,
    /// Switching the old root's propagation to slave.
    Propagation,
    /// Lazy unmount of the old root.
    DetachOldRoot,
    /// Final `chdir("/")`.
    ChdirRoot,
}

impl fmt::Display for ChrootStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OpenOldRoot => "open host root directory",
            Self::ChdirNewRoot => "change directory to new root",
            Self::PivotRoot => "pivot_root",
            Self::FchdirOldRoot => "change directory to old root",
            Self::Propagation => "apply slave propagation to host root",
            Self::DetachOldRoot => "detach old root",
            Self::ChdirRoot => "change directory to /",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while building or inspecting images.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Definition header has no `bootstrap` key, or it is empty.
    #[error("no bootstrap specification found")]
    NoBootstrap,

    /// Definition header names a source kind this builder does not know.
    #[error("invalid build source {0}")]
    InvalidBootstrap(String),

    /// Multi-stage build where a definition lacks a `stage` header.
    #[error("multiple definitions given but definition {index} has no stage name")]
    MissingStageName { index: usize },

    /// File-copy directive names a stage that was not built before it.
    #[error("stage {0} was not found")]
    StageNotFound(String),

    /// Requested output format is not one of `flat-tree`, `packed-image`.
    #[error("unrecognized output format {0}")]
    UnsupportedFormat(String),

    /// Source needs the image cache but none was configured.
    #[error("undefined image cache")]
    UndefinedImageCache,

    /// Definition could not be parsed or is otherwise malformed.
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    // =========================================================================
    // Privilege Errors
    // =========================================================================
    /// Operation needs root and the caller is not root.
    #[error("{0}")]
    PrivilegeRequired(String),

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// `mount(2)` failed.
    #[error("failed to mount {source_path} on {target}: {reason}")]
    MountFailed {
        source_path: String,
        target: PathBuf,
        reason: String,
    },

    /// `umount2(2)` failed.
    #[error("failed to unmount {target}: {reason}")]
    UnmountFailed { target: PathBuf, reason: String },

    /// No loop device could be attached.
    #[error("failed to attach loop device: {0}")]
    LoopAttachFailed(String),

    /// Loop device attached but its status could not be set.
    #[error("failed to set status on loop device {device}: {reason}")]
    LoopStatusFailed { device: u32, reason: String },

    /// Loop device detach failed.
    #[error("failed to detach loop device {device}: {reason}")]
    LoopDetachFailed { device: u32, reason: String },

    /// One step of the pivot-root sequence failed.
    #[error("chroot to {root} failed at '{step}': {reason}")]
    ChrootFailed {
        root: PathBuf,
        step: ChrootStep,
        reason: String,
    },

    /// Primary partition is not a squashfs filesystem.
    #[error("unsupported image filesystem type: {0}")]
    UnsupportedFilesystem(String),

    /// Packed image carries no system partition.
    #[error("no primary partition found in {0}")]
    NoPrimaryPartition(PathBuf),

    /// Packed image header or descriptor table is malformed.
    #[error("invalid image {path}: {reason}")]
    InvalidImage { path: PathBuf, reason: String },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Engine configuration could not be handed to the helper.
    #[error("failed to stream engine configuration: {0}")]
    ConfigChannel(String),

    /// Helper process exited unsuccessfully.
    #[error("engine exited with status {code:?}")]
    EngineExit { code: Option<i32> },

    /// Privileged call failed on the helper side or the channel broke.
    #[error("rpc {method} failed: {reason}")]
    Rpc { method: String, reason: String },

    // =========================================================================
    // Source Errors
    // =========================================================================
    /// Failed to parse an image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Image pull or download failed.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    /// Layer extraction failed.
    #[error("failed to extract layer {digest}: {reason}")]
    LayerExtractionFailed { digest: String, reason: String },

    /// Image size exceeded limits.
    #[error("image exceeds size limit: {size} > {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    /// Path traversal attempt detected in tar archive.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    /// External tool needed by a source is not installed.
    #[error("required tool '{0}' not found in PATH")]
    ToolNotFound(String),

    /// Conveyor fetch step failed.
    #[error("conveyor failed to get: {0}")]
    FetchFailed(String),

    /// Packer step failed.
    #[error("packer failed to pack: {0}")]
    PackFailed(String),

    // =========================================================================
    // Build Errors
    // =========================================================================
    /// A build script exited unsuccessfully.
    #[error("{section} script failed with status {code:?}")]
    ScriptFailed { section: String, code: Option<i32> },

    /// File-copy collaborator failed.
    #[error("failed to copy {src} to {dst}: {reason}")]
    CopyFailed {
        src: PathBuf,
        dst: PathBuf,
        reason: String,
    },

    /// Assembler could not produce the artifact.
    #[error("assembler failed: {0}")]
    AssembleFailed(String),

    /// Pipeline was cancelled.
    #[error("build interrupted")]
    Interrupted,

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Cache initialization failed.
    #[error("failed to initialize image cache at {path}: {reason}")]
    CacheInitFailed { path: PathBuf, reason: String },

    /// Blob not found in cache.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Cache write failed.
    #[error("failed to write to image cache: {0}")]
    CacheWriteFailed(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for errors detected from configuration alone.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::NoBootstrap
                | Self::InvalidBootstrap(_)
                | Self::MissingStageName { .. }
                | Self::StageNotFound(_)
                | Self::UnsupportedFormat(_)
                | Self::UndefinedImageCache
                | Self::InvalidDefinition(_)
        )
    }

    /// Returns true if the caller lacked required privilege.
    pub fn is_privilege(&self) -> bool {
        matches!(self, Self::PrivilegeRequired(_))
    }

    /// Builds a [`Error::PrivilegeRequired`] with the given message.
    pub fn privilege(message: impl Into<String>) -> Self {
        Self::PrivilegeRequired(message.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
