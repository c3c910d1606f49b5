//! # Build Constants
//!
//! Resource limits, timeouts, reserved paths and environment variable names
//! for the build pipeline and the privileged engine. These constants are the
//! **single source of truth** for values shared between the unprivileged
//! orchestrator and the helper process; both sides must agree on them.
//!
//! ## Cross-References
//!
//! - [`crate::sources`]: size limits and timeouts for fetching sources
//! - [`crate::engine`]: environment variables handed to the helper
//! - [`crate::metadata`]: reserved in-image paths
//! - [`crate::loopdev`]: loop device retry bounds

use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================
//
// These limits prevent disk and memory exhaustion from malicious or malformed
// source images. MAX_ROOTFS_SIZE bounds the total extraction regardless of
// how many layers are involved.
// =============================================================================

/// Maximum OCI image reference length in bytes.
///
/// **Security**: Prevents overly long references from reaching the
/// registry client's parser.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of a single compressed layer (512 MiB).
///
/// **Attack Vector**: A malicious registry could serve infinite-length layers.
pub const MAX_LAYER_SIZE: usize = 512 * 1024 * 1024;

/// Maximum total extracted rootfs size (16 GiB).
///
/// Build roots are larger than runtime roots (toolchains, package caches),
/// so this is more generous than a runtime would allow.
///
/// **Attack Vector**: Compression bombs (small compressed, huge uncompressed).
pub const MAX_ROOTFS_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// Maximum number of layers in an OCI image.
pub const MAX_LAYERS: usize = 128;

/// Maximum size of a definition document (1 MiB).
pub const MAX_DEFINITION_SIZE: usize = 1024 * 1024;

/// Maximum size of the serialized engine configuration (16 MiB).
///
/// **Security**: The helper reads the configuration from a pipe before it
/// does anything else; an unbounded read would let a broken parent pin
/// helper memory.
pub const MAX_ENGINE_CONFIG_SIZE: u64 = 16 * 1024 * 1024;

/// Maximum length of a single RPC request or response line (1 MiB).
pub const MAX_RPC_LINE_LEN: usize = 1024 * 1024;

/// Maximum descriptor table size in a packed image header (4 MiB).
pub const MAX_DESCRIPTOR_TABLE_SIZE: u64 = 4 * 1024 * 1024;

// =============================================================================
// Timeouts
// =============================================================================

/// Timeout for registry pulls and remote downloads (30 minutes).
///
/// Covers the manifest fetch and every layer download for one image. Build
/// sources are routinely multi-GiB, so this is longer than a runtime pull.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(1800);

/// Timeout for a single privileged RPC round-trip (2 minutes).
///
/// Mounting a large squashfs over a slow loop device is the slowest call.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// Loop Devices
// =============================================================================

/// Number of times to retry a loop attach that lost a race for a free slot.
///
/// `LOOP_CTL_GET_FREE` returns an index that another process may claim
/// before our `LOOP_SET_FD`; the kernel then reports `EBUSY`.
pub const MAX_LOOP_ATTEMPTS: usize = 16;

/// Path of the loop control device.
pub const LOOP_CONTROL_PATH: &str = "/dev/loop-control";

/// Prefix of loop device nodes (`/dev/loop<N>`).
pub const LOOP_DEVICE_PREFIX: &str = "/dev/loop";

// =============================================================================
// Reserved Paths
// =============================================================================
//
// Paths inside a built root filesystem. All are absolute with respect to the
// image root and are joined onto a bundle's rootfs before use.
// =============================================================================

/// Metadata directory inside every built image.
pub const METADATA_DIR: &str = "/.imgbuild.d";

/// Environment script generated from `%environment` at build time.
pub const ENVIRONMENT_SCRIPT: &str = "/.imgbuild.d/env/90-environment.sh";

/// Environment script that build scripts append to.
pub const BUILD_ENVIRONMENT_SCRIPT: &str = "/.imgbuild.d/env/91-environment.sh";

/// Root of the app (SCIF) tree inside an image.
pub const SCIF_APPS_DIR: &str = "/scif/apps";

/// Root of the app (SCIF) data tree inside an image.
pub const SCIF_DATA_DIR: &str = "/scif/data";

/// Label partition key for the primary system partition.
pub const SYSTEM_PARTITION: &str = "system-partition";

/// Label key prefix for build information.
pub const LABEL_SCHEMA_PREFIX: &str = "org.label-schema";

// =============================================================================
// Environment Variables
// =============================================================================

/// Bundle root path exposed to build scripts.
pub const ENV_ROOTFS: &str = "IMGBUILD_ROOTFS";

/// Environment script path exposed to build scripts.
pub const ENV_ENVIRONMENT: &str = "IMGBUILD_ENVIRONMENT";

/// File descriptor number of the engine configuration pipe in the helper.
pub const ENV_CONFIG_FD: &str = "IMGBUILD_CONFIG_FD";

/// Log level forwarded from the orchestrator to the helper.
pub const ENV_LOG_LEVEL: &str = "IMGBUILD_LOG_LEVEL";

/// Override for the helper binary path.
pub const ENV_ENGINE: &str = "IMGBUILD_ENGINE";

/// Override for the temporary bundle directory.
pub const ENV_TMPDIR: &str = "IMGBUILD_TMPDIR";

/// Override for the image cache directory.
pub const ENV_CACHEDIR: &str = "IMGBUILD_CACHEDIR";

/// Override for the library download endpoint.
pub const ENV_LIBRARY_URL: &str = "IMGBUILD_LIBRARY_URL";

/// Override for the hub download endpoint.
pub const ENV_SHUB_URL: &str = "IMGBUILD_SHUB_URL";

// =============================================================================
// Defaults
// =============================================================================

/// Name of the helper binary, looked up next to the running executable.
pub const ENGINE_BINARY: &str = "imgbuild-engine";

/// Engine name for build-script execution.
pub const BUILD_ENGINE_NAME: &str = "imgbuild";

/// Engine name for inspection queries.
pub const QUERY_ENGINE_NAME: &str = "query";

/// Container ID used for build engine invocations.
pub const BUILD_CONTAINER_ID: &str = "image-build";

/// Default library endpoint for `library://` sources.
pub const DEFAULT_LIBRARY_URL: &str = "https://library.sylabs.io";

/// Default hub endpoint for `shub://` sources.
pub const DEFAULT_SHUB_URL: &str = "https://singularity-hub.org";

/// Prefix of bundle working directory names.
pub const BUNDLE_PREFIX: &str = "sbuild";

/// Subdirectory for the content-addressed blob cache.
pub const BLOB_CACHE_DIR: &str = "blobs";

/// Subdirectory for downloaded packed images.
pub const IMAGE_CACHE_DIR: &str = "images";

/// OCI Runtime Spec version for generated `config.json`.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

/// Label schema version written into every image.
pub const LABEL_SCHEMA_VERSION: &str = "1.0";

// =============================================================================
// Validation
// =============================================================================

/// Valid characters for stage and app names.
///
/// **Security**: Names become path components under the bundle tree and
/// under `/scif/apps`; `/` and `.` are excluded.
pub const NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// Maximum stage or app name length.
pub const MAX_NAME_LEN: usize = 128;

/// Validates a stage or app name before it is used in a path.
#[inline]
#[must_use = "validation result must be checked before using the name in a path"]
pub fn validate_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("name cannot be empty");
    }
    if name.len() > MAX_NAME_LEN {
        return Err("name exceeds maximum length");
    }
    if !name.chars().all(|c| NAME_VALID_CHARS.contains(c)) {
        return Err("name contains invalid characters");
    }
    Ok(())
}
