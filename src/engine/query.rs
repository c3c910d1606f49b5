//! Helper-side `query` engine: enter an image and run one command.

use super::{QueryEngineConfig, run_section, with_rpc};
use crate::error::{Error, Result};
use crate::mount::{MS_BIND, MS_RDONLY, MS_REC, MS_REMOUNT};
use crate::ocibundle::{BundlePaths, Materializer};
use crate::rpc::PrivilegedOps;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Runs the query engine.
pub fn run(config: &QueryEngineConfig) -> Result<()> {
    let Some((program, args)) = config.process.args.split_first() else {
        return Err(Error::Internal("query without a command".to_string()));
    };

    with_rpc(|client| {
        let root = enter_image(client, &config.image, &config.bundle_path)?;
        client.chroot(&root)?;

        let cwd = if config.process.cwd.as_os_str().is_empty() {
            Path::new("/")
        } else {
            config.process.cwd.as_path()
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(config.process.env_pairs())
            .current_dir(cwd);
        run_section("query", &mut cmd)
    })
}

/// Makes `image` available as a mount point and returns the root to pivot
/// into. Directories are bound read-only; packed images are materialized
/// at `bundle_path`.
pub fn enter_image(
    ops: &mut dyn PrivilegedOps,
    image: &Path,
    bundle_path: &Path,
) -> Result<PathBuf> {
    if image.is_dir() {
        debug!(image = %image.display(), "querying directory image");
        let source = image.to_string_lossy();
        ops.mount(&source, image, "", MS_BIND | MS_REC, "")?;
        ops.mount(&source, image, "", MS_BIND | MS_REMOUNT | MS_RDONLY, "")?;
        return Ok(image.to_path_buf());
    }

    debug!(image = %image.display(), "querying packed image");
    Materializer::new(ops).create(image, bundle_path, false)?;
    Ok(BundlePaths::new(bundle_path).rootfs)
}
