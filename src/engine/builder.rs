//! Helper-side `imgbuild` engine.
//!
//! ```text
//! setup (host) → %files from host → private namespace + binds
//!              → Chroot RPC → post → test
//! ```
//!
//! Everything after the chroot runs inside the bundle's root filesystem.
//! Mounts made here live in the helper's private mount namespace and vanish
//! when the helper exits.

use super::{BuildEngineConfig, ProcessSpec, run_section, shell, with_rpc};
use crate::bundle::Bundle;
use crate::error::Result;
use crate::files;
use crate::mount::{MS_BIND, MS_REC};
use crate::rpc::PrivilegedOps;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Host directories bound into the root before chroot.
const BIND_DIRS: &[&str] = &["/proc", "/sys", "/dev"];

/// Host files bound into the root so networking works from scripts.
const BIND_FILES: &[&str] = &["/etc/resolv.conf", "/etc/hosts"];

/// Runs the build engine.
pub fn run(config: &BuildEngineConfig) -> Result<()> {
    let bundle = &config.bundle;
    let build = &bundle.recipe.build_data;
    let process = &config.process;

    if bundle.run_section("setup") && !build.setup.trim().is_empty() {
        run_section("setup", &mut shell(&build.setup, process, &bundle.path))?;
    }

    if bundle.run_section("files") {
        copy_host_files(bundle)?;
    }

    let post = bundle.run_section("post") && !build.post.trim().is_empty();
    let test =
        !bundle.opts.no_test && bundle.run_section("test") && !build.test.trim().is_empty();
    if !post && !test {
        debug!("no in-root sections to run");
        return Ok(());
    }

    with_rpc(|client| {
        prepare_root(client, &bundle.rootfs)?;
        client.chroot(&bundle.rootfs)?;
        run_in_root(bundle, process, post, test)
    })
}

fn run_in_root(bundle: &Bundle, process: &ProcessSpec, post: bool, test: bool) -> Result<()> {
    let build = &bundle.recipe.build_data;
    let cwd = if process.cwd.as_os_str().is_empty() {
        Path::new("/")
    } else {
        process.cwd.as_path()
    };

    if post {
        run_section("post", &mut shell(&build.post, process, cwd))?;
    }
    if test {
        run_section("test", &mut shell(&build.test, process, cwd))?;
    }
    Ok(())
}

/// Copies `%files` entries without a source stage from the host into the
/// rootfs. Entries without `src` are skipped; missing `dst` means `src`.
pub fn copy_host_files(bundle: &Bundle) -> Result<()> {
    for copy in bundle.recipe.build_data.files.iter().filter(|c| c.stage.is_none()) {
        for transfer in &copy.files {
            if transfer.src.is_empty() {
                warn!("attempt to copy file with no name, skipping");
                continue;
            }
            let dst = if transfer.dst.is_empty() {
                &transfer.src
            } else {
                &transfer.dst
            };
            info!(src = %transfer.src, dst = %dst, "copying host file");
            files::copy(Path::new(&transfer.src), &bundle.in_rootfs(dst))?;
        }
    }
    Ok(())
}

/// Makes `rootfs` a mount point and binds the host's kernel filesystems
/// and name resolution files into it.
pub fn prepare_root(ops: &mut dyn PrivilegedOps, rootfs: &Path) -> Result<()> {
    let root = rootfs.to_string_lossy();
    ops.mount(&root, rootfs, "", MS_BIND | MS_REC, "")?;

    for dir in BIND_DIRS {
        let target = files::add_prefix(rootfs, Path::new(dir));
        ops.mkdir(&target, 0o755)?;
        ops.mount(dir, &target, "", MS_BIND | MS_REC, "")?;
    }

    for file in BIND_FILES {
        if !Path::new(file).exists() {
            continue;
        }
        let target = files::add_prefix(rootfs, Path::new(file));
        ensure_file(ops, &target)?;
        ops.mount(file, &target, "", MS_BIND, "")?;
    }
    Ok(())
}

/// Creates an empty file at `path` (and its parent) so it can serve as a
/// bind target.
fn ensure_file(ops: &mut dyn PrivilegedOps, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ops.mkdir(parent, 0o755)?;
    }
    if !path.exists() {
        OpenOptions::new().create(true).truncate(false).write(true).open(path)?;
    }
    Ok(())
}

/// Bind targets `prepare_root` creates under `rootfs`.
pub fn bind_targets(rootfs: &Path) -> Vec<PathBuf> {
    BIND_DIRS
        .iter()
        .chain(BIND_FILES)
        .map(|p| files::add_prefix(rootfs, Path::new(p)))
        .collect()
}
