//! Tests for packed-image materialization.
//!
//! Drives the materializer through a recording fake of the privileged
//! operations so acquisition order, rollback and teardown can be checked
//! without root.

use imgbuild::Materializer;
use imgbuild::constants::SYSTEM_PARTITION;
use imgbuild::error::{Error, Result};
use imgbuild::image::{FsType, ImageWriter, PartType};
use imgbuild::loopdev::{ImageRef, LoopInfo, LoopMode};
use imgbuild::mount::is_mounted;
use imgbuild::rpc::{Methods, PrivilegedOps};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Mount { fstype: String, target: PathBuf },
    Unmount(PathBuf),
    Mkdir(PathBuf),
    LoopAttach,
    LoopDetach(u32),
}

#[derive(Default)]
struct FakeOps {
    calls: Vec<Call>,
    fail_mount: Option<&'static str>,
    fail_unmount: bool,
    fail_status: bool,
}

impl PrivilegedOps for FakeOps {
    fn mount(&mut self, source: &str, target: &Path, fstype: &str, _: u64, _: &str) -> Result<()> {
        self.calls.push(Call::Mount {
            fstype: fstype.to_string(),
            target: target.to_path_buf(),
        });
        if self.fail_mount == Some(fstype) {
            return Err(Error::MountFailed {
                source_path: source.to_string(),
                target: target.to_path_buf(),
                reason: "EINVAL".to_string(),
            });
        }
        Ok(())
    }

    fn unmount(&mut self, target: &Path, _: i32) -> Result<()> {
        self.calls.push(Call::Unmount(target.to_path_buf()));
        if self.fail_unmount {
            return Err(Error::UnmountFailed {
                target: target.to_path_buf(),
                reason: "EBUSY".to_string(),
            });
        }
        Ok(())
    }

    fn mkdir(&mut self, path: &Path, _: u32) -> Result<()> {
        self.calls.push(Call::Mkdir(path.to_path_buf()));
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn loop_attach(&mut self, _: &ImageRef, _: LoopMode, _: &LoopInfo) -> Result<u32> {
        self.calls.push(Call::LoopAttach);
        if self.fail_status {
            return Err(Error::LoopStatusFailed {
                device: 7,
                reason: "EIO".to_string(),
            });
        }
        Ok(3)
    }

    fn loop_detach(&mut self, device: u32) -> Result<()> {
        self.calls.push(Call::LoopDetach(device));
        Ok(())
    }

    fn chroot(&mut self, _: &Path) -> Result<()> {
        unreachable!("materializer never changes root")
    }
}

fn write_image(dir: &Path, fs_type: FsType) -> PathBuf {
    let path = dir.join("image.img");
    ImageWriter::new()
        .add_partition_bytes(SYSTEM_PARTITION, vec![0u8; 8192], fs_type, PartType::System)
        .write(&path)
        .unwrap();
    path
}

// =============================================================================
// Create Tests
// =============================================================================

#[test]
fn test_read_only_bundle_has_no_overlay() {
    let temp = TempDir::new().unwrap();
    let image = write_image(temp.path(), FsType::Squashfs);
    let bundle = temp.path().join("bundle");
    let rootfs = bundle.join("rootfs");

    let mut ops = FakeOps::default();
    Materializer::new(&mut ops).create(&image, &bundle, false).unwrap();

    assert_eq!(
        ops.calls,
        vec![
            Call::Mkdir(rootfs.clone()),
            Call::LoopAttach,
            Call::Mount {
                fstype: "squashfs".to_string(),
                target: rootfs,
            },
            Call::LoopDetach(3),
        ]
    );
    assert!(!bundle.join("overlay").exists(), "no overlay dirs when read-only");

    let config = fs::read_to_string(bundle.join("config.json")).unwrap();
    assert!(config.contains("\"readonly\": true"));
}

#[test]
fn test_writable_bundle_mounts_overlay_last() {
    let temp = TempDir::new().unwrap();
    let image = write_image(temp.path(), FsType::Squashfs);
    let bundle = temp.path().join("bundle");

    let mut ops = FakeOps::default();
    Materializer::new(&mut ops).create(&image, &bundle, true).unwrap();

    assert!(bundle.join("overlay/upper").is_dir());
    assert!(bundle.join("overlay/work").is_dir());
    assert_eq!(
        ops.calls.last(),
        Some(&Call::Mount {
            fstype: "overlay".to_string(),
            target: bundle.join("rootfs"),
        })
    );
}

#[test]
fn test_unsupported_filesystem_rejected() {
    let temp = TempDir::new().unwrap();
    let image = write_image(temp.path(), FsType::Ext3);
    let bundle = temp.path().join("bundle");

    let mut ops = FakeOps::default();
    let err = Materializer::new(&mut ops)
        .create(&image, &bundle, false)
        .unwrap_err();

    assert!(matches!(err, Error::UnsupportedFilesystem(ref t) if t == "ext3"));
    assert!(ops.calls.is_empty(), "nothing acquired");
    assert!(!bundle.exists());
}

#[test]
fn test_status_failure_detaches_device() {
    let temp = TempDir::new().unwrap();
    let image = write_image(temp.path(), FsType::Squashfs);
    let bundle = temp.path().join("bundle");

    let mut ops = FakeOps {
        fail_status: true,
        ..FakeOps::default()
    };
    let err = Materializer::new(&mut ops)
        .create(&image, &bundle, false)
        .unwrap_err();

    assert!(matches!(err, Error::LoopStatusFailed { device: 7, .. }));
    assert!(ops.calls.contains(&Call::LoopDetach(7)));
    assert!(!bundle.exists(), "bundle directory rolled back");
}

#[test]
fn test_mount_failure_rolls_back() {
    let temp = TempDir::new().unwrap();
    let image = write_image(temp.path(), FsType::Squashfs);
    let bundle = temp.path().join("bundle");

    let mut ops = FakeOps {
        fail_mount: Some("squashfs"),
        ..FakeOps::default()
    };
    let err = Materializer::new(&mut ops)
        .create(&image, &bundle, false)
        .unwrap_err();

    assert!(matches!(err, Error::MountFailed { .. }));
    assert_eq!(ops.calls.last(), Some(&Call::LoopDetach(3)));
    assert!(
        !ops.calls.iter().any(|c| matches!(c, Call::Unmount(_))),
        "nothing mounted, nothing to unmount"
    );
    assert!(!bundle.exists());
}

#[test]
fn test_overlay_failure_unmounts_rootfs() {
    let temp = TempDir::new().unwrap();
    let image = write_image(temp.path(), FsType::Squashfs);
    let bundle = temp.path().join("bundle");

    let mut ops = FakeOps {
        fail_mount: Some("overlay"),
        ..FakeOps::default()
    };
    Materializer::new(&mut ops)
        .create(&image, &bundle, true)
        .unwrap_err();

    let unmounts = ops
        .calls
        .iter()
        .filter(|c| matches!(c, Call::Unmount(_)))
        .count();
    assert_eq!(unmounts, 1, "only the squashfs mount was acquired");
    assert!(!bundle.exists());
}

// =============================================================================
// Delete Tests
// =============================================================================

#[test]
fn test_delete_unmounts_overlay_first() {
    let temp = TempDir::new().unwrap();
    let image = write_image(temp.path(), FsType::Squashfs);
    let bundle = temp.path().join("bundle");

    let mut ops = FakeOps::default();
    Materializer::new(&mut ops).create(&image, &bundle, true).unwrap();
    ops.calls.clear();

    Materializer::new(&mut ops).delete(&bundle).unwrap();

    let rootfs = bundle.join("rootfs");
    assert_eq!(
        ops.calls,
        vec![Call::Unmount(rootfs.clone()), Call::Unmount(rootfs)]
    );
    assert!(!bundle.exists());
}

#[test]
fn test_delete_read_only_unmounts_once() {
    let temp = TempDir::new().unwrap();
    let image = write_image(temp.path(), FsType::Squashfs);
    let bundle = temp.path().join("bundle");

    let mut ops = FakeOps::default();
    Materializer::new(&mut ops).create(&image, &bundle, false).unwrap();
    ops.calls.clear();

    Materializer::new(&mut ops).delete(&bundle).unwrap();
    assert_eq!(ops.calls, vec![Call::Unmount(bundle.join("rootfs"))]);
}

#[test]
fn test_delete_continues_after_error() {
    let temp = TempDir::new().unwrap();
    let image = write_image(temp.path(), FsType::Squashfs);
    let bundle = temp.path().join("bundle");

    let mut ops = FakeOps::default();
    Materializer::new(&mut ops).create(&image, &bundle, true).unwrap();
    ops.calls.clear();
    ops.fail_unmount = true;

    let err = Materializer::new(&mut ops).delete(&bundle).unwrap_err();
    assert!(matches!(err, Error::UnmountFailed { .. }));
    assert_eq!(ops.calls.len(), 2, "every unmount attempted");
    assert!(!bundle.exists(), "directory removed despite unmount errors");
}

// =============================================================================
// Real Device Tests (root only)
// =============================================================================

fn can_use_loop_devices() -> bool {
    // SAFETY: geteuid has no preconditions.
    (unsafe { libc::geteuid() }) == 0
        && Path::new("/dev/loop-control").exists()
        && which::which("mksquashfs").is_ok()
}

/// Source device of the mount at `target`, from `/proc/self/mountinfo`.
fn mount_source(target: &Path) -> Option<String> {
    let info = fs::read_to_string("/proc/self/mountinfo").ok()?;
    let wanted = target.to_string_lossy();
    info.lines().find_map(|line| {
        let (left, right) = line.split_once(" - ")?;
        if left.split_whitespace().nth(4)? != wanted {
            return None;
        }
        right.split_whitespace().nth(1).map(str::to_string)
    })
}

fn loop_backing_file(index: u32) -> Option<String> {
    fs::read_to_string(format!("/sys/block/loop{}/loop/backing_file", index))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn write_squashfs_image(dir: &Path) -> PathBuf {
    let tree = dir.join("tree");
    fs::create_dir_all(tree.join("etc")).unwrap();
    fs::write(tree.join("etc/os-release"), "ID=test\n").unwrap();

    let squash = dir.join("root.squashfs");
    let status = std::process::Command::new("mksquashfs")
        .arg(&tree)
        .arg(&squash)
        .args(["-noappend", "-quiet"])
        .status()
        .unwrap();
    assert!(status.success());

    let image = dir.join("image.img");
    ImageWriter::new()
        .add_partition_file(SYSTEM_PARTITION, &squash, FsType::Squashfs, PartType::System)
        .write(&image)
        .unwrap();
    image
}

#[test]
fn test_real_create_delete_leaves_no_residue() {
    if !can_use_loop_devices() {
        return;
    }
    let temp = TempDir::new().unwrap();
    let image = write_squashfs_image(temp.path());
    let backing = fs::canonicalize(&image).unwrap().to_string_lossy().to_string();

    for writable in [false, true] {
        let bundle = temp.path().join(format!("bundle-{}", writable));
        let rootfs = bundle.join("rootfs");
        let mut ops = Methods::new();

        Materializer::new(&mut ops).create(&image, &bundle, writable).unwrap();
        assert!(is_mounted(&rootfs));
        assert_eq!(
            fs::read_to_string(rootfs.join("etc/os-release")).unwrap(),
            "ID=test\n"
        );
        assert!(ops.attached().is_empty(), "device handle released after mount");

        let device: u32 = match mount_source(&rootfs) {
            Some(source) if writable => {
                assert_eq!(source, "overlay");
                None
            }
            Some(source) => source.strip_prefix("/dev/loop").and_then(|n| n.parse().ok()),
            None => None,
        }
        .or_else(|| {
            // The overlay hides the squashfs mount; find the loop device by
            // its backing file instead.
            (0..256).find(|i| loop_backing_file(*i).is_some_and(|f| f == backing))
        })
        .expect("loop device backing the image");

        Materializer::new(&mut ops).delete(&bundle).unwrap();

        assert!(!is_mounted(&rootfs), "no mount left at the rootfs");
        assert!(!bundle.exists());

        let mut released = false;
        for _ in 0..50 {
            if loop_backing_file(device).is_none_or(|f| f != backing) {
                released = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        assert!(released, "loop{} still backed by the image", device);
    }
}
