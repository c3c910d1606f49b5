//! Mount and namespace primitives used by the privileged engine.
//!
//! # Root Replacement
//!
//! [`chroot`] swaps the process root without a spare mount point:
//!
//! ```text
//! fd = open("/")                 hold the host root
//! chdir(new_root)
//! pivot_root(".", ".")           new root on top, old root stacked under it
//! fchdir(fd)                     step onto the old root
//! mount("", ".", MS_SLAVE|MS_REC) host events stop flowing in and out
//! umount2(".", MNT_DETACH)       old root gone, even if busy
//! chdir("/")
//! ```
//!
//! `pivot_root` relocates the root of every thread sharing the filesystem
//! context, so the engine and the RPC server thread land in the new root
//! together.

use crate::error::{ChrootStep, Error, Result};
use std::ffi::{CString, OsStr};
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use tracing::debug;

pub use libc::{
    MNT_DETACH, MS_BIND, MS_NODEV, MS_NOSUID, MS_PRIVATE, MS_RDONLY, MS_REC, MS_REMOUNT,
    MS_SLAVE,
};

fn cstring(s: &OsStr) -> Result<CString> {
    CString::new(s.as_bytes()).map_err(|e| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path contains NUL byte: {}", e),
        ))
    })
}

fn optional(s: &str) -> Result<Option<CString>> {
    if s.is_empty() {
        Ok(None)
    } else {
        cstring(OsStr::new(s)).map(Some)
    }
}

/// `mount(2)`. Empty `fstype` and `data` are passed as NULL.
pub fn mount(source: &str, target: &Path, fstype: &str, flags: u64, data: &str) -> Result<()> {
    let fail = |reason: String| Error::MountFailed {
        source_path: source.to_string(),
        target: target.to_path_buf(),
        reason,
    };

    let c_source = cstring(OsStr::new(source))?;
    let c_target = cstring(target.as_os_str())?;
    let c_fstype = optional(fstype)?;
    let c_data = optional(data)?;

    debug!(source, target = %target.display(), fstype, flags, data, "mount");

    // SAFETY: every pointer is either NULL or a NUL-terminated string that
    // lives until the call returns.
    let rc = unsafe {
        libc::mount(
            c_source.as_ptr(),
            c_target.as_ptr(),
            c_fstype.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
            flags as libc::c_ulong,
            c_data
                .as_ref()
                .map_or(ptr::null(), |s| s.as_ptr() as *const libc::c_void),
        )
    };
    if rc != 0 {
        return Err(fail(io::Error::last_os_error().to_string()));
    }
    Ok(())
}

/// `umount2(2)`.
pub fn unmount(target: &Path, flags: i32) -> Result<()> {
    let c_target = cstring(target.as_os_str())?;
    debug!(target = %target.display(), flags, "unmount");

    // SAFETY: c_target is NUL-terminated and outlives the call.
    if unsafe { libc::umount2(c_target.as_ptr(), flags) } != 0 {
        return Err(Error::UnmountFailed {
            target: target.to_path_buf(),
            reason: io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}

/// Bind-mounts `source` onto `target`, optionally remounting read-only.
pub fn bind(source: &Path, target: &Path, readonly: bool) -> Result<()> {
    let src = source.to_string_lossy();
    mount(&src, target, "", (MS_BIND | MS_REC) as u64, "")?;
    if readonly {
        mount(
            &src,
            target,
            "",
            (MS_BIND | MS_REMOUNT | MS_RDONLY) as u64,
            "",
        )?;
    }
    Ok(())
}

/// Moves the calling process into a new mount namespace whose mounts do not
/// propagate back to the host.
pub fn unshare_mount_namespace() -> Result<()> {
    // SAFETY: unshare only affects the calling task.
    if unsafe { libc::unshare(libc::CLONE_NEWNS) } != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    mount("", Path::new("/"), "", (MS_PRIVATE | MS_REC) as u64, "")
}

/// Replaces the process root with `new_root` using the pivot sequence
/// described in the module docs. No step is retried.
pub fn chroot(new_root: &Path) -> Result<()> {
    let fail = |step: ChrootStep, err: io::Error| Error::ChrootFailed {
        root: new_root.to_path_buf(),
        step,
        reason: err.to_string(),
    };
    let dot = c".";
    let slash = c"/";

    debug!("hold reference to host / directory");
    let old_root = File::open("/").map_err(|e| fail(ChrootStep::OpenOldRoot, e))?;

    debug!(root = %new_root.display(), "change current directory to new root");
    let c_root = cstring(new_root.as_os_str())?;
    // SAFETY: c_root is NUL-terminated.
    if unsafe { libc::chdir(c_root.as_ptr()) } != 0 {
        return Err(fail(ChrootStep::ChdirNewRoot, io::Error::last_os_error()));
    }

    debug!("pivot_root(\".\", \".\")");
    // SAFETY: both arguments are static NUL-terminated strings.
    if unsafe { libc::syscall(libc::SYS_pivot_root, dot.as_ptr(), dot.as_ptr()) } != 0 {
        return Err(fail(ChrootStep::PivotRoot, io::Error::last_os_error()));
    }

    debug!("change current directory to host / directory");
    // SAFETY: old_root is an open directory descriptor.
    if unsafe { libc::fchdir(old_root.as_raw_fd()) } != 0 {
        return Err(fail(ChrootStep::FchdirOldRoot, io::Error::last_os_error()));
    }

    debug!("apply slave mount propagation for host / directory");
    // SAFETY: "." is static; source, fstype and data are unused for a
    // propagation change.
    let rc = unsafe {
        libc::mount(
            c"".as_ptr(),
            dot.as_ptr(),
            ptr::null(),
            (MS_SLAVE | MS_REC) as libc::c_ulong,
            ptr::null(),
        )
    };
    if rc != 0 {
        return Err(fail(ChrootStep::Propagation, io::Error::last_os_error()));
    }

    debug!("detach old root");
    // SAFETY: "." is static.
    if unsafe { libc::umount2(dot.as_ptr(), MNT_DETACH) } != 0 {
        return Err(fail(ChrootStep::DetachOldRoot, io::Error::last_os_error()));
    }

    debug!("change directory to /");
    // SAFETY: "/" is static.
    if unsafe { libc::chdir(slash.as_ptr()) } != 0 {
        return Err(fail(ChrootStep::ChdirRoot, io::Error::last_os_error()));
    }

    Ok(())
}

/// Returns true if `path` is a mount point according to `/proc/self/mountinfo`.
pub fn is_mounted(path: &Path) -> bool {
    let Ok(info) = std::fs::read_to_string("/proc/self/mountinfo") else {
        return false;
    };
    let wanted = path.to_string_lossy();
    info.lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .any(|mount_point| unescape_mountinfo(mount_point) == wanted)
}

fn unescape_mountinfo(s: &str) -> String {
    s.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescape_mountinfo() {
        assert_eq!(unescape_mountinfo("/a\\040b"), "/a b");
        assert_eq!(unescape_mountinfo("/plain"), "/plain");
    }

    #[test]
    fn test_root_is_mounted() {
        assert!(is_mounted(Path::new("/")));
    }

    #[test]
    fn test_cstring_rejects_nul() {
        assert!(cstring(OsStr::new("a\0b")).is_err());
    }

    #[test]
    fn test_mount_nonexistent_target_reports_mount_error() {
        let err = mount(
            "none",
            Path::new("/nonexistent/imgbuild/target"),
            "tmpfs",
            0,
            "",
        )
        .unwrap_err();
        assert!(matches!(err, Error::MountFailed { .. }));
    }
}
