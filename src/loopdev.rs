//! # Loop Device Manager
//!
//! Attaches a byte range of an open file as a block device so that a
//! filesystem embedded in a packed image can be mounted directly.
//!
//! ## Attach Sequence
//!
//! ```text
//! /dev/loop-control ──LOOP_CTL_GET_FREE──► N
//! /dev/loopN        ──LOOP_SET_FD(image)──► attached   (EBUSY → retry)
//! /dev/loopN        ──LOOP_SET_STATUS64───► offset, sizelimit, flags
//! ```
//!
//! A status failure leaves the device attached. The caller learns the
//! device index from [`Error::LoopStatusFailed`] and must detach it.
//!
//! ## Identity Elevation
//!
//! Opening `/dev/loopN` may require filesystem identity 0 even when the
//! helper runs setuid with a different fsuid. The filesystem uid is a
//! per-thread attribute, so elevation happens through [`FsuidGuard`] on a
//! dedicated scoped worker thread (see [`attach_pinned`]); no other thread
//! ever observes the elevated identity.

use crate::constants::{LOOP_CONTROL_PATH, LOOP_DEVICE_PREFIX, MAX_LOOP_ATTEMPTS};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::PathBuf;
use tracing::{debug, warn};

// =============================================================================
// Kernel Interface
// =============================================================================

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

/// Device is read-only.
pub const LO_FLAGS_READ_ONLY: u32 = 1;
/// Device detaches itself when its last reference goes away.
pub const LO_FLAGS_AUTOCLEAR: u32 = 4;

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// `struct loop_info64` from `<linux/loop.h>`.
#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

// =============================================================================
// Public Types
// =============================================================================

/// Device parameters applied after attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopInfo {
    /// Byte offset of the range within the backing file.
    pub offset: u64,
    /// Length of the range; 0 means "to end of file".
    pub size_limit: u64,
    /// `LO_FLAGS_*` bits.
    pub flags: u32,
}

impl LoopInfo {
    /// Read-only, autoclearing view of `length` bytes at `offset`.
    pub fn read_only(offset: u64, length: u64) -> Self {
        Self {
            offset,
            size_limit: length,
            flags: LO_FLAGS_READ_ONLY | LO_FLAGS_AUTOCLEAR,
        }
    }

    fn to_kernel(self) -> LoopInfo64 {
        LoopInfo64 {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: self.offset,
            lo_sizelimit: self.size_limit,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: self.flags,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

/// Open mode for the backing file and the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    ReadOnly,
    ReadWrite,
}

impl LoopMode {
    fn open_options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(true);
        if self == Self::ReadWrite {
            opts.write(true);
        }
        opts
    }
}

/// Reference to the backing image: a path, or a descriptor already open in
/// this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRef {
    Path(PathBuf),
    Fd(RawFd),
}

impl ImageRef {
    /// Parses `/proc/self/fd/<n>` into [`ImageRef::Fd`], anything else into
    /// [`ImageRef::Path`].
    pub fn parse(s: &str) -> Result<Self> {
        match s.strip_prefix("/proc/self/fd/") {
            Some(n) => n
                .parse::<RawFd>()
                .map(Self::Fd)
                .map_err(|e| Error::LoopAttachFailed(format!("bad image descriptor '{}': {}", s, e))),
            None => Ok(Self::Path(PathBuf::from(s))),
        }
    }
}

/// An attached loop device. The device node stays open for the lifetime of
/// this value; with autoclear set, dropping it after the device is mounted
/// releases the slot once the mount goes away.
#[derive(Debug)]
pub struct LoopDevice {
    index: u32,
    device: File,
}

impl LoopDevice {
    /// Device index (`N` in `/dev/loopN`).
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Device node path.
    pub fn path(&self) -> PathBuf {
        device_path(self.index)
    }

    /// Attaches `image` to the first free loop device.
    pub fn attach(image: BorrowedFd<'_>, mode: LoopMode) -> Result<Self> {
        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open(LOOP_CONTROL_PATH)
            .map_err(|e| Error::LoopAttachFailed(format!("open {}: {}", LOOP_CONTROL_PATH, e)))?;

        for attempt in 0..MAX_LOOP_ATTEMPTS {
            // SAFETY: LOOP_CTL_GET_FREE takes no argument and returns an index or -1.
            let index = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE as _) };
            if index < 0 {
                return Err(Error::LoopAttachFailed(format!(
                    "no free loop device: {}",
                    std::io::Error::last_os_error()
                )));
            }
            let index = index as u32;

            let device = mode
                .open_options()
                .open(device_path(index))
                .map_err(|e| Error::LoopAttachFailed(format!("open loop{}: {}", index, e)))?;

            // SAFETY: LOOP_SET_FD takes the backing file descriptor by value.
            let rc = unsafe {
                libc::ioctl(device.as_raw_fd(), LOOP_SET_FD as _, image.as_raw_fd())
            };
            if rc == 0 {
                debug!(device = index, "attached loop device");
                return Ok(Self { index, device });
            }

            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EBUSY) {
                debug!(device = index, attempt, "loop device taken, retrying");
                continue;
            }
            return Err(Error::LoopAttachFailed(format!("loop{}: {}", index, err)));
        }

        Err(Error::LoopAttachFailed(format!(
            "no loop device after {} attempts",
            MAX_LOOP_ATTEMPTS
        )))
    }

    /// Applies offset, size limit and flags.
    pub fn set_status(&self, info: &LoopInfo) -> Result<()> {
        let kernel = info.to_kernel();
        // SAFETY: LOOP_SET_STATUS64 reads a loop_info64 through the pointer,
        // which outlives the call.
        let rc = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                LOOP_SET_STATUS64 as _,
                &kernel as *const LoopInfo64,
            )
        };
        if rc != 0 {
            return Err(Error::LoopStatusFailed {
                device: self.index,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }

    /// Detaches the backing file.
    pub fn detach(self) -> Result<()> {
        detach_index(self.index, &self.device)
    }
}

fn device_path(index: u32) -> PathBuf {
    PathBuf::from(format!("{}{}", LOOP_DEVICE_PREFIX, index))
}

fn detach_index(index: u32, device: &File) -> Result<()> {
    // SAFETY: LOOP_CLR_FD takes no argument.
    let rc = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD as _, 0) };
    if rc != 0 {
        return Err(Error::LoopDetachFailed {
            device: index,
            reason: std::io::Error::last_os_error().to_string(),
        });
    }
    debug!(device = index, "detached loop device");
    Ok(())
}

/// Detaches `/dev/loop<index>` by path.
pub fn detach_path(index: u32) -> Result<()> {
    let device = File::open(device_path(index)).map_err(|e| Error::LoopDetachFailed {
        device: index,
        reason: e.to_string(),
    })?;
    detach_index(index, &device)
}

// =============================================================================
// Identity Elevation
// =============================================================================

/// Raises the calling thread's filesystem uid to 0 and restores the previous
/// value on drop. Not `Send`: the guard must be dropped on the thread that
/// created it.
pub struct FsuidGuard {
    previous: libc::uid_t,
    _not_send: PhantomData<*const ()>,
}

impl FsuidGuard {
    /// Switches the current thread's fsuid to 0.
    pub fn elevate() -> Self {
        // SAFETY: setfsuid has no memory effects and returns the previous fsuid.
        let previous = unsafe { libc::setfsuid(0) } as libc::uid_t;
        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for FsuidGuard {
    fn drop(&mut self) {
        // SAFETY: see `elevate`.
        unsafe {
            libc::setfsuid(self.previous);
        }
    }
}

/// Opens the image, attaches it and applies `info`, all on a dedicated
/// worker thread holding an [`FsuidGuard`].
///
/// On a status failure the device is returned inside the error path as
/// [`Error::LoopStatusFailed`] and left attached; `on_status_failure`
/// receives it so the caller can keep it reachable for an explicit detach.
pub fn attach_pinned(
    image: &ImageRef,
    mode: LoopMode,
    info: &LoopInfo,
    on_status_failure: impl FnOnce(LoopDevice),
) -> Result<LoopDevice> {
    let outcome = std::thread::scope(|scope| {
        scope
            .spawn(|| -> std::result::Result<LoopDevice, StatusFailure> {
                let _identity = FsuidGuard::elevate();
                let backing = open_image(image, mode)?;
                let device = LoopDevice::attach(backing.as_fd_ref(), mode)?;
                if let Err(e) = device.set_status(info) {
                    return Err(StatusFailure(e, Some(device)));
                }
                Ok(device)
            })
            .join()
    });

    match outcome {
        Ok(Ok(device)) => Ok(device),
        Ok(Err(StatusFailure(e, device))) => {
            if let Some(device) = device {
                warn!(device = device.index(), "loop status failed, device left attached");
                on_status_failure(device);
            }
            Err(e)
        }
        Err(_) => Err(Error::Internal("loop attach worker panicked".to_string())),
    }
}

struct StatusFailure(Error, Option<LoopDevice>);

impl From<Error> for StatusFailure {
    fn from(e: Error) -> Self {
        Self(e, None)
    }
}

/// Backing file: either freshly opened, or borrowed from a descriptor the
/// process already owns.
enum Backing {
    Owned(File),
    Borrowed(RawFd),
}

impl Backing {
    fn as_fd_ref(&self) -> BorrowedFd<'_> {
        match self {
            Self::Owned(f) => f.as_fd(),
            // SAFETY: the descriptor belongs to the caller, who keeps it open
            // for the duration of the request.
            Self::Borrowed(fd) => unsafe { BorrowedFd::borrow_raw(*fd) },
        }
    }
}

fn open_image(image: &ImageRef, mode: LoopMode) -> Result<Backing> {
    match image {
        ImageRef::Path(path) => mode
            .open_options()
            .open(path)
            .map(Backing::Owned)
            .map_err(|e| Error::LoopAttachFailed(format!("open {}: {}", path.display(), e))),
        ImageRef::Fd(fd) => {
            // SAFETY: F_GETFD only checks validity; no ownership is taken.
            if unsafe { libc::fcntl(*fd, libc::F_GETFD) } < 0 {
                return Err(Error::LoopAttachFailed(format!("can't find image fd {}", fd)));
            }
            Ok(Backing::Borrowed(*fd))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_info64_layout() {
        // 5*u64 + 4*u32 + 64 + 64 + 32 + 2*u64
        assert_eq!(std::mem::size_of::<LoopInfo64>(), 232);
    }

    #[test]
    fn test_read_only_flags() {
        let info = LoopInfo::read_only(4096, 1 << 20);
        assert_eq!(info.flags & LO_FLAGS_READ_ONLY, LO_FLAGS_READ_ONLY);
        assert_eq!(info.flags & LO_FLAGS_AUTOCLEAR, LO_FLAGS_AUTOCLEAR);
        let k = info.to_kernel();
        assert_eq!(k.lo_offset, 4096);
        assert_eq!(k.lo_sizelimit, 1 << 20);
    }

    #[test]
    fn test_image_ref_parse() {
        assert_eq!(ImageRef::parse("/proc/self/fd/7").unwrap(), ImageRef::Fd(7));
        assert_eq!(
            ImageRef::parse("/tmp/img").unwrap(),
            ImageRef::Path(PathBuf::from("/tmp/img"))
        );
        assert!(ImageRef::parse("/proc/self/fd/x").is_err());
    }

    #[test]
    fn test_fsuid_guard_restores() {
        // SAFETY: setfsuid(-1) is a query that changes nothing.
        let before = unsafe { libc::setfsuid(u32::MAX as libc::uid_t) };
        {
            let _guard = FsuidGuard::elevate();
        }
        let after = unsafe { libc::setfsuid(u32::MAX as libc::uid_t) };
        assert_eq!(before, after);
    }

    #[test]
    fn test_attach_and_detach_range() {
        // SAFETY: geteuid has no preconditions.
        if unsafe { libc::geteuid() } != 0 || !std::path::Path::new(LOOP_CONTROL_PATH).exists() {
            return;
        }
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("backing.img");
        std::fs::write(&path, vec![0u8; 64 * 1024]).unwrap();
        let image = File::open(&path).unwrap();

        let device = LoopDevice::attach(image.as_fd(), LoopMode::ReadOnly).unwrap();
        let index = device.index();
        device.set_status(&LoopInfo::read_only(4096, 32 * 1024)).unwrap();
        device.detach().unwrap();

        assert!(device_path(index).exists());
    }
}
