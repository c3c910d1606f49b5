//! Privileged RPC boundary.
//!
//! Every mount, loop and root-replacement operation the engine needs goes
//! through [`PrivilegedOps`]. Two implementations exist:
//!
//! - [`server::Methods`] performs the syscalls directly.
//! - [`client::RpcClient`] forwards each call as one request/response pair
//!   to a [`server::serve`] loop on the other end of a socket pair.
//!
//! The engine only ever holds an `RpcClient`; the server loop owns the
//! `Methods` value. Because the loop handles one request at a time, the
//! methods need no internal locking.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::RpcClient;
pub use protocol::{Request, Response, WireError};
pub use server::{Methods, serve, spawn_server};

use crate::error::Result;
use crate::loopdev::{ImageRef, LoopInfo, LoopMode};
use std::path::Path;

/// Privileged operations available to the engine.
pub trait PrivilegedOps {
    /// `mount(2)`; failures are returned verbatim.
    fn mount(&mut self, source: &str, target: &Path, fstype: &str, flags: u64, data: &str)
    -> Result<()>;

    /// `umount2(2)`.
    fn unmount(&mut self, target: &Path, flags: i32) -> Result<()>;

    /// Creates a directory (and parents) with `mode`.
    fn mkdir(&mut self, path: &Path, mode: u32) -> Result<()>;

    /// Attaches `image` and applies `info`; returns the device index.
    ///
    /// A [`crate::Error::LoopStatusFailed`] means the device is still
    /// attached and the caller must call [`PrivilegedOps::loop_detach`].
    fn loop_attach(&mut self, image: &ImageRef, mode: LoopMode, info: &LoopInfo) -> Result<u32>;

    /// Detaches a device previously returned by `loop_attach`.
    fn loop_detach(&mut self, device: u32) -> Result<()>;

    /// Replaces the process root with `root`.
    fn chroot(&mut self, root: &Path) -> Result<()>;
}
