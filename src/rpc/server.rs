//! Privileged RPC server.
//!
//! Runs on a dedicated thread inside the helper process. Requests are read,
//! executed and answered strictly one at a time.

use super::PrivilegedOps;
use super::protocol::{Request, Response};
use crate::constants::MAX_RPC_LINE_LEN;
use crate::error::{Error, Result};
use crate::loopdev::{self, ImageRef, LoopDevice, LoopInfo, LoopMode};
use crate::mount;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Direct implementation of the privileged operations.
///
/// Attached loop devices stay open here until they are detached or the
/// server exits. Closing an autoclear device before it is mounted would
/// release it immediately.
#[derive(Debug, Default)]
pub struct Methods {
    devices: HashMap<u32, LoopDevice>,
}

impl Methods {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indices of devices currently held open.
    pub fn attached(&self) -> Vec<u32> {
        let mut v: Vec<u32> = self.devices.keys().copied().collect();
        v.sort_unstable();
        v
    }
}

impl PrivilegedOps for Methods {
    fn mount(
        &mut self,
        source: &str,
        target: &Path,
        fstype: &str,
        flags: u64,
        data: &str,
    ) -> Result<()> {
        mount::mount(source, target, fstype, flags, data)
    }

    fn unmount(&mut self, target: &Path, flags: i32) -> Result<()> {
        mount::unmount(target, flags)
    }

    fn mkdir(&mut self, path: &Path, mode: u32) -> Result<()> {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        Ok(())
    }

    fn loop_attach(&mut self, image: &ImageRef, mode: LoopMode, info: &LoopInfo) -> Result<u32> {
        let mut left_attached = None;
        let result = loopdev::attach_pinned(image, mode, info, |dev| left_attached = Some(dev));
        if let Some(dev) = left_attached {
            self.devices.insert(dev.index(), dev);
        }
        let device = result?;
        let index = device.index();
        self.devices.insert(index, device);
        Ok(index)
    }

    fn loop_detach(&mut self, device: u32) -> Result<()> {
        match self.devices.remove(&device) {
            Some(dev) => dev.detach(),
            None => loopdev::detach_path(device),
        }
    }

    fn chroot(&mut self, root: &Path) -> Result<()> {
        mount::chroot(root)
    }
}

/// Executes one request against `ops`.
pub fn dispatch(ops: &mut dyn PrivilegedOps, request: Request) -> Response {
    let result = match request {
        Request::Mount(a) => ops
            .mount(&a.source, &a.target, &a.filesystem, a.flags, &a.data)
            .map(|()| None),
        Request::Unmount(a) => ops.unmount(&a.target, a.flags).map(|()| None),
        Request::Mkdir(a) => ops.mkdir(&a.path, a.mode).map(|()| None),
        Request::LoopDevice(a) => ops.loop_attach(&a.image, a.mode, &a.info).map(Some),
        Request::LoopDetach(a) => ops.loop_detach(a.device).map(|()| None),
        Request::Chroot(a) => ops.chroot(&a.root).map(|()| None),
        Request::Ping => Ok(None),
    };

    match result {
        Ok(Some(device)) => Response::ok_device(device),
        Ok(None) => Response::ok(),
        Err(e) => Response::error(e),
    }
}

/// Serves requests from `stream` until the peer closes it.
pub fn serve(stream: UnixStream, ops: &mut dyn PrivilegedOps) -> Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader
            .by_ref()
            .take(MAX_RPC_LINE_LEN as u64 + 1)
            .read_line(&mut line)?;
        if n == 0 {
            debug!("rpc client disconnected");
            return Ok(());
        }
        if n > MAX_RPC_LINE_LEN {
            return Err(Error::Rpc {
                method: "unknown".to_string(),
                reason: format!("request exceeds {} bytes", MAX_RPC_LINE_LEN),
            });
        }

        let response = match Request::from_json(&line) {
            Ok(request) => {
                let method = request.method();
                debug!(method, "rpc request");
                let response = dispatch(ops, request);
                if let Response::Error { error } = &response {
                    warn!(method, error = ?error, "rpc request failed");
                }
                response
            }
            Err(e) => Response::Error {
                error: super::WireError::Other {
                    reason: format!("malformed request: {}", e),
                },
            },
        };

        writer.write_all(response.to_json_line()?.as_bytes())?;
        writer.flush()?;
    }
}

/// Spawns the server loop with fresh [`Methods`] on a dedicated thread.
pub fn spawn_server(stream: UnixStream) -> Result<JoinHandle<Result<()>>> {
    std::thread::Builder::new()
        .name("imgbuild-rpc".to_string())
        .spawn(move || {
            let mut methods = Methods::new();
            serve(stream, &mut methods)
        })
        .map_err(Error::Io)
}
