//! Synchronous RPC client used by the engine.

use super::PrivilegedOps;
use super::protocol::{
    ChrootArgs, LoopArgs, LoopDetachArgs, MkdirArgs, MountArgs, Request, Response, UnmountArgs,
};
use crate::constants::{MAX_RPC_LINE_LEN, RPC_TIMEOUT};
use crate::error::{Error, Result};
use crate::loopdev::{ImageRef, LoopInfo, LoopMode};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

/// Client end of the privileged RPC channel.
pub struct RpcClient {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl RpcClient {
    /// Wraps a connected stream.
    pub fn new(stream: UnixStream) -> Result<Self> {
        stream.set_read_timeout(Some(RPC_TIMEOUT))?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    /// Creates a connected pair: this client and the stream the server
    /// should own.
    pub fn pair() -> Result<(Self, UnixStream)> {
        let (client, server) = UnixStream::pair()?;
        Ok((Self::new(client)?, server))
    }

    /// Checks that the server is alive.
    pub fn ping(&mut self) -> Result<()> {
        self.call(Request::Ping).map(|_| ())
    }

    /// Sends one request and waits for its response. Returns the device
    /// index when the server sent one.
    pub fn call(&mut self, request: Request) -> Result<Option<u32>> {
        let method = request.method();
        let transport = |reason: String| Error::Rpc {
            method: method.to_string(),
            reason,
        };

        let line = request.to_json_line()?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.flush())
            .map_err(|e| transport(e.to_string()))?;

        let mut reply = String::new();
        let n = self
            .reader
            .by_ref()
            .take(MAX_RPC_LINE_LEN as u64 + 1)
            .read_line(&mut reply)
            .map_err(|e| transport(e.to_string()))?;
        if n == 0 {
            return Err(transport("server closed the connection".to_string()));
        }
        if n > MAX_RPC_LINE_LEN {
            return Err(transport(format!("response exceeds {} bytes", MAX_RPC_LINE_LEN)));
        }

        match Response::from_json(&reply)? {
            Response::Ok { device } => Ok(device),
            Response::Error { error } => Err(error.into_error(method)),
        }
    }
}

impl PrivilegedOps for RpcClient {
    fn mount(
        &mut self,
        source: &str,
        target: &Path,
        fstype: &str,
        flags: u64,
        data: &str,
    ) -> Result<()> {
        self.call(Request::Mount(MountArgs {
            source: source.to_string(),
            target: target.to_path_buf(),
            filesystem: fstype.to_string(),
            flags,
            data: data.to_string(),
        }))
        .map(|_| ())
    }

    fn unmount(&mut self, target: &Path, flags: i32) -> Result<()> {
        self.call(Request::Unmount(UnmountArgs {
            target: target.to_path_buf(),
            flags,
        }))
        .map(|_| ())
    }

    fn mkdir(&mut self, path: &Path, mode: u32) -> Result<()> {
        self.call(Request::Mkdir(MkdirArgs {
            path: path.to_path_buf(),
            mode,
        }))
        .map(|_| ())
    }

    fn loop_attach(&mut self, image: &ImageRef, mode: LoopMode, info: &LoopInfo) -> Result<u32> {
        self.call(Request::LoopDevice(LoopArgs {
            image: image.clone(),
            mode,
            info: *info,
        }))?
        .ok_or_else(|| Error::Rpc {
            method: "loop_device".to_string(),
            reason: "reply carried no device index".to_string(),
        })
    }

    fn loop_detach(&mut self, device: u32) -> Result<()> {
        self.call(Request::LoopDetach(LoopDetachArgs { device }))
            .map(|_| ())
    }

    fn chroot(&mut self, root: &Path) -> Result<()> {
        self.call(Request::Chroot(ChrootArgs {
            root: root.to_path_buf(),
        }))
        .map(|_| ())
    }
}
