//! # Privileged Engine
//!
//! The unprivileged side ([`launcher::EngineLauncher`]) serializes an
//! [`EngineConfig`] and streams it to a freshly spawned helper process
//! (`imgbuild-engine`) over a dedicated pipe. The helper reads the
//! descriptor number from `IMGBUILD_CONFIG_FD`, decodes the envelope and
//! dispatches on [`EngineConfig::engine_name`]:
//!
//! | Engine     | Inner config          | Work                                  |
//! |------------|-----------------------|---------------------------------------|
//! | `imgbuild` | [`BuildEngineConfig`] | setup, host files, chroot, post, test |
//! | `query`    | [`QueryEngineConfig`] | materialize, chroot, run one command  |
//!
//! ```text
//! imgbuild (unprivileged)                imgbuild-engine (root)
//! ┌──────────────────────┐  config pipe  ┌────────────────────────────┐
//! │ EngineLauncher::run  │──────────────►│ main thread: engine        │
//! │                      │               │   │ RpcClient               │
//! │ stdout/stderr ◄──────┼───inherited───┤   ▼ socketpair             │
//! └──────────────────────┘               │ rpc thread: Methods        │
//!                                        └────────────────────────────┘
//! ```

pub mod builder;
pub mod launcher;
pub mod query;

pub use launcher::EngineLauncher;

use crate::bundle::Bundle;
use crate::constants::MAX_ENGINE_CONFIG_SIZE;
use crate::error::{Error, Result};
use crate::mount;
use crate::rpc::{RpcClient, spawn_server};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

/// Transport envelope handed to the helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub engine_name: String,
    #[serde(rename = "containerID")]
    pub container_id: String,
    /// Engine-specific configuration; opaque to the transport.
    pub engine_config: Box<RawValue>,
}

impl EngineConfig {
    /// Wraps `inner` for the engine called `engine_name`.
    pub fn new<T: Serialize>(engine_name: &str, container_id: &str, inner: &T) -> Result<Self> {
        Ok(Self {
            engine_name: engine_name.to_string(),
            container_id: container_id.to_string(),
            engine_config: serde_json::value::to_raw_value(inner)?,
        })
    }

    /// Decodes the inner configuration.
    pub fn inner<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(self.engine_config.get()).map_err(Error::from)
    }

    /// Reads an envelope from `reader`, rejecting anything larger than
    /// [`MAX_ENGINE_CONFIG_SIZE`].
    pub fn read_from(reader: impl Read) -> Result<Self> {
        let mut data = Vec::new();
        reader
            .take(MAX_ENGINE_CONFIG_SIZE + 1)
            .read_to_end(&mut data)
            .map_err(|e| Error::ConfigChannel(e.to_string()))?;
        if data.len() as u64 > MAX_ENGINE_CONFIG_SIZE {
            return Err(Error::ConfigChannel(format!(
                "configuration exceeds {} bytes",
                MAX_ENGINE_CONFIG_SIZE
            )));
        }
        serde_json::from_slice(&data).map_err(|e| Error::ConfigChannel(e.to_string()))
    }
}

/// Runtime-spec process overrides for commands run by the helper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSpec {
    /// Working directory inside the new root.
    pub cwd: PathBuf,
    /// Full environment as `KEY=value` entries.
    pub env: Vec<String>,
    /// Command line; unused by the build engine, which runs script bodies.
    pub args: Vec<String>,
}

impl ProcessSpec {
    /// Environment entries split into pairs. Entries without `=` are skipped.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|e| e.split_once('='))
    }
}

/// Inner configuration of the `imgbuild` engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildEngineConfig {
    pub bundle: Bundle,
    pub process: ProcessSpec,
}

/// Inner configuration of the `query` engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryEngineConfig {
    /// Flat tree or packed image to query.
    pub image: PathBuf,
    /// Where packed images are materialized; removed by the launcher.
    pub bundle_path: PathBuf,
    pub process: ProcessSpec,
}

/// Moves into a private mount namespace, starts the RPC server thread and
/// runs `f` with a connected client.
///
/// Must be called while the helper is still single-threaded: `unshare`
/// only affects the calling thread, and the server thread has to inherit
/// the new namespace.
pub fn with_rpc<T>(f: impl FnOnce(&mut RpcClient) -> Result<T>) -> Result<T> {
    mount::unshare_mount_namespace()?;
    let (mut client, server_end) = RpcClient::pair()?;
    let server = spawn_server(server_end)?;

    let result = f(&mut client);

    drop(client);
    match server.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "rpc server exited with error"),
        Err(_) => warn!("rpc server panicked"),
    }
    result
}

/// Runs `cmd` to completion, mapping a non-zero exit to
/// [`Error::ScriptFailed`] for `section`.
pub fn run_section(section: &str, cmd: &mut Command) -> Result<()> {
    info!("Running {} scriptlet", section);
    let status = cmd.status()?;
    if !status.success() {
        return Err(Error::ScriptFailed {
            section: section.to_string(),
            code: status.code(),
        });
    }
    Ok(())
}

/// `/bin/sh -e -c <body>` with the process environment of `process`.
pub fn shell(body: &str, process: &ProcessSpec, cwd: &Path) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-e")
        .arg("-c")
        .arg(body)
        .env_clear()
        .envs(process.env_pairs())
        .current_dir(cwd);
    cmd
}
