//! Unprivileged side of the engine boundary.

use super::{BuildEngineConfig, EngineConfig, ProcessSpec, QueryEngineConfig};
use crate::bundle::Bundle;
use crate::constants::{
    BUILD_CONTAINER_ID, BUILD_ENGINE_NAME, BUILD_ENVIRONMENT_SCRIPT, ENV_CONFIG_FD,
    ENV_ENVIRONMENT, ENV_LOG_LEVEL, ENV_ROOTFS, QUERY_ENGINE_NAME,
};
use crate::error::{Error, Result};
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Spawns the privileged helper and streams it an [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct EngineLauncher {
    helper: PathBuf,
    privileged: bool,
    log_level: Option<String>,
    /// Held for the lifetime of a helper process; clones share it.
    busy: Arc<Mutex<()>>,
}

impl EngineLauncher {
    /// Launcher for the helper binary at `helper`. Privilege is taken from
    /// the effective uid of the current process.
    pub fn new(helper: impl Into<PathBuf>) -> Self {
        // SAFETY: geteuid has no preconditions.
        let privileged = unsafe { libc::geteuid() } == 0;
        Self {
            helper: helper.into(),
            privileged,
            log_level: std::env::var(ENV_LOG_LEVEL).ok(),
            busy: Arc::new(Mutex::new(())),
        }
    }

    /// Overrides the privilege check result.
    #[must_use]
    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Log level forwarded to the helper.
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    pub fn helper(&self) -> &Path {
        &self.helper
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Runs the build engine against `bundle`.
    ///
    /// Scripts see the inherited environment plus `IMGBUILD_ROOTFS` and
    /// `IMGBUILD_ENVIRONMENT`.
    pub async fn run(&self, bundle: &Bundle) -> Result<()> {
        if !self.privileged {
            return Err(Error::privilege(
                "Attempted to build with scripts as non-root user",
            ));
        }

        let mut env: Vec<String> = std::env::vars()
            .filter(|(k, _)| k != ENV_ROOTFS && k != ENV_ENVIRONMENT)
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.push(format!("{}={}", ENV_ROOTFS, bundle.rootfs.display()));
        env.push(format!("{}={}", ENV_ENVIRONMENT, BUILD_ENVIRONMENT_SCRIPT));

        let inner = BuildEngineConfig {
            bundle: bundle.clone(),
            process: ProcessSpec {
                cwd: PathBuf::from("/"),
                env,
                args: Vec::new(),
            },
        };
        let config = EngineConfig::new(BUILD_ENGINE_NAME, BUILD_CONTAINER_ID, &inner)?;

        info!(bundle = %bundle.path.display(), "starting build engine");
        self.launch(&config, false).await.map(|_| ())
    }

    /// Runs `args` inside `image` and returns its standard output.
    ///
    /// Packed images are materialized under `tmp_dir`; the bundle directory
    /// is removed once the helper exits.
    pub async fn query(&self, image: &Path, tmp_dir: &Path, args: &[String]) -> Result<Vec<u8>> {
        if !self.privileged {
            return Err(Error::privilege("Attempted to query image as non-root user"));
        }

        let bundle_path = tmp_dir.join(format!("query-{}", uuid::Uuid::now_v7()));
        let inner = QueryEngineConfig {
            image: image.to_path_buf(),
            bundle_path: bundle_path.clone(),
            process: ProcessSpec {
                cwd: PathBuf::from("/"),
                env: vec![
                    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"
                        .to_string(),
                ],
                args: args.to_vec(),
            },
        };
        let config = EngineConfig::new(QUERY_ENGINE_NAME, BUILD_CONTAINER_ID, &inner)?;

        let result = self.launch(&config, true).await;

        if bundle_path.exists()
            && let Err(e) = tokio::fs::remove_dir_all(&bundle_path).await
        {
            warn!(error = %e, bundle = %bundle_path.display(), "failed to remove query bundle");
        }
        result
    }

    /// Spawns the helper, streams `config` to it and waits for it to exit.
    async fn launch(&self, config: &EngineConfig, capture: bool) -> Result<Vec<u8>> {
        let _busy = self.busy.lock().await;
        let payload = serde_json::to_vec(config)?;
        let (read_end, write_end) = config_pipe()?;
        let child_fd = read_end.as_raw_fd();

        let mut cmd = Command::new(&self.helper);
        cmd.env(ENV_CONFIG_FD, child_fd.to_string())
            .stdin(Stdio::null())
            .stdout(if capture {
                Stdio::piped()
            } else {
                Stdio::inherit()
            })
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(level) = &self.log_level {
            cmd.env(ENV_LOG_LEVEL, level);
        }

        // SAFETY: the closure only calls fcntl, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                if libc::fcntl(child_fd, libc::F_SETFD, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        debug!(helper = %self.helper.display(), engine = %config.engine_name, "spawning engine");
        let child = cmd.spawn().map_err(|e| {
            Error::ConfigChannel(format!("failed to spawn {}: {}", self.helper.display(), e))
        })?;
        drop(read_end);

        let writer = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut pipe = File::from(write_end);
            pipe.write_all(&payload)?;
            pipe.flush()
        });

        let output = child.wait_with_output().await?;
        let written = writer
            .await
            .map_err(|e| Error::Internal(format!("config writer panicked: {}", e)))?;

        if !output.status.success() {
            return Err(Error::EngineExit {
                code: output.status.code(),
            });
        }
        written.map_err(|e| Error::ConfigChannel(e.to_string()))?;

        Ok(output.stdout)
    }
}

/// Creates a close-on-exec pipe. The child clears the flag on its end
/// after fork.
fn config_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    // SAFETY: fds has room for the two descriptors pipe2 writes.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(Error::ConfigChannel(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    // SAFETY: pipe2 succeeded, so both descriptors are open and owned by us.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}
