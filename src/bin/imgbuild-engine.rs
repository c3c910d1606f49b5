//! # imgbuild-engine - Privileged Build Helper
//!
//! Spawned by the `imgbuild` orchestrator for each engine invocation. It
//! never parses arguments: everything it needs arrives as one JSON
//! [`EngineConfig`] on the pipe named by `IMGBUILD_CONFIG_FD`.
//!
//! ```text
//! read config (fd) → dispatch on engineName
//!                    ├─ imgbuild → setup, host files, chroot, post, test
//!                    └─ query    → materialize, chroot, run command
//! ```
//!
//! The helper stays single-threaded until an engine starts the RPC server,
//! so the private mount namespace it creates covers the server thread too.
//! No async runtime is used here for the same reason.

use imgbuild::constants::{BUILD_ENGINE_NAME, ENV_CONFIG_FD, ENV_LOG_LEVEL, QUERY_ENGINE_NAME};
use imgbuild::engine::{self, BuildEngineConfig, EngineConfig, QueryEngineConfig};
use imgbuild::error::{Error, Result};
use std::fs::File;
use std::os::fd::{FromRawFd, RawFd};
use std::process::ExitCode;
use tracing::{Level, debug, error};
use tracing_subscriber::FmtSubscriber;

/// Exit codes.
const EXIT_ENGINE_FAILED: u8 = 1;
const EXIT_CONFIG_FAILED: u8 = 2;

fn main() -> ExitCode {
    init_logging();

    let config = match read_config() {
        Ok(c) => c,
        Err(e) => {
            error!("failed to read engine configuration: {}", e);
            return ExitCode::from(EXIT_CONFIG_FAILED);
        }
    };
    debug!(engine = %config.engine_name, container = %config.container_id, "engine starting");

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            match e {
                Error::ScriptFailed {
                    code: Some(code), ..
                } if (1..=255).contains(&code) => ExitCode::from(code as u8),
                _ => ExitCode::from(EXIT_ENGINE_FAILED),
            }
        }
    }
}

fn init_logging() {
    let level = std::env::var(ENV_LOG_LEVEL)
        .ok()
        .and_then(|l| l.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn read_config() -> Result<EngineConfig> {
    let fd: RawFd = std::env::var(ENV_CONFIG_FD)
        .map_err(|_| Error::ConfigChannel(format!("{} is not set", ENV_CONFIG_FD)))?
        .parse()
        .map_err(|_| Error::ConfigChannel(format!("{} is not a descriptor", ENV_CONFIG_FD)))?;
    if fd < 3 {
        return Err(Error::ConfigChannel(format!(
            "refusing to read configuration from standard descriptor {}",
            fd
        )));
    }
    // SAFETY: the launcher passes the read end of a pipe it created for us
    // and nothing else in this process owns that descriptor.
    let pipe = unsafe { File::from_raw_fd(fd) };
    EngineConfig::read_from(pipe)
}

fn run(config: &EngineConfig) -> Result<()> {
    match config.engine_name.as_str() {
        BUILD_ENGINE_NAME => {
            let inner: BuildEngineConfig = config.inner()?;
            engine::builder::run(&inner)
        }
        QUERY_ENGINE_NAME => {
            let inner: QueryEngineConfig = config.inner()?;
            engine::query::run(&inner)
        }
        other => Err(Error::ConfigChannel(format!("unknown engine {}", other))),
    }
}
