//! Privileged RPC wire protocol.
//!
//! # Protocol Format
//!
//! - **Transport**: connected `AF_UNIX` stream socket pair
//! - **Encoding**: JSON
//! - **Framing**: Newline-delimited (each message ends with `\n`)
//!
//! ```text
//! Engine (client)                      RPC server thread
//!   |  {"method":"loop_device",...}\n     |
//!   |------------------------------------>|
//!   |  {"status":"ok","device":7}\n       |
//!   |<------------------------------------|
//! ```
//!
//! Exactly one request is outstanding at a time; the server answers every
//! request before reading the next one.
//!
//! | Method        | Reply            |
//! |---------------|------------------|
//! | `mount`       | ok               |
//! | `unmount`     | ok               |
//! | `mkdir`       | ok               |
//! | `loop_device` | ok + device      |
//! | `loop_detach` | ok               |
//! | `chroot`      | ok               |
//! | `ping`        | ok               |

use crate::error::{ChrootStep, Error};
use crate::loopdev::{ImageRef, LoopInfo, LoopMode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// =============================================================================
// Request Types
// =============================================================================

/// Request from the engine to the privileged server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    Mount(MountArgs),
    Unmount(UnmountArgs),
    Mkdir(MkdirArgs),
    LoopDevice(LoopArgs),
    LoopDetach(LoopDetachArgs),
    Chroot(ChrootArgs),
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountArgs {
    pub source: String,
    pub target: PathBuf,
    #[serde(default)]
    pub filesystem: String,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmountArgs {
    pub target: PathBuf,
    #[serde(default)]
    pub flags: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MkdirArgs {
    pub path: PathBuf,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopArgs {
    pub image: ImageRef,
    pub mode: LoopMode,
    pub info: LoopInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopDetachArgs {
    pub device: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChrootArgs {
    pub root: PathBuf,
}

impl Request {
    /// Method name, for logs and errors.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Mount(_) => "mount",
            Self::Unmount(_) => "unmount",
            Self::Mkdir(_) => "mkdir",
            Self::LoopDevice(_) => "loop_device",
            Self::LoopDetach(_) => "loop_detach",
            Self::Chroot(_) => "chroot",
            Self::Ping => "ping",
        }
    }

    /// Serializes request to JSON line (with newline).
    ///
    /// # Errors
    ///
    /// Returns error if JSON serialization fails.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserializes request from JSON.
    ///
    /// # Errors
    ///
    /// Returns error if JSON deserialization fails.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// Response from the privileged server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<u32>,
    },
    Error {
        error: WireError,
    },
}

/// Error as carried across the RPC boundary. Mirrors the resource variants
/// of [`Error`] so the client can hand back the same typed error the server
/// saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireError {
    Mount {
        source: String,
        target: PathBuf,
        reason: String,
    },
    Unmount {
        target: PathBuf,
        reason: String,
    },
    LoopAttach {
        reason: String,
    },
    LoopStatus {
        device: u32,
        reason: String,
    },
    LoopDetach {
        device: u32,
        reason: String,
    },
    Chroot {
        root: PathBuf,
        step: ChrootStep,
        reason: String,
    },
    Other {
        reason: String,
    },
}

impl From<Error> for WireError {
    fn from(e: Error) -> Self {
        match e {
            Error::MountFailed {
                source_path,
                target,
                reason,
            } => Self::Mount {
                source: source_path,
                target,
                reason,
            },
            Error::UnmountFailed { target, reason } => Self::Unmount { target, reason },
            Error::LoopAttachFailed(reason) => Self::LoopAttach { reason },
            Error::LoopStatusFailed { device, reason } => Self::LoopStatus { device, reason },
            Error::LoopDetachFailed { device, reason } => Self::LoopDetach { device, reason },
            Error::ChrootFailed { root, step, reason } => Self::Chroot { root, step, reason },
            other => Self::Other {
                reason: other.to_string(),
            },
        }
    }
}

impl WireError {
    /// Converts back into a crate error. `method` names the call for
    /// errors without a dedicated variant.
    pub fn into_error(self, method: &str) -> Error {
        match self {
            Self::Mount {
                source,
                target,
                reason,
            } => Error::MountFailed {
                source_path: source,
                target,
                reason,
            },
            Self::Unmount { target, reason } => Error::UnmountFailed { target, reason },
            Self::LoopAttach { reason } => Error::LoopAttachFailed(reason),
            Self::LoopStatus { device, reason } => Error::LoopStatusFailed { device, reason },
            Self::LoopDetach { device, reason } => Error::LoopDetachFailed { device, reason },
            Self::Chroot { root, step, reason } => Error::ChrootFailed { root, step, reason },
            Self::Other { reason } => Error::Rpc {
                method: method.to_string(),
                reason,
            },
        }
    }
}

impl Response {
    /// Success with no payload.
    pub fn ok() -> Self {
        Self::Ok { device: None }
    }

    /// Success carrying a loop device index.
    pub fn ok_device(device: u32) -> Self {
        Self::Ok {
            device: Some(device),
        }
    }

    /// Failure.
    pub fn error(e: Error) -> Self {
        Self::Error { error: e.into() }
    }

    /// Serializes response to JSON line (with newline).
    ///
    /// # Errors
    ///
    /// Returns error if JSON serialization fails.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserializes response from JSON.
    ///
    /// # Errors
    ///
    /// Returns error if JSON deserialization fails.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_request() {
        let json = Request::Ping.to_json_line().unwrap();
        assert!(json.contains("\"method\":\"ping\""));
        assert!(json.ends_with('\n'));
        assert!(matches!(Request::from_json(&json).unwrap(), Request::Ping));
    }

    #[test]
    fn test_loop_request_with_fd() {
        let req = Request::LoopDevice(LoopArgs {
            image: ImageRef::Fd(5),
            mode: LoopMode::ReadOnly,
            info: LoopInfo::read_only(4096, 8192),
        });
        let json = req.to_json_line().unwrap();
        assert!(json.contains("\"method\":\"loop_device\""));
        assert!(json.contains("\"fd\":5"));
        assert_eq!(Request::from_json(&json).unwrap(), req);
    }

    #[test]
    fn test_ok_response_omits_empty_device() {
        let json = Response::ok().to_json_line().unwrap();
        assert_eq!(json, "{\"status\":\"ok\"}\n");

        let json = Response::ok_device(3).to_json_line().unwrap();
        assert!(json.contains("\"device\":3"));
    }

    #[test]
    fn test_chroot_error_keeps_step() {
        let resp = Response::error(Error::ChrootFailed {
            root: PathBuf::from("/new"),
            step: ChrootStep::PivotRoot,
            reason: "EINVAL".to_string(),
        });
        let json = resp.to_json_line().unwrap();
        assert!(json.contains("\"step\":\"pivot_root\""));

        let Response::Error { error } = Response::from_json(&json).unwrap() else {
            panic!("expected error response");
        };
        let err = error.into_error("chroot");
        assert!(matches!(
            err,
            Error::ChrootFailed {
                step: ChrootStep::PivotRoot,
                ..
            }
        ));
    }

    #[test]
    fn test_status_error_keeps_device() {
        let wire: WireError = Error::LoopStatusFailed {
            device: 9,
            reason: "EIO".to_string(),
        }
        .into();
        assert!(matches!(
            wire.into_error("loop_device"),
            Error::LoopStatusFailed { device: 9, .. }
        ));
    }
}
