//! Tests for error types.
//!
//! Validates display formatting and the configuration / privilege
//! categories the sequencer uses to decide how failures are reported.

use imgbuild::error::{ChrootStep, Error};
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Configuration Error Tests
// =============================================================================

#[test]
fn test_configuration_errors() {
    let errors = [
        Error::NoBootstrap,
        Error::InvalidBootstrap("floppy".to_string()),
        Error::MissingStageName { index: 2 },
        Error::StageNotFound("base".to_string()),
        Error::UnsupportedFormat("ext4".to_string()),
        Error::UndefinedImageCache,
        Error::InvalidDefinition("bad".to_string()),
    ];
    for err in errors {
        assert!(err.is_configuration(), "{} should be a configuration error", err);
        assert!(!err.is_privilege());
    }
}

#[test]
fn test_runtime_errors_are_not_configuration() {
    let errors = [
        Error::FetchFailed("x".to_string()),
        Error::PackFailed("x".to_string()),
        Error::Interrupted,
        Error::EngineExit { code: Some(1) },
    ];
    for err in errors {
        assert!(!err.is_configuration(), "{}", err);
    }
}

#[test]
fn test_configuration_messages() {
    assert_eq!(Error::NoBootstrap.to_string(), "no bootstrap specification found");
    assert_eq!(
        Error::InvalidBootstrap("floppy".to_string()).to_string(),
        "invalid build source floppy"
    );
    assert_eq!(
        Error::StageNotFound("base".to_string()).to_string(),
        "stage base was not found"
    );
    assert_eq!(Error::UndefinedImageCache.to_string(), "undefined image cache");
    assert!(
        Error::MissingStageName { index: 1 }
            .to_string()
            .contains("definition 1")
    );
}

// =============================================================================
// Privilege Error Tests
// =============================================================================

#[test]
fn test_privilege_error() {
    let err = Error::privilege("You must be root to build with debootstrap");
    assert!(err.is_privilege());
    assert!(!err.is_configuration());
    assert_eq!(err.to_string(), "You must be root to build with debootstrap");
}

// =============================================================================
// Resource Error Tests
// =============================================================================

#[test]
fn test_mount_failed_display() {
    let err = Error::MountFailed {
        source_path: "/dev/loop3".to_string(),
        target: PathBuf::from("/b/rootfs"),
        reason: "EINVAL".to_string(),
    };
    let msg = err.to_string();
    assert!(msg.contains("/dev/loop3"));
    assert!(msg.contains("/b/rootfs"));
    assert!(msg.contains("EINVAL"));
}

#[test]
fn test_chroot_failed_names_step() {
    let err = Error::ChrootFailed {
        root: PathBuf::from("/new"),
        step: ChrootStep::PivotRoot,
        reason: "EINVAL".to_string(),
    };
    assert_eq!(err.to_string(), "chroot to /new failed at 'pivot_root': EINVAL");
}

#[test]
fn test_loop_status_display() {
    let err = Error::LoopStatusFailed {
        device: 5,
        reason: "EIO".to_string(),
    };
    assert_eq!(err.to_string(), "failed to set status on loop device 5: EIO");
}

// =============================================================================
// Collaborator Error Tests
// =============================================================================

#[test]
fn test_fetch_and_pack_prefixes() {
    assert_eq!(
        Error::FetchFailed("timeout".to_string()).to_string(),
        "conveyor failed to get: timeout"
    );
    assert_eq!(
        Error::PackFailed("disk full".to_string()).to_string(),
        "packer failed to pack: disk full"
    );
}

#[test]
fn test_script_failed_display() {
    let err = Error::ScriptFailed {
        section: "post".to_string(),
        code: Some(2),
    };
    assert_eq!(err.to_string(), "post script failed with status Some(2)");
}

#[test]
fn test_timeout_display() {
    let err = Error::Timeout {
        operation: "pull manifest".to_string(),
        duration: Duration::from_secs(5),
    };
    let msg = err.to_string();
    assert!(msg.contains("pull manifest"));
    assert!(msg.contains("5s"));
}

#[test]
fn test_io_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let err: Error = io.into();
    assert!(matches!(err, Error::Io(_)));
    assert!(err.to_string().contains("gone"));
}

#[test]
fn test_serde_conversion() {
    let parse: Result<serde_json::Value, _> = serde_json::from_str("{");
    let err: Error = parse.unwrap_err().into();
    assert!(matches!(err, Error::Serialization(_)));
}
