//! Tests for the stage sequencer.
//!
//! Validates definition validation before any I/O, stage lookup for
//! cross-stage copies, do-once cleanup, and an unprivileged scratch build
//! end to end.

use imgbuild::definition::{FileCopy, FileTransfer};
use imgbuild::sources::SourceKind;
use imgbuild::{
    Build, BuildConfig, CleanupOutcome, Definition, EngineLauncher, Error, Options, OutputFormat,
};
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn options(temp: &Path) -> Options {
    Options {
        tmp_dir: temp.join("tmp"),
        image_cache: Some(temp.join("cache")),
        ..Options::default()
    }
}

fn config(temp: &Path) -> BuildConfig {
    fs::create_dir_all(temp.join("tmp")).unwrap();
    BuildConfig::new(temp.join("out"), OutputFormat::FlatTree).with_options(options(temp))
}

fn stage(bootstrap: &str, name: &str) -> Definition {
    let mut def = Definition::default();
    def.header.insert("bootstrap".to_string(), bootstrap.to_string());
    if !name.is_empty() {
        def.header.insert("stage".to_string(), name.to_string());
    }
    def
}

fn unprivileged() -> EngineLauncher {
    EngineLauncher::new("/bin/false").with_privileged(false)
}

fn tmp_entries(temp: &Path) -> usize {
    fs::read_dir(temp.join("tmp")).unwrap().count()
}

// =============================================================================
// Validation Tests
// =============================================================================

#[test]
fn test_empty_definitions_rejected() {
    let temp = TempDir::new().unwrap();
    let result = Build::new(Vec::new(), config(temp.path()));
    assert!(matches!(result, Err(Error::InvalidDefinition(_))));
}

#[test]
fn test_multi_stage_requires_names() {
    let temp = TempDir::new().unwrap();
    let defs = vec![stage("scratch", "base"), stage("scratch", "")];

    let err = Build::new(defs, config(temp.path())).err().unwrap();
    assert!(matches!(err, Error::MissingStageName { index: 1 }));
    assert_eq!(tmp_entries(temp.path()), 0, "no bundle should be created");
}

#[test]
fn test_single_stage_name_optional() {
    let temp = TempDir::new().unwrap();
    let build = Build::new(vec![stage("scratch", "")], config(temp.path())).unwrap();

    assert_eq!(build.stages().len(), 1);
    assert_eq!(build.stages()[0].name(), "");
    assert!(build.stages()[0].has_assembler());
    build.cleanup();
}

#[test]
fn test_invalid_bootstrap_rejected_before_io() {
    let temp = TempDir::new().unwrap();
    let defs = vec![stage("scratch", "a"), stage("nosuchsource", "b")];

    let err = Build::new(defs, config(temp.path())).err().unwrap();
    assert!(matches!(err, Error::InvalidBootstrap(ref k) if k == "nosuchsource"));
    assert_eq!(tmp_entries(temp.path()), 0);
}

#[test]
fn test_missing_image_cache_rejected() {
    let temp = TempDir::new().unwrap();
    let mut cfg = config(temp.path());
    cfg.opts.image_cache = None;

    let def = Definition::from_uri("docker://alpine:3.18").unwrap();
    let err = Build::new(vec![def], cfg).err().unwrap();
    assert!(matches!(err, Error::UndefinedImageCache));
    assert_eq!(tmp_entries(temp.path()), 0);
}

#[test]
fn test_scratch_needs_no_image_cache() {
    let temp = TempDir::new().unwrap();
    let mut cfg = config(temp.path());
    cfg.opts.image_cache = None;

    let build = Build::new(vec![stage("scratch", "")], cfg).unwrap();
    build.cleanup();
}

#[test]
fn test_only_last_stage_assembles() {
    let temp = TempDir::new().unwrap();
    let defs = vec![
        stage("scratch", "one"),
        stage("scratch", "two"),
        stage("scratch", "three"),
    ];
    let build = Build::new(defs, config(temp.path())).unwrap();

    let flags: Vec<bool> = build.stages().iter().map(|s| s.has_assembler()).collect();
    assert_eq!(flags, vec![false, false, true]);
    let names: Vec<&str> = build.stages().iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["one", "two", "three"]);
    build.cleanup();
}

#[test]
fn test_update_skips_last_stage_packer() {
    let temp = TempDir::new().unwrap();
    let mut cfg = config(temp.path());
    cfg.opts.update = true;

    let build = Build::new(vec![stage("scratch", "")], cfg).unwrap();
    assert!(build.stages()[0].source_kind().is_none());
    build.cleanup();
}

#[test]
fn test_bundle_creation_failure_is_reported() {
    let temp = TempDir::new().unwrap();
    let mut cfg = config(temp.path());
    let blocker = temp.path().join("not-a-dir");
    fs::write(&blocker, "").unwrap();
    cfg.opts.tmp_dir = blocker;

    let defs = vec![stage("scratch", "a"), stage("scratch", "b")];
    let err = Build::new(defs, cfg).err().unwrap();
    assert!(matches!(err, Error::Io(_)), "unexpected error: {}", err);
    assert_eq!(tmp_entries(temp.path()), 0);
}

// =============================================================================
// Cleanup Tests
// =============================================================================

#[test]
fn test_cleanup_runs_once() {
    let temp = TempDir::new().unwrap();
    let defs = vec![stage("scratch", "a"), stage("scratch", "b")];
    let build = Build::new(defs, config(temp.path())).unwrap();

    let paths = build.bundle_paths();
    assert_eq!(paths.len(), 2);
    assert!(paths.iter().all(|p| p.is_dir()));

    assert_eq!(build.cleanup(), CleanupOutcome::Removed(paths.clone()));
    assert!(paths.iter().all(|p| !p.exists()));
    assert_eq!(build.cleanup(), CleanupOutcome::AlreadyDone);
}

#[test]
fn test_no_cleanup_retains_bundles() {
    let temp = TempDir::new().unwrap();
    let cfg = config(temp.path()).with_no_cleanup(true);
    let build = Build::new(vec![stage("scratch", "")], cfg).unwrap();

    let paths = build.bundle_paths();
    assert_eq!(build.cleanup(), CleanupOutcome::Retained(paths.clone()));
    assert!(paths[0].is_dir(), "bundle kept for debugging");
    assert_eq!(build.cleanup(), CleanupOutcome::AlreadyDone);
}

// =============================================================================
// Pipeline Tests
// =============================================================================

#[tokio::test]
async fn test_scratch_flat_tree_build() {
    let temp = TempDir::new().unwrap();
    let mut build = Build::new(vec![stage("scratch", "")], config(temp.path()))
        .unwrap()
        .with_launcher(unprivileged());
    let paths = build.bundle_paths();

    build.full(CancellationToken::new()).await.unwrap();

    let dest = temp.path().join("out");
    let entries: Vec<String> = fs::read_dir(&dest)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(entries, vec![".imgbuild.d"]);
    assert!(dest.join(".imgbuild.d/runscript").is_file());
    assert!(dest.join(".imgbuild.d/Definition").is_file());
    assert!(dest.join(".imgbuild.d/env/90-environment.sh").is_file());

    let labels = fs::read_to_string(dest.join(".imgbuild.d/labels.json")).unwrap();
    assert!(labels.contains("org.label-schema.schema-version"));
    assert!(labels.contains("usage.imgbuild.deffile.bootstrap"));

    assert!(paths.iter().all(|p| !p.exists()), "bundles removed");
    assert_eq!(build.cleanup(), CleanupOutcome::AlreadyDone);
}

#[tokio::test]
async fn test_scratch_build_keeps_bundles_with_no_cleanup() {
    let temp = TempDir::new().unwrap();
    let cfg = config(temp.path()).with_no_cleanup(true);
    let mut build = Build::new(vec![stage("scratch", "")], cfg)
        .unwrap()
        .with_launcher(unprivileged());
    let paths = build.bundle_paths();

    build.full(CancellationToken::new()).await.unwrap();

    assert!(paths[0].is_dir());
    assert_eq!(build.cleanup(), CleanupOutcome::AlreadyDone);
}

#[tokio::test]
async fn test_runscript_written_into_tree() {
    let temp = TempDir::new().unwrap();
    let mut def = stage("scratch", "");
    def.image_data.runscript = "exec /bin/echo hello".to_string();
    def.build_data.labels.insert("maintainer".to_string(), "ops".to_string());

    let mut build = Build::new(vec![def], config(temp.path()))
        .unwrap()
        .with_launcher(unprivileged());
    build.full(CancellationToken::new()).await.unwrap();

    let dest = temp.path().join("out");
    let runscript = fs::read_to_string(dest.join(".imgbuild.d/runscript")).unwrap();
    assert!(runscript.contains("exec /bin/echo hello"));
    let labels = fs::read_to_string(dest.join(".imgbuild.d/labels.json")).unwrap();
    assert!(labels.contains("\"maintainer\""));
}

#[tokio::test]
async fn test_post_script_requires_privilege() {
    let temp = TempDir::new().unwrap();
    let mut def = stage("scratch", "");
    def.build_data.post = "echo hello".to_string();

    let mut build = Build::new(vec![def], config(temp.path()))
        .unwrap()
        .with_launcher(unprivileged());
    let paths = build.bundle_paths();

    let err = build.full(CancellationToken::new()).await.unwrap_err();
    assert!(err.is_privilege(), "unexpected error: {}", err);
    assert!(err.to_string().contains("non-root"));
    assert!(paths.iter().all(|p| !p.exists()), "bundles removed on failure");
    assert!(!temp.path().join("out").exists(), "nothing assembled");
}

#[tokio::test]
async fn test_pre_script_requires_privilege() {
    let temp = TempDir::new().unwrap();
    let mut def = stage("scratch", "");
    def.build_data.pre = "touch /tmp/should-not-run".to_string();

    let mut build = Build::new(vec![def], config(temp.path()))
        .unwrap()
        .with_launcher(unprivileged());

    let err = build.full(CancellationToken::new()).await.unwrap_err();
    assert!(err.is_privilege());
}

#[tokio::test]
async fn test_copy_from_unknown_stage() {
    let temp = TempDir::new().unwrap();
    let mut second = stage("scratch", "final");
    second.build_data.files.push(FileCopy {
        stage: Some("missing".to_string()),
        files: vec![FileTransfer {
            src: "/etc/hostname".to_string(),
            dst: String::new(),
        }],
    });
    let defs = vec![stage("scratch", "base"), second];

    let mut build = Build::new(defs, config(temp.path()))
        .unwrap()
        .with_launcher(unprivileged());
    let paths = build.bundle_paths();

    let err = build.full(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::StageNotFound(ref s) if s == "missing"));
    assert_eq!(err.to_string(), "stage missing was not found");
    assert!(paths.iter().all(|p| !p.exists()));
}

#[tokio::test]
async fn test_copy_from_later_stage_not_found() {
    let temp = TempDir::new().unwrap();
    let mut first = stage("scratch", "first");
    first.build_data.files.push(FileCopy {
        stage: Some("second".to_string()),
        files: vec![FileTransfer {
            src: "/data".to_string(),
            dst: "/data".to_string(),
        }],
    });
    let defs = vec![first, stage("scratch", "second")];

    let mut build = Build::new(defs, config(temp.path()))
        .unwrap()
        .with_launcher(unprivileged());

    let err = build.full(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::StageNotFound(ref s) if s == "second"));
}

#[tokio::test]
async fn test_cancel_after_completion_is_noop() {
    let temp = TempDir::new().unwrap();
    let mut build = Build::new(vec![stage("scratch", "")], config(temp.path()))
        .unwrap()
        .with_launcher(unprivileged());

    let cancel = CancellationToken::new();
    build.full(cancel.clone()).await.unwrap();
    cancel.cancel();

    assert!(temp.path().join("out/.imgbuild.d").is_dir());
    assert_eq!(build.cleanup(), CleanupOutcome::AlreadyDone);
}

// =============================================================================
// Cancellation Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_build_is_interrupted() {
    for _ in 0..20 {
        let temp = TempDir::new().unwrap();
        let defs = vec![stage("scratch", "one"), stage("scratch", "two")];
        let mut build = Build::new(defs, config(temp.path()))
            .unwrap()
            .with_launcher(unprivileged());
        let paths = build.bundle_paths();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = build.full(cancel).await.unwrap_err();

        assert!(matches!(err, Error::Interrupted), "unexpected result: {}", err);
        assert!(!temp.path().join("out").exists(), "no artifact after cancel");
        assert!(paths.iter().all(|p| !p.exists()), "bundles removed");
        assert_eq!(build.cleanup(), CleanupOutcome::AlreadyDone);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_while_running_never_assembles_after_interrupt() {
    for _ in 0..20 {
        let temp = TempDir::new().unwrap();
        let defs = vec![
            stage("scratch", "one"),
            stage("scratch", "two"),
            stage("scratch", "three"),
        ];
        let mut build = Build::new(defs, config(temp.path()))
            .unwrap()
            .with_launcher(unprivileged());

        let cancel = CancellationToken::new();
        let trigger = tokio::spawn({
            let cancel = cancel.clone();
            async move { cancel.cancel() }
        });
        let result = build.full(cancel).await;
        trigger.await.unwrap();

        match result {
            Ok(()) => assert!(temp.path().join("out/.imgbuild.d").is_dir()),
            Err(Error::Interrupted) => assert!(!temp.path().join("out").exists()),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}

#[tokio::test]
async fn test_retained_bundles_reported_after_cancel() {
    let temp = TempDir::new().unwrap();
    let cfg = config(temp.path()).with_no_cleanup(true);
    let mut build = Build::new(vec![stage("scratch", "")], cfg)
        .unwrap()
        .with_launcher(unprivileged());
    let paths = build.bundle_paths();

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(build.full(cancel).await, Err(Error::Interrupted)));
    assert!(paths[0].is_dir());
    assert_eq!(build.cleanup(), CleanupOutcome::AlreadyDone);
}

// =============================================================================
// Stage Copy Tests
// =============================================================================

#[tokio::test]
async fn test_stage_copy_with_spaces_in_tmp_dir() {
    let temp = TempDir::new().unwrap();
    let tree = temp.path().join("tree");
    fs::create_dir_all(tree.join("srv")).unwrap();
    fs::write(tree.join("srv/hello.txt"), "hello").unwrap();

    let mut base = stage("localimage", "base");
    base.header.insert("from".to_string(), tree.display().to_string());
    let mut last = stage("scratch", "final");
    last.build_data.files.push(FileCopy {
        stage: Some("base".to_string()),
        files: vec![FileTransfer {
            src: "/srv/hello.txt".to_string(),
            dst: "/copied".to_string(),
        }],
    });

    let tmp = temp.path().join("my tmp");
    fs::create_dir_all(&tmp).unwrap();
    let mut cfg = config(temp.path()).with_no_cleanup(true);
    cfg.opts.tmp_dir = tmp;

    let mut build = Build::new(vec![base, last], cfg)
        .unwrap()
        .with_launcher(unprivileged());
    assert_eq!(build.stages()[0].source_kind(), Some(SourceKind::LocalImage));
    let paths = build.bundle_paths();

    // %files makes the engine required, which an unprivileged launcher refuses
    // only after stage copies are done.
    let err = build.full(CancellationToken::new()).await.unwrap_err();
    assert!(err.is_privilege(), "unexpected error: {}", err);

    let copied = paths[1].join("rootfs/copied");
    assert_eq!(fs::read_to_string(copied).unwrap(), "hello");
}
