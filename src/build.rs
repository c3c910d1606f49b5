//! # Stage Sequencer
//!
//! A [`Build`] turns an ordered list of [`Definition`]s into one artifact.
//! Each definition becomes a [`Stage`] with its own [`Bundle`]; later
//! stages may copy files out of earlier ones, and only the last stage is
//! assembled.
//!
//! ## Pipeline
//!
//! ```text
//! for each stage:
//!   pre (host, root) → fetch → pack          (or: unpack dest when updating)
//!                    → apps → %files from <stage>
//!                    → engine (setup, host files, post, test) if required
//!                    → metadata
//! last stage: aggregate labels → assemble → dest
//! ```
//!
//! ## Cleanup
//!
//! Bundles are removed exactly once, whichever comes first:
//!
//! - [`Build::full`] returning, normally or after its [`CancellationToken`]
//!   fired (removal runs on the blocking pool)
//! - the scoped guard dropped if the `full` future itself is dropped
//! - an explicit [`Build::cleanup`] call
//!
//! Cancellation is observed ahead of the stages on every poll and at each
//! stage boundary. Assembly starts only if the token has not fired, and is
//! never interrupted once started, so an interrupted build leaves no
//! artifact behind.
//!
//! With `no_cleanup` set the bundles are kept and their paths reported.

use crate::apps::Apps;
use crate::assemblers::{self, Assembler};
use crate::bundle::Bundle;
use crate::config::{BuildConfig, Settings};
use crate::constants::{BUNDLE_PREFIX, ENV_ROOTFS, validate_name};
use crate::definition::Definition;
use crate::engine::EngineLauncher;
use crate::error::{Error, Result};
use crate::files;
use crate::metadata;
use crate::sources::local::LocalConveyorPacker;
use crate::sources::{ConveyorPacker, SourceKind, conveyor_packer};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Cleanup
// =============================================================================

/// Result of a cleanup attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Bundles were removed (paths listed).
    Removed(Vec<PathBuf>),
    /// `no_cleanup` was set; bundles kept at these paths.
    Retained(Vec<PathBuf>),
    /// Cleanup had already run.
    AlreadyDone,
}

/// Do-once removal of every stage's bundle.
#[derive(Debug)]
struct Cleanup {
    paths: Vec<PathBuf>,
    retain: bool,
    done: AtomicBool,
}

impl Cleanup {
    fn run(&self) -> CleanupOutcome {
        if self.done.swap(true, Ordering::SeqCst) {
            return CleanupOutcome::AlreadyDone;
        }

        if self.retain {
            info!(
                "Build performed with no clean up option, build bundle(s) located at: {:?}",
                self.paths
            );
            return CleanupOutcome::Retained(self.paths.clone());
        }

        for path in &self.paths {
            if !path.exists() {
                continue;
            }
            if let Err(e) = fs::remove_dir_all(path) {
                error!(bundle = %path.display(), error = %e, "failed to remove bundle");
            }
        }
        debug!("Build bundle(s) cleaned: {:?}", self.paths);
        CleanupOutcome::Removed(self.paths.clone())
    }
}

/// Runs the shared cleanup when dropped.
struct CleanupGuard(Arc<Cleanup>);

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.0.run();
    }
}

// =============================================================================
// Stages
// =============================================================================

/// One definition's slot in the pipeline.
pub struct Stage {
    name: String,
    bundle: Bundle,
    packer: Option<Box<dyn ConveyorPacker>>,
    assembler: Option<Box<dyn Assembler>>,
}

impl Stage {
    /// Stage name from the `stage` header; empty for single-stage builds
    /// without one.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    /// Source kind of this stage's packer, if it fetches.
    pub fn source_kind(&self) -> Option<SourceKind> {
        self.packer.as_ref().map(|p| p.kind())
    }

    pub fn has_assembler(&self) -> bool {
        self.assembler.is_some()
    }
}

/// A multi-stage build.
pub struct Build {
    stages: Vec<Stage>,
    config: BuildConfig,
    launcher: EngineLauncher,
    cleanup: Arc<Cleanup>,
}

impl Build {
    /// Validates `defs` against `config` and creates one bundle per stage.
    ///
    /// All configuration errors (stage names, bootstrap keys, missing image
    /// cache) are reported before any directory is created.
    pub fn new(defs: Vec<Definition>, config: BuildConfig) -> Result<Self> {
        if defs.is_empty() {
            return Err(Error::InvalidDefinition("no definitions given".to_string()));
        }

        let last = defs.len() - 1;
        let mut plans = Vec::with_capacity(defs.len());
        for (index, def) in defs.iter().enumerate() {
            let name = match def.stage_name() {
                Some(name) => {
                    validate_name(name).map_err(|e| {
                        Error::InvalidDefinition(format!("stage name '{}': {}", name, e))
                    })?;
                    name.to_string()
                }
                None if defs.len() > 1 => return Err(Error::MissingStageName { index }),
                None => String::new(),
            };

            let fetches = index != last || config.opts.bootstraps();
            let packer = if fetches {
                let packer = conveyor_packer(def)?;
                if packer.kind().needs_cache() && config.opts.image_cache.is_none() {
                    return Err(Error::UndefinedImageCache);
                }
                Some(packer)
            } else {
                None
            };
            plans.push((name, packer));
        }

        let mut stages: Vec<Stage> = Vec::with_capacity(defs.len());
        for (index, (def, (name, packer))) in defs.into_iter().zip(plans).enumerate() {
            let mut bundle = match Bundle::new(&config.opts.tmp_dir, BUNDLE_PREFIX) {
                Ok(b) => b,
                Err(e) => {
                    for stage in &stages {
                        let path = &stage.bundle.path;
                        if let Err(err) = fs::remove_dir_all(path) {
                            error!(bundle = %path.display(), error = %err, "failed to remove bundle");
                        }
                    }
                    return Err(e);
                }
            };
            bundle.recipe = def;
            bundle.opts = config.opts.clone();

            let assembler = (index == last).then(|| assemblers::for_format(config.format));
            stages.push(Stage {
                name,
                bundle,
                packer,
                assembler,
            });
        }

        let cleanup = Arc::new(Cleanup {
            paths: stages.iter().map(|s| s.bundle.path.clone()).collect(),
            retain: config.no_cleanup,
            done: AtomicBool::new(false),
        });

        Ok(Self {
            stages,
            launcher: EngineLauncher::new(Settings::from_env().engine),
            config,
            cleanup,
        })
    }

    /// Replaces the engine launcher.
    #[must_use]
    pub fn with_launcher(mut self, launcher: EngineLauncher) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Bundle directories of every stage, in stage order.
    pub fn bundle_paths(&self) -> Vec<PathBuf> {
        self.cleanup.paths.clone()
    }

    /// Removes every bundle unless `no_cleanup` is set. Safe to call more
    /// than once; later calls return [`CleanupOutcome::AlreadyDone`].
    pub fn cleanup(&self) -> CleanupOutcome {
        self.cleanup.run()
    }

    /// Runs the whole pipeline and assembles the artifact at the
    /// configured destination.
    ///
    /// Cancelling `cancel` before assembly starts aborts the pipeline at the
    /// next await point or stage boundary and this returns
    /// [`Error::Interrupted`]. Bundles are cleaned up on every exit path.
    pub async fn full(&mut self, cancel: CancellationToken) -> Result<()> {
        info!("Starting build...");
        let _guard = CleanupGuard(self.cleanup.clone());

        let mut result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Interrupted),
            result = self.run_stages(&cancel) => result,
        };
        if result.is_ok() {
            result = if cancel.is_cancelled() {
                Err(Error::Interrupted)
            } else {
                self.assemble().await
            };
        }
        if matches!(result, Err(Error::Interrupted)) {
            warn!("build interrupted, cleaning up");
        }

        let cleanup = self.cleanup.clone();
        match tokio::task::spawn_blocking(move || cleanup.run()).await {
            Ok(CleanupOutcome::Retained(paths)) if result.is_err() => {
                warn!("bundles retained at {:?}", paths);
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "cleanup task failed"),
        }

        if result.is_ok() {
            info!("Build complete: {}", self.config.dest.display());
        }
        result
    }

    async fn run_stages(&mut self, cancel: &CancellationToken) -> Result<()> {
        let count = self.stages.len();
        for index in 0..count {
            if cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            let (built, rest) = self.stages.split_at_mut(index);
            let stage = &mut rest[0];
            info!(stage = %stage.name, "building stage {}/{}", index + 1, count);

            run_pre_script(&self.launcher, &stage.bundle).await?;

            match stage.packer.as_mut() {
                Some(packer) => {
                    packer.fetch(&stage.bundle).await.map_err(fetch_error)?;
                    packer.pack(&mut stage.bundle).await.map_err(pack_error)?;
                }
                None => {
                    info!("Building into existing container: {}", self.config.dest.display());
                    let mut local = LocalConveyorPacker::new(&self.config.dest);
                    local.fetch(&stage.bundle).await?;
                    local.pack(&mut stage.bundle).await?;
                }
            }

            let mut apps = Apps::new();
            for (ident, data) in &stage.bundle.recipe.custom_data {
                apps.handle_section(ident, data)?;
            }
            apps.handle_bundle(&stage.bundle)?;
            stage.bundle.recipe.build_data.post.push_str(&apps.handle_post());

            if stage.bundle.run_section("files") {
                copy_stage_files(built, &stage.bundle)?;
            }

            metadata::insert_base_env(&stage.bundle)?;
            if stage.bundle.recipe.engine_required() {
                self.launcher.run(&stage.bundle).await?;
            }

            debug!("Inserting Metadata");
            metadata::insert_metadata(&stage.bundle)?;
        }

        Ok(())
    }

    /// Aggregates labels into the last stage and writes the artifact.
    async fn assemble(&mut self) -> Result<()> {
        let Some(last) = self.stages.last_mut() else {
            return Ok(());
        };
        metadata::aggregate_labels(&mut last.bundle);

        debug!("Calling assembler");
        let assembler = last
            .assembler
            .as_ref()
            .ok_or_else(|| Error::Internal("last stage has no assembler".to_string()))?;
        assembler.assemble(&mut last.bundle, &self.config.dest).await
    }
}

/// Runs `%pre` on the host. Needs root.
async fn run_pre_script(launcher: &EngineLauncher, bundle: &Bundle) -> Result<()> {
    let pre = &bundle.recipe.build_data.pre;
    if !bundle.run_section("pre") || pre.trim().is_empty() {
        return Ok(());
    }
    if !launcher.is_privileged() {
        return Err(Error::privilege(
            "Attempted to build with scripts as non-root user",
        ));
    }

    info!("Running pre scriptlet");
    let status = Command::new("/bin/sh")
        .arg("-e")
        .arg("-c")
        .arg(pre)
        .env(ENV_ROOTFS, &bundle.rootfs)
        .current_dir(&bundle.path)
        .status()
        .await?;
    if !status.success() {
        return Err(Error::ScriptFailed {
            section: "pre".to_string(),
            code: status.code(),
        });
    }
    Ok(())
}

/// Copies `%files from <stage>` directives into `bundle`.
///
/// The source stage of each directive is resolved before any of its files
/// are copied.
fn copy_stage_files(built: &[Stage], bundle: &Bundle) -> Result<()> {
    for copy in &bundle.recipe.build_data.files {
        let Some(stage_name) = copy.stage.as_deref() else {
            continue;
        };
        let source = find_stage(built, stage_name)?;

        for transfer in &copy.files {
            if transfer.src.is_empty() {
                warn!("Attempt to copy file with no name, skipping");
                continue;
            }
            let dst = if transfer.dst.is_empty() {
                &transfer.src
            } else {
                &transfer.dst
            };
            let dst = files::add_prefix(&bundle.rootfs, Path::new(dst));
            info!(stage = stage_name, src = %transfer.src, dst = %dst.display(), "copying from stage");
            files::copy_from(&source.bundle.rootfs, &transfer.src, &dst)?;
        }
    }
    Ok(())
}

/// Linear search over the stages built so far.
fn find_stage<'a>(built: &'a [Stage], name: &str) -> Result<&'a Stage> {
    built
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| Error::StageNotFound(name.to_string()))
}

fn fetch_error(e: Error) -> Error {
    match e {
        Error::FetchFailed(_) => e,
        e if e.is_configuration() || e.is_privilege() => e,
        e => Error::FetchFailed(e.to_string()),
    }
}

fn pack_error(e: Error) -> Error {
    match e {
        Error::PackFailed(_) => e,
        e if e.is_configuration() || e.is_privilege() => e,
        e => Error::PackFailed(e.to_string()),
    }
}
