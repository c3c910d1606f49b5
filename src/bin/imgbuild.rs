//! # imgbuild - Container Image Builder CLI
//!
//! ## Usage
//!
//! ```text
//! imgbuild build [OPTIONS] <DEST> <SPEC>...
//! imgbuild inspect [OPTIONS] <IMAGE>
//! ```
//!
//! Each `SPEC` is either a source URI (`docker://alpine:3.18`,
//! `localimage:///srv/base.img`) or a path to a JSON definition. Multiple
//! specs form a multi-stage build; the last one produces the artifact.
//!
//! Scripted stages and packed-image inspection need root: the work runs in
//! the `imgbuild-engine` helper, located next to this binary or through
//! `IMGBUILD_ENGINE`.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use imgbuild::{
    Build, BuildConfig, Definition, EngineLauncher, InspectRequest, OutputFormat, Settings,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "imgbuild")]
#[command(about = "Multi-stage container image builder", version)]
struct Cli {
    /// Print debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Only print errors
    #[arg(short, long, global = true, conflicts_with = "debug")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from one or more stage specs
    Build(BuildArgs),

    /// Show metadata stored in an image
    Inspect(InspectArgs),
}

#[derive(Args)]
struct BuildArgs {
    /// Output format: flat-tree or packed-image
    #[arg(short, long, default_value = "packed-image")]
    format: OutputFormat,

    /// Keep bundle directories for debugging
    #[arg(long)]
    no_cleanup: bool,

    /// Build into an existing flat tree
    #[arg(short, long)]
    update: bool,

    /// Bootstrap even when updating
    #[arg(short = 'F', long)]
    force: bool,

    /// Skip the %test script
    #[arg(short = 'T', long)]
    notest: bool,

    /// Only run the named sections (repeatable)
    #[arg(short, long = "section", value_name = "SECTION")]
    sections: Vec<String>,

    /// Destination of the artifact
    dest: PathBuf,

    /// Source URIs or JSON definition files, one per stage
    #[arg(required = true)]
    specs: Vec<String>,
}

#[derive(Args)]
struct InspectArgs {
    /// Show labels (default when nothing else is selected)
    #[arg(short, long)]
    labels: bool,

    /// Show the definition the image was built from
    #[arg(short = 'D', long)]
    deffile: bool,

    /// Show the runscript
    #[arg(short, long)]
    runscript: bool,

    /// Show the test script
    #[arg(short, long)]
    test: bool,

    /// Show environment scripts
    #[arg(short, long)]
    environment: bool,

    /// Show the help file
    #[arg(short = 'H', long)]
    helpfile: bool,

    /// List installed apps
    #[arg(long)]
    list_apps: bool,

    /// Inspect an app instead of the image
    #[arg(long)]
    app: Option<String>,

    /// Print JSON
    #[arg(short, long)]
    json: bool,

    /// Image file or flat tree
    image: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.debug {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };
    init_logging(level);

    let result = match cli.command {
        Commands::Build(args) => cmd_build(args, level).await,
        Commands::Inspect(args) => cmd_inspect(args, level).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

// =============================================================================
// Build
// =============================================================================

async fn cmd_build(args: BuildArgs, level: Level) -> Result<()> {
    let defs = args
        .specs
        .iter()
        .map(|spec| load_definition(spec))
        .collect::<Result<Vec<_>>>()?;

    let settings = Settings::from_env();
    let mut opts = settings.options();
    opts.update = args.update;
    opts.force = args.force;
    opts.no_test = args.notest;
    if !args.sections.is_empty() {
        opts.sections = args.sections;
    }

    if opts.update && args.format != OutputFormat::FlatTree {
        bail!("--update is only supported with the flat-tree format");
    }

    let config = BuildConfig::new(&args.dest, args.format)
        .with_no_cleanup(args.no_cleanup)
        .with_options(opts);

    let launcher = EngineLauncher::new(&settings.engine).with_log_level(level.to_string());
    let mut build = Build::new(defs, config)?.with_launcher(launcher);

    let cancel = CancellationToken::new();
    let listener = tokio::spawn(forward_signals(cancel.clone()));

    info!(dest = %args.dest.display(), stages = build.stages().len(), "starting build");
    let result = build.full(cancel).await;
    listener.abort();

    result.with_context(|| format!("while performing build of {}", args.dest.display()))?;
    info!(dest = %args.dest.display(), "build complete");
    Ok(())
}

fn load_definition(spec: &str) -> Result<Definition> {
    if Definition::is_uri(spec) {
        return Ok(Definition::from_uri(spec)?);
    }
    let data = std::fs::read_to_string(spec)
        .with_context(|| format!("unable to read definition {}", spec))?;
    Definition::from_json(&data).with_context(|| format!("unable to parse definition {}", spec))
}

/// Cancels `token` on the first SIGINT or SIGTERM.
async fn forward_signals(token: CancellationToken) {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM");
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!("received SIGINT"),
        _ = term.recv() => debug!("received SIGTERM"),
    }
    warn!("interrupted, cleaning up");
    token.cancel();
}

// =============================================================================
// Inspect
// =============================================================================

async fn cmd_inspect(args: InspectArgs, level: Level) -> Result<()> {
    let request = InspectRequest {
        labels: args.labels,
        deffile: args.deffile,
        runscript: args.runscript,
        test: args.test,
        environment: args.environment,
        helpfile: args.helpfile,
        list_apps: args.list_apps,
        app: args.app,
    };

    let settings = Settings::from_env();
    let launcher = EngineLauncher::new(&settings.engine).with_log_level(level.to_string());
    let report = imgbuild::inspect(&args.image, &request, &launcher, &settings.tmp_dir).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render());
    }
    Ok(())
}
