//! # imgbuild
//!
//! **Multi-Stage Container Image Builder with a Privilege-Separated Engine**
//!
//! This crate builds container images from heterogeneous sources (registries,
//! OS bootstrap tools, existing images, empty roots) through a stage-based
//! pipeline. Build scripts and every mount, loop-device and root-replacement
//! operation run in a separately spawned privileged helper; the orchestrator
//! itself never touches a namespace.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        imgbuild (unprivileged)                      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                     Stage Sequencer                         │    │
//! │  │   pre → fetch → pack → apps → %files → engine → metadata    │    │
//! │  │                   last stage: assemble                      │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │           │                                       │                 │
//! │  ┌────────┴──────────────┐            ┌───────────┴──────────┐      │
//! │  │   ConveyorPackers     │            │     Assemblers       │      │
//! │  │ remote │ oci │ boot-  │            │ flat-tree │ packed-  │      │
//! │  │ strap │ local │scratch│            │           │ image    │      │
//! │  └───────────────────────┘            └──────────────────────┘      │
//! │                              │                                      │
//! │                     EngineLauncher (config pipe)                    │
//! ├──────────────────────────────┼──────────────────────────────────────┤
//! │                   imgbuild-engine (privileged)                      │
//! │  ┌──────────────────┐   socketpair   ┌──────────────────────────┐   │
//! │  │ builder / query  │ ─────────────► │ RPC server: mount, loop, │   │
//! │  │     engines      │ ◄───────────── │ mkdir, chroot            │   │
//! │  └──────────────────┘                └──────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Security Model
//!
//! - **Privilege separation**: the orchestrator refuses to launch the helper
//!   unless it runs as root, and the helper performs privileged work only
//!   through typed RPC calls ([`rpc::PrivilegedOps`]).
//! - **Scoped elevation**: loop attachment elevates the filesystem uid on one
//!   pinned OS thread and restores it on every path ([`loopdev::FsuidGuard`]).
//! - **Path Traversal Protection**: layer and archive extraction reject `..`
//!   and absolute entries; `%files` destinations cannot leave the rootfs
//!   ([`files::add_prefix`]).
//! - **Size Limits**: bounded constants cap layers, root filesystems, the
//!   engine configuration and RPC lines (see [`constants`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use imgbuild::{Build, BuildConfig, Definition, OutputFormat, Settings};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> imgbuild::Result<()> {
//!     let settings = Settings::from_env();
//!     let def = Definition::from_uri("docker://alpine:3.18")?;
//!     let config = BuildConfig::new("/tmp/alpine", OutputFormat::FlatTree)
//!         .with_options(settings.options());
//!
//!     let mut build = Build::new(vec![def], config)?;
//!     build.full(CancellationToken::new()).await
//! }
//! ```

pub mod apps;
pub mod assemblers;
pub mod build;
pub mod bundle;
pub mod cache;
pub mod config;
pub mod constants;
pub mod definition;
pub mod engine;
pub mod error;
pub mod files;
pub mod image;
pub mod inspect;
pub mod loopdev;
pub mod metadata;
pub mod mount;
pub mod ocibundle;
pub mod rpc;
pub mod sources;

// Re-exports
pub use assemblers::{Assembler, FlatTreeAssembler, PackedImageAssembler};
pub use build::{Build, CleanupOutcome, Stage};
pub use bundle::{Bundle, Labels};
pub use cache::ImageCache;
pub use config::{BuildConfig, Options, OutputFormat, Settings};
pub use definition::Definition;
pub use engine::{EngineConfig, EngineLauncher};
pub use error::{Error, Result};
pub use image::{ImageWriter, PackedImage};
pub use inspect::{InspectReport, InspectRequest, inspect};
pub use ocibundle::Materializer;
pub use rpc::PrivilegedOps;
pub use sources::{ConveyorPacker, SourceKind, conveyor_packer};
