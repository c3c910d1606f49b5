//! # Source ConveyorPackers
//!
//! A [`ConveyorPacker`] fetches source content into a bundle ("convey") and
//! normalizes it into a root filesystem ("pack"). One implementation exists
//! per source kind; the definition's `bootstrap` header picks it.
//!
//! | `bootstrap`                                  | Kind                      | Module        |
//! |----------------------------------------------|---------------------------|---------------|
//! | `library`, `shub`                            | remote packed image       | [`remote`]    |
//! | `docker`, `oci`                              | OCI distribution pull     | [`oci`]       |
//! | `docker-archive`, `oci-archive`, `docker-daemon` | image archive         | [`oci`]       |
//! | `debootstrap`, `arch`, `yum`, `zypper`, `busybox` | OS bootstrap         | [`bootstrap`] |
//! | `localimage`                                 | existing tree or image    | [`local`]     |
//! | `scratch`                                    | empty root                | [`scratch`]   |
//!
//! Dispatch ([`SourceKind::from_bootstrap`], [`conveyor_packer`]) is a pure
//! function of the header: it touches no files and no network, so a whole
//! multi-stage build can be validated before any working directory exists.

pub mod bootstrap;
pub mod layers;
pub mod local;
pub mod oci;
pub mod remote;
pub mod scratch;

use crate::bundle::Bundle;
use crate::definition::Definition;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fmt;

/// Fetch + normalize contract for one source kind.
#[async_trait]
pub trait ConveyorPacker: Send {
    /// Source kind this packer handles.
    fn kind(&self) -> SourceKind;

    /// Fetches source content into `bundle` (downloads, archives, caches).
    async fn fetch(&mut self, bundle: &Bundle) -> Result<()>;

    /// Lays the fetched content out as `bundle`'s root filesystem.
    async fn pack(&mut self, bundle: &mut Bundle) -> Result<()>;
}

/// Transport of an OCI-family source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OciTransport {
    /// `docker://` or `oci://` registry pull.
    Registry,
    /// Tarball written by `docker save`.
    DockerArchive,
    /// Tarball of an OCI image layout.
    OciArchive,
    /// Image from the local Docker daemon.
    DockerDaemon,
}

/// OS bootstrap flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapFlavor {
    Debootstrap,
    Arch,
    Yum,
    Zypper,
    Busybox,
}

/// Remote packed-image service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteService {
    Library,
    Shub,
}

/// Source kind selected by the `bootstrap` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Remote(RemoteService),
    Oci(OciTransport),
    Bootstrap(BootstrapFlavor),
    LocalImage,
    Scratch,
}

impl SourceKind {
    /// Maps a `bootstrap` header value to its source kind.
    ///
    /// # Errors
    ///
    /// - [`Error::NoBootstrap`] for an empty key
    /// - [`Error::InvalidBootstrap`] naming any unknown key
    pub fn from_bootstrap(key: &str) -> Result<Self> {
        let kind = match key {
            "library" => Self::Remote(RemoteService::Library),
            "shub" => Self::Remote(RemoteService::Shub),
            "docker" | "oci" => Self::Oci(OciTransport::Registry),
            "docker-archive" => Self::Oci(OciTransport::DockerArchive),
            "oci-archive" => Self::Oci(OciTransport::OciArchive),
            "docker-daemon" => Self::Oci(OciTransport::DockerDaemon),
            "debootstrap" => Self::Bootstrap(BootstrapFlavor::Debootstrap),
            "arch" => Self::Bootstrap(BootstrapFlavor::Arch),
            "yum" => Self::Bootstrap(BootstrapFlavor::Yum),
            "zypper" => Self::Bootstrap(BootstrapFlavor::Zypper),
            "busybox" => Self::Bootstrap(BootstrapFlavor::Busybox),
            "localimage" => Self::LocalImage,
            "scratch" => Self::Scratch,
            "" => return Err(Error::NoBootstrap),
            other => return Err(Error::InvalidBootstrap(other.to_string())),
        };
        Ok(kind)
    }

    /// Returns true if fetching this kind stores material in the image cache.
    pub fn needs_cache(&self) -> bool {
        matches!(self, Self::Remote(_) | Self::Oci(OciTransport::Registry))
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Remote(RemoteService::Library) => "library",
            Self::Remote(RemoteService::Shub) => "shub",
            Self::Oci(OciTransport::Registry) => "oci registry",
            Self::Oci(OciTransport::DockerArchive) => "docker-archive",
            Self::Oci(OciTransport::OciArchive) => "oci-archive",
            Self::Oci(OciTransport::DockerDaemon) => "docker-daemon",
            Self::Bootstrap(BootstrapFlavor::Debootstrap) => "debootstrap",
            Self::Bootstrap(BootstrapFlavor::Arch) => "arch",
            Self::Bootstrap(BootstrapFlavor::Yum) => "yum",
            Self::Bootstrap(BootstrapFlavor::Zypper) => "zypper",
            Self::Bootstrap(BootstrapFlavor::Busybox) => "busybox",
            Self::LocalImage => "localimage",
            Self::Scratch => "scratch",
        };
        f.write_str(name)
    }
}

/// Constructs the packer for `kind`. No I/O happens here.
pub fn new_conveyor_packer(kind: SourceKind) -> Box<dyn ConveyorPacker> {
    match kind {
        SourceKind::Remote(service) => Box::new(remote::RemoteConveyorPacker::new(service)),
        SourceKind::Oci(transport) => Box::new(oci::OciConveyorPacker::new(transport)),
        SourceKind::Bootstrap(flavor) => Box::new(bootstrap::BootstrapConveyorPacker::new(flavor)),
        SourceKind::LocalImage => Box::new(local::LocalConveyorPacker::from_header()),
        SourceKind::Scratch => Box::new(scratch::ScratchConveyorPacker),
    }
}

/// Selects the packer for `def` by its `bootstrap` header.
pub fn conveyor_packer(def: &Definition) -> Result<Box<dyn ConveyorPacker>> {
    SourceKind::from_bootstrap(def.bootstrap()).map(new_conveyor_packer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_table() {
        let cases = [
            ("library", SourceKind::Remote(RemoteService::Library)),
            ("shub", SourceKind::Remote(RemoteService::Shub)),
            ("docker", SourceKind::Oci(OciTransport::Registry)),
            ("oci", SourceKind::Oci(OciTransport::Registry)),
            ("docker-archive", SourceKind::Oci(OciTransport::DockerArchive)),
            ("oci-archive", SourceKind::Oci(OciTransport::OciArchive)),
            ("docker-daemon", SourceKind::Oci(OciTransport::DockerDaemon)),
            ("debootstrap", SourceKind::Bootstrap(BootstrapFlavor::Debootstrap)),
            ("arch", SourceKind::Bootstrap(BootstrapFlavor::Arch)),
            ("yum", SourceKind::Bootstrap(BootstrapFlavor::Yum)),
            ("zypper", SourceKind::Bootstrap(BootstrapFlavor::Zypper)),
            ("busybox", SourceKind::Bootstrap(BootstrapFlavor::Busybox)),
            ("localimage", SourceKind::LocalImage),
            ("scratch", SourceKind::Scratch),
        ];
        for (key, expected) in cases {
            let kind = SourceKind::from_bootstrap(key).unwrap();
            assert_eq!(kind, expected, "key {}", key);
            assert_eq!(new_conveyor_packer(kind).kind(), expected, "packer for {}", key);
        }
    }

    #[test]
    fn test_empty_and_unknown_keys() {
        assert!(matches!(SourceKind::from_bootstrap(""), Err(Error::NoBootstrap)));
        let err = SourceKind::from_bootstrap("floppy").unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(err.to_string(), "invalid build source floppy");
    }
}
