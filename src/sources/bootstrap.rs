//! OS bootstrap sources.
//!
//! Each flavor drives the distribution's own bootstrap tool against the
//! bundle's rootfs. Definition header keys:
//!
//! | Key         | Used by                             |
//! |-------------|-------------------------------------|
//! | `osversion` | debootstrap (suite), yum, zypper    |
//! | `mirrorurl` | debootstrap, yum, zypper, busybox   |
//! | `include`   | debootstrap, arch, yum, zypper      |
//!
//! Package-manager flavors need root; busybox only downloads a static
//! binary and works unprivileged.

use super::{BootstrapFlavor, ConveyorPacker, SourceKind};
use crate::bundle::Bundle;
use crate::constants::IMAGE_PULL_TIMEOUT;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};

const DEFAULT_BUSYBOX_URL: &str = "https://www.busybox.net/downloads/binaries/1.31.0-i686-uclibc/busybox";

/// Skeleton directories created before a busybox root is populated.
const BUSYBOX_DIRS: &[&str] = &[
    "bin", "dev", "etc", "home", "proc", "root", "sbin", "sys", "tmp", "usr/bin", "usr/sbin",
    "var/tmp",
];

/// Header values a bootstrap flavor reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapHeader {
    pub os_version: String,
    pub mirror_url: String,
    pub include: Vec<String>,
}

impl BootstrapHeader {
    fn from_bundle(bundle: &Bundle) -> Self {
        let get = |key: &str| {
            bundle
                .recipe
                .header
                .get(key)
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };
        Self {
            os_version: get("osversion"),
            mirror_url: get("mirrorurl"),
            include: get("include")
                .split([' ', ','])
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

/// ConveyorPacker for OS bootstrap flavors.
pub struct BootstrapConveyorPacker {
    flavor: BootstrapFlavor,
    header: BootstrapHeader,
    tool: Option<PathBuf>,
}

impl BootstrapConveyorPacker {
    pub fn new(flavor: BootstrapFlavor) -> Self {
        Self {
            flavor,
            header: BootstrapHeader::default(),
            tool: None,
        }
    }

    fn tool_name(&self) -> Option<&'static str> {
        match self.flavor {
            BootstrapFlavor::Debootstrap => Some("debootstrap"),
            BootstrapFlavor::Arch => Some("pacstrap"),
            BootstrapFlavor::Yum => Some("yum"),
            BootstrapFlavor::Zypper => Some("zypper"),
            BootstrapFlavor::Busybox => None,
        }
    }

    /// Command line for package-manager flavors.
    pub fn command(&self, rootfs: &Path) -> Result<Vec<String>> {
        let h = &self.header;
        let root = rootfs.to_string_lossy().to_string();
        let tool = self
            .tool
            .as_ref()
            .map(|t| t.to_string_lossy().to_string())
            .or_else(|| self.tool_name().map(str::to_string))
            .unwrap_or_default();

        let mut args = vec![tool];
        match self.flavor {
            BootstrapFlavor::Debootstrap => {
                if h.os_version.is_empty() || h.mirror_url.is_empty() {
                    return Err(Error::InvalidDefinition(
                        "debootstrap requires osversion and mirrorurl".to_string(),
                    ));
                }
                args.push("--variant=minbase".to_string());
                if !h.include.is_empty() {
                    args.push(format!("--include={}", h.include.join(",")));
                }
                args.extend([h.os_version.clone(), root, h.mirror_url.clone()]);
            }
            BootstrapFlavor::Arch => {
                args.extend(["-c".to_string(), "-d".to_string(), "-G".to_string(), "-M".to_string()]);
                args.push(root);
                args.push("base".to_string());
                args.extend(h.include.iter().cloned());
            }
            BootstrapFlavor::Yum => {
                if h.mirror_url.is_empty() {
                    return Err(Error::InvalidDefinition("yum requires mirrorurl".to_string()));
                }
                args.extend([
                    "--noplugins".to_string(),
                    "-y".to_string(),
                    format!("--installroot={}", root),
                    "--setopt=reposdir=".to_string(),
                    format!("--repofrompath=base,{}", h.mirror_url.replace("%{OSVERSION}", &h.os_version)),
                ]);
                if !h.os_version.is_empty() {
                    args.push(format!("--releasever={}", h.os_version));
                }
                args.push("install".to_string());
                args.push("/etc/redhat-release".to_string());
                args.extend(h.include.iter().cloned());
            }
            BootstrapFlavor::Zypper => {
                if h.mirror_url.is_empty() {
                    return Err(Error::InvalidDefinition("zypper requires mirrorurl".to_string()));
                }
                args.extend([
                    format!("--root={}", root),
                    "--non-interactive".to_string(),
                    "--gpg-auto-import-keys".to_string(),
                    "addrepo".to_string(),
                    h.mirror_url.replace("%{OSVERSION}", &h.os_version),
                    "repo-oss".to_string(),
                ]);
            }
            BootstrapFlavor::Busybox => {
                return Err(Error::Internal("busybox has no bootstrap command".to_string()));
            }
        }
        Ok(args)
    }

    async fn run(&self, args: &[String]) -> Result<()> {
        let Some((program, rest)) = args.split_first() else {
            return Err(Error::Internal("empty bootstrap command".to_string()));
        };
        info!(command = %args.join(" "), "bootstrapping root filesystem");
        let status = Command::new(program).args(rest).status().await?;
        if !status.success() {
            return Err(Error::PackFailed(format!(
                "{} exited with {:?}",
                program,
                status.code()
            )));
        }
        Ok(())
    }

    async fn pack_busybox(&self, rootfs: &Path) -> Result<()> {
        for dir in BUSYBOX_DIRS {
            fs::create_dir_all(rootfs.join(dir))?;
        }
        fs::write(rootfs.join("etc/passwd"), "root:x:0:0:root:/root:/bin/sh\n")?;
        fs::write(rootfs.join("etc/group"), "root:x:0:\n")?;

        let url = if self.header.mirror_url.is_empty() {
            DEFAULT_BUSYBOX_URL
        } else {
            self.header.mirror_url.as_str()
        };
        info!(url, "downloading busybox");
        let body = reqwest::Client::builder()
            .timeout(IMAGE_PULL_TIMEOUT)
            .build()
            .map_err(|e| Error::FetchFailed(e.to_string()))?
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::FetchFailed(format!("busybox: {}", e)))?
            .bytes()
            .await
            .map_err(|e| Error::FetchFailed(format!("busybox: {}", e)))?;

        let binary = rootfs.join("bin/busybox");
        fs::write(&binary, &body)?;
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755))?;
        let sh = rootfs.join("bin/sh");
        if !sh.exists() {
            symlink("busybox", &sh)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ConveyorPacker for BootstrapConveyorPacker {
    fn kind(&self) -> SourceKind {
        SourceKind::Bootstrap(self.flavor)
    }

    async fn fetch(&mut self, bundle: &Bundle) -> Result<()> {
        self.header = BootstrapHeader::from_bundle(bundle);
        let Some(tool) = self.tool_name() else {
            return Ok(());
        };
        // SAFETY: geteuid has no preconditions.
        if unsafe { libc::geteuid() } != 0 {
            return Err(Error::privilege(format!(
                "You must be root to build with {}",
                tool
            )));
        }
        self.tool = Some(which::which(tool).map_err(|_| Error::ToolNotFound(tool.to_string()))?);
        Ok(())
    }

    async fn pack(&mut self, bundle: &mut Bundle) -> Result<()> {
        if self.flavor == BootstrapFlavor::Busybox {
            return self.pack_busybox(&bundle.rootfs).await;
        }

        let args = self.command(&bundle.rootfs)?;
        self.run(&args).await?;

        if self.flavor == BootstrapFlavor::Zypper {
            let mut install = vec![
                args[0].clone(),
                format!("--root={}", bundle.rootfs.display()),
                "--non-interactive".to_string(),
                "install".to_string(),
                "--auto-agree-with-licenses".to_string(),
                "openSUSE-release".to_string(),
            ];
            install.extend(self.header.include.iter().cloned());
            self.run(&install).await?;
        }

        if !bundle.rootfs.join("etc").is_dir() {
            warn!(rootfs = %bundle.rootfs.display(), "bootstrap produced no /etc");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packer(flavor: BootstrapFlavor, header: BootstrapHeader) -> BootstrapConveyorPacker {
        BootstrapConveyorPacker {
            flavor,
            header,
            tool: None,
        }
    }

    #[test]
    fn test_debootstrap_command() {
        let p = packer(
            BootstrapFlavor::Debootstrap,
            BootstrapHeader {
                os_version: "bookworm".to_string(),
                mirror_url: "http://deb.debian.org/debian".to_string(),
                include: vec!["curl".to_string(), "ca-certificates".to_string()],
            },
        );
        let cmd = p.command(Path::new("/b/rootfs")).unwrap();
        assert_eq!(
            cmd,
            vec![
                "debootstrap",
                "--variant=minbase",
                "--include=curl,ca-certificates",
                "bookworm",
                "/b/rootfs",
                "http://deb.debian.org/debian"
            ]
        );
    }

    #[test]
    fn test_debootstrap_requires_headers() {
        let p = packer(BootstrapFlavor::Debootstrap, BootstrapHeader::default());
        assert!(p.command(Path::new("/b/rootfs")).unwrap_err().is_configuration());
    }

    #[test]
    fn test_yum_substitutes_osversion() {
        let p = packer(
            BootstrapFlavor::Yum,
            BootstrapHeader {
                os_version: "9".to_string(),
                mirror_url: "http://mirror/%{OSVERSION}/os".to_string(),
                include: vec![],
            },
        );
        let cmd = p.command(Path::new("/r")).unwrap();
        assert!(cmd.contains(&"--repofrompath=base,http://mirror/9/os".to_string()));
        assert!(cmd.contains(&"--releasever=9".to_string()));
    }
}
