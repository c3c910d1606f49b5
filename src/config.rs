//! Run configuration.
//!
//! [`BuildConfig`] is what the caller hands to [`crate::build::Build::new`].
//! [`Options`] is the part of it that travels inside every
//! [`crate::bundle::Bundle`] and therefore across the engine boundary.
//! [`Settings`] resolves environment overrides and per-user defaults.

use crate::constants::{
    DEFAULT_LIBRARY_URL, DEFAULT_SHUB_URL, ENGINE_BINARY, ENV_CACHEDIR,
    ENV_ENGINE, ENV_LIBRARY_URL, ENV_SHUB_URL, ENV_TMPDIR,
};
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Output format of the final artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// Plain directory tree; assembling is a rename.
    FlatTree,
    /// Single-file image with a squashfs primary partition.
    PackedImage,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flat-tree" => Ok(Self::FlatTree),
            "packed-image" => Ok(Self::PackedImage),
            other => Err(Error::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlatTree => f.write_str("flat-tree"),
            Self::PackedImage => f.write_str("packed-image"),
        }
    }
}

/// Per-bundle build options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    /// Parent directory of bundle working directories.
    pub tmp_dir: PathBuf,
    /// Build into the existing destination instead of bootstrapping.
    pub update: bool,
    /// Bootstrap even when updating.
    pub force: bool,
    /// Skip the test script.
    pub no_test: bool,
    /// Sections to run; `all` runs every section.
    pub sections: Vec<String>,
    /// Endpoint for `library` sources.
    pub library_url: String,
    /// Endpoint for `shub` sources.
    pub shub_url: String,
    /// Image cache root.
    pub image_cache: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            tmp_dir: std::env::temp_dir(),
            update: false,
            force: false,
            no_test: false,
            sections: vec!["all".to_string()],
            library_url: DEFAULT_LIBRARY_URL.to_string(),
            shub_url: DEFAULT_SHUB_URL.to_string(),
            image_cache: None,
        }
    }
}

impl Options {
    /// Returns true if the source must actually be fetched; false only
    /// when updating in place without `force`.
    pub fn bootstraps(&self) -> bool {
        !self.update || self.force
    }
}

/// Configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Destination of the final artifact.
    pub dest: PathBuf,
    /// Output format.
    pub format: OutputFormat,
    /// Retain bundle directories for debugging.
    pub no_cleanup: bool,
    /// Options copied into every bundle.
    pub opts: Options,
}

impl BuildConfig {
    /// Creates a configuration with default options.
    pub fn new(dest: impl Into<PathBuf>, format: OutputFormat) -> Self {
        Self {
            dest: dest.into(),
            format,
            no_cleanup: false,
            opts: Options::default(),
        }
    }

    /// Sets the retain-for-debugging flag.
    #[must_use]
    pub fn with_no_cleanup(mut self, no_cleanup: bool) -> Self {
        self.no_cleanup = no_cleanup;
        self
    }

    /// Replaces the bundle options.
    #[must_use]
    pub fn with_options(mut self, opts: Options) -> Self {
        self.opts = opts;
        self
    }
}

/// Environment-derived defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub tmp_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub engine: PathBuf,
    pub library_url: String,
    pub shub_url: String,
}

impl Settings {
    /// Resolves settings from `IMGBUILD_*` variables, falling back to
    /// per-user directories.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let tmp_dir = var(ENV_TMPDIR)
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        let cache_dir = var(ENV_CACHEDIR).map(PathBuf::from).unwrap_or_else(|| {
            dirs::cache_dir()
                .map(|d| d.join("imgbuild"))
                .unwrap_or_else(|| PathBuf::from(".imgbuild").join("cache"))
        });

        let engine = var(ENV_ENGINE)
            .map(PathBuf::from)
            .unwrap_or_else(default_engine_path);

        Self {
            tmp_dir,
            cache_dir,
            engine,
            library_url: var(ENV_LIBRARY_URL).unwrap_or_else(|| DEFAULT_LIBRARY_URL.to_string()),
            shub_url: var(ENV_SHUB_URL).unwrap_or_else(|| DEFAULT_SHUB_URL.to_string()),
        }
    }

    /// Bundle options seeded from these settings.
    pub fn options(&self) -> Options {
        Options {
            tmp_dir: self.tmp_dir.clone(),
            library_url: self.library_url.clone(),
            shub_url: self.shub_url.clone(),
            image_cache: Some(self.cache_dir.clone()),
            ..Options::default()
        }
    }
}

/// The helper binary next to the running executable, else from `PATH`.
fn default_engine_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(ENGINE_BINARY)))
        .filter(|p| p.exists())
        .or_else(|| which::which(ENGINE_BINARY).ok())
        .unwrap_or_else(|| PathBuf::from(ENGINE_BINARY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_parse() {
        assert_eq!("flat-tree".parse::<OutputFormat>().unwrap(), OutputFormat::FlatTree);
        assert_eq!(
            "packed-image".parse::<OutputFormat>().unwrap(),
            OutputFormat::PackedImage
        );
        let err = "sandbox".parse::<OutputFormat>().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("sandbox"));
    }

    #[test]
    fn test_bootstraps() {
        let mut opts = Options::default();
        assert!(opts.bootstraps());
        opts.update = true;
        assert!(!opts.bootstraps());
        opts.force = true;
        assert!(opts.bootstraps());
    }
}
