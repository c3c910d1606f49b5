//! Build definitions.
//!
//! A [`Definition`] is the declarative recipe for one stage. Definitions
//! arrive either as JSON documents or as a source URI shorthand such as
//! `docker://alpine:3.18`, which expands to a header-only definition.
//!
//! ```json
//! {
//!   "header": { "bootstrap": "docker", "from": "alpine:3.18", "stage": "build" },
//!   "buildData": {
//!     "post": "apk add gcc",
//!     "labels": { "maintainer": "ops" },
//!     "files": [ { "stage": "devel", "files": [ { "src": "/out", "dst": "/opt" } ] } ]
//!   },
//!   "imageData": { "runscript": "exec /opt/app \"$@\"" },
//!   "customData": { "appinstall foo": "make install" }
//! }
//! ```

use crate::constants::MAX_DEFINITION_SIZE;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declarative recipe for one build stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Definition {
    /// Header keys (`bootstrap`, `from`, `stage`, `mirrorurl`, ...).
    pub header: BTreeMap<String, String>,
    /// Build-time scripts, labels and file-copy directives.
    pub build_data: BuildData,
    /// Runtime scripts stored into the image.
    pub image_data: ImageData,
    /// App-scoped sections keyed by `"<section> <app>"`.
    pub custom_data: BTreeMap<String, String>,
    /// Original definition text, if the definition was read from one.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub raw: String,
}

/// Build-time part of a definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildData {
    /// Runs on the host before the source is fetched.
    pub pre: String,
    /// Runs on the host with the rootfs available as `$IMGBUILD_ROOTFS`.
    pub setup: String,
    /// Runs inside the new root.
    pub post: String,
    /// Runs inside the new root after `post`, and is stored in the image.
    pub test: String,
    /// Labels for the system partition.
    pub labels: BTreeMap<String, String>,
    /// File-copy directives.
    pub files: Vec<FileCopy>,
}

/// One `%files` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileCopy {
    /// Source stage; `None` copies from the host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Individual transfers.
    pub files: Vec<FileTransfer>,
}

/// One `src dst` line of a `%files` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileTransfer {
    pub src: String,
    pub dst: String,
}

/// Runtime scripts stored into the image metadata directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageData {
    pub runscript: String,
    pub environment: String,
    pub help: String,
}

impl Definition {
    /// Parses a JSON definition.
    pub fn from_json(data: &str) -> Result<Self> {
        if data.len() > MAX_DEFINITION_SIZE {
            return Err(Error::InvalidDefinition(format!(
                "definition exceeds {} bytes",
                MAX_DEFINITION_SIZE
            )));
        }
        serde_json::from_str(data).map_err(|e| Error::InvalidDefinition(e.to_string()))
    }

    /// Expands a source URI (`docker://alpine`, `localimage:///tmp/img`) into
    /// a header-only definition.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| Error::InvalidDefinition(format!("'{}' is not a source URI", uri)))?;

        if scheme.is_empty() || rest.is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "'{}' is not a source URI",
                uri
            )));
        }

        let mut header = BTreeMap::new();
        header.insert("bootstrap".to_string(), scheme.to_string());
        header.insert("from".to_string(), rest.to_string());

        Ok(Self {
            header,
            ..Default::default()
        })
    }

    /// Returns true if `spec` looks like a source URI rather than a path.
    pub fn is_uri(spec: &str) -> bool {
        spec.split_once("://")
            .is_some_and(|(scheme, _)| !scheme.is_empty() && !scheme.contains('/'))
    }

    /// The `bootstrap` header, or `""` when absent.
    pub fn bootstrap(&self) -> &str {
        self.header.get("bootstrap").map(String::as_str).unwrap_or("")
    }

    /// The `from` header, or `""` when absent.
    pub fn from_ref(&self) -> &str {
        self.header.get("from").map(String::as_str).unwrap_or("")
    }

    /// The `stage` header, if present and non-empty.
    pub fn stage_name(&self) -> Option<&str> {
        self.header
            .get("stage")
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Returns true if the definition needs the privileged engine: any of
    /// setup/post/test is non-empty or any file-copy directive is present.
    pub fn engine_required(&self) -> bool {
        !self.build_data.setup.is_empty()
            || !self.build_data.post.is_empty()
            || !self.build_data.test.is_empty()
            || !self.build_data.files.is_empty()
    }

    /// Renders the definition as definition-file text for the image metadata.
    ///
    /// Returns [`Definition::raw`] verbatim when present.
    pub fn render(&self) -> String {
        if !self.raw.is_empty() {
            return self.raw.clone();
        }

        let mut out = String::new();
        for (key, value) in &self.header {
            out.push_str(&format!("{}: {}\n", capitalize(key), value));
        }

        let scripts = [
            ("pre", &self.build_data.pre),
            ("setup", &self.build_data.setup),
            ("post", &self.build_data.post),
            ("test", &self.build_data.test),
            ("environment", &self.image_data.environment),
            ("runscript", &self.image_data.runscript),
            ("help", &self.image_data.help),
        ];
        for (name, body) in scripts {
            if !body.is_empty() {
                out.push_str(&format!("\n%{}\n{}\n", name, body.trim_end()));
            }
        }

        if !self.build_data.labels.is_empty() {
            out.push_str("\n%labels\n");
            for (key, value) in &self.build_data.labels {
                out.push_str(&format!("    {} {}\n", key, value));
            }
        }

        for copy in &self.build_data.files {
            match &copy.stage {
                Some(stage) => out.push_str(&format!("\n%files from {}\n", stage)),
                None => out.push_str("\n%files\n"),
            }
            for t in &copy.files {
                out.push_str(&format!("    {} {}\n", t.src, t.dst));
            }
        }

        for (key, body) in &self.custom_data {
            out.push_str(&format!("\n%{}\n{}\n", key, body.trim_end()));
        }

        out
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
