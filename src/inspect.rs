//! Structured inspection of a finished image.
//!
//! Flat trees are read directly from disk. Packed images answer labels and
//! definition text from their own objects; everything else is read inside
//! the image through the `query` engine, which prints section-framed
//! output:
//!
//! ```text
//! runscript:29
//! #!/bin/sh
//!
//! exec /bin/sh "$@"
//! 90-environment.sh:10
//! #!/bin/sh
//! ```
//!
//! Each frame is `label:size\n` followed by exactly `size` bytes.

use crate::constants::{METADATA_DIR, SCIF_APPS_DIR, SYSTEM_PARTITION, validate_name};
use crate::engine::EngineLauncher;
use crate::error::{Error, Result};
use crate::files;
use crate::image::{ObjectKind, PackedImage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Attributes reported for an image or app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectAttributes {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub apps: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deffile: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub runscript: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub test: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub environment: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub helpfile: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectData {
    pub attributes: InspectAttributes,
}

/// `{"data": {"attributes": {...}}, "type": "container"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectReport {
    pub data: InspectData,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for InspectReport {
    fn default() -> Self {
        Self {
            data: InspectData::default(),
            kind: "container".to_string(),
        }
    }
}

impl InspectReport {
    pub fn attributes(&self) -> &InspectAttributes {
        &self.data.attributes
    }

    /// Stores one section's payload under its attribute.
    pub fn set_attribute(&mut self, label: &str, value: &str) {
        let attrs = &mut self.data.attributes;
        match label {
            "apps" => attrs.apps = value.to_string(),
            "deffile" => attrs.deffile = value.to_string(),
            "test" => attrs.test = value.to_string(),
            "helpfile" => attrs.helpfile = value.to_string(),
            "runscript" => attrs.runscript = value.to_string(),
            "labels" => match serde_json::from_str::<BTreeMap<String, String>>(value) {
                Ok(labels) => attrs.labels.extend(labels),
                Err(e) => warn!(error = %e, "Unable to parse labels"),
            },
            env if env.ends_with("environment.sh") => attrs.environment.push_str(value),
            other => warn!(label = other, "Trying to set attribute for unknown label"),
        }
    }

    /// Human-readable rendering: each non-empty attribute, then sorted
    /// `key: value` labels.
    pub fn render(&self) -> String {
        let a = &self.data.attributes;
        let mut out = String::new();
        for field in [&a.apps, &a.helpfile, &a.deffile, &a.runscript, &a.test, &a.environment] {
            if !field.is_empty() {
                out.push_str(field);
                out.push('\n');
            }
        }
        for (k, v) in &a.labels {
            out.push_str(&format!("{}: {}\n", k, v));
        }
        out
    }
}

/// What to inspect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InspectRequest {
    pub labels: bool,
    pub deffile: bool,
    pub runscript: bool,
    pub test: bool,
    pub environment: bool,
    pub helpfile: bool,
    pub list_apps: bool,
    /// Inspect this app instead of the image.
    pub app: Option<String>,
}

impl InspectRequest {
    /// Labels are shown when nothing else was asked for.
    pub fn wants_labels(&self) -> bool {
        self.labels
            || !(self.deffile
                || self.runscript
                || self.test
                || self.environment
                || self.helpfile
                || self.list_apps)
    }

    /// Metadata directory for the image or the selected app.
    fn prefix(&self) -> String {
        match &self.app {
            Some(app) => format!("{}/{}/scif", SCIF_APPS_DIR, app),
            None => METADATA_DIR.to_string(),
        }
    }

    /// Shell script printing the requested sections inside the image.
    pub fn query_script(&self, with_labels: bool, with_deffile: bool) -> String {
        let prefix = self.prefix();
        let file = |name: &str, label: &str| {
            format!(
                " if [ -f {p}/{f} ]; then echo {l}:`wc -c < {p}/{f}`; cat {p}/{f}; fi;",
                p = prefix,
                f = name,
                l = label
            )
        };

        let mut script = String::new();
        if let Some(app) = &self.app {
            script.push_str(&format!(
                "if ! [ -d \"{apps}/{app}\" ]; then echo \"App {app} does not exist.\"; exit 2; fi;",
                apps = SCIF_APPS_DIR,
                app = app
            ));
        }
        if self.list_apps {
            script.push_str(&format!(
                " list=`for app in {}/*; do [ -d \"$app/scif\" ] && basename \"$app\"; done`; \
                 echo apps:`printf '%s' \"$list\" | wc -c`; printf '%s' \"$list\";",
                SCIF_APPS_DIR
            ));
        }
        if self.helpfile {
            script.push_str(&file("runscript.help", "helpfile"));
        }
        if with_deffile {
            script.push_str(&file("Definition", "deffile"));
        }
        if self.runscript {
            script.push_str(&file("runscript", "runscript"));
        }
        if self.test {
            script.push_str(&file("test", "test"));
        }
        if self.environment {
            script.push_str(&format!(
                " for env in {}/env/9*-environment.sh; do [ -f \"$env\" ] || continue; echo ${{env##*/}}:`wc -c < $env`; cat $env; done;",
                prefix
            ));
        }
        if with_labels {
            script.push_str(&file("labels.json", "labels"));
        }
        script
    }
}

/// Parses section-framed output into `report`.
pub fn parse_sections(output: &[u8], report: &mut InspectReport) -> Result<()> {
    let mut rest = output;
    while !rest.is_empty() {
        let Some(nl) = rest.iter().position(|&b| b == b'\n') else {
            break;
        };
        let header = String::from_utf8_lossy(&rest[..nl]).trim().to_string();
        rest = &rest[nl + 1..];
        if header.is_empty() {
            continue;
        }

        let (label, size) = header
            .split_once(':')
            .and_then(|(l, s)| s.trim().parse::<usize>().ok().map(|n| (l.to_string(), n)))
            .ok_or_else(|| Error::Internal(format!("Badly formatted content: {}", header)))?;
        if size > rest.len() {
            return Err(Error::Internal(format!(
                "section {} claims {} bytes, {} available",
                label,
                size,
                rest.len()
            )));
        }
        debug!("Section {} found with {} bytes of data.", label, size);
        report.set_attribute(&label, &String::from_utf8_lossy(&rest[..size]));
        rest = &rest[size..];
    }
    Ok(())
}

/// Inspects the image at `image`.
///
/// Flat trees need no privilege. Packed images need the launcher only for
/// sections stored inside the root filesystem.
pub async fn inspect(
    image: &Path,
    request: &InspectRequest,
    launcher: &EngineLauncher,
    tmp_dir: &Path,
) -> Result<InspectReport> {
    if let Some(app) = &request.app {
        validate_name(app)
            .map_err(|e| Error::InvalidDefinition(format!("app name '{}': {}", app, e)))?;
    }
    if !image.exists() {
        return Err(Error::InvalidImage {
            path: image.to_path_buf(),
            reason: "Container not found".to_string(),
        });
    }
    if image.is_dir() {
        return inspect_tree(image, request);
    }

    let packed = PackedImage::read(image)?;
    let mut report = InspectReport::default();

    let mut labels_inside = false;
    if request.wants_labels() {
        let key = request.app.as_deref().unwrap_or(SYSTEM_PARTITION);
        let stored = packed
            .descriptors()
            .iter()
            .any(|d| d.kind == ObjectKind::Labels);
        if stored {
            if let Some(labels) = packed.labels()?.get(key) {
                report.data.attributes.labels.extend(labels.clone());
            }
        } else {
            warn!("No metadata partition, searching in container...");
            labels_inside = true;
        }
    }
    let mut deffile_inside = false;
    if request.deffile {
        match packed.definition()? {
            Some(text) => report.data.attributes.deffile = text,
            None => deffile_inside = true,
        }
    }

    let script = request.query_script(labels_inside, deffile_inside);
    if !script.is_empty() {
        let args = vec!["/bin/sh".to_string(), "-c".to_string(), script];
        let output = launcher.query(image, tmp_dir, &args).await?;
        parse_sections(&output, &mut report)?;
    }
    Ok(report)
}

/// Reads the requested sections straight from a flat tree.
pub fn inspect_tree(root: &Path, request: &InspectRequest) -> Result<InspectReport> {
    let mut report = InspectReport::default();
    let meta = files::add_prefix(root, Path::new(&request.prefix()));
    if let Some(app) = &request.app
        && !files::add_prefix(root, Path::new(SCIF_APPS_DIR)).join(app).is_dir()
    {
        return Err(Error::InvalidImage {
            path: root.to_path_buf(),
            reason: format!("App {} does not exist.", app),
        });
    }

    let read = |name: &str| fs::read_to_string(meta.join(name)).ok();

    if request.list_apps {
        report.set_attribute("apps", &list_apps(root).join("\n"));
    }
    if request.helpfile
        && let Some(s) = read("runscript.help")
    {
        report.set_attribute("helpfile", &s);
    }
    let definition = files::add_prefix(root, Path::new(METADATA_DIR)).join("Definition");
    if request.deffile
        && let Ok(s) = fs::read_to_string(definition)
    {
        report.set_attribute("deffile", &s);
    }
    if request.runscript
        && let Some(s) = read("runscript")
    {
        report.set_attribute("runscript", &s);
    }
    if request.test
        && let Some(s) = read("test")
    {
        report.set_attribute("test", &s);
    }
    if request.environment {
        for script in environment_scripts(&meta.join("env")) {
            if let Ok(s) = fs::read_to_string(&script) {
                let name = script.file_name().unwrap_or_default().to_string_lossy().to_string();
                report.set_attribute(&name, &s);
            }
        }
    }
    if request.wants_labels()
        && let Some(s) = read("labels.json")
    {
        report.set_attribute("labels", &s);
    }
    Ok(report)
}

fn list_apps(root: &Path) -> Vec<String> {
    let apps = files::add_prefix(root, Path::new(SCIF_APPS_DIR));
    let Ok(entries) = fs::read_dir(apps) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().join("scif").is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

/// `9*-environment.sh` scripts in name order.
fn environment_scripts(env_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(env_dir) else {
        return Vec::new();
    };
    let mut scripts: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('9') && n.ends_with("-environment.sh"))
        })
        .collect();
    scripts.sort();
    scripts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sections() {
        let output = b"runscript:5\nhello90-environment.sh:3\nabc\nlabels:9\n{\"a\":\"b\"}";
        let mut report = InspectReport::default();
        parse_sections(output, &mut report).unwrap();
        assert_eq!(report.attributes().runscript, "hello");
        assert_eq!(report.attributes().environment, "abc");
        assert_eq!(report.attributes().labels["a"], "b");
    }

    #[test]
    fn test_parse_sections_rejects_garbage() {
        let mut report = InspectReport::default();
        assert!(parse_sections(b"no colon here\n", &mut report).is_err());
        assert!(parse_sections(b"test:99\nshort", &mut report).is_err());
    }

    #[test]
    fn test_report_json_shape() {
        let mut report = InspectReport::default();
        report.set_attribute("runscript", "x");
        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["type"], "container");
        assert_eq!(json["data"]["attributes"]["runscript"], "x");
        assert!(json["data"]["attributes"].get("test").is_none());
    }

    #[test]
    fn test_wants_labels_by_default() {
        assert!(InspectRequest::default().wants_labels());
        let req = InspectRequest {
            runscript: true,
            ..Default::default()
        };
        assert!(!req.wants_labels());
    }

    #[test]
    fn test_query_script_app_prefix() {
        let req = InspectRequest {
            runscript: true,
            app: Some("foo".to_string()),
            ..Default::default()
        };
        let script = req.query_script(false, false);
        assert!(script.contains("/scif/apps/foo/scif/runscript"));
        assert!(script.contains("App foo does not exist."));
    }
}
