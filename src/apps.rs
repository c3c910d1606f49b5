//! App (SCIF) sections.
//!
//! Definition sections such as `appinstall foo` or `apprun foo` describe
//! independently runnable apps inside one image. Each app gets its own tree:
//!
//! ```text
//! /scif/apps/<app>/
//! ├── bin/ lib/              ← app-local PATH and LD_LIBRARY_PATH
//! └── scif/
//!     ├── runscript          ← %apprun
//!     ├── runscript.help     ← %apphelp
//!     ├── test               ← %apptest
//!     ├── labels.json        ← %applabels
//!     └── env/
//!         ├── 01-base.sh     ← SCIF_APP* variables
//!         └── 90-environment.sh ← %appenv
//! /scif/data/<app>/{input,output}
//! ```
//!
//! `%appinstall` bodies do not run here; [`Apps::handle_post`] returns a
//! fragment that the sequencer appends to the stage's post script.

use crate::bundle::Bundle;
use crate::constants::{SCIF_APPS_DIR, SCIF_DATA_DIR, validate_name};
use crate::error::{Error, Result};
use crate::files;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

const SECTIONS: &[&str] = &[
    "appinstall",
    "apprun",
    "appenv",
    "applabels",
    "apphelp",
    "apptest",
    "appfiles",
];

/// Sections collected for one app.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct App {
    pub name: String,
    pub install: String,
    pub run: String,
    pub env: String,
    pub labels: BTreeMap<String, String>,
    pub help: String,
    pub test: String,
    pub files: Vec<(String, String)>,
}

/// Collects app sections and lays them out in a bundle.
#[derive(Debug, Default)]
pub struct Apps {
    apps: BTreeMap<String, App>,
}

impl Apps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collected apps by name.
    pub fn apps(&self) -> &BTreeMap<String, App> {
        &self.apps
    }

    /// Records one `"<section> <app>"` custom section. Sections that are
    /// not app sections are ignored.
    pub fn handle_section(&mut self, ident: &str, data: &str) -> Result<()> {
        let Some((section, name)) = split_ident(ident) else {
            debug!(section = ident, "not an app section");
            return Ok(());
        };
        validate_name(name)
            .map_err(|e| Error::InvalidDefinition(format!("app name '{}': {}", name, e)))?;

        let app = self.apps.entry(name.to_string()).or_insert_with(|| App {
            name: name.to_string(),
            ..App::default()
        });
        match section {
            "appinstall" => app.install = data.to_string(),
            "apprun" => app.run = data.to_string(),
            "appenv" => app.env = data.to_string(),
            "applabels" => app.labels = parse_labels(data),
            "apphelp" => app.help = data.to_string(),
            "apptest" => app.test = data.to_string(),
            "appfiles" => app.files = parse_files(data),
            _ => {}
        }
        Ok(())
    }

    /// Writes every app's tree into the bundle's rootfs.
    pub fn handle_bundle(&self, bundle: &Bundle) -> Result<()> {
        for app in self.apps.values() {
            let base = bundle.in_rootfs(format!("{}/{}", SCIF_APPS_DIR, app.name));
            let meta = base.join("scif");
            for dir in [base.join("bin"), base.join("lib"), meta.join("env")] {
                fs::create_dir_all(dir)?;
            }
            let data = bundle.in_rootfs(format!("{}/{}", SCIF_DATA_DIR, app.name));
            for dir in ["input", "output"] {
                fs::create_dir_all(data.join(dir))?;
            }

            fs::write(meta.join("env/01-base.sh"), base_env(&app.name))?;
            write_script(&meta.join("env/90-environment.sh"), &app.env)?;
            write_script(&meta.join("runscript"), &app.run)?;
            write_script(&meta.join("test"), &app.test)?;
            if !app.help.is_empty() {
                fs::write(meta.join("runscript.help"), &app.help)?;
            }
            if !app.labels.is_empty() {
                fs::write(meta.join("labels.json"), serde_json::to_vec_pretty(&app.labels)?)?;
            }

            for (src, dst) in &app.files {
                let target = if dst.is_empty() { src } else { dst };
                let dst = if Path::new(target).is_absolute() {
                    bundle.in_rootfs(target)
                } else {
                    files::add_prefix(&base, Path::new(target))
                };
                files::copy(Path::new(src), &dst)?;
            }
            debug!(app = %app.name, "app tree written");
        }
        Ok(())
    }

    /// Post-script fragment running each app's install section from its
    /// own directory.
    pub fn handle_post(&self) -> String {
        let mut post = String::new();
        for app in self.apps.values().filter(|a| !a.install.trim().is_empty()) {
            post.push_str(&format!(
                "\n# install app {name}\ncd /\n. {apps}/{name}/scif/env/01-base.sh\ncd {apps}/{name}\n{body}\ncd /\n",
                name = app.name,
                apps = SCIF_APPS_DIR,
                body = app.install.trim_end(),
            ));
        }
        post
    }

    /// Label maps per app, for aggregation into the image's label table.
    pub fn labels(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, String>)> {
        self.apps
            .values()
            .filter(|a| !a.labels.is_empty())
            .map(|a| (a.name.as_str(), &a.labels))
    }
}

/// Parses an `applabels <app>` section into `(app, labels)`; `None` for
/// any other section.
pub fn app_labels(ident: &str, data: &str) -> Option<(String, BTreeMap<String, String>)> {
    match split_ident(ident) {
        Some(("applabels", name)) => Some((name.to_string(), parse_labels(data))),
        _ => None,
    }
}

fn split_ident(ident: &str) -> Option<(&str, &str)> {
    let (section, name) = ident.trim().split_once(char::is_whitespace)?;
    let name = name.trim();
    (SECTIONS.contains(&section) && !name.is_empty()).then_some((section, name))
}

/// `KEY VALUE...` per line; blank lines and `#` comments are skipped.
pub fn parse_labels(data: &str) -> BTreeMap<String, String> {
    data.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| match l.split_once(char::is_whitespace) {
            Some((k, v)) => Some((k.to_string(), v.trim().to_string())),
            None => {
                warn!(label = l, "label without a value");
                None
            }
        })
        .collect()
}

fn parse_files(data: &str) -> Vec<(String, String)> {
    data.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| match l.split_once(char::is_whitespace) {
            Some((src, dst)) => (src.to_string(), dst.trim().to_string()),
            None => (l.to_string(), String::new()),
        })
        .collect()
}

fn base_env(app: &str) -> String {
    format!(
        "#!/bin/sh\n\
         SCIF_APPNAME={app}\n\
         SCIF_APPROOT={apps}/{app}\n\
         SCIF_APPMETA={apps}/{app}/scif\n\
         SCIF_APPDATA={data}/{app}\n\
         SCIF_APPINPUT={data}/{app}/input\n\
         SCIF_APPOUTPUT={data}/{app}/output\n\
         export SCIF_APPNAME SCIF_APPROOT SCIF_APPMETA SCIF_APPDATA SCIF_APPINPUT SCIF_APPOUTPUT\n\
         PATH={apps}/{app}/bin:$PATH\n\
         LD_LIBRARY_PATH={apps}/{app}/lib:$LD_LIBRARY_PATH\n\
         export PATH LD_LIBRARY_PATH\n",
        app = app,
        apps = SCIF_APPS_DIR,
        data = SCIF_DATA_DIR,
    )
}

fn write_script(path: &Path, body: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if body.trim().is_empty() {
        return Ok(());
    }
    fs::write(path, format!("#!/bin/sh\n\n{}\n", body.trim_end()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}
