//! Image metadata inside the reserved `/.imgbuild.d` directory.
//!
//! ```text
//! /.imgbuild.d/
//! ├── Definition             ← definition text of the last build
//! ├── bootstrap_history/     ← earlier definitions when updating in place
//! ├── labels.json            ← system-partition labels
//! ├── runscript
//! ├── runscript.help
//! ├── test
//! └── env/
//!     ├── 10-oci.sh          ← written by OCI sources
//!     ├── 90-environment.sh  ← %environment
//!     └── 91-environment.sh  ← appended to by build scripts
//! ```

use crate::apps;
use crate::bundle::Bundle;
use crate::constants::{
    BUILD_ENVIRONMENT_SCRIPT, ENVIRONMENT_SCRIPT, LABEL_SCHEMA_PREFIX, LABEL_SCHEMA_VERSION,
    METADATA_DIR,
};
use crate::error::Result;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const DEFAULT_RUNSCRIPT: &str =
    "#!/bin/sh\n\necho \"There is no runscript defined for this image\"\n";

fn meta_path(bundle: &Bundle, name: &str) -> PathBuf {
    bundle.in_rootfs(format!("{}/{}", METADATA_DIR, name))
}

/// Creates the metadata directory and empty environment scripts so build
/// scripts can append to them.
pub fn insert_base_env(bundle: &Bundle) -> Result<()> {
    fs::create_dir_all(meta_path(bundle, "env"))?;
    for script in [ENVIRONMENT_SCRIPT, BUILD_ENVIRONMENT_SCRIPT] {
        let path = bundle.in_rootfs(script);
        if !path.exists() {
            write_executable(&path, "#!/bin/sh\n")?;
        }
    }
    Ok(())
}

/// Writes labels, definition text and scripts selected by the build
/// options into the bundle's rootfs.
pub fn insert_metadata(bundle: &Bundle) -> Result<()> {
    insert_base_env(bundle)?;
    let image = &bundle.recipe.image_data;

    if bundle.run_section("environment") && !image.environment.trim().is_empty() {
        write_executable(
            &bundle.in_rootfs(ENVIRONMENT_SCRIPT),
            &format!(
                "#!/bin/sh\n# Custom environment shell code should follow\n\n{}\n",
                image.environment.trim_end()
            ),
        )?;
    }

    let runscript = meta_path(bundle, "runscript");
    if bundle.run_section("runscript") && !image.runscript.trim().is_empty() {
        write_executable(&runscript, &script(&image.runscript))?;
    } else if !runscript.exists() {
        write_executable(&runscript, DEFAULT_RUNSCRIPT)?;
    }

    let test = &bundle.recipe.build_data.test;
    if bundle.run_section("test") && !test.trim().is_empty() {
        write_executable(&meta_path(bundle, "test"), &script(test))?;
    }

    if bundle.run_section("help") && !image.help.trim().is_empty() {
        fs::write(meta_path(bundle, "runscript.help"), &image.help)?;
    }

    insert_definition(bundle)?;

    if bundle.run_section("labels") {
        let mut labels = read_labels(bundle);
        labels.extend(info_labels(bundle));
        labels.extend(bundle.recipe.build_data.labels.clone());
        fs::write(meta_path(bundle, "labels.json"), serde_json::to_vec_pretty(&labels)?)?;
    }

    debug!(rootfs = %bundle.rootfs.display(), "metadata inserted");
    Ok(())
}

/// Stores the definition text, moving any previous one into
/// `bootstrap_history/` when building into an existing image.
fn insert_definition(bundle: &Bundle) -> Result<()> {
    let path = meta_path(bundle, "Definition");
    if path.exists() && !bundle.opts.bootstraps() {
        let history = meta_path(bundle, "bootstrap_history");
        fs::create_dir_all(&history)?;
        let n = fs::read_dir(&history)?.count();
        fs::rename(&path, history.join(format!("Definition{}", n)))?;
    }
    fs::write(&path, bundle.recipe.render())?;
    Ok(())
}

/// Labels already stored in the rootfs, e.g. inherited from a base image.
pub fn read_labels(bundle: &Bundle) -> BTreeMap<String, String> {
    let path = meta_path(bundle, "labels.json");
    let Ok(data) = fs::read(&path) else {
        return BTreeMap::new();
    };
    serde_json::from_slice(&data).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "ignoring unreadable labels");
        BTreeMap::new()
    })
}

/// Build information labels.
pub fn info_labels(bundle: &Bundle) -> BTreeMap<String, String> {
    let key = |k: &str| format!("{}.{}", LABEL_SCHEMA_PREFIX, k);
    let mut labels = BTreeMap::new();
    labels.insert(key("schema-version"), LABEL_SCHEMA_VERSION.to_string());
    labels.insert(
        key("build-date"),
        chrono::Local::now().format("%A_%-d_%B_%Y_%-H:%-M:%-S_%Z").to_string(),
    );
    labels.insert(key("usage.imgbuild.version"), env!("CARGO_PKG_VERSION").to_string());

    if bundle.run_section("help") && !bundle.recipe.image_data.help.trim().is_empty() {
        let help = format!("{}/runscript.help", METADATA_DIR);
        labels.insert(key("usage"), help.clone());
        labels.insert(key("usage.imgbuild.runscript.help"), help);
    }

    if bundle.opts.bootstraps() {
        for (k, v) in &bundle.recipe.header {
            labels.insert(key(&format!("usage.imgbuild.deffile.{}", k)), v.clone());
        }
    }
    labels
}

/// Folds the rootfs labels and app labels into the bundle's label map:
/// system labels under [`crate::constants::SYSTEM_PARTITION`], app labels under the app name.
pub fn aggregate_labels(bundle: &mut Bundle) {
    let system = read_labels(bundle);
    bundle.system_labels().extend(system);

    let app_labels: Vec<_> = bundle
        .recipe
        .custom_data
        .iter()
        .filter_map(|(ident, data)| apps::app_labels(ident, data))
        .collect();
    for (app, labels) in app_labels {
        bundle.partition_labels(&app).extend(labels);
    }
}

/// Records the packed size of the primary partition.
pub fn set_image_size(bundle: &mut Bundle, bytes: u64) {
    bundle.system_labels().insert(
        format!("{}.image-size", LABEL_SCHEMA_PREFIX),
        read_bytes(bytes as f64),
    );
}

/// Human-readable size with one decimal per unit step (`1.5 MB`).
pub fn read_bytes(size: f64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];
    let mut size = size;
    let mut i = 0;
    while size > 1024.0 && i < UNITS.len() - 1 {
        size /= 1024.0;
        i += 1;
    }
    format!("{:.*} {}", i, size, UNITS[i])
}

fn script(body: &str) -> String {
    format!("#!/bin/sh\n\n{}\n", body.trim_end())
}

fn write_executable(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}
