//! Installed build detection from `build.prop`.

use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

use super::manifest::BuildDescriptor;

/// Parse `key=value` lines, skipping comments and blanks.
pub fn parse_build_prop(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Descriptor of the running build, or `None` when the build date is
/// missing. `ro.build.date.utc` is in seconds.
pub fn installed_build(props: &HashMap<String, String>) -> Option<BuildDescriptor> {
    let date_secs: i64 = props.get("ro.build.date.utc")?.parse().ok()?;
    let version = props
        .get("ro.build.version.release")
        .cloned()
        .unwrap_or_default();
    let incremental = props.get("ro.build.version.incremental").cloned();
    Some(BuildDescriptor::installed(
        version,
        date_secs.saturating_mul(1000),
        incremental,
    ))
}

/// Read the installed build from a `build.prop` file.
pub async fn read_installed_build(path: &Path) -> Option<BuildDescriptor> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let build = installed_build(&parse_build_prop(&content));
            if build.is_none() {
                warn!(path = %path.display(), "build.prop has no usable ro.build.date.utc");
            }
            build
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "build.prop not readable");
            None
        }
    }
}
