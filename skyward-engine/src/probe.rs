//! Device capability probe used to pick the engine variant at startup.

use std::path::Path;
use tracing::{debug, info};

use crate::recovery::slot_from_cmdline;
use crate::types::EngineKind;

/// Decide the engine variant from `build.prop` and kernel command line
/// contents. An explicit `ro.build.ab_update` wins; otherwise the presence
/// of a slot suffix on the command line means A/B.
pub fn detect_kind(build_prop: &str, cmdline: &str) -> EngineKind {
    let ab_prop = build_prop.lines().find_map(|line| {
        let (key, value) = line.trim().split_once('=')?;
        (key.trim() == "ro.build.ab_update").then(|| value.trim() == "true")
    });

    match ab_prop {
        Some(true) => EngineKind::AB,
        Some(false) => EngineKind::AOnly,
        None if slot_from_cmdline(cmdline).is_some() => EngineKind::AB,
        None => EngineKind::AOnly,
    }
}

/// Read both sources from disk. Missing files count as empty.
pub async fn probe_kind(build_prop: &Path, cmdline: &Path) -> EngineKind {
    let props = tokio::fs::read_to_string(build_prop).await.unwrap_or_else(|e| {
        debug!(path = %build_prop.display(), error = %e, "build.prop unreadable");
        String::new()
    });
    let cmdline_content = tokio::fs::read_to_string(cmdline).await.unwrap_or_default();

    let kind = detect_kind(&props, &cmdline_content);
    info!(kind = %kind, "Probed update engine kind");
    kind
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_prop_wins() {
        assert_eq!(
            detect_kind("ro.build.ab_update=true\n", ""),
            EngineKind::AB
        );
        assert_eq!(
            detect_kind(
                "ro.build.ab_update=false\n",
                "androidboot.slot_suffix=_a"
            ),
            EngineKind::AOnly
        );
    }

    #[test]
    fn test_cmdline_fallback() {
        assert_eq!(
            detect_kind("ro.product.name=x\n", "quiet androidboot.slot_suffix=_a"),
            EngineKind::AB
        );
        assert_eq!(detect_kind("", "quiet"), EngineKind::AOnly);
    }

    #[tokio::test]
    async fn test_probe_missing_files() {
        let kind = probe_kind(
            Path::new("/nonexistent/build.prop"),
            Path::new("/nonexistent/cmdline"),
        )
        .await;
        assert_eq!(kind, EngineKind::AOnly);
    }
}
