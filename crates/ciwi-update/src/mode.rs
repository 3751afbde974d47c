//! Service-mode capability probe.

use ciwi_core::version::DEV_VERSION;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceMode {
    Dev,
    Service,
    Standalone,
}

/// Whether the server can replace and restart itself, and why not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCapability {
    pub mode: ServiceMode,
    pub supported: bool,
    pub reason: String,
}

/// Probe the running process. `lookup` reads environment variables.
pub fn detect(
    version: &str,
    os: &str,
    executable: Option<&std::path::Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> UpdateCapability {
    let is_set = |key: &str| lookup(key).is_some_and(|v| !v.trim().is_empty());
    if version == DEV_VERSION || executable.is_some_and(looks_like_dev_binary) {
        return UpdateCapability {
            mode: ServiceMode::Dev,
            supported: false,
            reason: "development build; self-update disabled".into(),
        };
    }
    let service_env = match os {
        "linux" => Some("INVOCATION_ID"),
        "darwin" => Some("LAUNCH_JOB_LABEL"),
        "windows" => Some("CIWI_SERVER_WINDOWS_SERVICE_NAME"),
        _ => None,
    };
    match service_env {
        Some(key) if is_set(key) => UpdateCapability {
            mode: ServiceMode::Service,
            supported: true,
            reason: format!("running under a service manager ({key})"),
        },
        _ => UpdateCapability {
            mode: ServiceMode::Standalone,
            supported: false,
            reason: "not running under a service manager".into(),
        },
    }
}

/// Debug builds and binaries run straight from a build cache.
///
/// Release builds copied to `/tmp` are still real installs.
pub fn looks_like_dev_binary(path: &std::path::Path) -> bool {
    let normalized = path.to_string_lossy().replace('\\', "/").to_ascii_lowercase();
    ["/target/debug/", "/go-build/", "/temp/"]
        .iter()
        .any(|marker| normalized.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_dev_mode() {
        let cap = detect("dev", "linux", None, |_| None);
        assert_eq!(cap.mode, ServiceMode::Dev);
        assert!(!cap.supported);
        let cap = detect(
            "v1.0.0",
            "linux",
            Some(Path::new("/home/me/ciwi/target/debug/ciwi")),
            |_| None,
        );
        assert_eq!(cap.mode, ServiceMode::Dev);
    }

    #[test]
    fn test_service_detection_per_platform() {
        let exe = Path::new("/usr/local/bin/ciwi");
        let linux = detect("v1.0.0", "linux", Some(exe), |k| {
            (k == "INVOCATION_ID").then(|| "abc".to_string())
        });
        assert_eq!(linux.mode, ServiceMode::Service);
        assert!(linux.supported);

        let darwin = detect("v1.0.0", "darwin", Some(exe), |k| {
            (k == "INVOCATION_ID").then(|| "abc".to_string())
        });
        assert_eq!(darwin.mode, ServiceMode::Standalone);

        let windows = detect("v1.0.0", "windows", Some(exe), |k| {
            (k == "CIWI_SERVER_WINDOWS_SERVICE_NAME").then(|| "ciwi".to_string())
        });
        assert_eq!(windows.mode, ServiceMode::Service);
    }

    #[test]
    fn test_looks_like_dev_binary() {
        assert!(looks_like_dev_binary(Path::new("C:\\Users\\me\\AppData\\Local\\Temp\\ciwi.exe")));
        assert!(!looks_like_dev_binary(Path::new("/opt/ciwi/bin/ciwi")));
        assert!(looks_like_dev_binary(Path::new("/home/me/.cache/go-build/ab/ciwi")));
        assert!(looks_like_dev_binary(Path::new("/home/me/ciwi/target/debug/ciwi")));
    }

    #[test]
    fn test_release_binary_in_tmp_is_not_dev() {
        assert!(!looks_like_dev_binary(Path::new("/tmp/ciwi")));
        assert!(!looks_like_dev_binary(Path::new("/home/me/ciwi/target/release/ciwi")));
        let cap = detect("v1.2.0", "linux", Some(Path::new("/tmp/ciwi")), |k| {
            (k == "INVOCATION_ID").then(|| "abc".to_string())
        });
        assert_eq!(cap.mode, ServiceMode::Service);
        assert!(cap.supported);
    }
}
