//! Version and platform utilities.
//!
//! Pure functions shared by the agent registry, the update controller, and
//! capability matching.

use std::cmp::Ordering;
use std::fmt;

/// Version reported when no release version is compiled in or configured.
pub const DEV_VERSION: &str = "dev";

/// A parsed `vMAJOR.MINOR.PATCH` release version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Semver {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl fmt::Display for Semver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Parse a strict release version. The leading `v` is optional; anything
/// other than three numeric components is rejected.
pub fn parse_semver(raw: &str) -> Option<Semver> {
    let trimmed = raw.trim();
    let body = trimmed.strip_prefix('v').unwrap_or(trimmed);
    let mut parts = body.split('.');
    let major = parse_component(parts.next()?)?;
    let minor = parse_component(parts.next()?)?;
    let patch = parse_component(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some(Semver {
        major,
        minor,
        patch,
    })
}

fn parse_component(part: &str) -> Option<u64> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

fn normalize(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed.strip_prefix('v').unwrap_or(trimmed)
}

/// True when `candidate` should be considered newer than `current`.
///
/// Two valid release versions compare numerically. Otherwise any textual
/// difference (ignoring a leading `v`) counts as newer.
pub fn is_version_newer(candidate: &str, current: &str) -> bool {
    match (parse_semver(candidate), parse_semver(current)) {
        (Some(a), Some(b)) => a > b,
        _ => normalize(candidate) != normalize(current),
    }
}

/// True when the two versions differ textually (ignoring a leading `v`).
pub fn is_version_different(a: &str, b: &str) -> bool {
    normalize(a) != normalize(b)
}

/// True when `raw` is a release version rather than a development build.
pub fn is_release_version(raw: &str) -> bool {
    parse_semver(raw).is_some()
}

/// Release asset name for a platform, or `None` for unsupported platforms.
pub fn expected_asset_name(os: &str, arch: &str) -> Option<String> {
    let os = match os {
        "linux" | "darwin" | "windows" => os,
        _ => return None,
    };
    let arch = match arch {
        "amd64" | "arm64" => arch,
        _ => return None,
    };
    let suffix = if os == "windows" { ".exe" } else { "" };
    Some(format!("ciwi-{os}-{arch}{suffix}"))
}

/// The running platform in release-asset vocabulary (`linux`/`darwin`/`windows`,
/// `amd64`/`arm64`).
pub fn current_platform() -> (String, String) {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    (os.to_string(), arch.to_string())
}

/// Resolve the running server version: `CIWI_VERSION` wins, then the version
/// baked in at build time, then the `dev` sentinel.
pub fn current_version() -> String {
    if let Ok(value) = std::env::var("CIWI_VERSION") {
        let value = value.trim();
        if !value.is_empty() {
            return value.to_string();
        }
    }
    match option_env!("CIWI_BUILD_VERSION") {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => DEV_VERSION.to_string(),
    }
}

/// Lenient numeric version used for tool requirements (`1.22`, `go1.22.3`,
/// `v3`). Missing components are zero.
pub fn parse_tool_version(raw: &str) -> Option<(u64, u64, u64)> {
    let trimmed = raw.trim();
    let start = trimmed.find(|c: char| c.is_ascii_digit())?;
    let prefix = &trimmed[..start];
    if !prefix.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let body = &trimmed[start..];
    let mut components = [0u64; 3];
    let mut count = 0;
    for part in body.split('.') {
        if count == 3 {
            return None;
        }
        components[count] = parse_component(part)?;
        count += 1;
    }
    Some((components[0], components[1], components[2]))
}

/// Compare two tool versions when both parse.
pub fn compare_tool_versions(a: &str, b: &str) -> Option<Ordering> {
    Some(parse_tool_version(a)?.cmp(&parse_tool_version(b)?))
}
