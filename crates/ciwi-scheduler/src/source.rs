//! `SourceFetcher` backed by the `git` command line.

use async_trait::async_trait;
use ciwi_core::ports::{FetchedProject, ProjectIcon, SourceFetcher, SourceRefs};
use ciwi_core::{Error, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Icon files looked up at the repository root, first match wins.
const ICON_CANDIDATES: [(&str, &str); 4] = [
    ("ciwi-icon.png", "image/png"),
    ("ciwi-icon.svg", "image/svg+xml"),
    ("icon.png", "image/png"),
    ("icon.svg", "image/svg+xml"),
];

/// Largest icon file served.
const MAX_ICON_BYTES: u64 = 512 * 1024;

pub struct GitSourceFetcher {
    git: String,
    timeout: Duration,
}

impl GitSourceFetcher {
    pub fn new() -> Self {
        Self {
            git: "git".to_string(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, dir: Option<&Path>, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.git);
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        debug!(args = ?args, "running git");

        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(result) => result
                .map_err(|e| Error::SourceFetch(format!("failed to execute git: {e}")))?,
            Err(_) => {
                warn!(args = ?args, timeout_secs = self.timeout.as_secs(), "git timed out");
                return Err(Error::SourceFetch(format!(
                    "git {} timed out",
                    args.first().copied().unwrap_or_default()
                )));
            }
        };
        if !output.status.success() {
            return Err(Error::SourceFetch(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for GitSourceFetcher {
    fn default() -> Self {
        Self::new()
    }
}

fn is_commit_sha(raw: &str) -> bool {
    raw.len() == 40 && raw.chars().all(|c| c.is_ascii_hexdigit())
}

/// Reject config paths that would escape the checkout.
fn checked_relative(path: &str) -> Result<&str> {
    let path = path.trim();
    if path.is_empty()
        || Path::new(path).is_absolute()
        || path.split(['/', '\\']).any(|segment| segment == "..")
    {
        return Err(Error::validation(format!("invalid config file path: {path}")));
    }
    Ok(path)
}

/// First sha from `git ls-remote` output.
fn first_sha(ls_remote: &str) -> Option<String> {
    ls_remote
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .find(|sha| is_commit_sha(sha))
        .map(str::to_string)
}

/// Default branch and branch names from `git ls-remote --symref <repo> HEAD`
/// and `git ls-remote --heads <repo>`.
fn parse_refs(symref: &str, heads: &str) -> SourceRefs {
    let default_ref = symref
        .lines()
        .find_map(|line| line.strip_prefix("ref: "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|r| r.strip_prefix("refs/heads/"))
        .unwrap_or_default()
        .to_string();
    let mut refs: Vec<String> = heads
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|r| r.strip_prefix("refs/heads/"))
        .map(str::to_string)
        .collect();
    refs.sort();
    SourceRefs { default_ref, refs }
}

async fn read_icon(checkout: &Path) -> Option<ProjectIcon> {
    for (name, content_type) in ICON_CANDIDATES {
        let path = checkout.join(name);
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            continue;
        };
        if !meta.is_file() || meta.len() > MAX_ICON_BYTES {
            continue;
        }
        if let Ok(bytes) = tokio::fs::read(&path).await {
            return Some(ProjectIcon {
                content_type: content_type.to_string(),
                bytes,
            });
        }
    }
    None
}

#[async_trait]
impl SourceFetcher for GitSourceFetcher {
    async fn fetch_project_config(
        &self,
        repo_url: &str,
        repo_ref: &str,
        config_file: &str,
    ) -> Result<FetchedProject> {
        let config_file = checked_relative(config_file)?;
        let dir = tempfile::tempdir()?;
        let checkout = dir.path().join("repo");
        let checkout_str = checkout.to_string_lossy().into_owned();

        let mut args = vec!["clone", "--depth", "1"];
        if !repo_ref.trim().is_empty() {
            args.extend(["--branch", repo_ref.trim()]);
        }
        args.extend([repo_url, checkout_str.as_str()]);
        self.run(None, &args).await?;

        let source_commit = self
            .run(Some(&checkout), &["rev-parse", "HEAD"])
            .await?
            .trim()
            .to_string();
        let config_content = tokio::fs::read_to_string(checkout.join(config_file))
            .await
            .map_err(|e| Error::SourceFetch(format!("cannot read {config_file}: {e}")))?;
        let icon = read_icon(&checkout).await;

        Ok(FetchedProject {
            config_content,
            source_commit,
            icon,
        })
    }

    async fn resolve_commit(&self, repo_url: &str, git_ref: &str) -> Result<String> {
        let git_ref = git_ref.trim();
        if is_commit_sha(git_ref) {
            return Ok(git_ref.to_string());
        }
        let git_ref = if git_ref.is_empty() { "HEAD" } else { git_ref };
        let listing = self.run(None, &["ls-remote", repo_url, git_ref]).await?;
        first_sha(&listing)
            .ok_or_else(|| Error::SourceFetch(format!("ref {git_ref} not found in {repo_url}")))
    }

    async fn read_file_at(&self, repo_url: &str, commit: &str, path: &str) -> Result<String> {
        let path = checked_relative(path)?;
        let dir = tempfile::tempdir()?;
        self.run(Some(dir.path()), &["init", "--quiet"]).await?;
        self.run(
            Some(dir.path()),
            &["fetch", "--quiet", "--depth", "1", repo_url, commit],
        )
        .await?;
        let object = format!("{commit}:{path}");
        self.run(Some(dir.path()), &["show", object.as_str()]).await
    }

    async fn list_refs(&self, repo_url: &str) -> Result<SourceRefs> {
        let symref = self
            .run(None, &["ls-remote", "--symref", repo_url, "HEAD"])
            .await?;
        let heads = self.run(None, &["ls-remote", "--heads", repo_url]).await?;
        Ok(parse_refs(&symref, &heads))
    }

    async fn is_available(&self) -> bool {
        self.run(None, &["--version"]).await.is_ok()
    }
}
