//! Binary hand-off: staging for a system updater, launching the
//! `update-helper` subcommand, and the helper's own swap-and-relaunch.

use crate::config::UpdateConfig;
use chrono::Utc;
use ciwi_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{info, warn};

/// Manifest read by the system updater unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedManifest {
    pub version: String,
    pub binary_path: PathBuf,
    pub target_path: PathBuf,
    pub sha256: String,
    pub staged_utc: String,
}

/// Arguments of the `update-helper` subcommand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperArgs {
    pub target: PathBuf,
    pub new_binary: PathBuf,
    pub pid: u32,
    pub args: Vec<String>,
}

impl HelperArgs {
    pub fn to_command_args(&self) -> Vec<String> {
        let mut out = vec![
            "update-helper".to_string(),
            "--target".to_string(),
            self.target.display().to_string(),
            "--new".to_string(),
            self.new_binary.display().to_string(),
            "--pid".to_string(),
            self.pid.to_string(),
        ];
        for arg in &self.args {
            out.push("--arg".to_string());
            out.push(arg.clone());
        }
        out
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Write the verified binary into the staging directory with a manifest and
/// start the updater unit.
pub async fn stage_for_system_updater(
    config: &UpdateConfig,
    version: &str,
    downloaded: &Path,
    target: &Path,
    sha256: &str,
) -> Result<StagedManifest> {
    tokio::fs::create_dir_all(&config.staging_dir).await?;
    let binary_path = config.staging_dir.join(format!("ciwi-{version}"));
    tokio::fs::copy(downloaded, &binary_path).await?;
    make_executable(&binary_path).await?;

    let manifest = StagedManifest {
        version: version.to_string(),
        binary_path,
        target_path: target.to_path_buf(),
        sha256: sha256.to_string(),
        staged_utc: Utc::now().to_rfc3339(),
    };
    if let Some(parent) = config.staged_manifest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&config.staged_manifest, serde_json::to_vec_pretty(&manifest)?).await?;

    let status = tokio::process::Command::new(&config.systemctl_path)
        .args(["start", "--no-block", &config.updater_unit])
        .status()
        .await
        .map_err(|e| Error::Internal(format!("failed to run {}: {e}", config.systemctl_path)))?;
    if !status.success() {
        return Err(Error::Internal(format!(
            "{} start {} exited with {status}",
            config.systemctl_path, config.updater_unit
        )));
    }
    info!(version, unit = %config.updater_unit, "staged update for system updater");
    Ok(manifest)
}

/// Copy the running executable to a helper path and launch it in
/// `update-helper` mode. The caller is expected to exit shortly after.
pub async fn launch_helper(current_exe: &Path, new_binary: &Path, args: Vec<String>) -> Result<()> {
    let helper = std::env::temp_dir().join(format!(
        "ciwi-update-helper-{}{}",
        std::process::id(),
        std::env::consts::EXE_SUFFIX
    ));
    tokio::fs::copy(current_exe, &helper).await?;
    make_executable(&helper).await?;

    let helper_args = HelperArgs {
        target: current_exe.to_path_buf(),
        new_binary: new_binary.to_path_buf(),
        pid: std::process::id(),
        args,
    };
    tokio::process::Command::new(&helper)
        .args(helper_args.to_command_args())
        .spawn()
        .map_err(|e| Error::Internal(format!("failed to launch update helper: {e}")))?;
    info!(helper = %helper.display(), "launched update helper");
    Ok(())
}

/// Block until `pid` exits or `timeout` elapses. Returns whether it exited.
pub fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let pid = Pid::from_u32(pid);
    let deadline = Instant::now() + timeout;
    let mut system = System::new();
    loop {
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        if system.process(pid).is_none() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

/// Replace `target` with `new_binary`: rename, falling back to copy when the
/// two live on different filesystems.
pub fn swap_binary(target: &Path, new_binary: &Path) -> Result<()> {
    if std::fs::rename(new_binary, target).is_err() {
        std::fs::copy(new_binary, target)?;
        if let Err(e) = std::fs::remove_file(new_binary) {
            warn!(path = %new_binary.display(), error = %e, "failed to remove downloaded binary");
        }
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Body of the `update-helper` subcommand.
pub fn run_helper(args: &HelperArgs) -> Result<()> {
    if !wait_for_exit(args.pid, Duration::from_secs(30)) {
        warn!(pid = args.pid, "parent process still running; swapping anyway");
    }
    swap_binary(&args.target, &args.new_binary)?;
    std::process::Command::new(&args.target)
        .args(&args.args)
        .spawn()
        .map_err(|e| Error::Internal(format!("failed to relaunch {}: {e}", args.target.display())))?;
    info!(target = %args.target.display(), "relaunched updated binary");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_command_args() {
        let args = HelperArgs {
            target: PathBuf::from("/opt/ciwi/ciwi"),
            new_binary: PathBuf::from("/tmp/ciwi-new"),
            pid: 42,
            args: vec!["serve".into(), "--bind".into()],
        };
        assert_eq!(
            args.to_command_args(),
            vec![
                "update-helper",
                "--target",
                "/opt/ciwi/ciwi",
                "--new",
                "/tmp/ciwi-new",
                "--pid",
                "42",
                "--arg",
                "serve",
                "--arg",
                "--bind"
            ]
        );
    }

    #[test]
    fn test_swap_binary() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("ciwi");
        let new_binary = dir.path().join("ciwi-new");
        std::fs::write(&target, b"old").unwrap();
        std::fs::write(&new_binary, b"new").unwrap();
        swap_binary(&target, &new_binary).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"new");
        assert!(!new_binary.exists());
    }

    #[test]
    fn test_wait_for_exit_returns_for_missing_pid() {
        assert!(wait_for_exit(u32::MAX - 1, Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_for_running_process_times_out() {
        assert!(!wait_for_exit(std::process::id(), Duration::from_millis(10)));
    }
}
