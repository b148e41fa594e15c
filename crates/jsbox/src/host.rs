//! Locating and spawning the `jsbox-worker` helper process.
//!
//! The helper runs with a clean environment and talks length-delimited JSON
//! over its stdin/stdout (see [`crate::ipc`]).

use std::path::{Path, PathBuf};

use tokio::process::{Child, Command};

use crate::config::SandboxConfig;
use crate::error::SandboxError;

/// File name of the helper binary.
pub const WORKER_BIN_NAME: &str = "jsbox-worker";

/// Environment variable naming an absolute helper path.
pub const WORKER_BIN_ENV: &str = "JSBOX_WORKER_BIN";

/// Environment variable that makes the helper's stderr visible.
pub const DEBUG_ENV: &str = "JSBOX_DEBUG";

/// Spawn the helper with piped stdio and a cleared environment.
pub(crate) fn spawn_helper(config: &SandboxConfig) -> Result<Child, SandboxError> {
    let worker_bin = find_worker_binary(config.worker_bin.as_deref())?;
    let debug_worker = config.debug_worker || std::env::var(DEBUG_ENV).is_ok();

    tracing::debug!(
        path = %worker_bin.display(),
        debug_worker = debug_worker,
        "spawning helper"
    );

    let child = Command::new(&worker_bin)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(if debug_worker {
            std::process::Stdio::inherit()
        } else {
            std::process::Stdio::null()
        })
        .env_clear()
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            tracing::error!(path = %worker_bin.display(), error = %e, "failed to spawn helper");
            SandboxError::Transport(e)
        })?;
    Ok(child)
}

/// Find the `jsbox-worker` binary.
///
/// Search order:
/// 1. The explicitly configured path
/// 2. `JSBOX_WORKER_BIN` environment variable (must be absolute path)
/// 3. Same directory as the current executable, or its parent
///
/// On Unix, rejects world-writable binaries (mode & 0o002 != 0).
pub(crate) fn find_worker_binary(configured: Option<&Path>) -> Result<PathBuf, SandboxError> {
    if let Some(p) = configured {
        if !p.is_absolute() {
            return Err(SandboxError::InvalidArgument(format!(
                "worker_bin must be an absolute path, got: {}",
                p.display()
            )));
        }
        if !p.exists() {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "configured helper binary {} does not exist",
                p.display()
            )));
        }
        validate_binary_permissions(p)?;
        return Ok(p.to_path_buf());
    }

    if let Ok(path) = std::env::var(WORKER_BIN_ENV) {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "{WORKER_BIN_ENV} must be an absolute path, got: {path}"
            )));
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let worker = dir.join(WORKER_BIN_NAME);
            if worker.exists() {
                validate_binary_permissions(&worker)?;
                return Ok(worker);
            }
            // Test binaries are in target/debug/deps/ but the helper is in target/debug/
            if let Some(parent) = dir.parent() {
                let worker = parent.join(WORKER_BIN_NAME);
                if worker.exists() {
                    validate_binary_permissions(&worker)?;
                    return Ok(worker);
                }
            }
        }
    }

    Err(SandboxError::Execution(anyhow::anyhow!(
        "{WORKER_BIN_NAME} binary not found. Set {WORKER_BIN_ENV} or install it alongside the application"
    )))
}

/// Reject world-writable helper binaries (Unix only).
fn validate_binary_permissions(_path: &Path) -> Result<(), SandboxError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(_path).map_err(|e| {
            SandboxError::Execution(anyhow::anyhow!(
                "cannot read metadata for {}: {}",
                _path.display(),
                e
            ))
        })?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "insecure permissions on helper binary {}: mode {:o} is world-writable",
                _path.display(),
                mode,
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn configured_path_must_be_absolute() {
        let err = find_worker_binary(Some(Path::new("bin/jsbox-worker"))).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidArgument(_)), "got: {err:?}");
    }

    #[test]
    fn configured_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join(WORKER_BIN_NAME);
        let err = find_worker_binary(Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("does not exist"), "got: {err}");
    }

    #[test]
    #[serial]
    fn rejects_relative_env_var() {
        std::env::set_var(WORKER_BIN_ENV, "./relative/path");
        let result = find_worker_binary(None);
        std::env::remove_var(WORKER_BIN_ENV);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("absolute"), "expected 'absolute' in error: {err}");
    }

    #[test]
    #[serial]
    fn missing_binary_error_guides_user() {
        std::env::remove_var(WORKER_BIN_ENV);
        if let Err(e) = find_worker_binary(None) {
            let msg = e.to_string();
            assert!(!msg.contains("PATH"), "error should not mention PATH: {msg}");
            assert!(msg.contains(WORKER_BIN_ENV), "error should guide user: {msg}");
        }
        // Ok means the helper sits next to the test binary; also fine
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn rejects_world_writable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(WORKER_BIN_NAME);
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o777)).unwrap();

        std::env::set_var(WORKER_BIN_ENV, bin.to_str().unwrap());
        let result = find_worker_binary(None);
        std::env::remove_var(WORKER_BIN_ENV);

        let err = result.unwrap_err().to_string();
        assert!(err.contains("insecure"), "expected 'insecure' in error: {err}");
    }

    #[cfg(unix)]
    #[test]
    fn configured_path_wins_and_is_checked() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(WORKER_BIN_NAME);
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(find_worker_binary(Some(&bin)).unwrap(), bin);

        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o757)).unwrap();
        assert!(find_worker_binary(Some(&bin)).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unexecutable_helper_is_a_transport_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join(WORKER_BIN_NAME);
        std::fs::write(&bin, b"not a program").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o644)).unwrap();

        let config = SandboxConfig {
            worker_bin: Some(bin),
            debug_worker: true,
            ..SandboxConfig::default()
        };
        let err = spawn_helper(&config).unwrap_err();
        assert!(matches!(err, SandboxError::Transport(_)), "got: {err:?}");
        assert_eq!(err.code(), "TRANSPORT");
    }
}
