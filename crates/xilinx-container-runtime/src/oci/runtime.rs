//! Forwarding to the wrapped low-level runtime.

use std::env;
use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;

use error_stack::Report;
use tracing::info;

use crate::error::RuntimeError;

/// Runtime binaries tried in order.
pub const RUNTIME_CANDIDATES: [&str; 2] = ["docker-runc", "runc"];

/// A runtime the shim hands the original command line to.
pub trait Runtime: Send + Sync {
    fn exec(&self, args: &[String]) -> Result<(), Report<RuntimeError>>;
}

/// Replaces the current process with the runtime binary.
#[derive(Debug, Clone)]
pub struct SyscallExecRuntime {
    path: PathBuf,
}

impl SyscallExecRuntime {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Locate a runtime binary on `PATH`.
    pub fn from_path_env() -> Result<Self, Report<RuntimeError>> {
        find_runtime(env::var_os("PATH").as_deref()).map(Self::new)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Runtime for SyscallExecRuntime {
    fn exec(&self, args: &[String]) -> Result<(), Report<RuntimeError>> {
        info!(runtime = %self.path.display(), "exec {:?}", args);
        // only returns on failure
        let err = Command::new(&self.path)
            .args(args.iter().skip(1))
            .exec();
        Err(Report::new(err).change_context(RuntimeError::Exec {
            path: self.path.clone(),
        }))
    }
}

/// Search `path_var` for the first executable runtime candidate.
pub fn find_runtime(path_var: Option<&OsStr>) -> Result<PathBuf, Report<RuntimeError>> {
    let dirs: Vec<PathBuf> = path_var.map(|p| env::split_paths(p).collect()).unwrap_or_default();

    RUNTIME_CANDIDATES
        .iter()
        .find_map(|candidate| {
            dirs.iter()
                .map(|dir| dir.join(candidate))
                .find(|path| is_executable(path))
        })
        .ok_or_else(|| {
            Report::new(RuntimeError::NotFound {
                candidates: RUNTIME_CANDIDATES.to_vec(),
            })
        })
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Runtime double that records every forwarded command line.
#[derive(Debug, Default)]
pub struct RecordingRuntime {
    calls: Mutex<Vec<Vec<String>>>,
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }
}

impl Runtime for RecordingRuntime {
    fn exec(&self, args: &[String]) -> Result<(), Report<RuntimeError>> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(args.to_vec());
        }
        Ok(())
    }
}

impl<R: Runtime + ?Sized> Runtime for std::sync::Arc<R> {
    fn exec(&self, args: &[String]) -> Result<(), Report<RuntimeError>> {
        (**self).exec(args)
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn executable(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn prefers_docker_runc() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        executable(first.path(), "runc");
        let docker_runc = executable(second.path(), "docker-runc");

        let path_var = env::join_paths([first.path(), second.path()]).unwrap();
        assert_eq!(find_runtime(Some(&path_var)).unwrap(), docker_runc);
    }

    #[test]
    fn finds_runc() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("docker-runc"), "not executable").unwrap();
        let runc = executable(dir.path(), "runc");

        let path_var = OsString::from(dir.path());
        let found = find_runtime(Some(&path_var)).unwrap();
        assert_eq!(found, runc);
        assert!(found.ends_with("runc"));
    }

    #[test]
    fn missing_runtime_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path_var = OsString::from(dir.path());
        let err = find_runtime(Some(&path_var)).unwrap_err();
        assert!(matches!(err.current_context(), RuntimeError::NotFound { .. }));
        assert!(find_runtime(None).is_err());
    }

    #[test]
    fn recording_runtime_keeps_arguments() {
        let runtime = RecordingRuntime::new();
        let args = vec!["runtime".to_string(), "start".to_string(), "ctr".to_string()];
        runtime.exec(&args).unwrap();
        assert_eq!(runtime.calls(), vec![args]);
    }
}
