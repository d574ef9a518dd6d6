//! Backend abstraction for file and command operations.
//!
//! One trait covers both the local filesystem and SSH remotes so every tool
//! and the verifier run unchanged against either. All calls are async; long
//! commands are cancellable through [`Backend::cancel_running_command`].

mod local;
mod ssh;

pub use local::LocalBackend;
pub use ssh::{SshBackend, SshTarget};

use crate::error::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// One entry from a directory listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    /// "file" or "dir"
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Incremental output callback: `(chunk, is_stderr)`.
pub type OutputCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Uniform file + command API over a project directory.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The working directory this backend is rooted at. For SSH backends this
    /// is the composite `user@host:port:dir` form.
    fn working_directory(&self) -> &str;

    /// Stable identifier used to key caches so local and SSH never collide.
    fn backend_id(&self) -> &str;

    /// Resolve a path relative to the working directory. Absolute paths pass
    /// through unchanged; relative paths are normalized under the root.
    fn resolve_path(&self, path: &str) -> String;

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, BackendError>;

    async fn read_file(&self, path: &str) -> Result<String, BackendError>;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), BackendError>;

    async fn file_exists(&self, path: &str) -> bool;

    async fn is_dir(&self, path: &str) -> bool;

    async fn remove_file(&self, path: &str) -> Result<(), BackendError>;

    /// Run a shell command under `cwd` (relative to the working directory).
    async fn run_command(
        &self,
        command: &str,
        cwd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, BackendError>;

    /// Run a command forwarding output incrementally. The default buffers the
    /// whole run and emits one chunk per stream.
    async fn run_command_stream(
        &self,
        command: &str,
        cwd: &str,
        timeout: Duration,
        on_output: OutputCallback,
    ) -> Result<CommandOutput, BackendError> {
        let result = self.run_command(command, cwd, timeout).await?;
        if !result.stdout.is_empty() {
            on_output(&result.stdout, false);
        }
        if !result.stderr.is_empty() {
            on_output(&result.stderr, true);
        }
        Ok(result)
    }

    /// Kill the currently running command, if any. Returns true if one was
    /// killed.
    async fn cancel_running_command(&self) -> bool {
        false
    }

    /// Regex search under `path`, optionally filtered by a glob include.
    /// Returns raw `path:line:text` output.
    async fn search(
        &self,
        pattern: &str,
        path: &str,
        include: Option<&str>,
    ) -> Result<String, BackendError>;

    /// Find files matching a glob pattern. Returns working-dir-relative paths.
    async fn glob_find(&self, pattern: &str) -> Result<Vec<String>, BackendError>;
}

/// Lexically normalize a path: resolve `.` and `..` without touching the
/// filesystem, so escape checks work for paths that do not exist yet.
pub(crate) fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let absolute = path.starts_with('/');
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() && !absolute {
                    // Escaping above the root of a relative path.
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(normalize_path("/a/b/../c"), "/a/c");
        assert_eq!(normalize_path("a/./b"), "a/b");
        assert_eq!(normalize_path("/a/b/./../../x"), "/x");
        assert_eq!(normalize_path("../up"), "../up");
    }
}
