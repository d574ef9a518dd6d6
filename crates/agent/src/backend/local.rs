//! Local filesystem backend.

use super::{Backend, CommandOutput, DirEntry, OutputCallback, normalize_path};
use crate::error::BackendError;
use async_trait::async_trait;
use grep_regex::RegexMatcher;
use grep_searcher::sinks::UTF8;
use grep_searcher::{BinaryDetection, SearcherBuilder};
use ignore::WalkBuilder;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Backend over the local filesystem, rooted at an absolute directory.
pub struct LocalBackend {
    root: PathBuf,
    root_str: String,
    running: Arc<Mutex<Option<Child>>>,
}

impl LocalBackend {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        let root: PathBuf = working_directory.into();
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&root))
                .unwrap_or(root)
        };
        let root = PathBuf::from(normalize_path(&root.to_string_lossy()));
        let root_str = root.to_string_lossy().to_string();
        Self {
            root,
            root_str,
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Resolve and verify a path stays under the working directory.
    fn checked_path(&self, path: &str) -> Result<PathBuf, BackendError> {
        let resolved = self.resolve_path(path);
        if Path::new(path).is_relative() && !resolved.starts_with(&self.root_str) {
            return Err(BackendError::PathEscape(path.to_string()));
        }
        Ok(PathBuf::from(resolved))
    }

    async fn spawn_shell(&self, command: &str, cwd: &str) -> Result<Child, BackendError> {
        let dir = self.checked_path(cwd)?;
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn working_directory(&self) -> &str {
        &self.root_str
    }

    fn backend_id(&self) -> &str {
        "local"
    }

    fn resolve_path(&self, path: &str) -> String {
        if Path::new(path).is_absolute() {
            normalize_path(path)
        } else {
            normalize_path(&format!("{}/{}", self.root_str, path))
        }
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, BackendError> {
        let dir = self.checked_path(path)?;
        let mut reader = tokio::fs::read_dir(&dir).await?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let meta = entry.metadata().await?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                entry_type: if meta.is_dir() { "dir" } else { "file" }.to_string(),
                size: meta.is_file().then_some(meta.len()),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read_file(&self, path: &str) -> Result<String, BackendError> {
        let full = self.checked_path(path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BackendError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), BackendError> {
        let full = self.checked_path(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> bool {
        match self.checked_path(path) {
            Ok(full) => tokio::fs::metadata(&full)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn is_dir(&self, path: &str) -> bool {
        match self.checked_path(path) {
            Ok(full) => tokio::fs::metadata(&full)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn remove_file(&self, path: &str) -> Result<(), BackendError> {
        let full = self.checked_path(path)?;
        tokio::fs::remove_file(&full).await?;
        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        cwd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, BackendError> {
        let mut child = self.spawn_shell(command, cwd).await?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        {
            let mut slot = self.running.lock().await;
            *slot = Some(child);
        }

        // Drain both pipes concurrently so a full stderr buffer cannot stall
        // a stdout-heavy command (or vice versa).
        let stdout_task = tokio::spawn(async move {
            let mut out = String::new();
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    out.push_str(&line);
                    out.push('\n');
                }
            }
            out
        });
        let stderr_task = tokio::spawn(async move {
            let mut err = String::new();
            if let Some(stderr) = stderr {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    err.push_str(&line);
                    err.push('\n');
                }
            }
            err
        });
        let read_all = async {
            let out = stdout_task.await.unwrap_or_default();
            let err = stderr_task.await.unwrap_or_default();
            (out, err)
        };

        let outcome = tokio::time::timeout(timeout, read_all).await;
        let mut slot = self.running.lock().await;
        let Some(mut child) = slot.take() else {
            // Cancelled out from under us.
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: "(cancelled)".to_string(),
                exit_code: -1,
            });
        };
        match outcome {
            Ok((stdout, stderr)) => {
                let status = child.wait().await?;
                Ok(CommandOutput {
                    stdout,
                    stderr,
                    exit_code: status.code().unwrap_or(-1),
                })
            }
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(BackendError::Timeout(timeout.as_secs()))
            }
        }
    }

    async fn run_command_stream(
        &self,
        command: &str,
        cwd: &str,
        timeout: Duration,
        on_output: OutputCallback,
    ) -> Result<CommandOutput, BackendError> {
        let mut child = self.spawn_shell(command, cwd).await?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        {
            let mut slot = self.running.lock().await;
            *slot = Some(child);
        }

        let out_cb = on_output.clone();
        let stdout_task = tokio::spawn(async move {
            let mut collected = String::new();
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    out_cb(&line, false);
                    collected.push_str(&line);
                    collected.push('\n');
                }
            }
            collected
        });
        let err_cb = on_output.clone();
        let stderr_task = tokio::spawn(async move {
            let mut collected = String::new();
            if let Some(stderr) = stderr {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    err_cb(&line, true);
                    collected.push_str(&line);
                    collected.push('\n');
                }
            }
            collected
        });

        let join = async {
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            (stdout, stderr)
        };
        let outcome = tokio::time::timeout(timeout, join).await;
        let mut slot = self.running.lock().await;
        let Some(mut child) = slot.take() else {
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: "(cancelled)".to_string(),
                exit_code: -1,
            });
        };
        match outcome {
            Ok((stdout, stderr)) => {
                let status = child.wait().await?;
                Ok(CommandOutput {
                    stdout,
                    stderr,
                    exit_code: status.code().unwrap_or(-1),
                })
            }
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(BackendError::Timeout(timeout.as_secs()))
            }
        }
    }

    async fn cancel_running_command(&self) -> bool {
        let mut slot = self.running.lock().await;
        if let Some(mut child) = slot.take() {
            match child.start_kill() {
                Ok(_) => {
                    debug!("killed running command");
                    let _ = child.wait().await;
                    true
                }
                Err(e) => {
                    warn!("failed to kill running command: {}", e);
                    false
                }
            }
        } else {
            false
        }
    }

    async fn search(
        &self,
        pattern: &str,
        path: &str,
        include: Option<&str>,
    ) -> Result<String, BackendError> {
        let root = self.checked_path(path)?;
        let matcher = RegexMatcher::new_line_matcher(pattern)
            .map_err(|e| BackendError::Other(format!("invalid pattern: {}", e)))?;
        let include_glob = include
            .map(|g| {
                glob::Pattern::new(g)
                    .map_err(|e| BackendError::Other(format!("invalid include glob: {}", e)))
            })
            .transpose()?;

        let wd = self.root.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut output = String::new();
            let mut searcher = SearcherBuilder::new()
                .binary_detection(BinaryDetection::quit(b'\x00'))
                .line_number(true)
                .build();
            for entry in WalkBuilder::new(&root).hidden(false).build().flatten() {
                let fpath = entry.path();
                if !fpath.is_file() {
                    continue;
                }
                if let Some(ref pat) = include_glob {
                    let name = fpath.file_name().map(|n| n.to_string_lossy().to_string());
                    if !name.map(|n| pat.matches(&n)).unwrap_or(false) {
                        continue;
                    }
                }
                let rel = fpath.strip_prefix(&wd).unwrap_or(fpath).to_path_buf();
                let _ = searcher.search_path(
                    &matcher,
                    fpath,
                    UTF8(|line_number, line| {
                        output.push_str(&format!(
                            "{}:{}:{}",
                            rel.display(),
                            line_number,
                            line
                        ));
                        if !line.ends_with('\n') {
                            output.push('\n');
                        }
                        // Bail once the output is clearly big enough.
                        Ok(output.len() < 200_000)
                    }),
                );
                if output.len() >= 200_000 {
                    break;
                }
            }
            output
        })
        .await
        .map_err(|e| BackendError::Other(e.to_string()))?;
        Ok(result)
    }

    async fn glob_find(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        let full_pattern = if Path::new(pattern).is_absolute() {
            pattern.to_string()
        } else {
            format!("{}/{}", self.root_str, pattern)
        };
        let wd = self.root.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            if let Ok(paths) = glob::glob(&full_pattern) {
                for p in paths.flatten() {
                    let rel = p.strip_prefix(&wd).unwrap_or(&p);
                    out.push(rel.to_string_lossy().to_string());
                }
            }
            out.sort();
            out
        })
        .await
        .map_err(|e| BackendError::Other(e.to_string()))?;
        Ok(result)
    }
}
