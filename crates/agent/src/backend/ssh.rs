//! SSH backend: file and command operations over an `ssh` subprocess.
//!
//! All operations funnel through one serialized `ssh` invocation path. A
//! shared ControlMaster socket keeps a persistent connection alive; when the
//! master dies, the next call transparently establishes a new one, which is
//! the auto-reconnect behavior the executor relies on.

use super::{Backend, CommandOutput, DirEntry, OutputCallback, normalize_path};
use crate::error::BackendError;
use async_trait::async_trait;
use log::{debug, warn};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Connection parameters for a remote project directory.
#[derive(Debug, Clone, PartialEq)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub directory: String,
    /// Optional identity file.
    pub key_path: Option<String>,
}

impl SshTarget {
    /// Parse the composite `user@host:port:directory` form used in session
    /// working directories.
    pub fn parse_composite(wd: &str) -> Option<Self> {
        let mut parts = wd.splitn(3, ':');
        let user_host = parts.next()?;
        let port: u16 = parts.next()?.parse().ok()?;
        let directory = parts.next()?.trim();
        let (user, host) = user_host.split_once('@')?;
        if user.is_empty() || host.is_empty() {
            return None;
        }
        Some(Self {
            user: user.trim().to_string(),
            host: host.trim().to_string(),
            port,
            directory: if directory.is_empty() {
                "/".to_string()
            } else {
                directory.to_string()
            },
            key_path: None,
        })
    }

    /// The composite form, kept verbatim so distinct targets never collide.
    pub fn composite(&self) -> String {
        format!("{}@{}:{}:{}", self.user, self.host, self.port, self.directory)
    }
}

pub struct SshBackend {
    target: SshTarget,
    composite: String,
    backend_id: String,
    control_path: String,
    /// Serializes all remote operations on the single client connection.
    op_lock: Mutex<()>,
    running: Arc<Mutex<Option<Child>>>,
}

impl SshBackend {
    pub fn new(target: SshTarget) -> Self {
        let composite = target.composite();
        let backend_id = format!("ssh:{}:{}", target.host, target.directory);
        let control_path = format!(
            "/tmp/codex-ssh-{}-{}-{}.sock",
            target.user, target.host, target.port
        );
        Self {
            target,
            composite,
            backend_id,
            control_path,
            op_lock: Mutex::new(()),
            running: Arc::new(Mutex::new(None)),
        }
    }

    fn ssh_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-p")
            .arg(self.target.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path))
            .arg("-o")
            .arg("ControlPersist=60")
            .arg("-o")
            .arg("ConnectTimeout=10");
        if let Some(ref key) = self.target.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(format!("{}@{}", self.target.user, self.target.host));
        cmd
    }

    /// Run a remote shell snippet with optional stdin. Callers hold the
    /// connection lock.
    async fn remote_unlocked(
        &self,
        script: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput, BackendError> {
        let mut cmd = self.ssh_command();
        cmd.arg("--")
            .arg(script)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::Connection(format!("ssh spawn failed: {}", e)))?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let owned = bytes.to_vec();
            pipe.write_all(&owned)
                .await
                .map_err(|e| BackendError::Connection(format!("ssh stdin failed: {}", e)))?;
            drop(pipe);
        }

        let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
        match waited {
            Ok(Ok(output)) => {
                let result = CommandOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    exit_code: output.status.code().unwrap_or(-1),
                };
                // 255 is ssh's own "connection failed" code.
                if result.exit_code == 255 {
                    return Err(BackendError::Connection(result.stderr.trim().to_string()));
                }
                Ok(result)
            }
            Ok(Err(e)) => Err(BackendError::Connection(e.to_string())),
            Err(_) => Err(BackendError::Timeout(timeout.as_secs())),
        }
    }

    /// Run with one transparent reconnect attempt on connection failure.
    async fn remote_with_reconnect(
        &self,
        script: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<CommandOutput, BackendError> {
        let _guard = self.op_lock.lock().await;
        match self.remote_unlocked(script, stdin, timeout).await {
            Err(BackendError::Connection(first)) => {
                warn!("ssh connection lost ({}), reconnecting", first);
                // Drop the dead master socket so the retry opens a fresh one.
                let _ = tokio::fs::remove_file(&self.control_path).await;
                self.remote_unlocked(script, stdin, timeout).await
            }
            other => other,
        }
    }

    fn quoted(&self, path: &str) -> String {
        format!("'{}'", self.resolve_path(path).replace('\'', "'\\''"))
    }

    const IO_TIMEOUT: Duration = Duration::from_secs(60);
}

#[async_trait]
impl Backend for SshBackend {
    fn working_directory(&self) -> &str {
        &self.composite
    }

    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    fn resolve_path(&self, path: &str) -> String {
        if path.starts_with('/') {
            normalize_path(path)
        } else {
            normalize_path(&format!("{}/{}", self.target.directory, path))
        }
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, BackendError> {
        let script = format!(
            "cd {} && for f in * .*; do [ \"$f\" = . ] || [ \"$f\" = .. ] && continue; \
             if [ -d \"$f\" ]; then echo \"d:0:$f\"; \
             elif [ -e \"$f\" ]; then echo \"f:$(wc -c < \"$f\" 2>/dev/null || echo 0):$f\"; fi; done",
            self.quoted(path)
        );
        let out = self
            .remote_with_reconnect(&script, None, Self::IO_TIMEOUT)
            .await?;
        let mut entries = Vec::new();
        for line in out.stdout.lines() {
            let mut parts = line.splitn(3, ':');
            let (Some(kind), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let is_dir = kind == "d";
            entries.push(DirEntry {
                name: name.to_string(),
                entry_type: if is_dir { "dir" } else { "file" }.to_string(),
                size: if is_dir {
                    None
                } else {
                    size.trim().parse().ok()
                },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read_file(&self, path: &str) -> Result<String, BackendError> {
        let script = format!("cat {}", self.quoted(path));
        let out = self
            .remote_with_reconnect(&script, None, Self::IO_TIMEOUT)
            .await?;
        if out.exit_code != 0 {
            return Err(BackendError::NotFound(path.to_string()));
        }
        Ok(out.stdout)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), BackendError> {
        let quoted = self.quoted(path);
        // base64 round-trip keeps arbitrary content intact through the shell.
        let script = format!(
            "mkdir -p \"$(dirname {q})\" && base64 -d > {q}",
            q = quoted
        );
        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(content.as_bytes());
        let out = self
            .remote_with_reconnect(&script, Some(encoded.as_bytes()), Self::IO_TIMEOUT)
            .await?;
        if out.exit_code != 0 {
            return Err(BackendError::Other(format!(
                "remote write failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> bool {
        let script = format!("test -f {}", self.quoted(path));
        matches!(
            self.remote_with_reconnect(&script, None, Self::IO_TIMEOUT).await,
            Ok(out) if out.exit_code == 0
        )
    }

    async fn is_dir(&self, path: &str) -> bool {
        let script = format!("test -d {}", self.quoted(path));
        matches!(
            self.remote_with_reconnect(&script, None, Self::IO_TIMEOUT).await,
            Ok(out) if out.exit_code == 0
        )
    }

    async fn remove_file(&self, path: &str) -> Result<(), BackendError> {
        let script = format!("rm -f {}", self.quoted(path));
        let out = self
            .remote_with_reconnect(&script, None, Self::IO_TIMEOUT)
            .await?;
        if out.exit_code != 0 {
            return Err(BackendError::Other(format!(
                "remote remove failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn run_command(
        &self,
        command: &str,
        cwd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, BackendError> {
        let script = format!("cd {} && {}", self.quoted(cwd), command);
        self.remote_with_reconnect(&script, None, timeout).await
    }

    async fn run_command_stream(
        &self,
        command: &str,
        cwd: &str,
        timeout: Duration,
        on_output: OutputCallback,
    ) -> Result<CommandOutput, BackendError> {
        let _guard = self.op_lock.lock().await;
        let script = format!("cd {} && {}", self.quoted(cwd), command);
        let mut cmd = self.ssh_command();
        cmd.arg("--")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::Connection(format!("ssh spawn failed: {}", e)))?;
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
        let err_cb = on_output;
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
                let status = child
                    .wait()
                    .await
                    .map_err(|e| BackendError::Connection(e.to_string()))?;
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
            debug!("killing remote command");
            let _ = child.start_kill();
            let _ = child.wait().await;
            true
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
        let include_arg = include
            .map(|g| format!("--include='{}'", g.replace('\'', "")))
            .unwrap_or_default();
        let script = format!(
            "cd {} && grep -rn {} -e '{}' . 2>/dev/null | head -c 200000; true",
            self.quoted(path),
            include_arg,
            pattern.replace('\'', "'\\''"),
        );
        let out = self.remote_with_reconnect(&script, None, Self::IO_TIMEOUT).await?;
        Ok(out.stdout)
    }

    async fn glob_find(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        // Translate the glob to a find -path expression; `**` becomes `*`
        // which over-matches slightly, acceptable for discovery purposes.
        let find_pattern = format!("./{}", pattern.replace("**/", "*").replace("**", "*"));
        let script = format!(
            "cd {} && find . -type f -path '{}' 2>/dev/null | head -n 2000",
            self.quoted("."),
            find_pattern.replace('\'', ""),
        );
        let out = self.remote_with_reconnect(&script, None, Self::IO_TIMEOUT).await?;
        let mut files: Vec<String> = out
            .stdout
            .lines()
            .map(|l| l.trim_start_matches("./").to_string())
            .filter(|l| !l.is_empty())
            .collect();
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_composite_paths() {
        let t = SshTarget::parse_composite("alice@dev.example.com:2222:/srv/app").unwrap();
        assert_eq!(t.user, "alice");
        assert_eq!(t.host, "dev.example.com");
        assert_eq!(t.port, 2222);
        assert_eq!(t.directory, "/srv/app");
        assert_eq!(t.composite(), "alice@dev.example.com:2222:/srv/app");

        assert!(SshTarget::parse_composite("/local/path").is_none());
        assert!(SshTarget::parse_composite("host:22:/x").is_none());
    }

    #[test]
    fn resolves_under_remote_directory() {
        let b = SshBackend::new(SshTarget {
            user: "u".into(),
            host: "h".into(),
            port: 22,
            directory: "/srv/app".into(),
            key_path: None,
        });
        assert_eq!(b.resolve_path("src/main.rs"), "/srv/app/src/main.rs");
        assert_eq!(b.resolve_path("/etc/hosts"), "/etc/hosts");
        assert_eq!(b.resolve_path("a/../b"), "/srv/app/b");
    }

}
