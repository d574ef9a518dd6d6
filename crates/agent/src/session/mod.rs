//! Durable, crash-safe session persistence and reconnect support.

pub mod handoff;
mod state;

pub use handoff::{HandoffRegistry, ReplayPayload, clean_history_for_replay};

use codex::chat::Message;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

pub const SESSION_VERSION: u32 = 1;

/// Aggregate token usage persisted with a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

/// A persisted agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub version: u32,
    pub name: String,
    pub working_directory: String,
    pub model_id: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub extra_state: Map<String, Value>,
}

impl Session {
    /// Count of plain user messages in the history.
    pub fn message_count(&self) -> usize {
        self.history
            .iter()
            .filter(|m| {
                m.role == codex::chat::Role::User
                    && matches!(m.content, codex::chat::MessageContent::Text(_))
            })
            .count()
    }

    pub fn total_tokens(&self) -> u64 {
        self.token_usage.input_tokens + self.token_usage.output_tokens
    }
}

/// Summary row for the project listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub path: String,
    pub name: String,
    pub session_count: usize,
    pub message_count: usize,
    pub total_tokens: u64,
    pub updated_at: String,
    pub session_name: String,
    pub is_ssh: bool,
}

/// Turn a session name into a safe filename component.
fn slugify(name: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = false;
    for c in name.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash && !slug.is_empty() {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug: String = slug.trim_matches('-').chars().take(50).collect();
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "default".to_string()
    } else {
        slug
    }
}

/// An SSH composite working directory looks like `user@host:port:dir`.
pub fn is_ssh_path(working_directory: &str) -> bool {
    working_directory.contains('@') && working_directory.contains(':')
}

/// Normalize a working directory for hashing: SSH composites verbatim (so
/// distinct targets never collide), local paths made absolute.
pub fn normalize_working_directory(working_directory: &str) -> String {
    if is_ssh_path(working_directory) {
        return working_directory.to_string();
    }
    let path = PathBuf::from(working_directory);
    if path.is_absolute() {
        crate::backend::normalize_path(working_directory)
    } else {
        let absolute = std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path);
        crate::backend::normalize_path(&absolute.to_string_lossy())
    }
}

/// Deterministic 12-hex-char hash of a working directory.
pub fn dir_hash(working_directory: &str) -> String {
    let normalized = normalize_working_directory(working_directory);
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..6])
}

mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

fn now_iso() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Generate a session name from the first user task.
pub fn auto_name(first_task: &str) -> String {
    let words: Vec<&str> = first_task.split_whitespace().collect();
    if words.is_empty() {
        return "default".to_string();
    }
    let mut name = words[..words.len().min(6)].join(" ");
    if words.len() > 6 {
        name.push_str("...");
    }
    name
}

/// Manages session JSON files on disk: `{base_dir}/{dir_hash}_{slug}.json`,
/// written atomically via temp + rename.
pub struct SessionStore {
    base_dir: PathBuf,
}

impl SessionStore {
    /// Default base dir: `~/.bedrock-codex/sessions`.
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".bedrock-codex")
            .join("sessions")
    }

    pub async fn open(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    pub fn make_id(working_directory: &str, name: &str) -> String {
        format!("{}_{}", dir_hash(working_directory), slugify(name))
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", session_id))
    }

    /// Create a new empty session (not yet saved).
    pub fn create_session(
        &self,
        working_directory: &str,
        model_id: &str,
        name: &str,
    ) -> Session {
        let now = now_iso();
        Session {
            session_id: Self::make_id(working_directory, name),
            version: SESSION_VERSION,
            name: name.to_string(),
            working_directory: normalize_working_directory(working_directory),
            model_id: model_id.to_string(),
            created_at: now.clone(),
            updated_at: now,
            history: Vec::new(),
            token_usage: TokenUsage::default(),
            extra_state: Map::new(),
        }
    }

    /// Save atomically. Returns the file path.
    pub async fn save(&self, session: &mut Session) -> std::io::Result<PathBuf> {
        if session.session_id.is_empty() {
            session.session_id = Self::make_id(&session.working_directory, &session.name);
        }
        session.updated_at = now_iso();
        if session.created_at.is_empty() {
            session.created_at = session.updated_at.clone();
        }

        let path = self.path_for(&session.session_id);
        let tmp_path = self.base_dir.join(format!("{}.json.tmp", session.session_id));
        let data = serde_json::to_vec_pretty(session)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let write_result = async {
            tokio::fs::write(&tmp_path, &data).await?;
            tokio::fs::rename(&tmp_path, &path).await
        }
        .await;
        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        info!("session saved: {}", path.display());
        Ok(path)
    }

    pub async fn load(&self, session_id: &str) -> Option<Session> {
        self.read_file(&self.path_for(session_id)).await
    }

    pub async fn delete(&self, session_id: &str) -> bool {
        let path = self.path_for(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("session deleted: {}", path.display());
                true
            }
            Err(_) => false,
        }
    }

    async fn read_file(&self, path: &PathBuf) -> Option<Session> {
        let raw = tokio::fs::read_to_string(path).await.ok()?;
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("failed to read session {}: {}", path.display(), e);
                None
            }
        }
    }

    /// All sessions for a working directory, newest first.
    pub async fn list_sessions(&self, working_directory: &str) -> Vec<Session> {
        let prefix = format!("{}_", dir_hash(working_directory));
        let mut sessions = Vec::new();
        let Ok(mut reader) = tokio::fs::read_dir(&self.base_dir).await else {
            return sessions;
        };
        while let Ok(Some(entry)) = reader.next_entry().await {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with(&prefix) && file_name.ends_with(".json") {
                if let Some(session) = self.read_file(&entry.path()).await {
                    sessions.push(session);
                }
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    pub async fn get_latest(&self, working_directory: &str) -> Option<Session> {
        self.list_sessions(working_directory).await.into_iter().next()
    }

    pub async fn find_by_name(&self, working_directory: &str, name: &str) -> Option<Session> {
        let wanted = name.trim().to_lowercase();
        self.list_sessions(working_directory)
            .await
            .into_iter()
            .find(|s| s.name.trim().to_lowercase() == wanted)
    }

    /// Rename: a new id means a new file; the old one is deleted.
    pub async fn rename(&self, session: &mut Session, new_name: &str) -> std::io::Result<()> {
        let old_id = session.session_id.clone();
        session.name = new_name.to_string();
        session.session_id = Self::make_id(&session.working_directory, new_name);
        self.save(session).await?;
        if old_id != session.session_id {
            let _ = tokio::fs::remove_file(self.path_for(&old_id)).await;
        }
        Ok(())
    }

    /// Auto-name a still-"default" session from its first task.
    pub async fn auto_name_session(
        &self,
        session: &mut Session,
        first_task: &str,
    ) -> std::io::Result<()> {
        if session.name == "default" {
            let name = auto_name(first_task);
            self.rename(session, &name).await?;
        }
        Ok(())
    }

    /// All known projects grouped by working directory, newest first.
    pub async fn list_all_projects(&self) -> Vec<ProjectSummary> {
        let mut projects: std::collections::HashMap<String, ProjectSummary> =
            std::collections::HashMap::new();
        let Ok(mut reader) = tokio::fs::read_dir(&self.base_dir).await else {
            return Vec::new();
        };
        while let Ok(Some(entry)) = reader.next_entry().await {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !file_name.ends_with(".json") {
                continue;
            }
            let Some(session) = self.read_file(&entry.path()).await else {
                continue;
            };
            if session.working_directory.is_empty() {
                continue;
            }
            let wd = session.working_directory.clone();
            let is_ssh = is_ssh_path(&wd);
            let summary = projects.entry(wd.clone()).or_insert_with(|| {
                let name = if is_ssh {
                    let parts: Vec<&str> = wd.splitn(3, ':').collect();
                    let display_dir = parts.get(2).copied().unwrap_or(&wd);
                    let base = display_dir
                        .trim_end_matches('/')
                        .rsplit('/')
                        .next()
                        .filter(|s| !s.is_empty())
                        .unwrap_or(display_dir);
                    format!("{} ({})", base, parts.first().copied().unwrap_or(""))
                } else {
                    wd.trim_end_matches('/')
                        .rsplit('/')
                        .next()
                        .filter(|s| !s.is_empty())
                        .unwrap_or(&wd)
                        .to_string()
                };
                ProjectSummary {
                    path: wd.clone(),
                    name,
                    session_count: 0,
                    message_count: 0,
                    total_tokens: 0,
                    updated_at: String::new(),
                    session_name: String::new(),
                    is_ssh,
                }
            });
            summary.session_count += 1;
            summary.message_count += session.message_count();
            summary.total_tokens += session.total_tokens();
            if session.updated_at > summary.updated_at {
                summary.updated_at = session.updated_at.clone();
                summary.session_name = session.name.clone();
            }
        }
        let mut result: Vec<ProjectSummary> = projects.into_values().collect();
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn slugs_and_ids() {
        assert_eq!(slugify("My Session! #2"), "my-session-2");
        assert_eq!(slugify(""), "default");
        let id = SessionStore::make_id("/tmp/project", "Fix the bug");
        let parts: Vec<&str> = id.splitn(2, '_').collect();
        assert_eq!(parts[0].len(), 12);
        assert_eq!(parts[1], "fix-the-bug");
    }

    #[test]
    fn ssh_paths_kept_verbatim() {
        let a = dir_hash("alice@host:22:/srv/app");
        let b = dir_hash("alice@host:2222:/srv/app");
        assert_ne!(a, b);
        assert!(is_ssh_path("alice@host:22:/srv/app"));
        assert!(!is_ssh_path("/local/dir"));
    }

    #[test]
    fn auto_names_truncate() {
        assert_eq!(auto_name("fix the bug"), "fix the bug");
        assert_eq!(
            auto_name("one two three four five six seven eight"),
            "one two three four five six..."
        );
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        let mut session = store.create_session("/tmp/project", "model-x", "default");
        session.history.push(Message::user("hello"));
        session.token_usage.input_tokens = 42;
        session
            .extra_state
            .insert("plan_step_index".into(), serde_json::json!(3));

        store.save(&mut session).await.unwrap();
        let loaded = store.load(&session.session_id).await.unwrap();
        assert_eq!(loaded.history, session.history);
        assert_eq!(loaded.token_usage, session.token_usage);
        assert_eq!(loaded.extra_state["plan_step_index"], 3);
        assert!(!loaded.updated_at.is_empty());

        // No stray temp files after the atomic save.
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Ok(Some(entry)) = entries.next_entry().await {
            assert!(!entry.file_name().to_string_lossy().ends_with(".tmp"));
        }
    }

    #[tokio::test]
    async fn listing_filters_by_directory_hash() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        let mut a = store.create_session("/tmp/project-a", "m", "one");
        let mut b = store.create_session("/tmp/project-b", "m", "two");
        store.save(&mut a).await.unwrap();
        store.save(&mut b).await.unwrap();

        let listed = store.list_sessions("/tmp/project-a").await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "one");

        let projects = store.list_all_projects().await;
        assert_eq!(projects.len(), 2);
    }

    #[tokio::test]
    async fn rename_replaces_file() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        let mut session = store.create_session("/tmp/p", "m", "default");
        store.save(&mut session).await.unwrap();
        let old_id = session.session_id.clone();

        store.rename(&mut session, "better name").await.unwrap();
        assert!(store.load(&old_id).await.is_none());
        assert!(store.load(&session.session_id).await.is_some());
        // Same wd prefix survives the rename.
        assert_eq!(
            old_id.split('_').next(),
            session.session_id.split('_').next()
        );
    }

    #[tokio::test]
    async fn same_name_same_wd_collides_deliberately() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        let mut a = store.create_session("/tmp/p", "m", "shared");
        let mut b = store.create_session("/tmp/p", "m", "shared");
        assert_eq!(a.session_id, b.session_id);
        store.save(&mut a).await.unwrap();
        store.save(&mut b).await.unwrap();
        assert_eq!(store.list_sessions("/tmp/p").await.len(), 1);
    }
}
