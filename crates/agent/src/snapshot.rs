//! Snapshot store: per-file originals, per-step checkpoints, and per-batch
//! session checkpoints, all usable for revert.

use crate::backend::Backend;
use crate::error::BackendError;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// Upper bound for a snapshot entry to be persisted with the session.
pub const MAX_PERSISTED_SNAPSHOT_BYTES: usize = 1_000_000;

/// In-memory ring size for session checkpoints.
const SESSION_CHECKPOINT_RING: usize = 25;

/// Original state of a file before the run first touched it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotValue {
    /// File did not exist before the run (legacy marker, no content).
    Absent,
    /// File was created by the run; content kept so revert can restore it
    /// even after a later delete.
    Created { content: String },
    /// File existed; this is its original content.
    Original { content: String },
}

/// One batch-level checkpoint of file contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub id: String,
    pub label: String,
    pub created_at: i64,
    /// `None` marks a file that did not exist at capture time.
    pub files: BTreeMap<String, Option<String>>,
}

/// Three-tier snapshot store for a single run.
#[derive(Debug, Default, Clone)]
pub struct SnapshotStore {
    files: HashMap<String, SnapshotValue>,
    step_checkpoints: BTreeMap<usize, BTreeMap<String, Option<String>>>,
    session_checkpoints: Vec<SessionCheckpoint>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Absolute paths of all files touched this run.
    pub fn tracked_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn contains(&self, abs_path: &str) -> bool {
        self.files.contains_key(abs_path)
    }

    /// Capture a file's original content before its first mutation. First
    /// write wins; later calls for the same path are no-ops.
    pub async fn snapshot_file(&mut self, backend: &Arc<dyn Backend>, path: &str) {
        let abs_path = backend.resolve_path(path);
        if self.files.contains_key(&abs_path) {
            return;
        }
        let value = match backend.read_file(&abs_path).await {
            Ok(content) => SnapshotValue::Original { content },
            Err(_) => SnapshotValue::Absent,
        };
        debug!("snapshot {} ({})", abs_path, match &value {
            SnapshotValue::Absent => "new file",
            _ => "original content",
        });
        self.files.insert(abs_path, value);
    }

    /// Upgrade an `Absent` marker to `Created` with the written content, so
    /// revert can resurrect the file if the agent later deletes it.
    pub fn record_created_content(&mut self, abs_path: &str, content: &str) {
        if matches!(self.files.get(abs_path), Some(SnapshotValue::Absent))
            && content.len() < MAX_PERSISTED_SNAPSHOT_BYTES
        {
            self.files.insert(
                abs_path.to_string(),
                SnapshotValue::Created {
                    content: content.to_string(),
                },
            );
        }
    }

    /// Revert every tracked file to its pre-run state. Returns the reverted
    /// paths; failures are logged and skipped.
    pub async fn revert_all(&mut self, backend: &Arc<dyn Backend>) -> Vec<String> {
        let mut reverted = Vec::new();
        for (abs_path, original) in self.files.iter() {
            let outcome: Result<(), BackendError> = match original {
                SnapshotValue::Absent => {
                    if backend.file_exists(abs_path).await {
                        backend.remove_file(abs_path).await
                    } else {
                        continue;
                    }
                }
                SnapshotValue::Created { content } => {
                    if backend.file_exists(abs_path).await {
                        backend.remove_file(abs_path).await
                    } else {
                        backend.write_file(abs_path, content).await
                    }
                }
                SnapshotValue::Original { content } => backend.write_file(abs_path, content).await,
            };
            match outcome {
                Ok(()) => reverted.push(abs_path.clone()),
                Err(e) => warn!("failed to revert {}: {}", abs_path, e),
            }
        }
        self.files.clear();
        reverted
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.step_checkpoints.clear();
        self.session_checkpoints.clear();
    }

    // ── step checkpoints ────────────────────────────────────────────

    /// Snapshot the current content of every tracked file, keyed by plan
    /// step number.
    pub async fn capture_step_checkpoint(&mut self, backend: &Arc<dyn Backend>, step: usize) {
        if step == 0 {
            return;
        }
        let mut checkpoint = BTreeMap::new();
        for abs_path in self.files.keys() {
            let content = backend.read_file(abs_path).await.ok();
            checkpoint.insert(abs_path.clone(), content);
        }
        debug!("step checkpoint {}: {} files", step, checkpoint.len());
        self.step_checkpoints.insert(step, checkpoint);
    }

    /// Restore all files recorded at a step checkpoint and drop later
    /// checkpoints. Returns reverted paths.
    pub async fn revert_to_step(&mut self, backend: &Arc<dyn Backend>, step: usize) -> Vec<String> {
        let Some(checkpoint) = self.step_checkpoints.get(&step).cloned() else {
            return Vec::new();
        };
        let mut reverted = Vec::new();
        for (abs_path, content) in checkpoint {
            let outcome = match content {
                Some(content) => backend.write_file(&abs_path, &content).await,
                None => {
                    if backend.file_exists(&abs_path).await {
                        backend.remove_file(&abs_path).await
                    } else {
                        continue;
                    }
                }
            };
            match outcome {
                Ok(()) => reverted.push(abs_path),
                Err(e) => warn!("failed to revert {} to step {}: {}", abs_path, step, e),
            }
        }
        self.step_checkpoints.retain(|&s, _| s <= step);
        reverted
    }

    pub fn step_checkpoints(&self) -> &BTreeMap<usize, BTreeMap<String, Option<String>>> {
        &self.step_checkpoints
    }

    // ── session checkpoints ─────────────────────────────────────────

    /// Capture a batch-level checkpoint before a risky operation. Returns the
    /// checkpoint id, or `None` when there is nothing to capture.
    pub async fn create_session_checkpoint(
        &mut self,
        backend: &Arc<dyn Backend>,
        label: &str,
        target_paths: &[String],
    ) -> Option<String> {
        let mut paths: Vec<String> = target_paths
            .iter()
            .filter(|p| !p.is_empty())
            .cloned()
            .collect();
        if paths.is_empty() {
            paths = self.files.keys().cloned().collect();
        }
        if paths.is_empty() {
            return None;
        }
        paths.sort();
        paths.dedup();

        let mut files = BTreeMap::new();
        for abs_path in paths {
            let content = if backend.file_exists(&abs_path).await {
                backend.read_file(&abs_path).await.ok()
            } else {
                None
            };
            files.insert(abs_path, content);
        }
        if files.is_empty() {
            return None;
        }

        let id = format!("cp-{}", Uuid::new_v4().simple());
        let mut truncated_label = label.to_string();
        truncated_label.truncate(120);
        self.session_checkpoints.push(SessionCheckpoint {
            id: id.clone(),
            label: truncated_label,
            created_at: time::OffsetDateTime::now_utc().unix_timestamp(),
            files,
        });
        if self.session_checkpoints.len() > SESSION_CHECKPOINT_RING {
            let excess = self.session_checkpoints.len() - SESSION_CHECKPOINT_RING;
            self.session_checkpoints.drain(..excess);
        }
        Some(id)
    }

    /// Checkpoint summaries without file payloads.
    pub fn list_session_checkpoints(&self) -> Vec<(String, String, i64, usize)> {
        self.session_checkpoints
            .iter()
            .map(|cp| (cp.id.clone(), cp.label.clone(), cp.created_at, cp.files.len()))
            .collect()
    }

    pub fn latest_checkpoint_id(&self) -> Option<String> {
        self.session_checkpoints.last().map(|cp| cp.id.clone())
    }

    /// Restore files from a checkpoint id, or the latest for "latest".
    pub async fn rewind_to_checkpoint(
        &self,
        backend: &Arc<dyn Backend>,
        checkpoint_id: &str,
    ) -> Vec<String> {
        let checkpoint = if checkpoint_id == "latest" {
            self.session_checkpoints.last()
        } else {
            self.session_checkpoints
                .iter()
                .find(|cp| cp.id == checkpoint_id)
        };
        let Some(checkpoint) = checkpoint else {
            return Vec::new();
        };
        let mut reverted = Vec::new();
        for (abs_path, content) in &checkpoint.files {
            let outcome = match content {
                Some(content) => backend.write_file(abs_path, content).await,
                None => {
                    if backend.file_exists(abs_path).await {
                        backend.remove_file(abs_path).await
                    } else {
                        continue;
                    }
                }
            };
            match outcome {
                Ok(()) => reverted.push(abs_path.clone()),
                Err(e) => warn!("failed to rewind {}: {}", abs_path, e),
            }
        }
        reverted
    }

    // ── persistence views ───────────────────────────────────────────

    /// Snapshot map filtered for persistence: oversize entries dropped.
    pub fn persistable_files(&self) -> BTreeMap<String, SnapshotValue> {
        self.files
            .iter()
            .filter(|(_, v)| match v {
                SnapshotValue::Absent => true,
                SnapshotValue::Created { content } | SnapshotValue::Original { content } => {
                    content.len() < MAX_PERSISTED_SNAPSHOT_BYTES
                }
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Last `limit` session checkpoints with oversize entries removed.
    pub fn persistable_session_checkpoints(&self, limit: usize) -> Vec<SessionCheckpoint> {
        self.session_checkpoints
            .iter()
            .rev()
            .take(limit)
            .rev()
            .map(|cp| {
                let files = cp
                    .files
                    .iter()
                    .filter(|(_, c)| {
                        c.as_ref()
                            .map(|c| c.len() < MAX_PERSISTED_SNAPSHOT_BYTES)
                            .unwrap_or(true)
                    })
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                SessionCheckpoint {
                    id: cp.id.clone(),
                    label: cp.label.clone(),
                    created_at: cp.created_at,
                    files,
                }
            })
            .collect()
    }

    /// Most recent `limit` step checkpoints, oversize entries removed.
    pub fn persistable_step_checkpoints(
        &self,
        limit: usize,
    ) -> BTreeMap<usize, BTreeMap<String, Option<String>>> {
        self.step_checkpoints
            .iter()
            .rev()
            .take(limit)
            .map(|(step, files)| {
                let filtered = files
                    .iter()
                    .filter(|(_, c)| {
                        c.as_ref()
                            .map(|c| c.len() < MAX_PERSISTED_SNAPSHOT_BYTES)
                            .unwrap_or(true)
                    })
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                (*step, filtered)
            })
            .collect()
    }

    /// Restore state from persisted maps.
    pub fn restore(
        &mut self,
        files: BTreeMap<String, SnapshotValue>,
        step_checkpoints: BTreeMap<usize, BTreeMap<String, Option<String>>>,
        session_checkpoints: Vec<SessionCheckpoint>,
    ) {
        self.files = files.into_iter().collect();
        self.step_checkpoints = step_checkpoints;
        self.session_checkpoints = session_checkpoints;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<dyn Backend>) {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(dir.path()));
        (dir, backend)
    }

    #[tokio::test]
    async fn first_write_wins() {
        let (_dir, backend) = setup().await;
        backend.write_file("f.txt", "v1").await.unwrap();
        let mut store = SnapshotStore::new();
        store.snapshot_file(&backend, "f.txt").await;
        backend.write_file("f.txt", "v2").await.unwrap();
        store.snapshot_file(&backend, "f.txt").await;
        assert_eq!(store.len(), 1);

        let reverted = store.revert_all(&backend).await;
        assert_eq!(reverted.len(), 1);
        assert_eq!(backend.read_file("f.txt").await.unwrap(), "v1");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn revert_removes_created_and_restores_deleted() {
        let (_dir, backend) = setup().await;
        let mut store = SnapshotStore::new();

        // New file: Absent snapshot upgraded to Created.
        store.snapshot_file(&backend, "new.txt").await;
        backend.write_file("new.txt", "fresh").await.unwrap();
        let abs = backend.resolve_path("new.txt");
        store.record_created_content(&abs, "fresh");

        // Revert removes the created file.
        let reverted = store.revert_all(&backend).await;
        assert_eq!(reverted.len(), 1);
        assert!(!backend.file_exists("new.txt").await);

        // Created-then-deleted: revert restores the stored content.
        let mut store = SnapshotStore::new();
        store.snapshot_file(&backend, "new.txt").await;
        backend.write_file("new.txt", "fresh").await.unwrap();
        store.record_created_content(&abs, "fresh");
        backend.remove_file("new.txt").await.unwrap();
        store.revert_all(&backend).await;
        assert_eq!(backend.read_file("new.txt").await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn step_checkpoint_revert_drops_later_steps() {
        let (_dir, backend) = setup().await;
        backend.write_file("f.txt", "base").await.unwrap();
        let mut store = SnapshotStore::new();
        store.snapshot_file(&backend, "f.txt").await;

        backend.write_file("f.txt", "after step 1").await.unwrap();
        store.capture_step_checkpoint(&backend, 1).await;
        backend.write_file("f.txt", "after step 2").await.unwrap();
        store.capture_step_checkpoint(&backend, 2).await;

        let reverted = store.revert_to_step(&backend, 1).await;
        assert_eq!(reverted.len(), 1);
        assert_eq!(backend.read_file("f.txt").await.unwrap(), "after step 1");
        assert!(store.step_checkpoints().contains_key(&1));
        assert!(!store.step_checkpoints().contains_key(&2));
    }

    #[tokio::test]
    async fn session_checkpoint_ring_and_rewind() {
        let (_dir, backend) = setup().await;
        backend.write_file("f.txt", "original").await.unwrap();
        let mut store = SnapshotStore::new();
        store.snapshot_file(&backend, "f.txt").await;

        let id = store
            .create_session_checkpoint(&backend, "before_command:shell", &[])
            .await
            .unwrap();
        backend.write_file("f.txt", "clobbered").await.unwrap();
        let reverted = store.rewind_to_checkpoint(&backend, &id).await;
        assert_eq!(reverted.len(), 1);
        assert_eq!(backend.read_file("f.txt").await.unwrap(), "original");

        for i in 0..30 {
            store
                .create_session_checkpoint(&backend, &format!("cp {}", i), &[])
                .await;
        }
        assert!(store.list_session_checkpoints().len() <= 25);
    }

    #[tokio::test]
    async fn oversize_snapshots_not_persisted() {
        let (_dir, backend) = setup().await;
        let big = "x".repeat(MAX_PERSISTED_SNAPSHOT_BYTES + 1);
        backend.write_file("big.txt", &big).await.unwrap();
        backend.write_file("small.txt", "ok").await.unwrap();
        let mut store = SnapshotStore::new();
        store.snapshot_file(&backend, "big.txt").await;
        store.snapshot_file(&backend, "small.txt").await;

        // Both count in memory, only the small one persists.
        assert_eq!(store.len(), 2);
        let persisted = store.persistable_files();
        assert_eq!(persisted.len(), 1);
        assert!(persisted.keys().next().unwrap().ends_with("small.txt"));
    }
}
