//! Headless companion CLI for the codex agent runtime: inspect sessions and
//! plans, revert tracked changes, and clean transcripts. The interactive
//! front-end owns the LLM transport; everything here works from disk.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use codex_agent::session::{SessionStore, clean_history_for_replay};
use codex_agent::snapshot::SnapshotValue;
use std::collections::BTreeMap;

#[derive(Parser)]
#[command(name = "codex", about = "Inspect and manage codex agent sessions")]
struct Cli {
    /// Session store directory (defaults to ~/.bedrock-codex/sessions).
    #[arg(long, env = "CODEX_SESSIONS_DIR")]
    sessions_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List sessions for a working directory, newest first.
    Sessions {
        /// Project working directory.
        #[arg(long, default_value = ".")]
        wd: String,
    },
    /// List all known projects.
    Projects,
    /// Show one session: metadata, token usage, tracked files.
    Show { session_id: String },
    /// Print a session transcript cleaned of internal tags.
    Transcript { session_id: String },
    /// Delete a session file.
    Delete { session_id: String },
    /// Revert files tracked by a session's snapshots.
    Revert {
        session_id: String,
        /// Actually write; without this flag only the plan is printed.
        #[arg(long)]
        apply: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let base_dir = cli
        .sessions_dir
        .map(std::path::PathBuf::from)
        .unwrap_or_else(SessionStore::default_base_dir);
    let store = SessionStore::open(&base_dir)
        .await
        .with_context(|| format!("opening session store at {}", base_dir.display()))?;

    match cli.command {
        Command::Sessions { wd } => {
            let sessions = store.list_sessions(&wd).await;
            if sessions.is_empty() {
                println!("No sessions for {}", wd);
                return Ok(());
            }
            for session in sessions {
                println!(
                    "{}  {:40}  {} msgs  {} tokens  updated {}",
                    session.session_id,
                    session.name,
                    session.message_count(),
                    session.total_tokens(),
                    session.updated_at,
                );
            }
        }
        Command::Projects => {
            for project in store.list_all_projects().await {
                let kind = if project.is_ssh { "ssh" } else { "local" };
                println!(
                    "{:30}  [{}]  {} sessions  {} msgs  {} tokens  {}",
                    project.name,
                    kind,
                    project.session_count,
                    project.message_count,
                    project.total_tokens,
                    project.path,
                );
            }
        }
        Command::Show { session_id } => {
            let session = store
                .load(&session_id)
                .await
                .with_context(|| format!("no session {}", session_id))?;
            println!("session:   {}", session.session_id);
            println!("name:      {}", session.name);
            println!("directory: {}", session.working_directory);
            println!("model:     {}", session.model_id);
            println!("created:   {}", session.created_at);
            println!("updated:   {}", session.updated_at);
            println!("messages:  {}", session.history.len());
            println!(
                "tokens:    {} in / {} out / {} cache-read",
                session.token_usage.input_tokens,
                session.token_usage.output_tokens,
                session.token_usage.cache_read_tokens,
            );
            let snapshots = tracked_snapshots(&session);
            if !snapshots.is_empty() {
                println!("tracked files:");
                for (path, value) in snapshots {
                    let kind = match value {
                        SnapshotValue::Absent => "new",
                        SnapshotValue::Created { .. } => "created",
                        SnapshotValue::Original { .. } => "modified",
                    };
                    println!("  [{}] {}", kind, path);
                }
            }
        }
        Command::Transcript { session_id } => {
            let session = store
                .load(&session_id)
                .await
                .with_context(|| format!("no session {}", session_id))?;
            for message in clean_history_for_replay(&session.history) {
                let role = match message.role {
                    codex::chat::Role::User => "user",
                    codex::chat::Role::Assistant => "assistant",
                };
                let text = message.text();
                if !text.is_empty() {
                    println!("── {} ──\n{}\n", role, text);
                }
            }
        }
        Command::Delete { session_id } => {
            if store.delete(&session_id).await {
                println!("Deleted {}", session_id);
            } else {
                bail!("no session {}", session_id);
            }
        }
        Command::Revert { session_id, apply } => {
            let session = store
                .load(&session_id)
                .await
                .with_context(|| format!("no session {}", session_id))?;
            let snapshots = tracked_snapshots(&session);
            if snapshots.is_empty() {
                println!("Nothing to revert.");
                return Ok(());
            }
            if !apply {
                println!("Would revert {} file(s):", snapshots.len());
                for path in snapshots.keys() {
                    println!("  {}", path);
                }
                println!("Re-run with --apply to write.");
                return Ok(());
            }
            if codex_agent::session::is_ssh_path(&session.working_directory) {
                bail!("revert over SSH must run from the interactive front-end");
            }
            let backend: std::sync::Arc<dyn codex_agent::Backend> = std::sync::Arc::new(
                codex_agent::LocalBackend::new(session.working_directory.clone()),
            );
            let mut store_snapshots = codex_agent::SnapshotStore::new();
            store_snapshots.restore(snapshots, BTreeMap::new(), Vec::new());
            let reverted = store_snapshots.revert_all(&backend).await;
            for path in &reverted {
                println!("reverted {}", path);
            }
            println!("Reverted {} file(s).", reverted.len());
        }
    }

    Ok(())
}

/// File snapshots persisted in a session's extra state.
fn tracked_snapshots(
    session: &codex_agent::Session,
) -> BTreeMap<String, SnapshotValue> {
    session
        .extra_state
        .get("file_snapshots")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}
