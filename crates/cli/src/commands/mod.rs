// CLI subcommand dispatch and shared session loading.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Subcommand;
use url::Url;

use rewind_engine::store::{SessionStore, StoredSession};
use rewind_engine::timeline::CheckpointTimeline;
use rewind_engine::workspace::{DiskWorkspace, WorkspaceDelegate};
use rewind_engine::EngineConfig;

pub mod checkpoints;
pub mod navigate;
pub mod show;
pub mod status;

#[derive(Subcommand)]
pub enum Command {
    /// List the checkpoints of a session
    Checkpoints(checkpoints::CheckpointsArgs),
    /// Print a file as it was at a request or undo stop
    Show(show::ShowArgs),
    /// Undo to the previous checkpoint and rewrite files on disk
    Undo(navigate::NavigateArgs),
    /// Redo to the next checkpoint and rewrite files on disk
    Redo(navigate::NavigateArgs),
    /// Summarize a session's position and modified files
    Status(status::StatusArgs),
}

pub fn run(cmd: Command, config: EngineConfig) -> anyhow::Result<()> {
    match cmd {
        Command::Checkpoints(args) => checkpoints::run(args, &config),
        Command::Show(args) => show::run(args, &config),
        Command::Undo(args) => navigate::run(args, navigate::Direction::Undo, config),
        Command::Redo(args) => navigate::run(args, navigate::Direction::Redo, config),
        Command::Status(args) => status::run(args, &config),
    }
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load_from(path)
            .with_context(|| format!("failed to load config `{}`", path.display())),
        None => Ok(EngineConfig::load()),
    }
}

/// Runs one command future on a fresh single-threaded runtime.
pub(crate) fn block_on<T>(future: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?
        .block_on(future)
}

/// No persisted state exists for the requested session.
#[derive(Debug)]
pub struct SessionNotFound {
    pub session: String,
    pub storage_dir: PathBuf,
}

impl fmt::Display for SessionNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session `{}` not found in {}", self.session, self.storage_dir.display())
    }
}

impl std::error::Error for SessionNotFound {}

pub(crate) async fn load_session(
    config: &EngineConfig,
    session: &str,
) -> anyhow::Result<StoredSession> {
    let storage_dir = config.storage_dir();
    let store = SessionStore::new(&storage_dir, session);
    let stored = store
        .restore_state()
        .await
        .with_context(|| format!("failed to read session `{session}`"))?;
    stored.ok_or_else(|| SessionNotFound { session: session.to_string(), storage_dir }.into())
}

/// Rebuilds a stored timeline for read-only queries.
pub(crate) fn load_timeline(session: &str, stored: &StoredSession) -> CheckpointTimeline {
    let delegate = Arc::new(WorkspaceDelegate::new(Arc::new(DiskWorkspace)));
    let mut timeline = CheckpointTimeline::new(session, delegate);
    if let Some(state) = stored.timeline.clone() {
        timeline.restore_from_state(state);
    }
    timeline
}

/// URIs pass through untouched; file paths are made absolute first.
pub(crate) fn resolve_resource(input: &str) -> anyhow::Result<Url> {
    if input.contains("://") {
        return Url::parse(input).with_context(|| format!("invalid uri `{input}`"));
    }
    let path = Path::new(input);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().context("failed to read current directory")?.join(path)
    };
    Url::from_file_path(&absolute)
        .map_err(|()| anyhow!("cannot address `{}` as a file uri", absolute.display()))
}
