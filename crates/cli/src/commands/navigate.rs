// `rewind undo` / `rewind redo`: move a persisted session between
// checkpoints, rewriting the affected files on disk.

use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use serde::{Deserialize, Serialize};
use tracing::info;

use rewind_common::types::Epoch;
use rewind_engine::timeline::RequestDisablement;
use rewind_engine::workspace::DiskWorkspace;
use rewind_engine::{ChatEditingSession, EngineConfig};

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct NavigateArgs {
    /// Session id.
    session: String,

    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Undo,
    Redo,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Undo => "undo",
            Self::Redo => "redo",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigateResult {
    pub session: String,
    pub action: String,
    /// False when there was nothing to undo or redo.
    pub moved: bool,
    pub current_epoch: Epoch,
    pub can_undo: bool,
    pub can_redo: bool,
    #[serde(default)]
    pub disabled_requests: Vec<RequestDisablement>,
}

pub fn run(args: NavigateArgs, direction: Direction, config: EngineConfig) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    output::report(format, super::block_on(navigate(config, &args.session, direction)), format_human)
}

pub(crate) async fn navigate(
    mut config: EngineConfig,
    session_id: &str,
    direction: Direction,
) -> anyhow::Result<NavigateResult> {
    super::load_session(&config, session_id).await?;
    // The new position must be written back even if the config turns
    // persistence off for live sessions.
    config.persistence.enabled = true;

    let session = ChatEditingSession::open(session_id, Arc::new(DiskWorkspace), config).await;
    let moved = match direction {
        Direction::Undo => session.undo_interaction().await,
        Direction::Redo => session.redo_interaction().await,
    }
    .with_context(|| format!("{} failed for session `{session_id}`", direction.as_str()))?;

    if moved {
        session.store_state().await.context("failed to persist new session position")?;
    }

    let result = NavigateResult {
        session: session_id.to_string(),
        action: direction.as_str().to_string(),
        moved,
        current_epoch: session.current_epoch().await,
        can_undo: session.can_undo().await,
        can_redo: session.can_redo().await,
        disabled_requests: session.request_disablement().await,
    };
    session.dispose()?;

    info!(
        session = session_id,
        action = direction.as_str(),
        moved,
        epoch = result.current_epoch,
        "navigated session"
    );
    Ok(result)
}

fn format_human(result: &NavigateResult) -> String {
    if !result.moved {
        return format!("Nothing to {} in session {}", result.action, result.session);
    }

    let verb = match result.action.as_str() {
        "undo" => "Undid",
        _ => "Redid",
    };
    let mut lines = vec![format!("{verb} session {} to epoch {}", result.session, result.current_epoch)];
    if !result.disabled_requests.is_empty() {
        let requests: Vec<&str> =
            result.disabled_requests.iter().map(|d| d.request_id.as_str()).collect();
        lines.push(format!("  Undone requests: {}", requests.join(", ")));
    }
    let more = match (result.can_undo, result.can_redo) {
        (true, true) => "  More undo and redo available.",
        (true, false) => "  More undo available.",
        (false, true) => "  More redo available.",
        (false, false) => "  No further steps.",
    };
    lines.push(more.to_string());
    lines.join("\n")
}
