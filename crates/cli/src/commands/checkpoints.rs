// `rewind checkpoints`: list the checkpoints of a persisted session.

use clap::Args;
use serde::{Deserialize, Serialize};

use rewind_common::types::{Checkpoint, Epoch};
use rewind_engine::EngineConfig;

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct CheckpointsArgs {
    /// Session id.
    session: String,

    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointsResult {
    pub session: String,
    pub current_epoch: Epoch,
    pub checkpoints: Vec<CheckpointRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRow {
    pub checkpoint_id: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub undo_stop_id: Option<String>,
    pub epoch: Epoch,
    pub label: String,
    /// The checkpoint the session currently sits after.
    pub current: bool,
    /// Undone: at or beyond the current epoch.
    pub undone: bool,
}

pub fn run(args: CheckpointsArgs, config: &EngineConfig) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    output::report(format, super::block_on(list_checkpoints(config, &args.session)), format_human)
}

pub(crate) async fn list_checkpoints(
    config: &EngineConfig,
    session: &str,
) -> anyhow::Result<CheckpointsResult> {
    let stored = super::load_session(config, session).await?;
    let timeline = super::load_timeline(session, &stored);
    Ok(summarize(session, timeline.current_epoch(), timeline.checkpoints()))
}

fn summarize(session: &str, current_epoch: Epoch, checkpoints: &[Checkpoint]) -> CheckpointsResult {
    let current = checkpoints.iter().rposition(|cp| cp.epoch < current_epoch);
    let checkpoints = checkpoints
        .iter()
        .enumerate()
        .map(|(i, cp)| CheckpointRow {
            checkpoint_id: cp.checkpoint_id.clone(),
            request_id: cp.request_id.clone(),
            undo_stop_id: cp.undo_stop_id.clone(),
            epoch: cp.epoch,
            label: cp.label.clone(),
            current: current == Some(i),
            undone: cp.epoch >= current_epoch,
        })
        .collect();
    CheckpointsResult { session: session.to_string(), current_epoch, checkpoints }
}

fn format_human(result: &CheckpointsResult) -> String {
    let mut lines = vec![format!(
        "Session {} at epoch {} ({} checkpoints)",
        result.session,
        result.current_epoch,
        result.checkpoints.len()
    )];
    for cp in &result.checkpoints {
        let marker = if cp.current { "*" } else { " " };
        let mut line = format!("{marker} {:>5}  {}  [{}]", cp.epoch, cp.label, cp.checkpoint_id);
        if cp.undone {
            line.push_str("  (undone)");
        }
        lines.push(line);
    }
    lines.join("\n")
}
