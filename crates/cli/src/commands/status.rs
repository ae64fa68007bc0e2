// `rewind status`: where a persisted session sits and which files it touched.

use clap::Args;
use serde::{Deserialize, Serialize};
use url::Url;

use rewind_common::types::Epoch;
use rewind_engine::store::StoredSession;
use rewind_engine::timeline::{CheckpointTimeline, RequestDisablement};
use rewind_engine::EngineConfig;

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Session id.
    session: String,

    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
    pub session: String,
    pub current_epoch: Epoch,
    pub checkpoints: usize,
    pub operations: usize,
    pub can_undo: bool,
    pub can_redo: bool,
    #[serde(default)]
    pub disabled_requests: Vec<RequestDisablement>,
    #[serde(default)]
    pub entries: Vec<EntryStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryStatus {
    pub uri: Url,
    pub state: String,
    pub request_id: String,
    /// Current content differs from the last accepted content.
    pub changed: bool,
}

pub fn run(args: StatusArgs, config: &EngineConfig) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    output::report(format, super::block_on(session_status(config, &args.session)), format_human)
}

pub(crate) async fn session_status(
    config: &EngineConfig,
    session: &str,
) -> anyhow::Result<StatusResult> {
    let stored = super::load_session(config, session).await?;
    let timeline = super::load_timeline(session, &stored);
    Ok(summarize(session, &timeline, &stored))
}

fn summarize(session: &str, timeline: &CheckpointTimeline, stored: &StoredSession) -> StatusResult {
    let entries = stored
        .recent_snapshot
        .entries
        .iter()
        .map(|entry| EntryStatus {
            uri: entry.resource.clone(),
            state: entry.state.as_str().to_string(),
            request_id: entry.telemetry_info.request_id.clone(),
            changed: entry.original != entry.current,
        })
        .collect();

    StatusResult {
        session: session.to_string(),
        current_epoch: timeline.current_epoch(),
        checkpoints: timeline.checkpoints().len(),
        operations: timeline.operations().len(),
        can_undo: timeline.can_undo(),
        can_redo: timeline.can_redo(),
        disabled_requests: timeline.request_disablement(),
        entries,
    }
}

fn format_human(result: &StatusResult) -> String {
    let mut lines = Vec::new();
    lines.push(format!("Session {} at epoch {}", result.session, result.current_epoch));
    lines.push(format!(
        "  {} checkpoints, {} operations",
        result.checkpoints, result.operations
    ));
    lines.push(format!(
        "  undo: {}, redo: {}",
        if result.can_undo { "available" } else { "none" },
        if result.can_redo { "available" } else { "none" }
    ));

    if !result.disabled_requests.is_empty() {
        let requests: Vec<String> = result
            .disabled_requests
            .iter()
            .map(|d| match &d.after_undo_stop {
                Some(stop) => format!("{} (after stop {stop})", d.request_id),
                None => d.request_id.clone(),
            })
            .collect();
        lines.push(format!("  Undone requests: {}", requests.join(", ")));
    }

    if result.entries.is_empty() {
        lines.push("  No modified files.".into());
    } else {
        lines.push(format!("  Files ({}):", result.entries.len()));
        for entry in &result.entries {
            let marker = if entry.changed { "*" } else { " " };
            lines.push(format!(
                "    {marker} {:<9} {}  ({})",
                entry.state, entry.uri, entry.request_id
            ));
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::navigate::{navigate, Direction};
    use crate::commands::testing;
    use tempfile::TempDir;

    #[tokio::test]
    async fn reports_a_stored_session() {
        let dir = TempDir::new().expect("tempdir");
        let (config, uri) = testing::seed_session(&dir).await;

        let status = session_status(&config, testing::SESSION).await.expect("status");
        assert_eq!(status.current_epoch, 4);
        assert_eq!(status.checkpoints, 2);
        assert_eq!(status.operations, 1);
        assert!(status.can_undo);
        assert!(!status.can_redo);
        assert!(status.disabled_requests.is_empty());

        assert_eq!(status.entries.len(), 1);
        assert_eq!(status.entries[0].uri, uri);
        assert_eq!(status.entries[0].state, "modified");
        assert_eq!(status.entries[0].request_id, "r1");
        assert!(status.entries[0].changed);
    }

    #[tokio::test]
    async fn reports_undone_requests() {
        let dir = TempDir::new().expect("tempdir");
        let (config, _) = testing::seed_session(&dir).await;
        navigate(config.clone(), testing::SESSION, Direction::Undo).await.expect("undo");

        let status = session_status(&config, testing::SESSION).await.expect("status");
        assert!(status.can_redo);
        assert_eq!(
            status.disabled_requests,
            vec![RequestDisablement { request_id: "r1".into(), after_undo_stop: None }]
        );
        assert!(!status.entries[0].changed);
    }

    #[test]
    fn human_format_summarizes() {
        let result = StatusResult {
            session: "chat-1".into(),
            current_epoch: 4,
            checkpoints: 2,
            operations: 1,
            can_undo: true,
            can_redo: false,
            disabled_requests: vec![RequestDisablement {
                request_id: "r2".into(),
                after_undo_stop: Some("s1".into()),
            }],
            entries: vec![EntryStatus {
                uri: Url::parse("file:///work/a.txt").expect("uri"),
                state: "modified".into(),
                request_id: "r1".into(),
                changed: true,
            }],
        };
        let output = format_human(&result);
        assert!(output.contains("Session chat-1 at epoch 4"));
        assert!(output.contains("2 checkpoints, 1 operations"));
        assert!(output.contains("undo: available, redo: none"));
        assert!(output.contains("r2 (after stop s1)"));
        assert!(output.contains("* modified  file:///work/a.txt  (r1)"));
    }

    #[test]
    fn human_format_without_entries() {
        let result = StatusResult {
            session: "chat-1".into(),
            current_epoch: 1,
            checkpoints: 1,
            operations: 0,
            can_undo: false,
            can_redo: false,
            disabled_requests: Vec::new(),
            entries: Vec::new(),
        };
        assert!(format_human(&result).contains("No modified files."));
    }
}
