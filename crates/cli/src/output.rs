// How `rewind` commands print: human text on a terminal, one JSON object per
// command otherwise. Failures go to stderr with a stable error code.

use std::io::{self, IsTerminal, Write};

use rewind_engine::{StorageError, TimelineError};
use serde::Serialize;

use crate::commands::SessionNotFound;

const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

impl OutputFormat {
    /// `--json` wins; otherwise JSON unless stdout is a terminal.
    pub fn detect(json: bool) -> Self {
        Self::choose(json, io::stdout().is_terminal())
    }

    fn choose(json: bool, stdout_is_tty: bool) -> Self {
        if json || !stdout_is_tty {
            Self::Json
        } else {
            Self::Human
        }
    }
}

/// A failed command as reported to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub code: &'static str,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: &'a ErrorReport,
}

impl ErrorReport {
    /// Maps the first recognizable cause in the chain to a code and a hint.
    pub fn from_error(error: &anyhow::Error) -> Self {
        let message = format!("{error:#}");

        for cause in error.chain() {
            if let Some(not_found) = cause.downcast_ref::<SessionNotFound>() {
                return Self {
                    code: "SESSION_NOT_FOUND",
                    message: format!(
                        "No stored session `{}` under {}. Check [storage] dir in ~/.rewind/config.toml",
                        not_found.session,
                        not_found.storage_dir.display()
                    ),
                };
            }
            match cause.downcast_ref::<TimelineError>() {
                Some(TimelineError::CheckpointNotFound(id)) => {
                    return Self {
                        code: "CHECKPOINT_NOT_FOUND",
                        message: format!("Checkpoint {id} not found. Run: rewind checkpoints <session>"),
                    };
                }
                Some(TimelineError::ReplayImpossible(reason)) => {
                    return Self {
                        code: "REPLAY_IMPOSSIBLE",
                        message: format!("Session history cannot be replayed: {reason}"),
                    };
                }
                _ => {}
            }
            if cause.downcast_ref::<StorageError>().is_some() {
                return Self { code: "STORAGE_ERROR", message };
            }
        }

        // `show` reports unknown requests and stops as plain messages.
        if message.contains("no checkpoint for request") {
            return Self { code: "CHECKPOINT_NOT_FOUND", message };
        }
        Self { code: "ERROR", message }
    }

    fn render(&self, format: OutputFormat, color: bool) -> String {
        match format {
            OutputFormat::Json => serde_json::to_string(&ErrorEnvelope { error: self })
                .unwrap_or_else(|_| self.message.clone()),
            OutputFormat::Human if color => format!("{RED}error:{RESET} {}", self.message),
            OutputFormat::Human => format!("error: {}", self.message),
        }
    }
}

/// Renders a command result, without a trailing newline.
pub fn render<T: Serialize>(
    format: OutputFormat,
    value: &T,
    human: fn(&T) -> String,
) -> serde_json::Result<String> {
    match format {
        OutputFormat::Human => Ok(human(value)),
        OutputFormat::Json => serde_json::to_string(value),
    }
}

/// Prints a command's outcome: the result on stdout, or the mapped error on
/// stderr. The error is handed back so the process exits non-zero.
pub fn report<T: Serialize>(
    format: OutputFormat,
    outcome: anyhow::Result<T>,
    human: fn(&T) -> String,
) -> anyhow::Result<()> {
    match outcome {
        Ok(value) => {
            let rendered = render(format, &value, human)?;
            writeln!(io::stdout().lock(), "{rendered}")?;
            Ok(())
        }
        Err(error) => {
            let line = ErrorReport::from_error(&error).render(format, io::stderr().is_terminal());
            let _ = writeln!(io::stderr().lock(), "{line}");
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::navigate::NavigateResult;
    use rewind_engine::timeline::RequestDisablement;

    fn undone() -> NavigateResult {
        NavigateResult {
            session: "chat-1".into(),
            action: "undo".into(),
            moved: true,
            current_epoch: 3,
            can_undo: true,
            can_redo: true,
            disabled_requests: vec![RequestDisablement {
                request_id: "r2".into(),
                after_undo_stop: None,
            }],
        }
    }

    #[test]
    fn json_flag_or_pipe_selects_json() {
        assert_eq!(OutputFormat::choose(true, true), OutputFormat::Json);
        assert_eq!(OutputFormat::choose(false, false), OutputFormat::Json);
        assert_eq!(OutputFormat::choose(false, true), OutputFormat::Human);
        assert_eq!(OutputFormat::detect(true), OutputFormat::Json);
    }

    #[test]
    fn renders_navigation_as_json() {
        let rendered = render(OutputFormat::Json, &undone(), |_| {
            unreachable!("human text is not built for JSON output")
        })
        .expect("serialize");
        assert!(!rendered.ends_with('\n'));

        let parsed: serde_json::Value = serde_json::from_str(&rendered).expect("valid json");
        assert_eq!(parsed["action"], "undo");
        assert_eq!(parsed["current_epoch"], 3);
        assert_eq!(parsed["disabled_requests"][0]["requestId"], "r2");
    }

    #[test]
    fn renders_navigation_as_text() {
        let rendered =
            render(OutputFormat::Human, &undone(), |r| format!("{} to epoch {}", r.action, r.current_epoch))
                .expect("render");
        assert_eq!(rendered, "undo to epoch 3");
    }

    #[test]
    fn error_lines_follow_the_format() {
        let report = ErrorReport { code: "SESSION_NOT_FOUND", message: "No stored session".into() };

        assert_eq!(report.render(OutputFormat::Human, false), "error: No stored session");
        let colored = report.render(OutputFormat::Human, true);
        assert!(colored.starts_with(RED));
        assert!(colored.ends_with("No stored session"));

        let parsed: serde_json::Value =
            serde_json::from_str(&report.render(OutputFormat::Json, false)).expect("valid json");
        assert_eq!(parsed["error"]["code"], "SESSION_NOT_FOUND");
        assert_eq!(parsed["error"]["message"], "No stored session");
    }

    #[test]
    fn missing_session_points_at_storage_config() {
        let err = anyhow::Error::new(SessionNotFound {
            session: "chat-9".into(),
            storage_dir: "/tmp/sessions".into(),
        })
        .context("loading session");
        let report = ErrorReport::from_error(&err);
        assert_eq!(report.code, "SESSION_NOT_FOUND");
        assert!(report.message.contains("chat-9"));
        assert!(report.message.contains("/tmp/sessions"));
    }

    #[test]
    fn missing_checkpoint_suggests_listing_them() {
        let err = anyhow::Error::new(TimelineError::CheckpointNotFound("cp-7".into()));
        let report = ErrorReport::from_error(&err);
        assert_eq!(report.code, "CHECKPOINT_NOT_FOUND");
        assert!(report.message.contains("rewind checkpoints"));

        let err = anyhow::anyhow!("no checkpoint for request `r9`");
        assert_eq!(ErrorReport::from_error(&err).code, "CHECKPOINT_NOT_FOUND");
    }

    #[test]
    fn broken_history_and_storage_have_their_own_codes() {
        let err = anyhow::Error::new(TimelineError::ReplayImpossible("rename cycle".into()));
        assert_eq!(ErrorReport::from_error(&err).code, "REPLAY_IMPOSSIBLE");

        let err = anyhow::Error::new(StorageError::UnsupportedStorageVersion(9))
            .context("failed to read session `chat-1`");
        let report = ErrorReport::from_error(&err);
        assert_eq!(report.code, "STORAGE_ERROR");
        assert!(report.message.contains("unsupported session storage version 9"));
    }

    #[test]
    fn other_failures_keep_their_message() {
        let err = anyhow::anyhow!("something else");
        assert_eq!(
            ErrorReport::from_error(&err),
            ErrorReport { code: "ERROR", message: "something else".into() }
        );
    }
}
