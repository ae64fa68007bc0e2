// Core timeline types shared across all rewind crates.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::notebook::CellEdit;
use crate::text::TextEdit;

/// Position in the timeline. Allocated once per operation, checkpoint or
/// baseline and never reused.
pub type Epoch = u64;

/// Request id used for lookups that start before any request.
pub const START_REQUEST_EPOCH: &str = "$$start";

/// Stop ids with this prefix address an epoch directly (`__epoch_12`).
pub const STOP_ID_EPOCH_PREFIX: &str = "__epoch_";

/// Attribution carried alongside recorded content.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryInfo {
    #[serde(default)]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
}

impl TelemetryInfo {
    pub fn for_request(request_id: impl Into<String>) -> Self {
        Self { request_id: request_id.into(), ..Self::default() }
    }
}

/// A named position in the epoch line.
///
/// `undo_stop_id == None` marks the start of a request; a defined stop id
/// marks an intermediate stop within the request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub checkpoint_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo_stop_id: Option<String>,
    pub epoch: Epoch,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Checkpoint {
    pub fn is_request_boundary(&self) -> bool {
        self.undo_stop_id.is_none()
    }
}

/// Full content of a file captured the first time a request touched it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileBaseline {
    pub uri: Url,
    pub request_id: String,
    pub content: String,
    pub epoch: Epoch,
    #[serde(default)]
    pub telemetry_info: TelemetryInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook_view_type: Option<String>,
}

/// One recorded file mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FileOperation {
    #[serde(rename_all = "camelCase")]
    Create {
        uri: Url,
        request_id: String,
        epoch: Epoch,
        initial_content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notebook_view_type: Option<String>,
        #[serde(default)]
        telemetry_info: TelemetryInfo,
    },
    #[serde(rename_all = "camelCase")]
    Delete {
        uri: Url,
        request_id: String,
        epoch: Epoch,
        /// Content at deletion time, used to re-create the file on undo.
        final_content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notebook_view_type: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Rename { old_uri: Url, new_uri: Url, request_id: String, epoch: Epoch },
    #[serde(rename_all = "camelCase")]
    TextEdit {
        uri: Url,
        request_id: String,
        epoch: Epoch,
        edits: Vec<TextEdit>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cell_index: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    NotebookEdit { uri: Url, request_id: String, epoch: Epoch, cell_edits: Vec<CellEdit> },
}

impl FileOperation {
    pub fn epoch(&self) -> Epoch {
        match self {
            Self::Create { epoch, .. }
            | Self::Delete { epoch, .. }
            | Self::Rename { epoch, .. }
            | Self::TextEdit { epoch, .. }
            | Self::NotebookEdit { epoch, .. } => *epoch,
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::Create { request_id, .. }
            | Self::Delete { request_id, .. }
            | Self::Rename { request_id, .. }
            | Self::TextEdit { request_id, .. }
            | Self::NotebookEdit { request_id, .. } => request_id,
        }
    }

    /// The resource this operation leaves behind. Renames report their target.
    pub fn uri(&self) -> &Url {
        match self {
            Self::Create { uri, .. }
            | Self::Delete { uri, .. }
            | Self::TextEdit { uri, .. }
            | Self::NotebookEdit { uri, .. } => uri,
            Self::Rename { new_uri, .. } => new_uri,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Delete { .. } => "delete",
            Self::Rename { .. } => "rename",
            Self::TextEdit { .. } => "textEdit",
            Self::NotebookEdit { .. } => "notebookEdit",
        }
    }
}

/// Parse an `__epoch_N` stop id.
pub fn parse_epoch_stop(stop_id: &str) -> Option<Epoch> {
    stop_id.strip_prefix(STOP_ID_EPOCH_PREFIX)?.parse().ok()
}

pub fn epoch_stop_id(epoch: Epoch) -> String {
    format!("{STOP_ID_EPOCH_PREFIX}{epoch}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::Range;

    fn uri(path: &str) -> Url {
        Url::parse(&format!("file://{path}")).expect("uri should parse")
    }

    #[test]
    fn operation_serializes_with_type_tag_and_camel_case_fields() {
        let op = FileOperation::TextEdit {
            uri: uri("/a.txt"),
            request_id: "req1".into(),
            epoch: 4,
            edits: vec![TextEdit::new(Range::new(1, 1, 1, 1), "x")],
            cell_index: None,
        };
        let json = serde_json::to_value(&op).expect("serialize");
        assert_eq!(json["type"], "textEdit");
        assert_eq!(json["requestId"], "req1");
        assert_eq!(json["edits"][0]["range"]["startLineNumber"], 1);
        assert!(json.get("cellIndex").is_none());

        let back: FileOperation = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, op);
    }

    #[test]
    fn rename_reports_new_uri() {
        let op = FileOperation::Rename {
            old_uri: uri("/a.txt"),
            new_uri: uri("/b.txt"),
            request_id: "r".into(),
            epoch: 2,
        };
        assert_eq!(op.uri().path(), "/b.txt");
        assert_eq!(op.epoch(), 2);
        assert_eq!(op.kind(), "rename");
    }

    #[test]
    fn epoch_stop_ids_parse() {
        assert_eq!(parse_epoch_stop("__epoch_17"), Some(17));
        assert_eq!(parse_epoch_stop(&epoch_stop_id(3)), Some(3));
        assert_eq!(parse_epoch_stop("stop-1"), None);
        assert_eq!(parse_epoch_stop("__epoch_x"), None);
    }

    #[test]
    fn checkpoint_without_stop_is_request_boundary() {
        let cp = Checkpoint {
            checkpoint_id: "c".into(),
            request_id: Some("r".into()),
            undo_stop_id: None,
            epoch: 1,
            label: "Request r".into(),
            description: None,
        };
        assert!(cp.is_request_boundary());
    }
}
