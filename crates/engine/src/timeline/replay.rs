// Deterministic reconstruction of file state from a baseline plus operations.
//
// Replay is a pure function of (baseline, ordered operations): no clock,
// randomness or I/O. Notebook documents built here live only for the
// duration of one replay.

use std::collections::{BTreeMap, HashSet};

use rewind_common::notebook::NotebookDocument;
use rewind_common::text::apply_text_edits;
use rewind_common::types::{Epoch, FileBaseline, FileOperation, TelemetryInfo};
use rewind_common::uri::CellUri;
use url::Url;

use crate::error::TimelineError;

/// Baselines keyed by `"{uri}::{requestId}"`.
pub type BaselineMap = BTreeMap<String, FileBaseline>;

pub fn baseline_key(uri: &Url, request_id: &str) -> String {
    format!("{uri}::{request_id}")
}

/// Outcome of a replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedState {
    pub exists: bool,
    pub uri: Url,
    pub content: String,
    pub telemetry_info: TelemetryInfo,
    pub notebook_view_type: Option<String>,
}

struct WorkingState {
    exists: bool,
    uri: Url,
    content: String,
    telemetry_info: TelemetryInfo,
    notebook_view_type: Option<String>,
    notebook: Option<NotebookDocument>,
}

impl WorkingState {
    fn finish(self) -> ReplayedState {
        let content = match (&self.notebook, self.exists) {
            (Some(notebook), true) => notebook.snapshot(),
            _ => self.content,
        };
        ReplayedState {
            exists: self.exists,
            uri: self.uri,
            content,
            telemetry_info: self.telemetry_info,
            notebook_view_type: self.notebook_view_type,
        }
    }
}

fn load_notebook(view_type: &str, content: &str) -> Result<NotebookDocument, TimelineError> {
    Ok(NotebookDocument::from_snapshot(view_type, content)?)
}

/// Read-only view over an operation log and its baselines.
#[derive(Clone, Copy)]
pub struct ReplayEngine<'a> {
    operations: &'a [FileOperation],
    baselines: &'a BaselineMap,
}

impl<'a> ReplayEngine<'a> {
    pub fn new(operations: &'a [FileOperation], baselines: &'a BaselineMap) -> Self {
        Self { operations, baselines }
    }

    fn baseline(&self, uri: &Url, request_id: &str) -> Option<FileBaseline> {
        self.baselines.get(&baseline_key(uri, request_id)).cloned()
    }

    /// Finds the replay anchor for `uri` at `epoch`.
    ///
    /// Walks the log backward: a `Create` of the file is its own baseline, a
    /// `Rename` onto the file resolves the source file's state at the rename,
    /// and leaving a request that recorded a baseline stops the walk there.
    pub fn find_best_baseline(
        &self,
        uri: &Url,
        epoch: Epoch,
        request_id: &str,
    ) -> Result<Option<FileBaseline>, TimelineError> {
        let mut visited = HashSet::new();
        self.find_best_baseline_inner(uri, epoch, request_id, &mut visited)
    }

    fn find_best_baseline_inner(
        &self,
        uri: &Url,
        epoch: Epoch,
        request_id: &str,
        visited: &mut HashSet<(Url, Epoch)>,
    ) -> Result<Option<FileBaseline>, TimelineError> {
        if !visited.insert((uri.clone(), epoch)) {
            return Err(TimelineError::ReplayImpossible(format!(
                "cyclic rename chain through {uri} at epoch {epoch}"
            )));
        }

        let mut current_request = request_id.to_string();
        for operation in self.operations.iter().rev() {
            if operation.epoch() > epoch {
                continue;
            }

            match operation {
                FileOperation::Create {
                    uri: created,
                    request_id,
                    epoch,
                    initial_content,
                    notebook_view_type,
                    telemetry_info,
                } if created == uri => {
                    return Ok(Some(FileBaseline {
                        uri: created.clone(),
                        request_id: request_id.clone(),
                        content: initial_content.clone(),
                        epoch: *epoch,
                        telemetry_info: telemetry_info.clone(),
                        notebook_view_type: notebook_view_type.clone(),
                    }));
                }
                FileOperation::Rename { old_uri, new_uri, request_id, epoch } if new_uri == uri => {
                    let Some(previous) =
                        self.find_best_baseline_inner(old_uri, *epoch, request_id, visited)?
                    else {
                        return Ok(None);
                    };
                    let operations = self.operations_in_range(old_uri, previous.epoch, *epoch);
                    let telemetry_info = previous.telemetry_info.clone();
                    let replayed = self.replay(&previous, &operations)?;
                    return Ok(Some(FileBaseline {
                        uri: uri.clone(),
                        request_id: request_id.clone(),
                        content: if replayed.exists { replayed.content } else { String::new() },
                        epoch: *epoch,
                        telemetry_info,
                        notebook_view_type: if replayed.exists {
                            replayed.notebook_view_type
                        } else {
                            None
                        },
                    }));
                }
                _ => {}
            }

            if !current_request.is_empty() && operation.request_id() != current_request {
                if let Some(baseline) = self.baseline(uri, &current_request) {
                    return Ok(Some(baseline));
                }
            }
            current_request = operation.request_id().to_string();
        }

        Ok(self.baseline(uri, &current_request))
    }

    /// Operations touching `uri` (or cells of the notebook at `uri`) with
    /// `from <= epoch < to`, in epoch order.
    pub fn operations_in_range(&self, uri: &Url, from: Epoch, to: Epoch) -> Vec<FileOperation> {
        let mut operations: Vec<FileOperation> = self
            .operations
            .iter()
            .filter(|op| {
                let epoch = op.epoch();
                epoch >= from
                    && epoch < to
                    && (op.uri() == uri
                        || CellUri::parse(op.uri()).is_some_and(|cell| &cell.notebook == uri))
            })
            .cloned()
            .collect();
        operations.sort_by_key(FileOperation::epoch);
        operations
    }

    /// Folds `operations` over `baseline`.
    pub fn replay(
        &self,
        baseline: &FileBaseline,
        operations: &[FileOperation],
    ) -> Result<ReplayedState, TimelineError> {
        replay_operations(baseline, operations)
    }
}

/// Folds `operations` over `baseline` and returns the final file state.
pub fn replay_operations(
    baseline: &FileBaseline,
    operations: &[FileOperation],
) -> Result<ReplayedState, TimelineError> {
    let notebook = match &baseline.notebook_view_type {
        Some(view_type) => Some(load_notebook(view_type, &baseline.content)?),
        None => None,
    };
    let mut state = WorkingState {
        exists: true,
        uri: baseline.uri.clone(),
        content: baseline.content.clone(),
        telemetry_info: baseline.telemetry_info.clone(),
        notebook_view_type: baseline.notebook_view_type.clone(),
        notebook,
    };

    for operation in operations {
        state = apply_operation(state, operation, &baseline.telemetry_info)?;
    }
    Ok(state.finish())
}

fn apply_operation(
    mut state: WorkingState,
    operation: &FileOperation,
    telemetry_info: &TelemetryInfo,
) -> Result<WorkingState, TimelineError> {
    match operation {
        FileOperation::Create { uri, initial_content, notebook_view_type, .. } => {
            let notebook = match notebook_view_type {
                Some(view_type) => Some(load_notebook(view_type, initial_content)?),
                None => None,
            };
            Ok(WorkingState {
                exists: true,
                uri: uri.clone(),
                content: initial_content.clone(),
                telemetry_info: telemetry_info.clone(),
                notebook_view_type: notebook_view_type.clone(),
                notebook,
            })
        }
        FileOperation::Delete { uri, .. } => Ok(WorkingState {
            exists: false,
            uri: uri.clone(),
            content: String::new(),
            telemetry_info: state.telemetry_info,
            notebook_view_type: None,
            notebook: None,
        }),
        FileOperation::Rename { new_uri, .. } => {
            state.uri = new_uri.clone();
            Ok(state)
        }
        FileOperation::TextEdit { edits, cell_index, .. } => {
            if !state.exists {
                return Err(TimelineError::ReplayImpossible(
                    "cannot apply text edits to non-existent file".to_string(),
                ));
            }
            if let (Some(index), Some(notebook)) = (cell_index, state.notebook.as_mut()) {
                if let Some(cell) = notebook.cells().get(*index) {
                    let source = apply_text_edits(&cell.data.source, edits);
                    notebook.set_cell_source(*index, source)?;
                    return Ok(state);
                }
            }
            state.content = apply_text_edits(&state.content, edits);
            Ok(state)
        }
        FileOperation::NotebookEdit { cell_edits, .. } => {
            if !state.exists {
                return Err(TimelineError::ReplayImpossible(
                    "cannot apply notebook edits to non-existent file".to_string(),
                ));
            }
            let Some(notebook) = state.notebook.as_mut() else {
                return Err(TimelineError::ReplayImpossible(
                    "cannot apply notebook edits to non-notebook file".to_string(),
                ));
            };
            notebook.apply_edits(cell_edits)?;
            Ok(state)
        }
    }
}
