// External edits: a tool rewrites files directly on disk while the session
// holds their stream locks. On stop the disk state is diffed against the
// snapshot taken at start and recorded like any agent edit.

use rewind_common::notebook::CellEdit;
use rewind_common::text::TextEdit;
use rewind_common::types::{FileOperation, TelemetryInfo};
use rewind_common::uri::owning_resource;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::entry::{AgentEdits, EditKind, ModifiedFileEntry, SharedEntry};
use super::sequencer::KeyedGuard;
use super::{record_edit_operation, workspace_error, ChatEditingSession, NotExistBehavior, SessionState};
use crate::error::SessionError;

/// Progress parts reported back to the chat for an external edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EditProgress {
    UndoStop {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    CodeBlockStart {
        uri: Url,
        is_notebook: bool,
    },
    #[serde(rename_all = "camelCase")]
    TextEdit {
        uri: Url,
        edits: Vec<TextEdit>,
        done: bool,
        is_external_edit: bool,
    },
    #[serde(rename_all = "camelCase")]
    NotebookEdit {
        uri: Url,
        edits: Vec<CellEdit>,
        done: bool,
        is_external_edit: bool,
    },
}

/// An external edit between start and stop.
pub(super) struct ExternalEditOperation {
    undo_stop_id: String,
    /// Content before the edit; `None` when the file did not exist.
    snapshots: Vec<(Url, Option<String>)>,
    guards: Vec<KeyedGuard>,
}

impl ChatEditingSession {
    /// Locks `resources` and snapshots them ahead of an external tool
    /// rewriting them. Returns the progress parts to report.
    ///
    /// Locks are taken in URI order, once per resource, so windows over
    /// overlapping sets of files queue behind each other instead of
    /// deadlocking.
    pub async fn start_external_edits(
        &self,
        response: &TelemetryInfo,
        operation_id: u64,
        resources: &[Url],
    ) -> Result<Vec<EditProgress>, SessionError> {
        self.ensure_not_disposed()?;
        self.wait_ready().await;

        let undo_stop_id = Uuid::new_v4().to_string();
        let mut progress = vec![EditProgress::UndoStop { id: undo_stop_id.clone() }];
        let mut snapshots = Vec::new();
        let mut guards = Vec::new();

        let mut ordered: Vec<&Url> = resources.iter().collect();
        ordered.sort();
        ordered.dedup();

        for resource in ordered {
            let guard = self.inner.streaming_locks.lock(resource.to_string()).await;
            if self.is_disposed() {
                return Err(SessionError::Disposed);
            }
            let before = match self.begin_external_edit(resource, response, &undo_stop_id).await {
                Ok(before) => before,
                Err(err) => {
                    warn!(uri = %resource, error = %err, "failed to prepare external edit");
                    continue;
                }
            };
            progress.push(EditProgress::CodeBlockStart {
                uri: resource.clone(),
                is_notebook: self.is_notebook_resource(resource),
            });
            snapshots.push((resource.clone(), before));
            guards.push(guard);
        }

        self.create_snapshot(&response.request_id, Some(&undo_stop_id)).await;
        info!(operation_id, resources = snapshots.len(), "started external edits");
        self.external_ops()
            .insert(operation_id, ExternalEditOperation { undo_stop_id, snapshots, guards });
        Ok(progress)
    }

    async fn begin_external_edit(
        &self,
        resource: &Url,
        response: &TelemetryInfo,
        undo_stop: &str,
    ) -> Result<Option<String>, SessionError> {
        let Some(entry) =
            self.get_or_create_entry(resource, NotExistBehavior::Abort, response).await?
        else {
            return Ok(None);
        };
        self.accept_streaming_edits_start(response, Some(undo_stop), resource).await?;

        let mut entry = entry.lock().await;
        entry
            .save(self.inner.workspace.as_ref())
            .await
            .map_err(|err| workspace_error(resource, err))?;
        let before = entry.current_snapshot();
        entry.start_external_edit();
        Ok(Some(before))
    }

    /// Records what the external tool changed and releases the resources.
    /// Unknown operation ids are ignored.
    pub async fn stop_external_edits(
        &self,
        response: &TelemetryInfo,
        operation_id: u64,
    ) -> Result<Vec<EditProgress>, SessionError> {
        let Some(operation) = self.external_ops().remove(&operation_id) else {
            warn!(operation_id, "no external edit operation to stop");
            return Ok(Vec::new());
        };
        let ExternalEditOperation { undo_stop_id, snapshots, guards } = operation;

        let mut progress = Vec::new();
        for (resource, before) in &snapshots {
            match self.finish_external_edit(resource, before.as_deref(), response, &undo_stop_id).await
            {
                Ok(Some(part)) => progress.push(part),
                Ok(None) => debug!(uri = %resource, "external edit left no file behind"),
                Err(err) => warn!(uri = %resource, error = %err, "failed to record external edit"),
            }
        }

        let held: Vec<String> = snapshots.iter().map(|(resource, _)| resource.to_string()).collect();
        let has_other_tasks =
            self.inner.streaming_locks.keys().iter().any(|key| !held.contains(key));
        drop(guards);
        if !has_other_tasks {
            self.set_state(SessionState::Idle);
        }
        info!(operation_id, resources = snapshots.len(), "stopped external edits");
        Ok(progress)
    }

    async fn finish_external_edit(
        &self,
        resource: &Url,
        before: Option<&str>,
        response: &TelemetryInfo,
        undo_stop: &str,
    ) -> Result<Option<EditProgress>, SessionError> {
        let mut entry = self.inner.entries.get(resource);
        if entry.is_none() && before.is_none() {
            entry = self.adopt_created_file(resource, response, undo_stop).await?;
        }
        let Some(entry) = entry else {
            return Ok(None);
        };

        let mut timeline = self.inner.timeline.lock().await;
        let mut guard = entry.lock().await;
        guard
            .revert_to_disk(self.inner.workspace.as_ref())
            .await
            .map_err(|err| workspace_error(resource, err))?;
        let after = guard.current_snapshot();

        let edits = match before {
            None => {
                let epoch = timeline.increment_epoch();
                timeline.record_file_operation(FileOperation::Create {
                    uri: guard.modified_uri().clone(),
                    request_id: response.request_id.clone(),
                    epoch,
                    initial_content: after,
                    notebook_view_type: guard.notebook_view_type().map(str::to_string),
                    telemetry_info: guard.telemetry_info().clone(),
                })?;
                if guard.is_notebook() {
                    AgentEdits::Notebook(Vec::new())
                } else {
                    AgentEdits::Text(Vec::new())
                }
            }
            Some(before) => {
                let edits = guard.compute_edits_from_snapshots(before, &after)?;
                if !edits.is_empty() {
                    record_edit_operation(&mut timeline, &guard, resource, &edits, &response.request_id)?;
                }
                edits
            }
        };
        drop(timeline);

        guard.accept_streaming_edits_end();
        guard.stop_external_edit();

        let uri = resource.clone();
        Ok(Some(match edits {
            AgentEdits::Text(edits) => {
                EditProgress::TextEdit { uri, edits, done: true, is_external_edit: true }
            }
            AgentEdits::Notebook(edits) => {
                EditProgress::NotebookEdit { uri, edits, done: true, is_external_edit: true }
            }
        }))
    }

    /// Starts tracking a file the external tool created. Rejecting it later
    /// deletes it again.
    async fn adopt_created_file(
        &self,
        resource: &Url,
        response: &TelemetryInfo,
        undo_stop: &str,
    ) -> Result<Option<SharedEntry>, SessionError> {
        let resource = owning_resource(resource);
        let exists = self
            .inner
            .workspace
            .read(&resource)
            .await
            .map_err(|err| workspace_error(&resource, err))?
            .is_some();
        if !exists {
            return Ok(None);
        }

        let view_type = self.inner.config.notebooks.view_type_for(resource.path());
        let mut entry = ModifiedFileEntry::new(
            resource.clone(),
            EditKind::Created,
            String::new(),
            view_type,
            response.clone(),
        )?;
        entry.start_external_edit();
        entry.accept_streaming_edits_start(&response.request_id, Some(undo_stop));
        self.initial_contents()
            .entry(resource.clone())
            .or_insert_with(|| entry.initial_content().to_string());
        Ok(Some(self.inner.entries.insert(resource, entry)))
    }
}
