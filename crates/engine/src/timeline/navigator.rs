// Undo/redo target selection and epoch-to-epoch navigation.
//
// Target selection is a pure function of the log and the current epoch.
// Navigation replays structural operations through the delegate and then
// rebuilds the contents of every file they touched.

use std::collections::BTreeSet;

use futures_util::future::try_join_all;
use rewind_common::types::{Checkpoint, Epoch, FileOperation};
use rewind_common::uri::owning_resource;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::replay::ReplayedState;
use super::CheckpointTimeline;
use crate::error::TimelineError;

/// A request (optionally from one undo stop onward) that is currently undone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RequestDisablement {
    pub request_id: String,
    pub after_undo_stop: Option<String>,
}

fn max_encountered_epoch(checkpoints: &[Checkpoint], operations: &[FileOperation]) -> Epoch {
    let last_op = operations.last().map(FileOperation::epoch).unwrap_or(0);
    let last_cp = checkpoints.last().map(|cp| cp.epoch).unwrap_or(0);
    last_op.max(last_cp)
}

/// The checkpoint an undo from `current_epoch` lands on.
pub fn undo_target<'a>(
    checkpoints: &'a [Checkpoint],
    operations: &[FileOperation],
    current_epoch: Epoch,
) -> Option<&'a Checkpoint> {
    if checkpoints.len() < 2 || current_epoch <= checkpoints[1].epoch {
        return None;
    }

    let current_idx = checkpoints.iter().rposition(|cp| cp.epoch < current_epoch)?;
    let start_of_request =
        checkpoints[..=current_idx].iter().rev().find(|cp| cp.is_request_boundary());

    let previous_checkpoint = operations
        .iter()
        .rev()
        .find(|op| op.epoch() < current_epoch)
        .and_then(|op| checkpoints.iter().rev().find(|cp| cp.epoch < op.epoch()));

    let (start, previous) = match (start_of_request, previous_checkpoint) {
        (None, previous) => return previous,
        (start, None) => return start,
        (Some(start), Some(previous)) => (start, previous),
    };

    // Undoing the first edit of a request discards the whole request.
    let edits_between =
        operations.iter().any(|op| op.epoch() > start.epoch && op.epoch() < previous.epoch);
    if !edits_between {
        return Some(start);
    }

    if previous.epoch > start.epoch {
        Some(previous)
    } else {
        Some(start)
    }
}

/// The epoch a redo from `current_epoch` navigates to.
pub fn redo_target(
    checkpoints: &[Checkpoint],
    operations: &[FileOperation],
    current_epoch: Epoch,
) -> Option<Epoch> {
    let max_epoch = max_encountered_epoch(checkpoints, operations);
    if current_epoch > max_epoch {
        return None;
    }

    let next_operation = operations.iter().find(|op| op.epoch() >= current_epoch);
    let next_checkpoint = next_operation
        .and_then(|next| checkpoints.iter().find(|cp| cp.epoch > next.epoch()));

    // Crossing into another request redoes that request as a whole.
    let current_checkpoint = checkpoints.iter().rev().find(|cp| cp.epoch < current_epoch);
    if let (Some(current), Some(next)) = (current_checkpoint, next_operation) {
        if current.request_id.as_deref() != Some(next.request_id()) {
            let start_of_next_idx = checkpoints.iter().enumerate().rev().find_map(|(i, cp)| {
                let previous_request = match i {
                    0 => None,
                    _ => checkpoints[i - 1].request_id.as_deref(),
                };
                (cp.is_request_boundary() && previous_request == current.request_id.as_deref())
                    .then_some(i)
            });
            if let Some(idx) = start_of_next_idx {
                let start_of_next = &checkpoints[idx];
                if start_of_next.request_id.as_deref() != Some(next.request_id()) {
                    if let Some(after) =
                        checkpoints[idx + 1..].iter().find(|cp| cp.is_request_boundary())
                    {
                        return Some(after.epoch);
                    }
                }
            }
        }
    }

    let next_checkpoint_epoch = next_checkpoint.map(|cp| cp.epoch).unwrap_or(Epoch::MAX);
    Some(next_checkpoint_epoch.min(max_epoch + 1))
}

/// Requests currently undone, most recent first.
pub fn request_disablement(
    checkpoints: &[Checkpoint],
    operations: &[FileOperation],
    current_epoch: Epoch,
) -> Vec<RequestDisablement> {
    let max_epoch = max_encountered_epoch(checkpoints, operations);
    if current_epoch > max_epoch {
        return Vec::new();
    }

    let last_applied_operation = operations
        .iter()
        .rev()
        .find(|op| op.epoch() < current_epoch)
        .map(FileOperation::epoch)
        .unwrap_or(0);
    let last_applied_request = checkpoints
        .iter()
        .rev()
        .find(|cp| cp.epoch < current_epoch && cp.is_request_boundary())
        .map(|cp| cp.epoch)
        .unwrap_or(0);
    let stop_at = last_applied_operation.max(last_applied_request);

    let mut disabled: Vec<RequestDisablement> = Vec::new();
    for checkpoint in checkpoints.iter().rev() {
        if checkpoint.epoch <= stop_at {
            break;
        }
        let Some(request_id) = &checkpoint.request_id else {
            continue;
        };
        match disabled.iter_mut().find(|d| &d.request_id == request_id) {
            Some(existing) => existing.after_undo_stop = checkpoint.undo_stop_id.clone(),
            None => disabled.push(RequestDisablement {
                request_id: request_id.clone(),
                after_undo_stop: checkpoint.undo_stop_id.clone(),
            }),
        }
    }
    disabled
}

impl CheckpointTimeline {
    pub fn can_undo(&self) -> bool {
        undo_target(&self.checkpoints, &self.operations, self.current_epoch).is_some()
    }

    pub fn can_redo(&self) -> bool {
        redo_target(&self.checkpoints, &self.operations, self.current_epoch).is_some()
    }

    pub fn request_disablement(&self) -> Vec<RequestDisablement> {
        request_disablement(&self.checkpoints, &self.operations, self.current_epoch)
    }

    /// Undoes to the previous checkpoint. Returns whether anything moved.
    pub async fn undo_to_last_checkpoint(&mut self) -> Result<bool, TimelineError> {
        let Some(target) = undo_target(&self.checkpoints, &self.operations, self.current_epoch)
        else {
            return Ok(false);
        };
        let checkpoint_id = target.checkpoint_id.clone();
        self.navigate_to_checkpoint(&checkpoint_id).await?;
        Ok(true)
    }

    /// Redoes to the next checkpoint. Returns whether anything moved.
    pub async fn redo_to_next_checkpoint(&mut self) -> Result<bool, TimelineError> {
        let Some(target) = redo_target(&self.checkpoints, &self.operations, self.current_epoch)
        else {
            return Ok(false);
        };
        self.navigate_to_epoch(target, target).await?;
        Ok(true)
    }

    /// Moves the workspace to the state right after `checkpoint_id`.
    ///
    /// Navigating to a request boundary restores that request's baselines
    /// and leaves the boundary itself marked as undone.
    pub async fn navigate_to_checkpoint(&mut self, checkpoint_id: &str) -> Result<(), TimelineError> {
        let target = self
            .checkpoints
            .iter()
            .find(|cp| cp.checkpoint_id == checkpoint_id)
            .ok_or_else(|| TimelineError::CheckpointNotFound(checkpoint_id.to_string()))?;

        let restore_to = target.epoch + 1;
        let navigate_to = if target.is_request_boundary() && target.request_id.is_some() {
            target.epoch
        } else {
            restore_to
        };
        self.navigate_to_epoch(restore_to, navigate_to).await
    }

    async fn navigate_to_epoch(
        &mut self,
        restore_to: Epoch,
        navigate_to: Epoch,
    ) -> Result<(), TimelineError> {
        let current = self.current_epoch;
        debug!(from = current, restore_to, navigate_to, "navigating timeline");
        if current != restore_to {
            let touched = self.apply_file_system_operations(current, restore_to).await?;
            self.reconstruct_all_file_contents(restore_to, &touched).await?;
        }
        self.current_epoch = navigate_to;
        self.notify();
        Ok(())
    }

    /// Replays creates, deletes and renames between two epochs in the right
    /// direction. Returns the files whose contents need rebuilding.
    async fn apply_file_system_operations(
        &self,
        from: Epoch,
        to: Epoch,
    ) -> Result<BTreeSet<Url>, TimelineError> {
        let forward = to > from;
        let mut operations: Vec<&FileOperation> = self
            .operations
            .iter()
            .filter(|op| {
                let epoch = op.epoch();
                if forward {
                    epoch >= from && epoch < to
                } else {
                    epoch < from && epoch >= to
                }
            })
            .collect();
        if forward {
            operations.sort_by_key(|op| op.epoch());
        } else {
            operations.sort_by_key(|op| std::cmp::Reverse(op.epoch()));
        }

        let mut touched = BTreeSet::new();
        for operation in operations {
            match operation {
                FileOperation::Create { uri, initial_content, .. } => {
                    if forward {
                        self.delegate.create_file(uri, initial_content).await?;
                        touched.insert(uri.clone());
                    } else {
                        self.delegate.delete_file(uri).await?;
                        touched.remove(uri);
                    }
                }
                FileOperation::Delete { uri, final_content, .. } => {
                    if forward {
                        self.delegate.delete_file(uri).await?;
                        touched.remove(uri);
                    } else {
                        self.delegate.create_file(uri, final_content).await?;
                        touched.insert(uri.clone());
                    }
                }
                FileOperation::Rename { old_uri, new_uri, .. } => {
                    if forward {
                        self.delegate.rename_file(old_uri, new_uri).await?;
                        touched.remove(old_uri);
                        touched.insert(new_uri.clone());
                    } else {
                        self.delegate.rename_file(new_uri, old_uri).await?;
                        touched.remove(new_uri);
                        touched.insert(old_uri.clone());
                    }
                }
                FileOperation::TextEdit { uri, .. } | FileOperation::NotebookEdit { uri, .. } => {
                    touched.insert(owning_resource(uri));
                }
            }
        }
        Ok(touched)
    }

    pub(super) fn reconstruct_file_state(
        &self,
        uri: &Url,
        target: Epoch,
    ) -> Result<ReplayedState, TimelineError> {
        let checkpoint = self
            .checkpoints
            .iter()
            .rev()
            .find(|cp| cp.epoch <= target)
            .ok_or_else(|| {
                TimelineError::ReplayImpossible(format!("no checkpoint at or before epoch {target}"))
            })?;
        let request_id = checkpoint.request_id.as_deref().unwrap_or_default();

        let engine = self.replay_engine();
        let Some(baseline) = engine.find_best_baseline(uri, target, request_id)? else {
            return Ok(ReplayedState {
                exists: false,
                uri: uri.clone(),
                content: String::new(),
                telemetry_info: Default::default(),
                notebook_view_type: None,
            });
        };
        let operations = engine.operations_in_range(uri, baseline.epoch, target);
        engine.replay(&baseline, &operations)
    }

    async fn reconstruct_all_file_contents(
        &self,
        target: Epoch,
        uris: &BTreeSet<Url>,
    ) -> Result<(), TimelineError> {
        let states = uris
            .iter()
            .map(|uri| self.reconstruct_file_state(uri, target))
            .collect::<Result<Vec<_>, _>>()?;

        try_join_all(states.iter().filter(|state| state.exists).map(|state| {
            self.delegate.set_contents(&state.uri, &state.content, &state.telemetry_info)
        }))
        .await?;
        Ok(())
    }
}
