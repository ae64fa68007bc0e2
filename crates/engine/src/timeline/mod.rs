// Checkpoint timeline: epoch allocator, operation log, checkpoints and
// per-request file baselines.
//
// Invariants:
// - checkpoints and operations are sorted ascending by epoch
// - at most one checkpoint or operation occupies an epoch
// - an item whose epoch equals `current_epoch` is not applied (redo-able)

pub mod delegate;
pub mod navigator;
pub mod replay;

use std::sync::Arc;

use rewind_common::diff::line_change_stats;
use rewind_common::types::{
    epoch_stop_id, parse_epoch_stop, Checkpoint, Epoch, FileBaseline, FileOperation,
    START_REQUEST_EPOCH,
};
use rewind_common::uri::{SnapshotUri, UriError};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::error::TimelineError;
use delegate::TimelineDelegate;
use replay::{baseline_key, BaselineMap, ReplayEngine};

pub use navigator::{redo_target, request_disablement, undo_target, RequestDisablement};
pub use replay::{replay_operations, ReplayedState};

const INITIAL_CHECKPOINT_LABEL: &str = "Initial State";
const INITIAL_CHECKPOINT_DESCRIPTION: &str = "Starting point before any edits";

/// Serialized form of a timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimelineState {
    pub checkpoints: Vec<Checkpoint>,
    pub current_epoch: Epoch,
    /// `("{uri}::{requestId}", baseline)` pairs.
    pub file_baselines: Vec<(String, FileBaseline)>,
    pub operations: Vec<FileOperation>,
    pub epoch_counter: Epoch,
}

/// Line-level summary of how a file changed between two points.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EntryDiff {
    pub original_uri: Url,
    pub modified_uri: Url,
    pub identical: bool,
    /// False when the end point is still open and may receive more edits.
    pub is_final: bool,
    pub added: usize,
    pub removed: usize,
}

pub struct CheckpointTimeline {
    session: String,
    delegate: Arc<dyn TimelineDelegate>,
    checkpoints: Vec<Checkpoint>,
    operations: Vec<FileOperation>,
    baselines: BaselineMap,
    current_epoch: Epoch,
    epoch_counter: Epoch,
    changes: watch::Sender<u64>,
}

impl CheckpointTimeline {
    /// Creates a timeline holding only the initial checkpoint at epoch 0.
    pub fn new(session: impl Into<String>, delegate: Arc<dyn TimelineDelegate>) -> Self {
        let (changes, _) = watch::channel(0);
        let mut timeline = Self {
            session: session.into(),
            delegate,
            checkpoints: Vec::new(),
            operations: Vec::new(),
            baselines: BaselineMap::new(),
            current_epoch: 0,
            epoch_counter: 0,
            changes,
        };
        timeline.create_checkpoint(
            None,
            None,
            INITIAL_CHECKPOINT_LABEL,
            Some(INITIAL_CHECKPOINT_DESCRIPTION.to_string()),
        );
        timeline
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn operations(&self) -> &[FileOperation] {
        &self.operations
    }

    /// Version counter bumped on every structural change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    /// Allocates the next epoch.
    pub fn increment_epoch(&mut self) -> Epoch {
        let epoch = self.epoch_counter;
        self.epoch_counter += 1;
        epoch
    }

    /// Drops everything at or after the current epoch.
    fn truncate_future(&mut self) {
        let current = self.current_epoch;
        let before = self.checkpoints.len() + self.operations.len();
        self.checkpoints.retain(|cp| cp.epoch < current);
        self.operations.retain(|op| op.epoch() < current);
        let dropped = before - (self.checkpoints.len() + self.operations.len());
        if dropped > 0 {
            debug!(current_epoch = current, dropped, "discarded undone history");
        }
    }

    /// Creates (or finds) the checkpoint for `(request_id, undo_stop_id)`.
    pub fn create_checkpoint(
        &mut self,
        request_id: Option<&str>,
        undo_stop_id: Option<&str>,
        label: &str,
        description: Option<String>,
    ) -> String {
        if let Some(existing) = self.checkpoints.iter().find(|cp| {
            cp.request_id.as_deref() == request_id && cp.undo_stop_id.as_deref() == undo_stop_id
        }) {
            return existing.checkpoint_id.clone();
        }

        self.truncate_future();
        let checkpoint_id = Uuid::new_v4().to_string();
        let epoch = self.increment_epoch();
        self.checkpoints.push(Checkpoint {
            checkpoint_id: checkpoint_id.clone(),
            request_id: request_id.map(str::to_string),
            undo_stop_id: undo_stop_id.map(str::to_string),
            epoch,
            label: label.to_string(),
            description,
        });
        self.current_epoch = epoch + 1;
        self.notify();
        checkpoint_id
    }

    /// Appends `operation`, discarding any undone future first.
    pub fn record_file_operation(&mut self, operation: FileOperation) -> Result<(), TimelineError> {
        let epoch = operation.epoch();
        if epoch < self.current_epoch {
            return Err(TimelineError::EpochOrderViolation { epoch, current: self.current_epoch });
        }
        self.truncate_future();
        debug!(epoch, kind = operation.kind(), uri = %operation.uri(), "recorded file operation");
        self.operations.push(operation);
        self.current_epoch = epoch + 1;
        self.notify();
        Ok(())
    }

    /// Stores a baseline unless one already exists for its `(uri, request)`.
    pub fn record_file_baseline(&mut self, baseline: FileBaseline) {
        let key = baseline_key(&baseline.uri, &baseline.request_id);
        self.baselines.entry(key).or_insert(baseline);
    }

    pub fn has_file_baseline(&self, uri: &Url, request_id: &str) -> bool {
        self.baselines.contains_key(&baseline_key(uri, request_id))
    }

    pub fn checkpoint_id_for_request(
        &self,
        request_id: &str,
        undo_stop_id: Option<&str>,
    ) -> Option<String> {
        self.checkpoints
            .iter()
            .find(|cp| {
                cp.request_id.as_deref() == Some(request_id)
                    && cp.undo_stop_id.as_deref() == undo_stop_id
            })
            .map(|cp| cp.checkpoint_id.clone())
    }

    fn replay_engine(&self) -> ReplayEngine<'_> {
        ReplayEngine::new(&self.operations, &self.baselines)
    }

    /// URI addressing `file_uri` as of `(request_id, stop_id)`.
    pub fn content_uri_at_stop(
        &self,
        request_id: &str,
        file_uri: &Url,
        stop_id: Option<&str>,
    ) -> Result<Url, UriError> {
        SnapshotUri {
            session: self.session.clone(),
            request_id: request_id.to_string(),
            stop_id: stop_id.map(str::to_string),
            path: file_uri.path().to_string(),
        }
        .to_uri()
    }

    /// Recovers the recorded URI for a path, since lookups may arrive with a
    /// different scheme or authority.
    fn canonical_uri_for_path(&self, path: &str) -> Option<Url> {
        self.baselines
            .values()
            .map(|baseline| &baseline.uri)
            .chain(self.operations.iter().map(FileOperation::uri))
            .find(|uri| uri.path() == path)
            .cloned()
    }

    /// Content of `uri` at a stop. `Some("")` when nothing is known about the
    /// file there, `None` when it is known not to exist.
    pub fn content_at_stop(
        &self,
        request_id: &str,
        uri: &Url,
        stop_id: Option<&str>,
    ) -> Result<Option<String>, TimelineError> {
        let epoch = match stop_id.and_then(parse_epoch_stop) {
            Some(epoch) => Some(epoch),
            None => self
                .checkpoints
                .iter()
                .find(|cp| {
                    cp.request_id.as_deref() == Some(request_id)
                        && cp.undo_stop_id.as_deref() == stop_id
                })
                .map(|cp| cp.epoch),
        };
        match epoch {
            Some(epoch) if epoch > 0 => self.content_at_epoch(request_id, uri, epoch),
            _ => Ok(Some(String::new())),
        }
    }

    fn content_at_epoch(
        &self,
        request_id: &str,
        uri: &Url,
        epoch: Epoch,
    ) -> Result<Option<String>, TimelineError> {
        let Some(file_uri) = self.canonical_uri_for_path(uri.path()) else {
            return Ok(Some(String::new()));
        };
        let engine = self.replay_engine();
        let Some(baseline) = engine.find_best_baseline(&file_uri, epoch, request_id)? else {
            return Ok(Some(String::new()));
        };
        let operations = engine.operations_in_range(&file_uri, baseline.epoch, epoch);
        let replayed = engine.replay(&baseline, &operations)?;
        Ok(replayed.exists.then_some(replayed.content))
    }

    /// Diff of `uri` across the stop `(request_id, stop_id)` and the
    /// checkpoint after it.
    pub fn entry_diff_between_stops(
        &self,
        uri: &Url,
        request_id: &str,
        stop_id: Option<&str>,
    ) -> Result<Option<EntryDiff>, TimelineError> {
        let Some(start_idx) = self.checkpoints.iter().position(|cp| {
            cp.request_id.as_deref() == Some(request_id) && cp.undo_stop_id.as_deref() == stop_id
        }) else {
            return Ok(None);
        };
        let start = &self.checkpoints[start_idx];
        let end = self.checkpoints.get(start_idx + 1);
        self.entry_diff_between_checkpoints(uri, start, end).map(Some)
    }

    /// Diff of `uri` from the start of `start_request_id` to the start of
    /// `stop_request_id` (or the next request).
    pub fn entry_diff_between_requests(
        &self,
        uri: &Url,
        start_request_id: &str,
        stop_request_id: &str,
    ) -> Result<Option<EntryDiff>, TimelineError> {
        let start_idx = self
            .checkpoints
            .iter()
            .position(|cp| cp.request_id.as_deref() == Some(start_request_id));
        let Some(start) = self.checkpoints.get(start_idx.unwrap_or(0)) else {
            return Ok(None);
        };
        let end = self
            .checkpoints
            .iter()
            .find(|cp| cp.request_id.as_deref() == Some(stop_request_id))
            .or_else(|| {
                self.checkpoints[start_idx.unwrap_or(0)..]
                    .iter()
                    .find(|cp| cp.request_id.as_deref() != Some(start_request_id))
            })
            .or_else(|| self.checkpoints.last());
        self.entry_diff_between_checkpoints(uri, start, end).map(Some)
    }

    fn entry_diff_between_checkpoints(
        &self,
        uri: &Url,
        start: &Checkpoint,
        end: Option<&Checkpoint>,
    ) -> Result<EntryDiff, TimelineError> {
        let start_request = start.request_id.as_deref().unwrap_or(START_REQUEST_EPOCH);
        let end_request = end
            .and_then(|cp| cp.request_id.as_deref())
            .unwrap_or(start_request);
        let end_epoch = end.map(|cp| cp.epoch).unwrap_or(Epoch::MAX);

        let original = self.content_at_epoch(start_request, uri, start.epoch)?.unwrap_or_default();
        let modified = self.content_at_epoch(end_request, uri, end_epoch)?.unwrap_or_default();
        let stats = line_change_stats(&original, &modified);

        let original_uri = self
            .content_uri_at_stop(start_request, uri, Some(epoch_stop_id(start.epoch).as_str()))
            .unwrap_or_else(|_| uri.clone());
        let modified_uri = self
            .content_uri_at_stop(end_request, uri, Some(epoch_stop_id(end_epoch).as_str()))
            .unwrap_or_else(|_| uri.clone());

        Ok(EntryDiff {
            original_uri,
            modified_uri,
            identical: original == modified,
            is_final: end.is_some(),
            added: stats.added,
            removed: stats.removed,
        })
    }

    pub fn state_for_persistence(&self) -> TimelineState {
        TimelineState {
            checkpoints: self.checkpoints.clone(),
            current_epoch: self.current_epoch,
            file_baselines: self
                .baselines
                .iter()
                .map(|(key, baseline)| (key.clone(), baseline.clone()))
                .collect(),
            operations: self.operations.clone(),
            epoch_counter: self.epoch_counter,
        }
    }

    pub fn restore_from_state(&mut self, state: TimelineState) {
        self.checkpoints = state.checkpoints;
        self.current_epoch = state.current_epoch;
        self.operations = state.operations;
        self.epoch_counter = state.epoch_counter;
        self.baselines = state.file_baselines.into_iter().collect();
        self.notify();
    }

    /// Whether `epoch` lies past everything recorded so far.
    pub fn is_open_epoch(&self, epoch: Epoch) -> bool {
        epoch > self.epoch_counter
    }

    pub fn last_operation_epoch(&self) -> Option<Epoch> {
        self.operations.last().map(FileOperation::epoch)
    }
}
