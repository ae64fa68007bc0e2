// Session orchestrator: one checkpoint timeline plus the live entries of a
// chat session.
//
// Lock order: timeline, then entry. Entry locks are never held while
// waiting for the timeline. Std mutexes are never held across an await.

pub mod entry;
pub mod external;
pub mod sequencer;
pub mod streaming;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures_util::future::join_all;
use rewind_common::types::{
    parse_epoch_stop, Checkpoint, Epoch, FileBaseline, FileOperation, TelemetryInfo,
};
use rewind_common::uri::{owning_resource, UriError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{EngineConfig, NotebookConfig};
use crate::error::{SessionError, StorageError, TimelineError};
use crate::store::{RecentSnapshot, SessionStore, StoredSession};
use crate::timeline::delegate::TimelineDelegate;
use crate::timeline::{CheckpointTimeline, EntryDiff, RequestDisablement};
use crate::workspace::Workspace;
use entry::{
    AgentEdits, EditKind, EntryState, EntryTable, EntryTransition, ModifiedFileEntry, SharedEntry,
};
use external::ExternalEditOperation;
use sequencer::{KeyedLocks, ThrottledSequencer};

pub use entry::EntrySnapshot;
pub use external::EditProgress;
pub use streaming::StreamingEditsHandle;

/// Minimum spacing between pushes of changing content at an open stop.
const CONTENTS_AT_STOP_THROTTLE: Duration = Duration::from_millis(500);

// ── Types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    StreamingEdits,
    Idle,
    Disposed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::StreamingEdits => "streaming",
            Self::Idle => "idle",
            Self::Disposed => "disposed",
        }
    }
}

/// What to do when an edited file does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NotExistBehavior {
    Create,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryAction {
    Accept,
    Reject,
}

impl EntryAction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
        }
    }
}

fn workspace_error(uri: &Url, source: anyhow::Error) -> SessionError {
    SessionError::Workspace { uri: uri.to_string(), source }
}

type InitialContents = Arc<Mutex<BTreeMap<Url, String>>>;

fn lock_contents(contents: &Mutex<BTreeMap<Url, String>>) -> MutexGuard<'_, BTreeMap<Url, String>> {
    contents.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Session ──────────────────────────────────────────────────────────

struct SessionInner {
    session_id: String,
    config: EngineConfig,
    workspace: Arc<dyn Workspace>,
    timeline: tokio::sync::Mutex<CheckpointTimeline>,
    timeline_changes: watch::Receiver<u64>,
    entries: Arc<EntryTable>,
    /// File contents from before the session first touched each file.
    initial_file_contents: InitialContents,
    state: watch::Sender<SessionState>,
    streaming_locks: KeyedLocks,
    /// One throttle per resource, shared by every stream into it.
    stream_sequencers: Mutex<HashMap<String, ThrottledSequencer>>,
    baseline_locks: KeyedLocks,
    external_ops: Mutex<HashMap<u64, ExternalEditOperation>>,
    store: Option<SessionStore>,
}

/// A chat editing session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChatEditingSession {
    inner: Arc<SessionInner>,
}

impl ChatEditingSession {
    /// Creates the session and restores any persisted state for it.
    pub async fn open(
        session_id: impl Into<String>,
        workspace: Arc<dyn Workspace>,
        config: EngineConfig,
    ) -> Self {
        let session = Self::new(session_id, workspace, config);
        session.init().await;
        session
    }

    /// Creates the session in the `Initial` state without restoring anything.
    pub fn new(
        session_id: impl Into<String>,
        workspace: Arc<dyn Workspace>,
        config: EngineConfig,
    ) -> Self {
        let session_id = session_id.into();
        let entries = Arc::new(EntryTable::default());
        let initial_file_contents = InitialContents::default();
        let delegate = Arc::new(SessionDelegate {
            workspace: workspace.clone(),
            entries: entries.clone(),
            notebooks: config.notebooks.clone(),
            initial_file_contents: initial_file_contents.clone(),
        });
        let timeline = CheckpointTimeline::new(session_id.clone(), delegate);
        let timeline_changes = timeline.subscribe();
        let store = config
            .persistence
            .enabled
            .then(|| SessionStore::new(config.storage_dir(), &session_id));
        let (state, _) = watch::channel(SessionState::Initial);

        Self {
            inner: Arc::new(SessionInner {
                session_id,
                config,
                workspace,
                timeline: tokio::sync::Mutex::new(timeline),
                timeline_changes,
                entries,
                initial_file_contents,
                state,
                streaming_locks: KeyedLocks::default(),
                stream_sequencers: Mutex::new(HashMap::new()),
                baseline_locks: KeyedLocks::default(),
                external_ops: Mutex::new(HashMap::new()),
                store,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == SessionState::Disposed
    }

    fn set_state(&self, state: SessionState) {
        self.inner.state.send_if_modified(|current| {
            if *current == SessionState::Disposed || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn ensure_not_disposed(&self) -> Result<(), SessionError> {
        if self.is_disposed() {
            return Err(SessionError::Disposed);
        }
        Ok(())
    }

    /// Resolves once restoration has finished.
    pub async fn wait_ready(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|state| *state != SessionState::Initial).await;
    }

    fn initial_contents(&self) -> MutexGuard<'_, BTreeMap<Url, String>> {
        lock_contents(&self.inner.initial_file_contents)
    }

    fn external_ops(&self) -> MutexGuard<'_, HashMap<u64, ExternalEditOperation>> {
        self.inner.external_ops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stream_sequencer(&self, resource: &Url) -> ThrottledSequencer {
        self.inner
            .stream_sequencers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(resource.to_string())
            .or_insert_with(|| ThrottledSequencer::from_config(&self.inner.config.streaming))
            .clone()
    }

    fn is_notebook_resource(&self, uri: &Url) -> bool {
        self.inner.config.notebooks.view_type_for(owning_resource(uri).path()).is_some()
    }

    // ── Restore ────────────────────────────────────────────────────

    async fn init(&self) {
        let restored = match &self.inner.store {
            Some(store) => match store.restore_state().await {
                Ok(restored) => restored,
                Err(err) => {
                    error!(session = %self.inner.session_id, error = %err, "failed to restore session state");
                    None
                }
            },
            None => None,
        };
        if self.is_disposed() {
            return;
        }

        if let Some(restored) = restored {
            self.initial_contents().extend(restored.initial_file_contents);
            self.init_entries(&restored.recent_snapshot).await;
            if let Some(timeline) = restored.timeline {
                self.inner.timeline.lock().await.restore_from_state(timeline);
            }
            info!(
                session = %self.inner.session_id,
                entries = self.inner.entries.len(),
                "restored editing session"
            );
        }
        self.set_state(SessionState::Idle);
    }

    async fn init_entries(&self, snapshot: &RecentSnapshot) {
        let workspace = self.inner.workspace.as_ref();
        for uri in self.inner.entries.uris() {
            if snapshot.entries.iter().any(|entry| entry.resource == uri) {
                continue;
            }
            if let Some(entry) = self.inner.entries.remove(&uri) {
                if let Err(err) = entry.lock().await.reset_to_initial_content(workspace).await {
                    warn!(uri = %uri, error = %err, "failed to reset entry");
                }
            }
        }

        for stored in &snapshot.entries {
            let entry = match self
                .get_or_create_entry(&stored.resource, NotExistBehavior::Abort, &stored.telemetry_info)
                .await
            {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    debug!(uri = %stored.resource, "skipping stored entry for missing file");
                    continue;
                }
                Err(err) => {
                    warn!(uri = %stored.resource, error = %err, "failed to restore entry");
                    continue;
                }
            };
            let mut entry = entry.lock().await;
            if let Err(err) = entry.restore_from_snapshot(stored) {
                warn!(uri = %stored.resource, error = %err, "failed to restore entry snapshot");
                continue;
            }
            if stored.state == EntryState::Modified {
                if let Err(err) = entry.save(workspace).await {
                    warn!(uri = %stored.resource, error = %err, "failed to write restored entry");
                }
            }
        }
    }

    // ── Entries ────────────────────────────────────────────────────

    /// Live entries. Empty before restoration finishes and after dispose.
    pub fn entries(&self) -> Vec<SharedEntry> {
        match self.state() {
            SessionState::Initial | SessionState::Disposed => Vec::new(),
            _ => self.inner.entries.all(),
        }
    }

    /// Entry for `uri`. Cell URIs resolve to their notebook's entry.
    pub fn get_entry(&self, uri: &Url) -> Option<SharedEntry> {
        self.inner.entries.get(uri)
    }

    pub fn initial_file_content(&self, uri: &Url) -> Option<String> {
        self.initial_contents().get(uri).cloned()
    }

    async fn get_or_create_entry(
        &self,
        resource: &Url,
        if_not_exists: NotExistBehavior,
        telemetry_info: &TelemetryInfo,
    ) -> Result<Option<SharedEntry>, SessionError> {
        let resource = owning_resource(resource);
        if let Some(existing) = self.inner.entries.get(&resource) {
            {
                let mut entry = existing.lock().await;
                if entry.telemetry_info().request_id != telemetry_info.request_id {
                    entry.update_telemetry_info(telemetry_info.clone());
                }
            }
            return Ok(Some(existing));
        }

        let view_type =
            self.inner.config.notebooks.view_type_for(resource.path()).map(str::to_string);
        let known_initial = self.initial_contents().get(&resource).cloned();
        let on_disk = self
            .inner
            .workspace
            .read(&resource)
            .await
            .map_err(|err| workspace_error(&resource, err))?;

        let entry = match on_disk {
            Some(disk) => {
                let initial = known_initial.unwrap_or_else(|| disk.clone());
                let differs = disk != initial;
                let mut entry = ModifiedFileEntry::new(
                    resource.clone(),
                    EditKind::Modified,
                    initial,
                    view_type.as_deref(),
                    telemetry_info.clone(),
                )?;
                if differs {
                    entry.set_contents(&disk)?;
                }
                entry
            }
            None if if_not_exists == NotExistBehavior::Abort => return Ok(None),
            None => {
                let initial = known_initial.unwrap_or_default();
                self.inner
                    .workspace
                    .write(&resource, &initial)
                    .await
                    .map_err(|err| workspace_error(&resource, err))?;
                let mut timeline = self.inner.timeline.lock().await;
                let epoch = timeline.increment_epoch();
                timeline.record_file_operation(FileOperation::Create {
                    uri: resource.clone(),
                    request_id: telemetry_info.request_id.clone(),
                    epoch,
                    initial_content: initial.clone(),
                    notebook_view_type: view_type.clone(),
                    telemetry_info: telemetry_info.clone(),
                })?;
                drop(timeline);
                debug!(uri = %resource, epoch, "created file for agent edits");
                ModifiedFileEntry::new(
                    resource.clone(),
                    EditKind::Created,
                    initial,
                    view_type.as_deref(),
                    telemetry_info.clone(),
                )?
            }
        };

        self.initial_contents()
            .entry(resource.clone())
            .or_insert_with(|| entry.initial_content().to_string());
        Ok(Some(self.inner.entries.insert(resource, entry)))
    }

    /// Starts tracking `resource` for the current request: records its
    /// baseline if this request has none yet.
    async fn accept_streaming_edits_start(
        &self,
        response: &TelemetryInfo,
        undo_stop: Option<&str>,
        resource: &Url,
    ) -> Result<SharedEntry, SessionError> {
        let entry = self
            .get_or_create_entry(resource, NotExistBehavior::Create, response)
            .await?
            .ok_or_else(|| workspace_error(resource, anyhow!("file could not be created")))?;

        let mut timeline = self.inner.timeline.lock().await;
        let mut guard = entry.lock().await;
        let uri = guard.modified_uri().clone();
        if !timeline.has_file_baseline(&uri, &response.request_id) {
            let epoch = timeline.increment_epoch();
            timeline.record_file_baseline(FileBaseline {
                uri: uri.clone(),
                request_id: response.request_id.clone(),
                content: guard.current_snapshot(),
                epoch,
                telemetry_info: guard.telemetry_info().clone(),
                notebook_view_type: guard.notebook_view_type().map(str::to_string),
            });
            debug!(uri = %uri, epoch, request_id = %response.request_id, "recorded file baseline");
        }
        self.set_state(SessionState::StreamingEdits);
        guard.accept_streaming_edits_start(&response.request_id, undo_stop);
        drop(guard);
        Ok(entry)
    }

    /// Applies one batch of agent edits and records it in the timeline.
    async fn accept_edits(
        &self,
        resource: &Url,
        edits: &AgentEdits,
        is_last: bool,
        response: &TelemetryInfo,
    ) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        let entry = self
            .get_or_create_entry(resource, NotExistBehavior::Create, response)
            .await?
            .ok_or_else(|| workspace_error(resource, anyhow!("file could not be created")))?;

        let mut timeline = self.inner.timeline.lock().await;
        let mut guard = entry.lock().await;
        self.ensure_not_disposed()?;
        guard.accept_agent_edits(resource, edits)?;
        if !edits.is_empty() {
            record_edit_operation(&mut timeline, &guard, resource, edits, &response.request_id)?;
        }
        drop(timeline);

        if is_last {
            guard
                .save(self.inner.workspace.as_ref())
                .await
                .map_err(|err| workspace_error(resource, err))?;
        }
        Ok(())
    }

    /// Finishes a stream: creates its checkpoint and releases the entry.
    async fn resolve(&self, request_id: &str, undo_stop: Option<&str>, resource: &Url) {
        if self.is_disposed() {
            return;
        }
        let key = resource.to_string();
        let has_other_tasks = self.inner.streaming_locks.keys().iter().any(|k| *k != key);
        if !has_other_tasks {
            self.set_state(SessionState::Idle);
        }

        let Some(entry) = self.inner.entries.get(resource) else {
            return;
        };
        let mut timeline = self.inner.timeline.lock().await;
        if self.is_disposed() {
            return;
        }
        timeline.create_checkpoint(
            Some(request_id),
            undo_stop,
            &checkpoint_label(request_id, undo_stop),
            None,
        );
        drop(timeline);

        let mut entry = entry.lock().await;
        if self.is_disposed() {
            return;
        }
        entry.accept_streaming_edits_end();
    }

    // ── Accept / reject ────────────────────────────────────────────

    /// Accepts pending edits in `uris` (all entries when empty). Returns the
    /// number of entries operated on.
    pub async fn accept(&self, uris: &[Url]) -> Result<usize, SessionError> {
        self.operate_entries(EntryAction::Accept, uris).await
    }

    /// Rejects pending edits in `uris` (all entries when empty).
    pub async fn reject(&self, uris: &[Url]) -> Result<usize, SessionError> {
        self.operate_entries(EntryAction::Reject, uris).await
    }

    async fn operate_entries(&self, action: EntryAction, uris: &[Url]) -> Result<usize, SessionError> {
        self.ensure_not_disposed()?;

        let mut applicable = Vec::new();
        for entry in self.inner.entries.all() {
            let guard = entry.lock_owned().await;
            let matches = uris.is_empty() || uris.iter().any(|uri| uri == guard.modified_uri());
            if matches
                && guard.is_currently_being_modified_by().is_none()
                && guard.state() == EntryState::Modified
            {
                applicable.push(guard);
            }
        }
        if applicable.is_empty() {
            return Ok(0);
        }

        // All I/O first, concurrently.
        let workspace = self.inner.workspace.as_ref();
        let transitions = join_all(applicable.iter().map(|guard| async move {
            let result = match action {
                EntryAction::Accept => guard.accept_deferred(workspace).await,
                EntryAction::Reject => guard.reject_deferred(workspace).await,
            };
            result
                .map_err(|err| {
                    error!(uri = %guard.modified_uri(), error = %err, "failed to {} entry", action.as_str());
                })
                .ok()
        }))
        .await;

        // Then every transition while all entries are still held.
        let count = applicable.len();
        for (guard, transition) in applicable.iter_mut().zip(&transitions) {
            let Some(transition) = transition else {
                continue;
            };
            if let Err(err) = guard.apply_transition(transition) {
                warn!(uri = %guard.modified_uri(), error = %err, "failed to apply entry transition");
            }
            if matches!(transition, EntryTransition::Deleted { .. }) {
                self.inner.entries.remove(guard.modified_uri());
            }
        }
        drop(applicable);
        info!(action = action.as_str(), entries = count, "operated on entries");
        Ok(count)
    }

    // ── Timeline ───────────────────────────────────────────────────

    /// Creates the checkpoint for `(request_id, undo_stop)`.
    pub async fn create_snapshot(&self, request_id: &str, undo_stop: Option<&str>) -> String {
        let label = checkpoint_label(request_id, undo_stop);
        self.inner.timeline.lock().await.create_checkpoint(Some(request_id), undo_stop, &label, None)
    }

    pub async fn restore_snapshot(
        &self,
        request_id: &str,
        stop_id: Option<&str>,
    ) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        let mut timeline = self.inner.timeline.lock().await;
        if let Some(checkpoint_id) = timeline.checkpoint_id_for_request(request_id, stop_id) {
            timeline.navigate_to_checkpoint(&checkpoint_id).await?;
        }
        Ok(())
    }

    pub async fn undo_interaction(&self) -> Result<bool, SessionError> {
        self.ensure_not_disposed()?;
        Ok(self.inner.timeline.lock().await.undo_to_last_checkpoint().await?)
    }

    pub async fn redo_interaction(&self) -> Result<bool, SessionError> {
        self.ensure_not_disposed()?;
        Ok(self.inner.timeline.lock().await.redo_to_next_checkpoint().await?)
    }

    pub async fn can_undo(&self) -> bool {
        self.state() == SessionState::Idle && self.inner.timeline.lock().await.can_undo()
    }

    pub async fn can_redo(&self) -> bool {
        self.state() == SessionState::Idle && self.inner.timeline.lock().await.can_redo()
    }

    pub async fn request_disablement(&self) -> Vec<RequestDisablement> {
        self.inner.timeline.lock().await.request_disablement()
    }

    pub async fn checkpoints(&self) -> Vec<Checkpoint> {
        self.inner.timeline.lock().await.checkpoints().to_vec()
    }

    pub async fn operations(&self) -> Vec<FileOperation> {
        self.inner.timeline.lock().await.operations().to_vec()
    }

    pub async fn current_epoch(&self) -> Epoch {
        self.inner.timeline.lock().await.current_epoch()
    }

    /// Content of `uri` at a stop. Waits for a baseline being captured for
    /// the same path.
    pub async fn get_snapshot_contents(
        &self,
        request_id: &str,
        uri: &Url,
        stop_id: Option<&str>,
    ) -> Result<Option<String>, SessionError> {
        self.inner.baseline_locks.peek(uri.path()).await;
        Ok(self.inner.timeline.lock().await.content_at_stop(request_id, uri, stop_id)?)
    }

    pub async fn get_snapshot_uri(
        &self,
        request_id: &str,
        uri: &Url,
        stop_id: Option<&str>,
    ) -> Result<Url, UriError> {
        self.inner.timeline.lock().await.content_uri_at_stop(request_id, uri, stop_id)
    }

    pub async fn entry_diff_between_stops(
        &self,
        uri: &Url,
        request_id: &str,
        stop_id: Option<&str>,
    ) -> Result<Option<EntryDiff>, TimelineError> {
        self.inner.timeline.lock().await.entry_diff_between_stops(uri, request_id, stop_id)
    }

    pub async fn entry_diff_between_requests(
        &self,
        uri: &Url,
        start_request_id: &str,
        stop_request_id: &str,
    ) -> Result<Option<EntryDiff>, TimelineError> {
        self.inner
            .timeline
            .lock()
            .await
            .entry_diff_between_requests(uri, start_request_id, stop_request_id)
    }

    /// Streams new content for `uri` at an `__epoch_N` stop that lies past
    /// every recorded epoch. `None` when the content at the stop is final.
    pub async fn contents_at_stop_receiver(
        &self,
        request_id: &str,
        uri: &Url,
        stop_id: &str,
    ) -> Option<mpsc::UnboundedReceiver<String>> {
        let target = parse_epoch_stop(stop_id)?;
        if !self.inner.timeline.lock().await.is_open_epoch(target) {
            return None;
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let session = self.clone();
        let mut changes = self.inner.timeline_changes.clone();
        changes.borrow_and_update();
        let (request_id, uri, stop_id) = (request_id.to_string(), uri.clone(), stop_id.to_string());

        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                tokio::time::sleep(CONTENTS_AT_STOP_THROTTLE).await;
                changes.borrow_and_update();
                if session.is_disposed() || sender.is_closed() {
                    break;
                }
                let timeline = session.inner.timeline.lock().await;
                let finished = timeline.last_operation_epoch().is_some_and(|epoch| epoch >= target);
                match timeline.content_at_stop(&request_id, &uri, Some(&stop_id)) {
                    Ok(Some(content)) => {
                        if sender.send(content).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!(uri = %uri, error = %err, "failed to compute content at stop"),
                }
                drop(timeline);
                if finished {
                    break;
                }
            }
        });
        Some(receiver)
    }

    // ── Persistence & lifecycle ────────────────────────────────────

    async fn stored_state(&self) -> StoredSession {
        let mut entries = Vec::new();
        for entry in self.inner.entries.all() {
            entries.push(entry.lock().await.create_snapshot(&self.inner.session_id, None, None));
        }
        let timeline = self.inner.timeline.lock().await.state_for_persistence();
        let initial_file_contents: Vec<(Url, String)> =
            self.initial_contents().iter().map(|(uri, content)| (uri.clone(), content.clone())).collect();
        StoredSession {
            initial_file_contents,
            timeline: Some(timeline),
            recent_snapshot: RecentSnapshot { stop_id: None, entries },
        }
    }

    /// Persists the session. A no-op when persistence is disabled.
    pub async fn store_state(&self) -> Result<(), StorageError> {
        let Some(store) = &self.inner.store else {
            return Ok(());
        };
        let state = self.stored_state().await;
        store.store_state(&state).await
    }

    /// Persists the session, then optionally wipes what was stored.
    pub async fn stop(&self, clear_state: bool) -> Result<(), StorageError> {
        if let Err(err) = self.store_state().await {
            warn!(session = %self.inner.session_id, error = %err, "session not persisted");
        }
        match (&self.inner.store, clear_state) {
            (Some(store), true) => store.clear_state().await,
            _ => Ok(()),
        }
    }

    pub fn dispose(&self) -> Result<(), SessionError> {
        self.ensure_not_disposed()?;
        self.inner.entries.drain();
        self.external_ops().clear();
        self.inner.stream_sequencers.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.inner.state.send_replace(SessionState::Disposed);
        debug!(session = %self.inner.session_id, "disposed editing session");
        Ok(())
    }
}

fn checkpoint_label(request_id: &str, undo_stop: Option<&str>) -> String {
    match undo_stop {
        Some(stop) => format!("Request {request_id} - Stop {stop}"),
        None => format!("Request {request_id}"),
    }
}

fn record_edit_operation(
    timeline: &mut CheckpointTimeline,
    entry: &ModifiedFileEntry,
    resource: &Url,
    edits: &AgentEdits,
    request_id: &str,
) -> Result<(), TimelineError> {
    let epoch = timeline.increment_epoch();
    let operation = match edits {
        AgentEdits::Notebook(cell_edits) => FileOperation::NotebookEdit {
            uri: resource.clone(),
            request_id: request_id.to_string(),
            epoch,
            cell_edits: cell_edits.clone(),
        },
        AgentEdits::Text(edits) => FileOperation::TextEdit {
            uri: resource.clone(),
            request_id: request_id.to_string(),
            epoch,
            edits: edits.clone(),
            cell_index: entry.cell_index_for(resource),
        },
    };
    timeline.record_file_operation(operation)
}

// ── Timeline delegate ────────────────────────────────────────────────

/// Applies navigation to the workspace and keeps live entries in step.
struct SessionDelegate {
    workspace: Arc<dyn Workspace>,
    entries: Arc<EntryTable>,
    notebooks: NotebookConfig,
    initial_file_contents: InitialContents,
}

#[async_trait]
impl TimelineDelegate for SessionDelegate {
    async fn create_file(&self, uri: &Url, content: &str) -> anyhow::Result<()> {
        self.workspace.write(uri, content).await
    }

    async fn delete_file(&self, uri: &Url) -> anyhow::Result<()> {
        self.entries.remove(uri);
        self.workspace.delete(uri).await
    }

    async fn rename_file(&self, old_uri: &Url, new_uri: &Url) -> anyhow::Result<()> {
        if self.workspace.read(old_uri).await?.is_some() {
            self.workspace.rename(old_uri, new_uri).await?;
        }
        if let Some(entry) = self.entries.rekey(old_uri, new_uri) {
            entry.lock().await.rename_to(new_uri.clone());
        }
        Ok(())
    }

    async fn set_contents(
        &self,
        uri: &Url,
        content: &str,
        telemetry_info: &TelemetryInfo,
    ) -> anyhow::Result<()> {
        let entry = match self.entries.get(uri) {
            Some(entry) => entry,
            None => {
                let on_disk = self.workspace.read(uri).await?;
                let kind = if on_disk.is_some() { EditKind::Modified } else { EditKind::Created };
                let initial = lock_contents(&self.initial_file_contents)
                    .get(uri)
                    .cloned()
                    .or(on_disk)
                    .unwrap_or_default();
                let entry = ModifiedFileEntry::new(
                    uri.clone(),
                    kind,
                    initial,
                    self.notebooks.view_type_for(uri.path()),
                    telemetry_info.clone(),
                )?;
                lock_contents(&self.initial_file_contents)
                    .entry(uri.clone())
                    .or_insert_with(|| entry.initial_content().to_string());
                self.entries.insert(uri.clone(), entry)
            }
        };
        entry.lock().await.set_contents(content)?;
        self.workspace.write(uri, content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::MemoryWorkspace;
    use rewind_common::text::{Position, TextEdit};

    fn uri(path: &str) -> Url {
        Url::parse(&format!("file://{path}")).unwrap()
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.persistence.enabled = false;
        config.streaming.min_edit_interval_ms = 0;
        config
    }

    async fn session_with(files: &[(&str, &str)]) -> (ChatEditingSession, Arc<MemoryWorkspace>) {
        let workspace = Arc::new(MemoryWorkspace::default());
        for (path, content) in files {
            workspace.write(&uri(path), content).await.unwrap();
        }
        let session = ChatEditingSession::open("session-1", workspace.clone(), config()).await;
        (session, workspace)
    }

    #[tokio::test]
    async fn opens_idle_with_initial_checkpoint() {
        let (session, _) = session_with(&[]).await;
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.checkpoints().await.len(), 1);
        assert!(session.entries().is_empty());
        assert!(!session.can_undo().await);
    }

    #[tokio::test]
    async fn accept_edits_records_operation_and_updates_entry() {
        let (session, _) = session_with(&[("/a.txt", "hello\n")]).await;
        let response = TelemetryInfo::for_request("r1");
        session.accept_streaming_edits_start(&response, None, &uri("/a.txt")).await.unwrap();
        session
            .accept_edits(
                &uri("/a.txt"),
                &AgentEdits::Text(vec![TextEdit::insert(Position::new(1, 1), ">> ")]),
                false,
                &response,
            )
            .await
            .unwrap();

        let operations = session.operations().await;
        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].kind(), "textEdit");

        let entry = session.get_entry(&uri("/a.txt")).unwrap();
        let entry = entry.lock().await;
        assert_eq!(entry.current_snapshot(), ">> hello\n");
        assert_eq!(entry.is_currently_being_modified_by(), Some("r1"));
        assert_eq!(session.state(), SessionState::StreamingEdits);
        assert_eq!(session.initial_file_content(&uri("/a.txt")).as_deref(), Some("hello\n"));
    }

    #[tokio::test]
    async fn missing_file_is_created_on_first_edit() {
        let (session, workspace) = session_with(&[]).await;
        let response = TelemetryInfo::for_request("r1");
        session.accept_streaming_edits_start(&response, None, &uri("/new.txt")).await.unwrap();

        assert_eq!(workspace.get(&uri("/new.txt")).as_deref(), Some(""));
        let operations = session.operations().await;
        assert!(matches!(operations[0], FileOperation::Create { .. }));
        let entry = session.get_entry(&uri("/new.txt")).unwrap();
        assert_eq!(entry.lock().await.kind(), EditKind::Created);
    }

    #[tokio::test]
    async fn disposed_session_rejects_actions() {
        let (session, _) = session_with(&[]).await;
        session.dispose().unwrap();
        assert!(session.is_disposed());
        assert!(matches!(session.accept(&[]).await, Err(SessionError::Disposed)));
        assert!(matches!(session.undo_interaction().await, Err(SessionError::Disposed)));
        assert!(matches!(session.dispose(), Err(SessionError::Disposed)));
        assert!(session.entries().is_empty());
    }

    #[tokio::test]
    async fn accept_edits_rechecks_disposal_after_waiting() {
        let (session, workspace) = session_with(&[("/a.txt", "hello\n")]).await;
        let response = TelemetryInfo::for_request("r1");
        session.accept_streaming_edits_start(&response, None, &uri("/a.txt")).await.unwrap();

        let timeline = session.inner.timeline.lock().await;
        let pending = {
            let session = session.clone();
            tokio::spawn(async move {
                let edits = AgentEdits::Text(vec![TextEdit::insert(Position::new(1, 1), ">> ")]);
                session.accept_edits(&uri("/a.txt"), &edits, true, &response).await
            })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        session.dispose().unwrap();
        drop(timeline);

        assert!(matches!(pending.await.unwrap(), Err(SessionError::Disposed)));
        assert!(session.operations().await.is_empty());
        assert_eq!(workspace.get(&uri("/a.txt")).as_deref(), Some("hello\n"));
    }

    #[tokio::test]
    async fn resolve_after_disposal_creates_no_checkpoint() {
        let (session, _) = session_with(&[("/a.txt", "hello\n")]).await;
        let response = TelemetryInfo::for_request("r1");
        session.accept_streaming_edits_start(&response, None, &uri("/a.txt")).await.unwrap();

        let timeline = session.inner.timeline.lock().await;
        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.resolve("r1", None, &uri("/a.txt")).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        session.dispose().unwrap();
        drop(timeline);

        pending.await.unwrap();
        assert_eq!(session.checkpoints().await.len(), 1);
    }

    #[tokio::test]
    async fn streams_into_one_resource_share_a_throttle() {
        let (session, _) = session_with(&[("/a.txt", "a\n")]).await;
        let response = TelemetryInfo::for_request("r1");
        let first = session.start_streaming_edits(&uri("/a.txt"), &response, None);
        let second = session.start_streaming_edits(&uri("/a.txt"), &response, None);
        let other = session.start_streaming_edits(&uri("/b.txt"), &response, None);

        first.push_text(vec![TextEdit::insert(Position::new(1, 1), "1")], false);
        second.push_text(vec![TextEdit::insert(Position::new(1, 1), "2")], false);
        assert_eq!(session.stream_sequencer(&uri("/a.txt")).pending(), 2);
        assert_eq!(session.stream_sequencer(&uri("/b.txt")).pending(), 0);

        let handles = [first, second, other];
        for handle in &handles {
            handle.complete();
        }
        for handle in handles {
            assert!(handle.finished().await);
        }
    }

    #[tokio::test]
    async fn delegate_set_contents_creates_entry_and_writes() {
        let workspace = Arc::new(MemoryWorkspace::default());
        let entries = Arc::new(EntryTable::default());
        let delegate = SessionDelegate {
            workspace: workspace.clone(),
            entries: entries.clone(),
            notebooks: NotebookConfig::default(),
            initial_file_contents: InitialContents::default(),
        };
        workspace.write(&uri("/a.txt"), "old").await.unwrap();
        delegate.set_contents(&uri("/a.txt"), "new", &TelemetryInfo::default()).await.unwrap();

        assert_eq!(workspace.get(&uri("/a.txt")).as_deref(), Some("new"));
        let entry = entries.get(&uri("/a.txt")).unwrap();
        let entry = entry.lock().await;
        assert_eq!(entry.current_snapshot(), "new");
        assert_eq!(entry.initial_content(), "old");

        drop(entry);
        delegate.rename_file(&uri("/a.txt"), &uri("/b.txt")).await.unwrap();
        assert!(entries.get(&uri("/a.txt")).is_none());
        let moved = entries.get(&uri("/b.txt")).unwrap();
        assert_eq!(moved.lock().await.modified_uri(), &uri("/b.txt"));
        assert_eq!(workspace.get(&uri("/b.txt")).as_deref(), Some("new"));

        delegate.delete_file(&uri("/b.txt")).await.unwrap();
        assert!(entries.is_empty());
        assert!(workspace.get(&uri("/b.txt")).is_none());
    }
}
