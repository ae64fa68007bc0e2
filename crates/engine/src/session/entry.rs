// Live per-file state owned by a session.
//
// An entry tracks three versions of one file:
// - `initial_content`: the file before the session first touched it
// - `original`: the last accepted content, the base of pending review
// - the current content, text or notebook, as produced by the agent

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use rewind_common::diff::compute_text_edits;
use rewind_common::notebook::{compute_notebook_edits, CellEdit, NotebookDocument};
use rewind_common::text::{apply_text_edits, TextEdit};
use rewind_common::types::TelemetryInfo;
use rewind_common::uri::{owning_resource, CellUri, SnapshotUri};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::TimelineError;
use crate::workspace::Workspace;

// ── Types ────────────────────────────────────────────────────────────

/// Review state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryState {
    Modified,
    Accepted,
    Rejected,
}

impl EntryState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Modified => "modified",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "modified" => Some(Self::Modified),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Whether the session created the file or found it on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Created,
    Modified,
}

/// Edits delivered to an entry, either streamed by the agent or
/// synthesized from two snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEdits {
    Text(Vec<TextEdit>),
    Notebook(Vec<CellEdit>),
}

impl AgentEdits {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(edits) => edits.is_empty(),
            Self::Notebook(edits) => edits.is_empty(),
        }
    }
}

/// Point-in-time copy of an entry, as persisted and restored.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    pub resource: Url,
    pub language_id: String,
    pub snapshot_uri: Url,
    pub original: String,
    pub current: String,
    pub state: EntryState,
    pub telemetry_info: TelemetryInfo,
}

/// Result of deferred accept/reject I/O, applied later in one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryTransition {
    Accepted { content: String },
    Rejected { content: String },
    /// A rejected file the session had created. The entry goes away.
    Deleted { final_content: String },
}

#[derive(Debug, Clone)]
enum EntryContent {
    Text(String),
    Notebook(NotebookDocument),
}

impl EntryContent {
    fn snapshot(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Notebook(doc) => doc.snapshot(),
        }
    }
}

/// Language id guessed from the file extension.
pub fn language_for(uri: &Url, notebook_view_type: Option<&str>) -> String {
    if let Some(view_type) = notebook_view_type {
        return view_type.to_string();
    }
    let extension = uri
        .path()
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    let language = match extension.as_deref() {
        Some("rs") => "rust",
        Some("py") => "python",
        Some("ts" | "tsx") => "typescript",
        Some("js" | "jsx" | "mjs") => "javascript",
        Some("json") => "json",
        Some("md") => "markdown",
        Some("toml") => "toml",
        Some("yaml" | "yml") => "yaml",
        Some("sh") => "shellscript",
        _ => "plaintext",
    };
    language.to_string()
}

// ── Entry ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ModifiedFileEntry {
    uri: Url,
    language_id: String,
    kind: EditKind,
    initial_content: String,
    original: String,
    content: EntryContent,
    state: EntryState,
    being_modified_by: Option<String>,
    undo_stop: Option<String>,
    external_edit: bool,
    telemetry_info: TelemetryInfo,
}

impl ModifiedFileEntry {
    pub fn new(
        uri: Url,
        kind: EditKind,
        initial_content: String,
        notebook_view_type: Option<&str>,
        telemetry_info: TelemetryInfo,
    ) -> Result<Self, TimelineError> {
        let content = match notebook_view_type {
            Some(view_type) => {
                EntryContent::Notebook(NotebookDocument::from_snapshot(view_type, &initial_content)?)
            }
            None => EntryContent::Text(initial_content.clone()),
        };
        Ok(Self {
            language_id: language_for(&uri, notebook_view_type),
            uri,
            kind,
            original: initial_content.clone(),
            initial_content,
            content,
            state: EntryState::Accepted,
            being_modified_by: None,
            undo_stop: None,
            external_edit: false,
            telemetry_info,
        })
    }

    pub fn modified_uri(&self) -> &Url {
        &self.uri
    }

    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    pub fn kind(&self) -> EditKind {
        self.kind
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn initial_content(&self) -> &str {
        &self.initial_content
    }

    pub fn original_content(&self) -> &str {
        &self.original
    }

    pub fn telemetry_info(&self) -> &TelemetryInfo {
        &self.telemetry_info
    }

    pub fn update_telemetry_info(&mut self, telemetry_info: TelemetryInfo) {
        self.telemetry_info = telemetry_info;
    }

    pub fn notebook_view_type(&self) -> Option<&str> {
        match &self.content {
            EntryContent::Notebook(doc) => Some(doc.view_type()),
            EntryContent::Text(_) => None,
        }
    }

    pub fn is_notebook(&self) -> bool {
        self.notebook_view_type().is_some()
    }

    /// Request id currently streaming into this entry.
    pub fn is_currently_being_modified_by(&self) -> Option<&str> {
        self.being_modified_by.as_deref()
    }

    pub fn last_undo_stop(&self) -> Option<&str> {
        self.undo_stop.as_deref()
    }

    pub fn is_external_edit(&self) -> bool {
        self.external_edit
    }

    /// Current text, or the serialized notebook.
    pub fn current_snapshot(&self) -> String {
        self.content.snapshot()
    }

    pub fn index_of_cell_handle(&self, handle: u64) -> Option<usize> {
        match &self.content {
            EntryContent::Notebook(doc) => doc.index_of_handle(handle),
            EntryContent::Text(_) => None,
        }
    }

    /// Cell index addressed by `resource`, if it is a cell of this notebook.
    pub fn cell_index_for(&self, resource: &Url) -> Option<usize> {
        CellUri::parse(resource).and_then(|cell| self.index_of_cell_handle(cell.handle))
    }

    pub(crate) fn rename_to(&mut self, uri: Url) {
        self.uri = uri;
    }

    // ── Streaming ──────────────────────────────────────────────────

    pub fn accept_streaming_edits_start(&mut self, request_id: &str, undo_stop: Option<&str>) {
        self.being_modified_by = Some(request_id.to_string());
        self.undo_stop = undo_stop.map(str::to_string);
        self.state = EntryState::Modified;
    }

    /// Applies agent edits to the in-memory content. Text edits addressed
    /// at a cell URI edit that cell's source.
    pub fn accept_agent_edits(
        &mut self,
        resource: &Url,
        edits: &AgentEdits,
    ) -> Result<(), TimelineError> {
        if edits.is_empty() {
            return Ok(());
        }
        let cell_index = self.cell_index_for(resource);
        match (&mut self.content, edits) {
            (EntryContent::Text(text), AgentEdits::Text(edits)) => {
                *text = apply_text_edits(text, edits);
            }
            (EntryContent::Notebook(doc), AgentEdits::Text(edits)) => match cell_index {
                Some(index) => {
                    let source = apply_text_edits(&doc.cells()[index].data.source, edits);
                    doc.set_cell_source(index, source)?;
                }
                None => {
                    let snapshot = apply_text_edits(&doc.snapshot(), edits);
                    doc.restore_snapshot(&snapshot)?;
                }
            },
            (EntryContent::Notebook(doc), AgentEdits::Notebook(edits)) => {
                doc.apply_edits(edits)?;
            }
            (EntryContent::Text(_), AgentEdits::Notebook(_)) => {
                return Err(TimelineError::ReplayImpossible(format!(
                    "cannot apply notebook edits to non-notebook file {}",
                    self.uri
                )));
            }
        }
        self.state = EntryState::Modified;
        Ok(())
    }

    pub fn accept_streaming_edits_end(&mut self) {
        self.being_modified_by = None;
    }

    /// Replaces the whole content (text or notebook snapshot).
    pub fn set_contents(&mut self, content: &str) -> Result<(), TimelineError> {
        match &mut self.content {
            EntryContent::Text(text) => *text = content.to_string(),
            EntryContent::Notebook(doc) => doc.restore_snapshot(content)?,
        }
        if content != self.original {
            self.state = EntryState::Modified;
        }
        Ok(())
    }

    pub fn start_external_edit(&mut self) {
        self.external_edit = true;
    }

    pub fn stop_external_edit(&mut self) {
        self.external_edit = false;
    }

    /// Edits turning snapshot `before` into `after`, in this entry's format.
    pub fn compute_edits_from_snapshots(
        &self,
        before: &str,
        after: &str,
    ) -> Result<AgentEdits, TimelineError> {
        match &self.content {
            EntryContent::Text(_) => Ok(AgentEdits::Text(compute_text_edits(before, after))),
            EntryContent::Notebook(doc) => {
                Ok(AgentEdits::Notebook(compute_notebook_edits(doc.view_type(), before, after)?))
            }
        }
    }

    // ── Snapshots ──────────────────────────────────────────────────

    pub fn create_snapshot(
        &self,
        session: &str,
        request_id: Option<&str>,
        undo_stop: Option<&str>,
    ) -> EntrySnapshot {
        let snapshot_uri = SnapshotUri {
            session: session.to_string(),
            request_id: request_id.unwrap_or(&self.telemetry_info.request_id).to_string(),
            stop_id: undo_stop.map(str::to_string),
            path: self.uri.path().to_string(),
        }
        .to_uri()
        .unwrap_or_else(|_| self.uri.clone());

        EntrySnapshot {
            resource: self.uri.clone(),
            language_id: self.language_id.clone(),
            snapshot_uri,
            original: self.original.clone(),
            current: self.current_snapshot(),
            state: self.state,
            telemetry_info: self.telemetry_info.clone(),
        }
    }

    pub fn restore_from_snapshot(&mut self, snapshot: &EntrySnapshot) -> Result<(), TimelineError> {
        match &mut self.content {
            EntryContent::Text(text) => *text = snapshot.current.clone(),
            EntryContent::Notebook(doc) => doc.restore_snapshot(&snapshot.current)?,
        }
        self.original = snapshot.original.clone();
        self.state = snapshot.state;
        self.language_id = snapshot.language_id.clone();
        self.telemetry_info = snapshot.telemetry_info.clone();
        self.being_modified_by = None;
        Ok(())
    }

    // ── Disk I/O ───────────────────────────────────────────────────

    pub async fn save(&self, workspace: &dyn Workspace) -> Result<()> {
        workspace.write(&self.uri, &self.current_snapshot()).await
    }

    /// Reloads the content from disk. Missing files read as empty.
    pub async fn revert_to_disk(&mut self, workspace: &dyn Workspace) -> Result<()> {
        let content = workspace.read(&self.uri).await?.unwrap_or_default();
        match &mut self.content {
            EntryContent::Text(text) => *text = content,
            EntryContent::Notebook(doc) => doc
                .restore_snapshot(&content)
                .with_context(|| format!("invalid notebook on disk at {}", self.uri))?,
        }
        Ok(())
    }

    /// Puts the file back the way the session found it.
    pub async fn reset_to_initial_content(&mut self, workspace: &dyn Workspace) -> Result<()> {
        match self.kind {
            EditKind::Created => workspace.delete(&self.uri).await?,
            EditKind::Modified => workspace.write(&self.uri, &self.initial_content).await?,
        }
        self.set_contents(&self.initial_content.clone())
            .with_context(|| format!("failed to reset {}", self.uri))?;
        self.original = self.initial_content.clone();
        self.state = EntryState::Accepted;
        Ok(())
    }

    pub async fn accept_deferred(&self, workspace: &dyn Workspace) -> Result<EntryTransition> {
        let content = self.current_snapshot();
        workspace.write(&self.uri, &content).await?;
        Ok(EntryTransition::Accepted { content })
    }

    pub async fn reject_deferred(&self, workspace: &dyn Workspace) -> Result<EntryTransition> {
        if self.kind == EditKind::Created && self.original == self.initial_content {
            workspace.delete(&self.uri).await?;
            return Ok(EntryTransition::Deleted { final_content: self.current_snapshot() });
        }
        workspace.write(&self.uri, &self.original).await?;
        Ok(EntryTransition::Rejected { content: self.original.clone() })
    }

    pub fn apply_transition(&mut self, transition: &EntryTransition) -> Result<(), TimelineError> {
        match transition {
            EntryTransition::Accepted { content } => {
                self.original = content.clone();
                self.state = EntryState::Accepted;
            }
            EntryTransition::Rejected { content } => {
                self.set_contents(content)?;
                self.state = EntryState::Rejected;
            }
            EntryTransition::Deleted { .. } => {
                self.state = EntryState::Rejected;
            }
        }
        Ok(())
    }
}

// ── Table ────────────────────────────────────────────────────────────

pub type SharedEntry = Arc<tokio::sync::Mutex<ModifiedFileEntry>>;

/// Entries of one session in insertion order, keyed by their file URI.
/// Cell URIs resolve to their notebook.
#[derive(Debug, Default)]
pub struct EntryTable {
    entries: Mutex<Vec<(Url, SharedEntry)>>,
}

impl EntryTable {
    fn lock(&self) -> MutexGuard<'_, Vec<(Url, SharedEntry)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, uri: &Url) -> Option<SharedEntry> {
        let uri = owning_resource(uri);
        self.lock().iter().find(|(key, _)| *key == uri).map(|(_, entry)| entry.clone())
    }

    /// Inserts `entry` unless one already exists for its URI; returns the
    /// entry that ends up in the table.
    pub fn insert(&self, uri: Url, entry: ModifiedFileEntry) -> SharedEntry {
        let mut entries = self.lock();
        if let Some((_, existing)) = entries.iter().find(|(key, _)| *key == uri) {
            return existing.clone();
        }
        let shared = Arc::new(tokio::sync::Mutex::new(entry));
        entries.push((uri, shared.clone()));
        shared
    }

    pub fn remove(&self, uri: &Url) -> Option<SharedEntry> {
        let mut entries = self.lock();
        let index = entries.iter().position(|(key, _)| key == uri)?;
        Some(entries.remove(index).1)
    }

    /// Moves the entry at `from` to `to`, replacing anything already there.
    pub fn rekey(&self, from: &Url, to: &Url) -> Option<SharedEntry> {
        let mut entries = self.lock();
        entries.retain(|(key, _)| key != to);
        let slot = entries.iter_mut().find(|(key, _)| key == from)?;
        slot.0 = to.clone();
        Some(slot.1.clone())
    }

    pub fn all(&self) -> Vec<SharedEntry> {
        self.lock().iter().map(|(_, entry)| entry.clone()).collect()
    }

    pub fn uris(&self) -> Vec<Url> {
        self.lock().iter().map(|(uri, _)| uri.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn drain(&self) -> Vec<SharedEntry> {
        self.lock().drain(..).map(|(_, entry)| entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::MemoryWorkspace;
    use rewind_common::notebook::CellData;
    use rewind_common::text::Position;

    fn uri(path: &str) -> Url {
        Url::parse(&format!("file://{path}")).unwrap()
    }

    fn text_entry(path: &str, content: &str, kind: EditKind) -> ModifiedFileEntry {
        ModifiedFileEntry::new(uri(path), kind, content.into(), None, TelemetryInfo::for_request("r1"))
            .unwrap()
    }

    #[test]
    fn entry_state_round_trips_through_str() {
        for state in [EntryState::Modified, EntryState::Accepted, EntryState::Rejected] {
            assert_eq!(EntryState::parse(state.as_str()), Some(state));
        }
        assert_eq!(EntryState::parse("pending"), None);
    }

    #[test]
    fn text_edits_mark_entry_modified() {
        let mut entry = text_entry("/a.rs", "fn a() {}\n", EditKind::Modified);
        assert_eq!(entry.language_id(), "rust");
        assert_eq!(entry.state(), EntryState::Accepted);

        entry.accept_streaming_edits_start("r1", Some("s1"));
        assert_eq!(entry.is_currently_being_modified_by(), Some("r1"));
        entry
            .accept_agent_edits(
                &uri("/a.rs"),
                &AgentEdits::Text(vec![TextEdit::insert(Position::new(2, 1), "fn b() {}\n")]),
            )
            .unwrap();
        entry.accept_streaming_edits_end();

        assert_eq!(entry.current_snapshot(), "fn a() {}\nfn b() {}\n");
        assert_eq!(entry.original_content(), "fn a() {}\n");
        assert_eq!(entry.state(), EntryState::Modified);
        assert!(entry.is_currently_being_modified_by().is_none());
    }

    #[test]
    fn notebook_edits_on_text_entry_fail() {
        let mut entry = text_entry("/a.txt", "", EditKind::Modified);
        let edits = AgentEdits::Notebook(vec![CellEdit::DocumentMetadata {
            metadata: Default::default(),
        }]);
        let err = entry.accept_agent_edits(&uri("/a.txt"), &edits).unwrap_err();
        assert!(matches!(err, TimelineError::ReplayImpossible(_)));
    }

    #[test]
    fn cell_text_edits_target_the_cell() {
        let notebook = uri("/n.ipynb");
        let mut entry = ModifiedFileEntry::new(
            notebook.clone(),
            EditKind::Modified,
            String::new(),
            Some("jupyter-notebook"),
            TelemetryInfo::for_request("r1"),
        )
        .unwrap();
        entry
            .accept_agent_edits(
                &notebook,
                &AgentEdits::Notebook(vec![CellEdit::Replace {
                    index: 0,
                    count: 0,
                    cells: vec![CellData::code("python", "x = 1"), CellData::code("python", "y")],
                }]),
            )
            .unwrap();

        // Handles are allocated in insertion order.
        assert_eq!(entry.index_of_cell_handle(1), Some(1));
        let cell = CellUri::generate(&notebook, 1).unwrap();
        assert_eq!(entry.cell_index_for(&cell), Some(1));

        entry
            .accept_agent_edits(&cell, &AgentEdits::Text(vec![TextEdit::replace_all("y = 2")]))
            .unwrap();
        let doc =
            NotebookDocument::from_snapshot("jupyter-notebook", &entry.current_snapshot()).unwrap();
        assert_eq!(doc.cells()[0].data.source, "x = 1");
        assert_eq!(doc.cells()[1].data.source, "y = 2");
    }

    #[test]
    fn snapshot_restores_content_and_state() {
        let mut entry = text_entry("/a.txt", "one", EditKind::Modified);
        entry.set_contents("two").unwrap();
        let snapshot = entry.create_snapshot("session-1", None, None);
        assert_eq!(snapshot.current, "two");
        assert_eq!(snapshot.original, "one");
        assert_eq!(snapshot.state, EntryState::Modified);
        assert_eq!(SnapshotUri::parse(&snapshot.snapshot_uri).unwrap().request_id, "r1");

        let mut other = text_entry("/a.txt", "zzz", EditKind::Modified);
        other.restore_from_snapshot(&snapshot).unwrap();
        assert_eq!(other.current_snapshot(), "two");
        assert_eq!(other.original_content(), "one");
        assert_eq!(other.state(), EntryState::Modified);
    }

    #[tokio::test]
    async fn accept_writes_current_and_rebases_original() {
        let workspace = MemoryWorkspace::default();
        let mut entry = text_entry("/a.txt", "one", EditKind::Modified);
        entry.set_contents("two").unwrap();

        let transition = entry.accept_deferred(&workspace).await.unwrap();
        entry.apply_transition(&transition).unwrap();
        assert_eq!(workspace.get(&uri("/a.txt")).as_deref(), Some("two"));
        assert_eq!(entry.original_content(), "two");
        assert_eq!(entry.state(), EntryState::Accepted);
    }

    #[tokio::test]
    async fn reject_restores_original_or_deletes_created_file() {
        let workspace = MemoryWorkspace::default();
        let mut modified = text_entry("/a.txt", "one", EditKind::Modified);
        modified.set_contents("two").unwrap();
        let transition = modified.reject_deferred(&workspace).await.unwrap();
        modified.apply_transition(&transition).unwrap();
        assert_eq!(workspace.get(&uri("/a.txt")).as_deref(), Some("one"));
        assert_eq!(modified.current_snapshot(), "one");
        assert_eq!(modified.state(), EntryState::Rejected);

        workspace.write(&uri("/new.txt"), "draft").await.unwrap();
        let mut created = text_entry("/new.txt", "", EditKind::Created);
        created.set_contents("draft").unwrap();
        let transition = created.reject_deferred(&workspace).await.unwrap();
        assert_eq!(transition, EntryTransition::Deleted { final_content: "draft".into() });
        assert!(workspace.get(&uri("/new.txt")).is_none());
    }

    #[tokio::test]
    async fn revert_to_disk_reads_missing_file_as_empty() {
        let workspace = MemoryWorkspace::default();
        let mut entry = text_entry("/a.txt", "one", EditKind::Modified);
        entry.revert_to_disk(&workspace).await.unwrap();
        assert_eq!(entry.current_snapshot(), "");
    }

    #[test]
    fn table_resolves_cells_and_rekeys() {
        let table = EntryTable::default();
        let notebook = uri("/n.ipynb");
        let first = table.insert(notebook.clone(), text_entry("/n.ipynb", "", EditKind::Modified));
        let again = table.insert(notebook.clone(), text_entry("/n.ipynb", "x", EditKind::Modified));
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(table.len(), 1);

        let cell = CellUri::generate(&notebook, 3).unwrap();
        assert!(table.get(&cell).is_some());

        let moved = uri("/m.ipynb");
        assert!(table.rekey(&notebook, &moved).is_some());
        assert!(table.get(&notebook).is_none());
        assert_eq!(table.uris(), vec![moved.clone()]);
        assert!(table.remove(&moved).is_some());
        assert!(table.is_empty());
    }
}
