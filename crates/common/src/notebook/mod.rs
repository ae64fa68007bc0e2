// In-memory notebook documents used for replay and notebook entries.
//
// A notebook snapshot is the JSON serialization of its metadata and cells.
// Cell handles are session-local and never serialized.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotebookEditError {
    #[error("invalid notebook snapshot: {0}")]
    InvalidSnapshot(#[from] serde_json::Error),

    #[error("cell range {index}..{end} out of bounds for notebook with {len} cells")]
    CellOutOfRange { index: usize, end: usize, len: usize },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CellKind {
    Markup,
    Code,
}

/// Cell content as carried by edits and snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CellData {
    pub cell_kind: CellKind,
    pub language: String,
    pub source: String,
    #[serde(default)]
    pub outputs: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl CellData {
    pub fn code(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            cell_kind: CellKind::Code,
            language: language.into(),
            source: source.into(),
            outputs: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn markup(source: impl Into<String>) -> Self {
        Self {
            cell_kind: CellKind::Markup,
            language: "markdown".to_string(),
            source: source.into(),
            outputs: Vec::new(),
            metadata: Map::new(),
        }
    }
}

/// Structural notebook edit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "editType", rename_all = "camelCase")]
pub enum CellEdit {
    /// Replace `count` cells starting at `index` with `cells`.
    Replace { index: usize, count: usize, cells: Vec<CellData> },
    Metadata { index: usize, metadata: Map<String, Value> },
    DocumentMetadata { metadata: Map<String, Value> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotebookCell {
    pub handle: u64,
    pub data: CellData,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NotebookSnapshot {
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    cells: Vec<CellData>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotebookDocument {
    view_type: String,
    metadata: Map<String, Value>,
    cells: Vec<NotebookCell>,
    next_handle: u64,
}

impl NotebookDocument {
    pub fn new(view_type: impl Into<String>) -> Self {
        Self { view_type: view_type.into(), metadata: Map::new(), cells: Vec::new(), next_handle: 0 }
    }

    /// Builds a notebook from a snapshot. Empty content yields an empty notebook.
    pub fn from_snapshot(view_type: &str, content: &str) -> Result<Self, NotebookEditError> {
        let mut doc = Self::new(view_type);
        doc.restore_snapshot(content)?;
        Ok(doc)
    }

    pub fn restore_snapshot(&mut self, content: &str) -> Result<(), NotebookEditError> {
        let snapshot: NotebookSnapshot = if content.trim().is_empty() {
            NotebookSnapshot::default()
        } else {
            serde_json::from_str(content)?
        };
        self.metadata = snapshot.metadata;
        self.cells = Vec::with_capacity(snapshot.cells.len());
        for data in snapshot.cells {
            self.push_cell(data);
        }
        Ok(())
    }

    pub fn snapshot(&self) -> String {
        let snapshot = NotebookSnapshot {
            metadata: self.metadata.clone(),
            cells: self.cells.iter().map(|cell| cell.data.clone()).collect(),
        };
        serde_json::to_string(&snapshot).unwrap_or_default()
    }

    pub fn view_type(&self) -> &str {
        &self.view_type
    }

    pub fn cells(&self) -> &[NotebookCell] {
        &self.cells
    }

    pub fn cell_data(&self) -> Vec<CellData> {
        self.cells.iter().map(|cell| cell.data.clone()).collect()
    }

    pub fn index_of_handle(&self, handle: u64) -> Option<usize> {
        self.cells.iter().position(|cell| cell.handle == handle)
    }

    pub fn handle_at(&self, index: usize) -> Option<u64> {
        self.cells.get(index).map(|cell| cell.handle)
    }

    /// Replaces the source of one cell, keeping its kind, language and outputs.
    pub fn set_cell_source(&mut self, index: usize, source: String) -> Result<(), NotebookEditError> {
        let len = self.cells.len();
        let cell = self.cells.get_mut(index).ok_or(NotebookEditError::CellOutOfRange {
            index,
            end: index + 1,
            len,
        })?;
        cell.data.source = source;
        Ok(())
    }

    pub fn apply_edits(&mut self, edits: &[CellEdit]) -> Result<(), NotebookEditError> {
        for edit in edits {
            match edit {
                CellEdit::Replace { index, count, cells } => {
                    let len = self.cells.len();
                    let end = index + count;
                    if *index > len || end > len {
                        return Err(NotebookEditError::CellOutOfRange { index: *index, end, len });
                    }
                    let replacement: Vec<NotebookCell> =
                        cells.iter().cloned().map(|data| self.allocate(data)).collect();
                    self.cells.splice(*index..end, replacement);
                }
                CellEdit::Metadata { index, metadata } => {
                    let len = self.cells.len();
                    let cell = self.cells.get_mut(*index).ok_or(
                        NotebookEditError::CellOutOfRange { index: *index, end: index + 1, len },
                    )?;
                    cell.data.metadata = metadata.clone();
                }
                CellEdit::DocumentMetadata { metadata } => {
                    self.metadata = metadata.clone();
                }
            }
        }
        Ok(())
    }

    fn allocate(&mut self, data: CellData) -> NotebookCell {
        let handle = self.next_handle;
        self.next_handle += 1;
        NotebookCell { handle, data }
    }

    fn push_cell(&mut self, data: CellData) {
        let cell = self.allocate(data);
        self.cells.push(cell);
    }
}

/// Edits that turn notebook snapshot `before` into `after`.
pub fn compute_notebook_edits(
    view_type: &str,
    before: &str,
    after: &str,
) -> Result<Vec<CellEdit>, NotebookEditError> {
    let before = NotebookDocument::from_snapshot(view_type, before)?;
    let after = NotebookDocument::from_snapshot(view_type, after)?;

    let mut edits = Vec::new();
    if before.metadata != after.metadata {
        edits.push(CellEdit::DocumentMetadata { metadata: after.metadata.clone() });
    }
    let old_cells = before.cell_data();
    let new_cells = after.cell_data();
    if old_cells != new_cells {
        edits.push(CellEdit::Replace { index: 0, count: old_cells.len(), cells: new_cells });
    }
    Ok(edits)
}
