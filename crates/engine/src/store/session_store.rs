// Persisted session state: `{root}/{session}/state.json` plus blobs under
// `{root}/{session}/contents/`.
//
// The state file references file contents by blob hash. The timeline is
// stored inline. Only the state file is ever overwritten.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use rewind_common::types::TelemetryInfo;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::blob::{write_atomic, BlobStore, ContentHash};
use crate::error::StorageError;
use crate::session::entry::{EntrySnapshot, EntryState};
use crate::timeline::TimelineState;

/// Version written by this build.
pub const STORAGE_VERSION: u32 = 2;
const SUPPORTED_VERSIONS: [u32; 2] = [1, 2];

const STATE_FILE: &str = "state.json";
const CONTENTS_DIR: &str = "contents";

// ── On-disk format ───────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateFile {
    version: u32,
    #[serde(default)]
    initial_file_contents: Vec<(String, ContentHash)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeline: Option<TimelineState>,
    recent_snapshot: StoredSnapshot,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSnapshot {
    #[serde(default)]
    stop_id: Option<String>,
    #[serde(default)]
    entries: Vec<SerializedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SerializedEntry {
    resource: String,
    language_id: String,
    original_hash: ContentHash,
    current_hash: ContentHash,
    state: EntryState,
    snapshot_uri: String,
    #[serde(default)]
    telemetry_info: TelemetryInfo,
}

// ── In-memory form ───────────────────────────────────────────────────

/// The latest entry snapshots of a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecentSnapshot {
    pub stop_id: Option<String>,
    pub entries: Vec<EntrySnapshot>,
}

/// Everything a session persists, with blob references resolved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredSession {
    pub initial_file_contents: Vec<(Url, String)>,
    pub timeline: Option<TimelineState>,
    pub recent_snapshot: RecentSnapshot,
}

// ── Store ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
    blobs: BlobStore,
}

/// Directory name for a session id: anything outside `[A-Za-z0-9._-]`
/// becomes `_`.
pub fn session_dir_name(session: &str) -> String {
    session
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect()
}

fn read_failure(err: impl Into<anyhow::Error>) -> StorageError {
    StorageError::PersistenceReadFailure(err.into())
}

fn write_failure(err: impl Into<anyhow::Error>) -> StorageError {
    StorageError::PersistenceWriteFailure(err.into())
}

impl SessionStore {
    pub fn new(root: impl AsRef<Path>, session: &str) -> Self {
        let dir = root.as_ref().join(session_dir_name(session));
        let blobs = BlobStore::new(dir.join(CONTENTS_DIR));
        Self { dir, blobs }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// Loads the persisted session. `Ok(None)` when nothing was stored or
    /// the stored version is not understood.
    pub async fn restore_state(&self) -> Result<Option<StoredSession>, StorageError> {
        match self.read_state_file().await {
            Ok(Some(file)) => self.resolve(file).await.map(Some),
            Ok(None) => Ok(None),
            Err(StorageError::UnsupportedStorageVersion(version)) => {
                warn!(
                    version,
                    path = %self.state_path().display(),
                    "ignoring session state with unsupported version"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn read_state_file(&self) -> Result<Option<StateFile>, StorageError> {
        let path = self.state_path();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(read_failure(
                    anyhow::Error::new(err).context(format!("failed to read `{}`", path.display())),
                ))
            }
        };

        let value: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON in `{}`", path.display()))
            .map_err(read_failure)?;
        let version = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| read_failure(anyhow!("`{}` has no version", path.display())))?;
        let version = u32::try_from(version).unwrap_or(u32::MAX);
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(StorageError::UnsupportedStorageVersion(version));
        }

        serde_json::from_value(value)
            .with_context(|| format!("malformed session state in `{}`", path.display()))
            .map(Some)
            .map_err(read_failure)
    }

    async fn resolve(&self, file: StateFile) -> Result<StoredSession, StorageError> {
        let mut initial_file_contents = Vec::with_capacity(file.initial_file_contents.len());
        for (uri, hash) in file.initial_file_contents {
            let uri = Url::parse(&uri)
                .with_context(|| format!("invalid uri `{uri}`"))
                .map_err(read_failure)?;
            let content = self.blobs.get(&hash).await.map_err(read_failure)?;
            initial_file_contents.push((uri, content));
        }

        let mut entries = Vec::with_capacity(file.recent_snapshot.entries.len());
        for entry in file.recent_snapshot.entries {
            let resource = Url::parse(&entry.resource)
                .with_context(|| format!("invalid entry resource `{}`", entry.resource))
                .map_err(read_failure)?;
            let snapshot_uri = Url::parse(&entry.snapshot_uri).unwrap_or_else(|_| resource.clone());
            entries.push(EntrySnapshot {
                original: self.blobs.get(&entry.original_hash).await.map_err(read_failure)?,
                current: self.blobs.get(&entry.current_hash).await.map_err(read_failure)?,
                resource,
                language_id: entry.language_id,
                snapshot_uri,
                state: entry.state,
                telemetry_info: entry.telemetry_info,
            });
        }

        debug!(
            path = %self.state_path().display(),
            version = file.version,
            entries = entries.len(),
            "restored session state"
        );
        Ok(StoredSession {
            initial_file_contents,
            timeline: file.timeline,
            recent_snapshot: RecentSnapshot { stop_id: file.recent_snapshot.stop_id, entries },
        })
    }

    /// Writes blobs for all referenced contents, then replaces the state file.
    pub async fn store_state(&self, session: &StoredSession) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create `{}`", self.dir.display()))
            .map_err(write_failure)?;

        let mut initial_file_contents = Vec::with_capacity(session.initial_file_contents.len());
        for (uri, content) in &session.initial_file_contents {
            let hash = self.blobs.put(content).await.map_err(write_failure)?;
            initial_file_contents.push((uri.to_string(), hash));
        }

        let mut entries = Vec::with_capacity(session.recent_snapshot.entries.len());
        for entry in &session.recent_snapshot.entries {
            entries.push(SerializedEntry {
                resource: entry.resource.to_string(),
                language_id: entry.language_id.clone(),
                original_hash: self.blobs.put(&entry.original).await.map_err(write_failure)?,
                current_hash: self.blobs.put(&entry.current).await.map_err(write_failure)?,
                state: entry.state,
                snapshot_uri: entry.snapshot_uri.to_string(),
                telemetry_info: entry.telemetry_info.clone(),
            });
        }

        let file = StateFile {
            version: STORAGE_VERSION,
            initial_file_contents,
            timeline: session.timeline.clone(),
            recent_snapshot: StoredSnapshot {
                stop_id: session.recent_snapshot.stop_id.clone(),
                entries,
            },
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .context("failed to serialize session state")
            .map_err(write_failure)?;
        write_atomic(&self.state_path(), &bytes).await.map_err(write_failure)?;
        debug!(path = %self.state_path().display(), "stored session state");
        Ok(())
    }

    /// Removes the session directory, blobs included.
    pub async fn clear_state(&self) -> Result<(), StorageError> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(write_failure(
                anyhow::Error::new(err).context(format!("failed to remove `{}`", self.dir.display())),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_common::types::{Checkpoint, FileOperation};
    use tempfile::TempDir;

    fn uri(path: &str) -> Url {
        Url::parse(&format!("file://{path}")).unwrap()
    }

    fn sample() -> StoredSession {
        let a = uri("/w/a.txt");
        StoredSession {
            initial_file_contents: vec![(a.clone(), "one\n".into())],
            timeline: Some(TimelineState {
                checkpoints: vec![Checkpoint {
                    checkpoint_id: "cp-0".into(),
                    request_id: None,
                    undo_stop_id: None,
                    epoch: 0,
                    label: "Initial State".into(),
                    description: None,
                }],
                current_epoch: 2,
                file_baselines: Vec::new(),
                operations: vec![FileOperation::Delete {
                    uri: a.clone(),
                    request_id: "r1".into(),
                    epoch: 1,
                    final_content: "one\n".into(),
                    notebook_view_type: None,
                }],
                epoch_counter: 2,
            }),
            recent_snapshot: RecentSnapshot {
                stop_id: None,
                entries: vec![EntrySnapshot {
                    resource: a.clone(),
                    language_id: "plaintext".into(),
                    snapshot_uri: a,
                    original: "one\n".into(),
                    current: "two\n".into(),
                    state: EntryState::Modified,
                    telemetry_info: TelemetryInfo::for_request("r1"),
                }],
            },
        }
    }

    #[tokio::test]
    async fn missing_state_restores_as_none() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path(), "s1");
        assert!(store.restore_state().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_then_restore_round_trips() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path(), "s1");
        let session = sample();
        store.store_state(&session).await.unwrap();

        let restored = store.restore_state().await.unwrap().unwrap();
        assert_eq!(restored, session);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.state_path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 2);
        assert_eq!(raw["initialFileContents"][0][1], "2c8b08d");
        assert_eq!(raw["recentSnapshot"]["entries"][0]["state"], "modified");
    }

    #[tokio::test]
    async fn identical_contents_share_one_blob() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path(), "s1");
        let mut session = sample();
        session.recent_snapshot.entries[0].current = "one\n".into();
        store.store_state(&session).await.unwrap();

        let blobs = std::fs::read_dir(store.dir().join("contents")).unwrap().count();
        assert_eq!(blobs, 1);
    }

    #[tokio::test]
    async fn unsupported_version_is_treated_as_missing() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path(), "s1");
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(
            store.state_path(),
            r#"{"version":3,"initialFileContents":[],"recentSnapshot":{"entries":[]}}"#,
        )
        .unwrap();
        assert!(store.restore_state().await.unwrap().is_none());
        assert!(matches!(
            store.read_state_file().await,
            Err(StorageError::UnsupportedStorageVersion(3))
        ));
    }

    #[tokio::test]
    async fn version_one_without_timeline_is_accepted() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path(), "s1");
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.state_path(), r#"{"version":1,"recentSnapshot":{"entries":[]}}"#)
            .unwrap();
        let restored = store.restore_state().await.unwrap().unwrap();
        assert!(restored.timeline.is_none());
        assert!(restored.recent_snapshot.entries.is_empty());
    }

    #[tokio::test]
    async fn corrupt_state_is_a_read_failure() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path(), "s1");
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.state_path(), "{not json").unwrap();
        assert!(matches!(
            store.restore_state().await,
            Err(StorageError::PersistenceReadFailure(_))
        ));
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path(), "chat://session/1");
        assert_eq!(store.dir(), tmp.path().join("chat___session_1"));
        store.store_state(&sample()).await.unwrap();
        store.clear_state().await.unwrap();
        assert!(!store.dir().exists());
        store.clear_state().await.unwrap();
    }
}
