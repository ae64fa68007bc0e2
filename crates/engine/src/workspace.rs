// File-system access for sessions and the CLI.
//
// `DiskWorkspace` maps `file:` URIs onto the local file system;
// `MemoryWorkspace` keeps everything in a map.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rewind_common::types::TelemetryInfo;
use url::Url;

use crate::timeline::delegate::TimelineDelegate;

#[async_trait]
pub trait Workspace: Send + Sync {
    /// Current content, or `None` if the file does not exist.
    async fn read(&self, uri: &Url) -> Result<Option<String>>;

    async fn write(&self, uri: &Url, content: &str) -> Result<()>;

    /// Removes the file. Missing files are not an error.
    async fn delete(&self, uri: &Url) -> Result<()>;

    async fn rename(&self, old_uri: &Url, new_uri: &Url) -> Result<()>;
}

// ── Disk ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct DiskWorkspace;

fn file_path(uri: &Url) -> Result<PathBuf> {
    uri.to_file_path().map_err(|()| anyhow!("`{uri}` is not a local file uri"))
}

#[async_trait]
impl Workspace for DiskWorkspace {
    async fn read(&self, uri: &Url) -> Result<Option<String>> {
        let path = file_path(uri)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read `{}`", path.display())),
        }
    }

    async fn write(&self, uri: &Url, content: &str) -> Result<()> {
        let path = file_path(uri)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create `{}`", parent.display()))?;
        }
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("failed to write `{}`", path.display()))
    }

    async fn delete(&self, uri: &Url) -> Result<()> {
        let path = file_path(uri)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to delete `{}`", path.display())),
        }
    }

    async fn rename(&self, old_uri: &Url, new_uri: &Url) -> Result<()> {
        let from = file_path(old_uri)?;
        let to = file_path(new_uri)?;
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create `{}`", parent.display()))?;
        }
        tokio::fs::rename(&from, &to).await.with_context(|| {
            format!("failed to rename `{}` to `{}`", from.display(), to.display())
        })
    }
}

// ── Memory ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryWorkspace {
    files: Mutex<BTreeMap<Url, String>>,
}

impl MemoryWorkspace {
    pub fn with_files<'a>(files: impl IntoIterator<Item = (&'a Url, &'a str)>) -> Self {
        let files = files.into_iter().map(|(uri, content)| (uri.clone(), content.to_string()));
        Self { files: Mutex::new(files.collect()) }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<Url, String>>> {
        self.files.lock().map_err(|_| anyhow!("memory workspace lock poisoned"))
    }

    pub fn get(&self, uri: &Url) -> Option<String> {
        self.lock().ok()?.get(uri).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<Url, String> {
        self.lock().map(|files| files.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Workspace for MemoryWorkspace {
    async fn read(&self, uri: &Url) -> Result<Option<String>> {
        Ok(self.lock()?.get(uri).cloned())
    }

    async fn write(&self, uri: &Url, content: &str) -> Result<()> {
        self.lock()?.insert(uri.clone(), content.to_string());
        Ok(())
    }

    async fn delete(&self, uri: &Url) -> Result<()> {
        self.lock()?.remove(uri);
        Ok(())
    }

    async fn rename(&self, old_uri: &Url, new_uri: &Url) -> Result<()> {
        let mut files = self.lock()?;
        let content =
            files.remove(old_uri).ok_or_else(|| anyhow!("cannot rename missing file `{old_uri}`"))?;
        files.insert(new_uri.clone(), content);
        Ok(())
    }
}

// ── Timeline delegate ──────────────────────────────────────────────

/// Applies timeline navigation straight to a workspace, with no live entries.
pub struct WorkspaceDelegate {
    workspace: Arc<dyn Workspace>,
}

impl WorkspaceDelegate {
    pub fn new(workspace: Arc<dyn Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl TimelineDelegate for WorkspaceDelegate {
    async fn create_file(&self, uri: &Url, content: &str) -> Result<()> {
        self.workspace.write(uri, content).await
    }

    async fn delete_file(&self, uri: &Url) -> Result<()> {
        self.workspace.delete(uri).await
    }

    async fn rename_file(&self, old_uri: &Url, new_uri: &Url) -> Result<()> {
        self.workspace.rename(old_uri, new_uri).await
    }

    async fn set_contents(&self, uri: &Url, content: &str, _: &TelemetryInfo) -> Result<()> {
        self.workspace.write(uri, content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_uri(dir: &TempDir, name: &str) -> Url {
        Url::from_file_path(dir.path().join(name)).expect("absolute path")
    }

    #[tokio::test]
    async fn disk_workspace_round_trip() {
        let tmp = TempDir::new().unwrap();
        let workspace = DiskWorkspace;
        let a = file_uri(&tmp, "nested/a.txt");
        let b = file_uri(&tmp, "b.txt");

        assert_eq!(workspace.read(&a).await.unwrap(), None);
        workspace.write(&a, "hello").await.unwrap();
        assert_eq!(workspace.read(&a).await.unwrap().as_deref(), Some("hello"));

        workspace.rename(&a, &b).await.unwrap();
        assert_eq!(workspace.read(&a).await.unwrap(), None);
        assert_eq!(workspace.read(&b).await.unwrap().as_deref(), Some("hello"));

        workspace.delete(&b).await.unwrap();
        workspace.delete(&b).await.unwrap();
        assert_eq!(workspace.read(&b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_workspace_rename_requires_source() {
        let workspace = MemoryWorkspace::default();
        let a = Url::parse("file:///a.txt").unwrap();
        let b = Url::parse("file:///b.txt").unwrap();
        assert!(workspace.rename(&a, &b).await.is_err());

        workspace.write(&a, "x").await.unwrap();
        workspace.rename(&a, &b).await.unwrap();
        assert_eq!(workspace.get(&b).as_deref(), Some("x"));
        assert!(workspace.get(&a).is_none());
    }

    #[tokio::test]
    async fn non_file_uris_are_rejected_on_disk() {
        let uri = Url::parse("untitled:scratch").unwrap();
        assert!(DiskWorkspace.read(&uri).await.is_err());
    }
}
