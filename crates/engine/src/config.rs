// Engine configuration.
//
// Global config: `~/.rewind/config.toml`
// Persisted sessions default to `~/.rewind/sessions/<session>/`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default spacing between streamed edit batches.
const DEFAULT_MIN_EDIT_INTERVAL_MS: u64 = 15;
/// Default cap on the delay added to a backed-up edit queue.
const DEFAULT_MAX_OVERALL_DELAY_MS: u64 = 1_000;
/// Upper bound accepted for either streaming knob.
const MAX_STREAMING_MS: u64 = 10_000;

/// Root directory for rewind global state: `~/.rewind/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".rewind"))
}

/// Path to the global config file: `~/.rewind/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

// ── Engine config ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub streaming: StreamingConfig,
    pub notebooks: NotebookConfig,
    pub persistence: PersistenceConfig,
}

impl EngineConfig {
    /// Load from `~/.rewind/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        global_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }

    /// Directory holding persisted sessions.
    pub fn storage_dir(&self) -> PathBuf {
        self.storage
            .dir
            .clone()
            .or_else(|| global_dir().map(|d| d.join("sessions")))
            .unwrap_or_else(|| PathBuf::from(".rewind/sessions"))
    }
}

/// Where persisted sessions live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub dir: Option<PathBuf>,
}

/// Pacing of streamed agent edits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamingConfig {
    pub min_edit_interval_ms: u64,
    pub max_overall_delay_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            min_edit_interval_ms: DEFAULT_MIN_EDIT_INTERVAL_MS,
            max_overall_delay_ms: DEFAULT_MAX_OVERALL_DELAY_MS,
        }
    }
}

impl StreamingConfig {
    /// Minimum spacing between batches, clamped to [0, 10s].
    pub fn min_edit_interval(&self) -> Duration {
        Duration::from_millis(self.min_edit_interval_ms.min(MAX_STREAMING_MS))
    }

    /// Maximum delay budget, clamped to [min interval, 10s].
    pub fn max_overall_delay(&self) -> Duration {
        let min = self.min_edit_interval_ms.min(MAX_STREAMING_MS);
        let max = self.max_overall_delay_ms.clamp(min, MAX_STREAMING_MS);
        Duration::from_millis(max)
    }
}

/// File extensions handled as notebooks, mapped to their view type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotebookConfig {
    pub view_types: BTreeMap<String, String>,
}

impl Default for NotebookConfig {
    fn default() -> Self {
        let mut view_types = BTreeMap::new();
        view_types.insert("ipynb".to_string(), "jupyter-notebook".to_string());
        Self { view_types }
    }
}

impl NotebookConfig {
    /// Notebook view type for `path`, if its extension is a registered notebook.
    pub fn view_type_for(&self, path: &str) -> Option<&str> {
        let file_name = path.rsplit('/').next()?;
        let (_, extension) = file_name.rsplit_once('.')?;
        self.view_types.get(&extension.to_ascii_lowercase()).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Store session state on stop and restore it on start.
    pub enabled: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn engine_config_defaults() {
        let cfg = EngineConfig::default();
        assert!(cfg.storage.dir.is_none());
        assert_eq!(cfg.streaming.min_edit_interval(), Duration::from_millis(15));
        assert_eq!(cfg.streaming.max_overall_delay(), Duration::from_millis(1_000));
        assert!(cfg.persistence.enabled);
    }

    #[test]
    fn round_trip_through_toml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        let mut cfg = EngineConfig::default();
        cfg.storage.dir = Some(tmp.path().join("sessions"));
        cfg.streaming.min_edit_interval_ms = 5;
        cfg.notebooks.view_types.insert("nb".into(), "custom-notebook".into());
        cfg.save_to(&path).unwrap();

        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.storage_dir(), tmp.path().join("sessions"));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: EngineConfig = toml::from_str("[streaming]\nmax_overall_delay_ms = 250\n").unwrap();
        assert_eq!(cfg.streaming.min_edit_interval_ms, 15);
        assert_eq!(cfg.streaming.max_overall_delay(), Duration::from_millis(250));
        assert_eq!(cfg.notebooks.view_type_for("/a/b.ipynb"), Some("jupyter-notebook"));
    }

    #[test]
    fn streaming_values_are_clamped() {
        let cfg = StreamingConfig { min_edit_interval_ms: 50_000, max_overall_delay_ms: 1 };
        assert_eq!(cfg.min_edit_interval(), Duration::from_millis(10_000));
        assert_eq!(cfg.max_overall_delay(), Duration::from_millis(10_000));
    }

    #[test]
    fn notebook_detection_uses_extension() {
        let cfg = NotebookConfig::default();
        assert_eq!(cfg.view_type_for("/work/Analysis.IPYNB"), Some("jupyter-notebook"));
        assert_eq!(cfg.view_type_for("/work/readme.md"), None);
        assert_eq!(cfg.view_type_for("/work/Makefile"), None);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let err = EngineConfig::load_from(&tmp.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
