// File-system side effects requested by the timeline during navigation.

use async_trait::async_trait;
use rewind_common::types::TelemetryInfo;
use url::Url;

/// Applies structural changes and reconstructed contents to the live
/// workspace. The timeline never touches storage itself.
#[async_trait]
pub trait TimelineDelegate: Send + Sync {
    /// Creates `uri` with `content`, overwriting anything already there.
    async fn create_file(&self, uri: &Url, content: &str) -> anyhow::Result<()>;

    async fn delete_file(&self, uri: &Url) -> anyhow::Result<()>;

    async fn rename_file(&self, old_uri: &Url, new_uri: &Url) -> anyhow::Result<()>;

    /// Replaces the full contents of an existing file.
    async fn set_contents(
        &self,
        uri: &Url,
        content: &str,
        telemetry_info: &TelemetryInfo,
    ) -> anyhow::Result<()>;
}
