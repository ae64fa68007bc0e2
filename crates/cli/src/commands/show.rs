// `rewind show`: print a file as it was at a request or undo stop.

use clap::Args;
use serde::{Deserialize, Serialize};
use url::Url;

use rewind_common::types::parse_epoch_stop;
use rewind_engine::EngineConfig;

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Session id.
    session: String,

    /// Request whose checkpoint to read from.
    request: String,

    /// File path or URI.
    path: String,

    /// Undo stop within the request (defaults to the request start).
    #[arg(long)]
    stop: Option<String>,

    /// Force JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowResult {
    pub uri: Url,
    pub request_id: String,
    #[serde(default)]
    pub stop_id: Option<String>,
    /// `None` when the file did not exist at that point.
    #[serde(default)]
    pub content: Option<String>,
}

pub fn run(args: ShowArgs, config: &EngineConfig) -> anyhow::Result<()> {
    let format = OutputFormat::detect(args.json);
    let result = super::resolve_resource(&args.path).and_then(|uri| {
        super::block_on(show(config, &args.session, &args.request, &uri, args.stop.as_deref()))
    });
    output::report(format, result, format_human)
}

pub(crate) async fn show(
    config: &EngineConfig,
    session: &str,
    request_id: &str,
    uri: &Url,
    stop_id: Option<&str>,
) -> anyhow::Result<ShowResult> {
    let stored = super::load_session(config, session).await?;
    let timeline = super::load_timeline(session, &stored);

    let addressed_by_epoch = stop_id.and_then(parse_epoch_stop).is_some();
    if !addressed_by_epoch && timeline.checkpoint_id_for_request(request_id, stop_id).is_none() {
        match stop_id {
            Some(stop) => anyhow::bail!("no checkpoint for request `{request_id}` at stop `{stop}`"),
            None => anyhow::bail!("no checkpoint for request `{request_id}`"),
        }
    }

    let content = timeline.content_at_stop(request_id, uri, stop_id)?;
    Ok(ShowResult {
        uri: uri.clone(),
        request_id: request_id.to_string(),
        stop_id: stop_id.map(str::to_string),
        content,
    })
}

fn format_human(result: &ShowResult) -> String {
    match &result.content {
        Some(content) => content.strip_suffix('\n').unwrap_or(content).to_string(),
        None => format!("({} does not exist at this point)", result.uri),
    }
}
