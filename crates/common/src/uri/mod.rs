// Resource identifiers: notebook cell URIs and historical snapshot URIs.

use thiserror::Error;
use url::Url;

pub use url::Url as Uri;

/// Scheme of URIs addressing a single notebook cell.
pub const CELL_SCHEME: &str = "vscode-notebook-cell";

/// Scheme of URIs addressing historical content at a stop.
pub const SNAPSHOT_SCHEME: &str = "chat-editing-snapshot-text-model";

const NOTEBOOK_SCHEME_PARAM: &str = "notebook-scheme";
const CELL_HANDLE_PREFIX: char = 'c';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("invalid uri `{input}`: {reason}")]
    Invalid { input: String, reason: String },

    #[error("not a snapshot uri: {0}")]
    NotSnapshot(String),
}

fn parse(input: String) -> Result<Url, UriError> {
    Url::parse(&input).map_err(|err| UriError::Invalid { input, reason: err.to_string() })
}

/// Parses a `file:` URI from an absolute path, or any URI with a scheme.
pub fn parse_resource(input: &str) -> Result<Url, UriError> {
    if input.starts_with('/') {
        return parse(format!("file://{input}"));
    }
    parse(input.to_string())
}

fn authority_prefix(uri: &Url) -> String {
    match uri.host_str() {
        Some(host) => format!("//{host}"),
        None => String::new(),
    }
}

/// A cell inside a notebook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellUri {
    pub notebook: Url,
    pub handle: u64,
}

impl CellUri {
    pub fn generate(notebook: &Url, handle: u64) -> Result<Url, UriError> {
        let mut cell = parse(format!(
            "{CELL_SCHEME}:{}{}",
            authority_prefix(notebook),
            notebook.path()
        ))?;
        cell.query_pairs_mut().append_pair(NOTEBOOK_SCHEME_PARAM, notebook.scheme());
        cell.set_fragment(Some(&format!("{CELL_HANDLE_PREFIX}{handle}")));
        Ok(cell)
    }

    /// Returns `None` for anything that is not a well-formed cell URI.
    pub fn parse(uri: &Url) -> Option<Self> {
        if uri.scheme() != CELL_SCHEME {
            return None;
        }
        let handle = uri.fragment()?.strip_prefix(CELL_HANDLE_PREFIX)?.parse().ok()?;
        let scheme = uri
            .query_pairs()
            .find(|(key, _)| key == NOTEBOOK_SCHEME_PARAM)
            .map(|(_, value)| value.into_owned())
            .unwrap_or_else(|| "file".to_string());
        let notebook = Url::parse(&format!("{scheme}://{}{}", uri.host_str().unwrap_or(""), uri.path()))
            .ok()?;
        Some(Self { notebook, handle })
    }
}

/// The notebook owning a cell URI, or the URI itself.
pub fn owning_resource(uri: &Url) -> Url {
    CellUri::parse(uri).map(|cell| cell.notebook).unwrap_or_else(|| uri.clone())
}

/// Content of `path` as of `(request_id, stop_id)` within a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotUri {
    pub session: String,
    pub request_id: String,
    pub stop_id: Option<String>,
    pub path: String,
}

impl SnapshotUri {
    pub fn to_uri(&self) -> Result<Url, UriError> {
        let path = if self.path.starts_with('/') { self.path.clone() } else { format!("/{}", self.path) };
        let mut uri = parse(format!("{SNAPSHOT_SCHEME}:{path}"))?;
        {
            let mut query = uri.query_pairs_mut();
            query.append_pair("session", &self.session);
            query.append_pair("requestId", &self.request_id);
            if let Some(stop) = &self.stop_id {
                query.append_pair("undoStop", stop);
            }
        }
        Ok(uri)
    }

    pub fn parse(uri: &Url) -> Result<Self, UriError> {
        if uri.scheme() != SNAPSHOT_SCHEME {
            return Err(UriError::NotSnapshot(uri.to_string()));
        }
        let mut session = None;
        let mut request_id = None;
        let mut stop_id = None;
        for (key, value) in uri.query_pairs() {
            match key.as_ref() {
                "session" => session = Some(value.into_owned()),
                "requestId" => request_id = Some(value.into_owned()),
                "undoStop" => stop_id = Some(value.into_owned()),
                _ => {}
            }
        }
        match (session, request_id) {
            (Some(session), Some(request_id)) => {
                Ok(Self { session, request_id, stop_id, path: uri.path().to_string() })
            }
            _ => Err(UriError::NotSnapshot(uri.to_string())),
        }
    }
}
