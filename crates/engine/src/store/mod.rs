// Persistence adapter: content-addressed blobs plus one state file per session.

pub mod blob;
pub mod session_store;

pub use blob::{content_hash, BlobStore, ContentHash};
pub use session_store::{RecentSnapshot, SessionStore, StoredSession, STORAGE_VERSION};
