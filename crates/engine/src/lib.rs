// rewind-engine: checkpoint timeline, session orchestration and persistence
// for agent-driven file edits.

pub mod config;
pub mod error;
pub mod session;
pub mod store;
pub mod timeline;
pub mod workspace;

pub use config::EngineConfig;
pub use error::{SessionError, StorageError, TimelineError};
pub use session::{ChatEditingSession, SessionState};
pub use timeline::CheckpointTimeline;
