// rewind-common: shared data model and pure algorithms for the rewind workspace

pub mod diff;
pub mod notebook;
pub mod text;
pub mod types;
pub mod uri;
