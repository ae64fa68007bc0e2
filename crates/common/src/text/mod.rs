// Text buffers addressed by 1-based line/column ranges.

pub mod edit;

pub use edit::{apply_text_edits, Position, Range, TextEdit};
