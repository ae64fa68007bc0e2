// Diffing: line diffs between text snapshots and edit synthesis from them.

pub mod lines;

pub use lines::{compute_text_edits, line_change_stats, LineChangeStats};
