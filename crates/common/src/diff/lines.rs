// Line-level diffs between two text snapshots.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use similar::{capture_diff_slices_deadline, Algorithm, DiffTag};

use crate::text::{Range, TextEdit};

/// Past this the diff gives up on minimality and returns a coarser result.
const DIFF_DEADLINE: Duration = Duration::from_millis(500);

/// Added/removed line counts between two versions of a file.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineChangeStats {
    pub added: usize,
    pub removed: usize,
}

/// Contiguous run of changed lines: `old[old_start..old_end]` becomes
/// `new[new_start..new_end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hunk {
    old_start: usize,
    old_end: usize,
    new_start: usize,
    new_end: usize,
}

fn hunks(old: &[&str], new: &[&str]) -> Vec<Hunk> {
    let deadline = Instant::now() + DIFF_DEADLINE;
    let mut hunks: Vec<Hunk> = Vec::new();

    for op in capture_diff_slices_deadline(Algorithm::Myers, old, new, Some(deadline)) {
        let (tag, old_range, new_range) = op.as_tag_tuple();
        if tag == DiffTag::Equal {
            continue;
        }
        // Adjacent delete and insert runs form one replacement.
        match hunks.last_mut() {
            Some(last) if last.old_end == old_range.start && last.new_end == new_range.start => {
                last.old_end = old_range.end;
                last.new_end = new_range.end;
            }
            _ => hunks.push(Hunk {
                old_start: old_range.start,
                old_end: old_range.end,
                new_start: new_range.start,
                new_end: new_range.end,
            }),
        }
    }
    hunks
}

fn line_number(index: usize) -> u32 {
    u32::try_from(index + 1).unwrap_or(u32::MAX)
}

/// Synthesizes the edits that turn `before` into `after`.
///
/// Each changed run of lines becomes one whole-line replacement addressed in
/// `before` coordinates, so the batch applies simultaneously.
pub fn compute_text_edits(before: &str, after: &str) -> Vec<TextEdit> {
    if before == after {
        return Vec::new();
    }

    let old_lines: Vec<&str> = before.split_inclusive('\n').collect();
    let new_lines: Vec<&str> = after.split_inclusive('\n').collect();

    hunks(&old_lines, &new_lines)
        .into_iter()
        .map(|hunk| {
            let range =
                Range::new(line_number(hunk.old_start), 1, line_number(hunk.old_end), 1);
            TextEdit::new(range, new_lines[hunk.new_start..hunk.new_end].concat())
        })
        .collect()
}

/// Counts added and removed lines between two versions.
pub fn line_change_stats(before: &str, after: &str) -> LineChangeStats {
    if before == after {
        return LineChangeStats::default();
    }

    let old_lines: Vec<&str> = before.lines().collect();
    let new_lines: Vec<&str> = after.lines().collect();

    hunks(&old_lines, &new_lines).into_iter().fold(LineChangeStats::default(), |mut acc, h| {
        acc.removed += h.old_end - h.old_start;
        acc.added += h.new_end - h.new_start;
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::apply_text_edits;
    use proptest::prelude::*;

    #[test]
    fn identical_text_needs_no_edits() {
        assert!(compute_text_edits("a\nb\n", "a\nb\n").is_empty());
        assert_eq!(line_change_stats("x", "x"), LineChangeStats::default());
    }

    #[test]
    fn replaces_a_middle_line() {
        let edits = compute_text_edits("one\ntwo\nthree\n", "one\nTWO\nthree\n");
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].range, Range::new(2, 1, 3, 1));
        assert_eq!(edits[0].text, "TWO\n");
    }

    #[test]
    fn appends_to_text_without_trailing_newline() {
        let before = "first";
        let after = "first\nsecond";
        let edits = compute_text_edits(before, after);
        assert_eq!(apply_text_edits(before, &edits), after);
    }

    #[test]
    fn counts_added_and_removed_lines() {
        let stats = line_change_stats("a\nb\nc", "a\nx\ny\nc");
        assert_eq!(stats, LineChangeStats { added: 2, removed: 1 });
    }

    #[test]
    fn rewriting_every_line_of_a_large_file_stays_cheap() {
        let before: String = (0..4_000).map(|i| format!("old line {i}\n")).collect();
        let after: String = (0..4_000).map(|i| format!("new line {i}\n")).collect();

        let edits = compute_text_edits(&before, &after);
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].range, Range::new(1, 1, 4_001, 1));
        assert_eq!(apply_text_edits(&before, &edits), after);
        assert_eq!(line_change_stats(&before, &after), LineChangeStats { added: 4_000, removed: 4_000 });
    }

    #[test]
    fn separate_changes_become_separate_edits() {
        let edits = compute_text_edits("a\nb\nc\nd\ne\n", "A\nb\nc\nd\nE\n");
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[0].range, Range::new(1, 1, 2, 1));
        assert_eq!(edits[1].range, Range::new(5, 1, 6, 1));
        assert_eq!(edits[1].text, "E\n");
    }

    proptest! {
        #[test]
        fn synthesized_edits_reproduce_target(
            before in proptest::collection::vec("[ab]{0,3}\n?", 0..8),
            after in proptest::collection::vec("[ab]{0,3}\n?", 0..8),
        ) {
            let before = before.concat();
            let after = after.concat();
            let edits = compute_text_edits(&before, &after);
            prop_assert_eq!(apply_text_edits(&before, &edits), after);
        }
    }
}
