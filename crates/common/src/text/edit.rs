// Range-based text edits.
//
// Ranges are 1-based and end-exclusive on the column axis. Columns count
// Unicode scalar values. All edits in one batch address the original text and
// are applied simultaneously; positions past the end of a line or document
// clamp to that end.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub line_number: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line_number: u32, column: u32) -> Self {
        Self { line_number, column }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Range {
    pub start_line_number: u32,
    pub start_column: u32,
    pub end_line_number: u32,
    pub end_column: u32,
}

impl Range {
    pub fn new(start_line: u32, start_column: u32, end_line: u32, end_column: u32) -> Self {
        Self {
            start_line_number: start_line,
            start_column,
            end_line_number: end_line,
            end_column,
        }
    }

    /// A range covering any document; used for whole-content replacement.
    pub fn full() -> Self {
        Self::new(1, 1, u32::MAX, u32::MAX)
    }

    pub fn start(&self) -> Position {
        Position::new(self.start_line_number, self.start_column)
    }

    pub fn end(&self) -> Position {
        Position::new(self.end_line_number, self.end_column)
    }

    pub fn is_empty(&self) -> bool {
        self.start() == self.end()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextEdit {
    pub range: Range,
    pub text: String,
}

impl TextEdit {
    pub fn new(range: Range, text: impl Into<String>) -> Self {
        Self { range, text: text.into() }
    }

    pub fn insert(at: Position, text: impl Into<String>) -> Self {
        Self::new(Range::new(at.line_number, at.column, at.line_number, at.column), text)
    }

    pub fn replace_all(text: impl Into<String>) -> Self {
        Self::new(Range::full(), text)
    }
}

/// Line start offsets for a borrowed text.
struct LineIndex<'a> {
    text: &'a str,
    starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    fn new(text: &'a str) -> Self {
        let starts = std::iter::once(0)
            .chain(text.match_indices('\n').map(|(idx, _)| idx + 1))
            .collect();
        Self { text, starts }
    }

    /// Byte offset for `pos`, clamped into the document.
    fn offset_at(&self, pos: Position) -> usize {
        let line = pos.line_number.max(1) as usize;
        if line > self.starts.len() {
            return self.text.len();
        }

        let start = self.starts[line - 1];
        let end = match self.starts.get(line) {
            Some(next) => next - 1,
            None => self.text.len(),
        };
        let mut line_text = &self.text[start..end];
        if let Some(stripped) = line_text.strip_suffix('\r') {
            line_text = stripped;
        }

        let column = pos.column.max(1) as usize - 1;
        match line_text.char_indices().nth(column) {
            Some((idx, _)) => start + idx,
            None => start + line_text.len(),
        }
    }
}

/// Applies `edits` to `content` and returns the new text.
///
/// Overlapping edits are resolved in range order: a later edit never reaches
/// back into text already consumed by an earlier one.
pub fn apply_text_edits(content: &str, edits: &[TextEdit]) -> String {
    if edits.is_empty() {
        return content.to_string();
    }

    let index = LineIndex::new(content);
    let mut spans: Vec<(usize, usize, &str)> = edits
        .iter()
        .map(|edit| {
            let start = index.offset_at(edit.range.start());
            let end = index.offset_at(edit.range.end());
            (start.min(end), start.max(end), edit.text.as_str())
        })
        .collect();
    spans.sort_by_key(|(start, end, _)| (*start, *end));

    let mut out = String::with_capacity(content.len());
    let mut cursor = 0usize;
    for (start, end, text) in spans {
        let start = start.max(cursor);
        let end = end.max(start);
        out.push_str(&content[cursor..start]);
        out.push_str(text);
        cursor = end;
    }
    out.push_str(&content[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_at_end_of_line() {
        let edits = [TextEdit::insert(Position::new(1, 2), "b")];
        assert_eq!(apply_text_edits("a", &edits), "ab");
    }

    #[test]
    fn replace_all_swaps_content() {
        let edits = [TextEdit::replace_all("new\ncontent")];
        assert_eq!(apply_text_edits("old\nlines\nhere", &edits), "new\ncontent");
        assert_eq!(apply_text_edits("", &edits), "new\ncontent");
    }

    #[test]
    fn replaces_across_lines() {
        let edits = [TextEdit::new(Range::new(1, 3, 3, 2), "X")];
        assert_eq!(apply_text_edits("abc\ndef\nghi", &edits), "abXhi");
    }

    #[test]
    fn applies_edits_against_original_positions() {
        let edits = [
            TextEdit::new(Range::new(2, 1, 2, 4), "TWO"),
            TextEdit::new(Range::new(1, 1, 1, 4), "ONE"),
        ];
        assert_eq!(apply_text_edits("one\ntwo\nthree", &edits), "ONE\nTWO\nthree");
    }

    #[test]
    fn same_position_inserts_keep_batch_order() {
        let edits = [
            TextEdit::insert(Position::new(1, 1), "a"),
            TextEdit::insert(Position::new(1, 1), "b"),
        ];
        assert_eq!(apply_text_edits("z", &edits), "abz");
    }

    #[test]
    fn clamps_out_of_range_positions() {
        let edits = [TextEdit::new(Range::new(1, 50, 9, 9), "!")];
        assert_eq!(apply_text_edits("hi\nthere", &edits), "hi!");
    }

    #[test]
    fn columns_count_characters_and_skip_carriage_return() {
        let edits = [TextEdit::insert(Position::new(1, 3), "é")];
        assert_eq!(apply_text_edits("ñö\r\nx", &edits), "ñöé\r\nx");
    }

    #[test]
    fn empty_batch_is_identity() {
        assert_eq!(apply_text_edits("same", &[]), "same");
    }
}
