//! Editable text after the prompt.
//!
//! Offsets are byte offsets kept on char boundaries. Offset 0 is the
//! prompt position; nothing can move left of it.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputBuffer {
    text: String,
    cursor: usize,
    anchor: Option<usize>,
}

impl InputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn set(&mut self, text: &str, cursor: usize) {
        self.text = text.to_string();
        self.cursor = self.clamp(cursor);
        self.anchor = None;
    }

    pub fn clear(&mut self) {
        self.set("", 0);
    }

    /// Take the whole text, leaving the buffer empty.
    pub fn take(&mut self) -> String {
        self.cursor = 0;
        self.anchor = None;
        std::mem::take(&mut self.text)
    }

    fn clamp(&self, pos: usize) -> usize {
        let mut pos = pos.min(self.text.len());
        while !self.text.is_char_boundary(pos) {
            pos -= 1;
        }
        pos
    }

    fn prev_boundary(&self, pos: usize) -> usize {
        self.text[..pos]
            .char_indices()
            .next_back()
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    fn next_boundary(&self, pos: usize) -> usize {
        self.text[pos..]
            .chars()
            .next()
            .map(|c| pos + c.len_utf8())
            .unwrap_or(pos)
    }

    pub fn selection(&self) -> Option<(usize, usize)> {
        let anchor = self.anchor?;
        if anchor == self.cursor {
            return None;
        }
        Some((anchor.min(self.cursor), anchor.max(self.cursor)))
    }

    pub fn selected_text(&self) -> Option<&str> {
        self.selection().map(|(a, b)| &self.text[a..b])
    }

    pub fn select_all(&mut self) {
        self.anchor = Some(0);
        self.cursor = self.text.len();
    }

    fn delete_selection(&mut self) -> bool {
        match self.selection() {
            Some((a, b)) => {
                self.text.replace_range(a..b, "");
                self.cursor = a;
                self.anchor = None;
                true
            }
            None => {
                self.anchor = None;
                false
            }
        }
    }

    pub fn insert(&mut self, s: &str) {
        self.delete_selection();
        self.text.insert_str(self.cursor, s);
        self.cursor += s.len();
    }

    pub fn backspace(&mut self) {
        if self.delete_selection() || self.cursor == 0 {
            return;
        }
        let start = self.prev_boundary(self.cursor);
        self.text.replace_range(start..self.cursor, "");
        self.cursor = start;
    }

    pub fn delete(&mut self) {
        if self.delete_selection() {
            return;
        }
        let end = self.next_boundary(self.cursor);
        self.text.replace_range(self.cursor..end, "");
    }

    fn begin_move(&mut self, select: bool) {
        if select {
            self.anchor.get_or_insert(self.cursor);
        } else {
            self.anchor = None;
        }
    }

    pub fn move_left(&mut self, select: bool) {
        self.begin_move(select);
        self.cursor = self.prev_boundary(self.cursor);
    }

    pub fn move_right(&mut self, select: bool) {
        self.begin_move(select);
        self.cursor = self.next_boundary(self.cursor);
    }

    fn line_start(&self, pos: usize) -> usize {
        self.text[..pos].rfind('\n').map(|i| i + 1).unwrap_or(0)
    }

    fn line_end(&self, pos: usize) -> usize {
        self.text[pos..]
            .find('\n')
            .map(|i| pos + i)
            .unwrap_or(self.text.len())
    }

    pub fn home(&mut self, select: bool) {
        self.begin_move(select);
        self.cursor = self.line_start(self.cursor);
    }

    pub fn end(&mut self, select: bool) {
        self.begin_move(select);
        self.cursor = self.line_end(self.cursor);
    }

    /// Index of the line holding the cursor.
    pub fn cursor_line(&self) -> usize {
        self.text[..self.cursor].matches('\n').count()
    }

    pub fn line_count(&self) -> usize {
        self.text.matches('\n').count() + 1
    }

    /// Move one line up, keeping the column. Returns false on the first line.
    pub fn move_up(&mut self) -> bool {
        if self.cursor_line() == 0 {
            return false;
        }
        self.anchor = None;
        let start = self.line_start(self.cursor);
        let column = self.text[start..self.cursor].chars().count();
        let prev_start = self.line_start(start - 1);
        self.cursor = self.column_offset(prev_start, column);
        true
    }

    /// Move one line down, keeping the column. Returns false on the last line.
    pub fn move_down(&mut self) -> bool {
        if self.cursor_line() + 1 >= self.line_count() {
            return false;
        }
        self.anchor = None;
        let start = self.line_start(self.cursor);
        let column = self.text[start..self.cursor].chars().count();
        let next_start = self.line_end(self.cursor) + 1;
        self.cursor = self.column_offset(next_start, column);
        true
    }

    fn column_offset(&self, line_start: usize, column: usize) -> usize {
        let end = self.line_end(line_start);
        self.text[line_start..end]
            .char_indices()
            .nth(column)
            .map(|(i, _)| line_start + i)
            .unwrap_or(end)
    }

    /// Text of the cursor line up to the cursor.
    pub fn line_to_cursor(&self) -> &str {
        &self.text[self.line_start(self.cursor)..self.cursor]
    }

    /// Split at the cursor into `(before, after)`.
    pub fn split_at_cursor(&self) -> (&str, &str) {
        self.text.split_at(self.cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_backspace() {
        let mut b = InputBuffer::new();
        b.insert("héllo");
        b.backspace();
        assert_eq!(b.text(), "héll");
        b.move_left(false);
        b.move_left(false);
        b.backspace();
        assert_eq!(b.text(), "hll");
        assert_eq!(b.cursor(), 1);
    }

    #[test]
    fn test_cursor_stops_at_prompt() {
        let mut b = InputBuffer::new();
        b.insert("ab");
        b.home(false);
        b.move_left(false);
        b.backspace();
        assert_eq!(b.cursor(), 0);
        assert_eq!(b.text(), "ab");
    }

    #[test]
    fn test_selection_replace() {
        let mut b = InputBuffer::new();
        b.insert("print(x)");
        b.move_left(false);
        b.move_left(true);
        assert_eq!(b.selected_text(), Some("x"));
        b.insert("y");
        assert_eq!(b.text(), "print(y)");
        assert_eq!(b.selected_text(), None);
    }

    #[test]
    fn test_multiline_navigation() {
        let mut b = InputBuffer::new();
        b.insert("for i in x:\n    print(i)");
        assert_eq!(b.line_count(), 2);
        assert_eq!(b.cursor_line(), 1);
        assert!(b.move_up());
        assert_eq!(b.cursor_line(), 0);
        assert_eq!(b.cursor(), "for i in x:".len());
        assert!(!b.move_up());
        assert!(b.move_down());
        assert!(!b.move_down());
        b.home(false);
        assert_eq!(b.line_to_cursor(), "");
    }

    #[test]
    fn test_take_and_split() {
        let mut b = InputBuffer::new();
        b.insert("abcd");
        b.move_left(false);
        assert_eq!(b.split_at_cursor(), ("abc", "d"));
        assert_eq!(b.take(), "abcd");
        assert!(b.is_empty());
        assert_eq!(b.cursor(), 0);
    }
}
