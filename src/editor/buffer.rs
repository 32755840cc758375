//! Editable snippet text with cursor, undo and an Emacs-style kill buffer

/// Undo history depth
const UNDO_LIMIT: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct TextBuffer {
    content: String,
    /// Byte offset, always on a char boundary
    cursor: usize,
    undo_stack: Vec<(String, usize)>,
    redo_stack: Vec<(String, usize)>,
    kill_buffer: String,
    /// Consecutive typed characters share one undo entry, split at newlines
    typing: bool,
}

impl TextBuffer {
    /// Buffer holding `text` with the cursor at the end
    pub fn new(text: &str) -> Self {
        Self {
            content: text.to_string(),
            cursor: text.len(),
            ..Self::default()
        }
    }

    pub fn text(&self) -> &str {
        &self.content
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn line_count(&self) -> usize {
        self.content.split('\n').count()
    }

    /// Zero-based line and column (in chars) of the cursor
    pub fn cursor_line_col(&self) -> (usize, usize) {
        let before = &self.content[..self.cursor];
        let line = before.matches('\n').count();
        let start = self.line_start();
        (line, self.content[start..self.cursor].chars().count())
    }

    fn line_start(&self) -> usize {
        self.content[..self.cursor].rfind('\n').map_or(0, |i| i + 1)
    }

    fn line_end(&self) -> usize {
        self.content[self.cursor..]
            .find('\n')
            .map_or(self.content.len(), |i| self.cursor + i)
    }

    /// Replace everything, keeping the old text on the undo stack
    pub fn replace_all(&mut self, text: &str) {
        self.push_undo();
        self.content = text.to_string();
        self.cursor = 0;
    }

    pub fn insert_char(&mut self, c: char) {
        if !self.typing || c == '\n' {
            self.push_undo();
        }
        self.content.insert(self.cursor, c);
        self.cursor += c.len_utf8();
        self.typing = true;
    }

    pub fn insert_str(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        self.push_undo();
        self.content.insert_str(self.cursor, s);
        self.cursor += s.len();
    }

    /// Delete the character before the cursor
    pub fn backspace(&mut self) -> bool {
        match self.content[..self.cursor].chars().next_back() {
            Some(c) => {
                self.push_undo();
                let start = self.cursor - c.len_utf8();
                self.content.replace_range(start..self.cursor, "");
                self.cursor = start;
                true
            }
            None => false,
        }
    }

    /// Delete the character under the cursor
    pub fn delete_forward(&mut self) -> bool {
        match self.content[self.cursor..].chars().next() {
            Some(c) => {
                self.push_undo();
                self.content
                    .replace_range(self.cursor..self.cursor + c.len_utf8(), "");
                true
            }
            None => false,
        }
    }

    /// Cut to end of line, or the newline itself when already there
    pub fn kill_line(&mut self) {
        let end = self.line_end();
        if self.cursor < end {
            self.push_undo();
            self.kill_buffer = self.content[self.cursor..end].to_string();
            self.content.replace_range(self.cursor..end, "");
        } else if self.cursor < self.content.len() {
            self.push_undo();
            self.kill_buffer = "\n".to_string();
            self.content.remove(self.cursor);
        }
    }

    /// Paste the last killed text
    pub fn yank(&mut self) {
        if !self.kill_buffer.is_empty() {
            let text = self.kill_buffer.clone();
            self.insert_str(&text);
        }
    }

    fn push_undo(&mut self) {
        if self.undo_stack.len() >= UNDO_LIMIT {
            self.undo_stack.remove(0);
        }
        self.undo_stack.push((self.content.clone(), self.cursor));
        self.redo_stack.clear();
        self.typing = false;
    }

    pub fn undo(&mut self) -> bool {
        match self.undo_stack.pop() {
            Some((content, cursor)) => {
                self.redo_stack
                    .push((std::mem::replace(&mut self.content, content), self.cursor));
                self.cursor = cursor;
                self.typing = false;
                true
            }
            None => false,
        }
    }

    pub fn redo(&mut self) -> bool {
        match self.redo_stack.pop() {
            Some((content, cursor)) => {
                self.undo_stack
                    .push((std::mem::replace(&mut self.content, content), self.cursor));
                self.cursor = cursor;
                self.typing = false;
                true
            }
            None => false,
        }
    }

    pub fn move_left(&mut self) {
        if let Some(c) = self.content[..self.cursor].chars().next_back() {
            self.cursor -= c.len_utf8();
        }
        self.typing = false;
    }

    pub fn move_right(&mut self) {
        if let Some(c) = self.content[self.cursor..].chars().next() {
            self.cursor += c.len_utf8();
        }
        self.typing = false;
    }

    pub fn move_up(&mut self) {
        let start = self.line_start();
        if start == 0 {
            return;
        }
        let col = self.content[start..self.cursor].chars().count();
        let prev_start = self.content[..start - 1].rfind('\n').map_or(0, |i| i + 1);
        self.cursor = offset_in_line(&self.content, prev_start, start - 1, col);
        self.typing = false;
    }

    pub fn move_down(&mut self) {
        let end = self.line_end();
        if end == self.content.len() {
            return;
        }
        let col = self.content[self.line_start()..self.cursor].chars().count();
        let next_start = end + 1;
        let next_end = self.content[next_start..]
            .find('\n')
            .map_or(self.content.len(), |i| next_start + i);
        self.cursor = offset_in_line(&self.content, next_start, next_end, col);
        self.typing = false;
    }

    pub fn move_line_start(&mut self) {
        self.cursor = self.line_start();
        self.typing = false;
    }

    pub fn move_line_end(&mut self) {
        self.cursor = self.line_end();
        self.typing = false;
    }
}

/// Byte offset of char column `col` in the line spanning `start..end`, clamped
fn offset_in_line(content: &str, start: usize, end: usize, col: usize) -> usize {
    content[start..end]
        .char_indices()
        .nth(col)
        .map_or(end, |(i, _)| start + i)
}
