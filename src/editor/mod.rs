//! Live coding editor with terminal UI
//!
//! A full-screen editor pane for snippets, a transport line showing what is
//! playing, an error banner and a console of recent events. The editor never
//! evaluates anything itself: keys are turned into requests on a
//! [`StudioHandle`] and the resulting [`PlaybackStatus`] is read back on
//! every frame.

mod browser;
pub mod buffer;

pub use browser::ExampleBrowser;
pub use buffer::TextBuffer;

use crate::catalog::{self, Example};
use crate::controller::{Backend, PlaybackStatus};
use crate::snippet::Snippet;
use crate::studio::StudioHandle;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame, Terminal,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Console history length
const CONSOLE_LIMIT: usize = 50;

const HELP: &str =
    "C-e: Eval | C-h: Stop | C-b: Backend | Alt-↑↓: Tempo | F2: Examples | C-u: Undo | C-r: Redo | C-s: Save | Alt-q: Quit";

/// Pattern tempo before anything sets one
pub const DEFAULT_CPS: f64 = 0.5;

/// Alt+Up / Alt+Down tempo nudge, cycles per second
const TEMPO_STEP: f64 = 0.05;

/// What the event loop should do after a key press
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyResult {
    Continue,
    Quit,
    Evaluate,
    Stop,
    Save,
    /// The pattern tempo changed; read it with [`EditorState::cps`]
    Tempo,
}

/// Everything the editor shows, independent of the terminal
pub struct EditorState {
    buffer: TextBuffer,
    file_path: Option<PathBuf>,
    backend: Backend,
    cps: f64,
    status: PlaybackStatus,
    error_banner: Option<String>,
    status_message: String,
    console_messages: Vec<String>,
    browser: ExampleBrowser,
}

impl EditorState {
    pub fn new(code: &str, file_path: Option<PathBuf>, backend: Backend) -> Self {
        Self {
            buffer: TextBuffer::new(code),
            file_path,
            backend,
            cps: DEFAULT_CPS,
            status: PlaybackStatus::default(),
            error_banner: None,
            status_message: "Ready".to_string(),
            console_messages: Vec::new(),
            browser: ExampleBrowser::new(),
        }
    }

    /// Open `path` if it exists, otherwise start from the backend's first example
    pub fn open(path: Option<PathBuf>, backend: Backend) -> io::Result<Self> {
        match path {
            Some(path) if path.exists() => {
                let code = fs::read_to_string(&path)?;
                let mut state = Self::new(&code, Some(path.clone()), backend);
                state.log(format!("Opened {}", path.display()));
                Ok(state)
            }
            path => {
                let code = catalog::all()
                    .iter()
                    .find(|e| e.backend == backend)
                    .map(Example::code)
                    .unwrap_or_default();
                Ok(Self::new(code, path, backend))
            }
        }
    }

    /// Start from a configured tempo instead of [`DEFAULT_CPS`]
    pub fn with_cps(mut self, cps: f64) -> Self {
        self.cps = cps;
        self
    }

    pub fn cps(&self) -> f64 {
        self.cps
    }

    fn nudge_tempo(&mut self, delta: f64) -> KeyResult {
        let cps = ((self.cps + delta) / TEMPO_STEP).round() * TEMPO_STEP;
        let cps = cps.max(TEMPO_STEP);
        if cps == self.cps {
            return KeyResult::Continue;
        }
        self.cps = cps;
        self.status_message = format!("Tempo: {:.2} cps ({:.0} bpm)", cps, cps * 240.0);
        KeyResult::Tempo
    }

    pub fn text(&self) -> &str {
        self.buffer.text()
    }

    pub fn snippet(&self) -> Snippet {
        Snippet::from(self.buffer.text())
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn error_banner(&self) -> Option<&str> {
        self.error_banner.as_deref()
    }

    pub fn console_messages(&self) -> &[String] {
        &self.console_messages
    }

    pub fn browser(&self) -> &ExampleBrowser {
        &self.browser
    }

    pub fn log(&mut self, msg: impl Into<String>) {
        self.console_messages.push(msg.into());
        if self.console_messages.len() > CONSOLE_LIMIT {
            self.console_messages.remove(0);
        }
    }

    /// Replace the snippet wholesale with an example
    pub fn load_example(&mut self, example: &Example) {
        self.buffer.replace_all(example.code());
        self.backend = example.backend;
        self.error_banner = None;
        self.status_message = format!("Loaded example: {}", example.title);
        self.log(format!("📄 {} ({})", example.title, example.backend));
    }

    /// Track controller status, logging transitions
    pub fn apply_status(&mut self, status: PlaybackStatus) {
        if status == self.status {
            return;
        }

        if status.session != self.status.session {
            match (status.session, status.backend) {
                (Some(id), Some(backend)) => self.log(format!("▶ Session {} on {}", id, backend)),
                _ => self.log("⏹ Stopped"),
            }
        }

        if status.error != self.status.error {
            if let Some(error) = &status.error {
                self.log(format!("❌ {}", error));
            }
            self.error_banner = status.error.clone();
        }

        self.status = status;
    }

    pub fn save(&mut self) -> io::Result<PathBuf> {
        let path = self.file_path.clone().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                "no file to save to; start the editor with a file path",
            )
        })?;
        fs::write(&path, self.buffer.text())?;
        self.status_message = format!("💾 Saved {}", path.display());
        Ok(path)
    }

    fn edited(&mut self) {
        self.error_banner = None;
    }

    /// Handle keyboard input
    pub fn handle_key_event(&mut self, key: KeyEvent) -> KeyResult {
        if self.browser.is_visible() {
            return self.handle_browser_key_event(key);
        }

        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        let alt = key.modifiers.contains(KeyModifiers::ALT);
        match key.code {
            // Alt+Q, since Ctrl+Q is terminal flow control
            KeyCode::Char('q') if alt => KeyResult::Quit,
            KeyCode::Up if alt => self.nudge_tempo(TEMPO_STEP),
            KeyCode::Down if alt => self.nudge_tempo(-TEMPO_STEP),

            KeyCode::Char('e') if ctrl => KeyResult::Evaluate,
            KeyCode::Enter if ctrl => KeyResult::Evaluate,
            KeyCode::Char('h') | KeyCode::Char('.') if ctrl => KeyResult::Stop,
            KeyCode::Char('s') if ctrl => KeyResult::Save,

            KeyCode::Char('b') if ctrl => {
                self.backend = self.backend.toggled();
                self.status_message = format!("Backend: {}", self.backend);
                KeyResult::Continue
            }
            KeyCode::F(2) => {
                self.browser.toggle();
                KeyResult::Continue
            }

            KeyCode::Char('u') if ctrl => {
                self.status_message = if self.buffer.undo() {
                    "↶ Undo".to_string()
                } else {
                    "Nothing to undo".to_string()
                };
                self.edited();
                KeyResult::Continue
            }
            KeyCode::Char('r') if ctrl => {
                self.status_message = if self.buffer.redo() {
                    "↷ Redo".to_string()
                } else {
                    "Nothing to redo".to_string()
                };
                self.edited();
                KeyResult::Continue
            }
            KeyCode::Char('k') if ctrl => {
                self.buffer.kill_line();
                self.edited();
                KeyResult::Continue
            }
            KeyCode::Char('y') if ctrl => {
                self.buffer.yank();
                self.edited();
                KeyResult::Continue
            }
            KeyCode::Char('d') if ctrl => {
                self.buffer.delete_forward();
                self.edited();
                KeyResult::Continue
            }
            KeyCode::Char('a') if ctrl => {
                self.buffer.move_line_start();
                KeyResult::Continue
            }
            KeyCode::Char('n') if ctrl => {
                self.buffer.move_down();
                KeyResult::Continue
            }
            KeyCode::Char('p') if ctrl => {
                self.buffer.move_up();
                KeyResult::Continue
            }
            KeyCode::Char(_) if ctrl => KeyResult::Continue,

            KeyCode::Char(c) => {
                self.buffer.insert_char(c);
                self.edited();
                KeyResult::Continue
            }
            KeyCode::Tab => {
                self.buffer.insert_str("  ");
                self.edited();
                KeyResult::Continue
            }
            KeyCode::Enter => {
                self.buffer.insert_char('\n');
                self.edited();
                KeyResult::Continue
            }
            KeyCode::Backspace => {
                self.buffer.backspace();
                self.edited();
                KeyResult::Continue
            }
            KeyCode::Delete => {
                self.buffer.delete_forward();
                self.edited();
                KeyResult::Continue
            }
            KeyCode::Left => {
                self.buffer.move_left();
                KeyResult::Continue
            }
            KeyCode::Right => {
                self.buffer.move_right();
                KeyResult::Continue
            }
            KeyCode::Up => {
                self.buffer.move_up();
                KeyResult::Continue
            }
            KeyCode::Down => {
                self.buffer.move_down();
                KeyResult::Continue
            }
            KeyCode::Home => {
                self.buffer.move_line_start();
                KeyResult::Continue
            }
            KeyCode::End => {
                self.buffer.move_line_end();
                KeyResult::Continue
            }
            _ => KeyResult::Continue,
        }
    }

    fn handle_browser_key_event(&mut self, key: KeyEvent) -> KeyResult {
        match key.code {
            KeyCode::Char('q') if key.modifiers.contains(KeyModifiers::ALT) => KeyResult::Quit,
            KeyCode::Esc | KeyCode::F(2) => {
                self.browser.hide();
                KeyResult::Continue
            }
            KeyCode::Up => {
                self.browser.select_prev();
                KeyResult::Continue
            }
            KeyCode::Down => {
                self.browser.select_next();
                KeyResult::Continue
            }
            KeyCode::Tab => {
                self.browser.next_category();
                KeyResult::Continue
            }
            KeyCode::Enter => {
                if let Some(example) = self.browser.selected() {
                    self.load_example(example);
                }
                self.browser.hide();
                KeyResult::Continue
            }
            _ => KeyResult::Continue,
        }
    }

    fn transport_line(&self) -> (String, Style) {
        match (self.status.session, self.status.backend) {
            (Some(id), Some(backend)) if self.status.is_playing() => {
                let remaining = self
                    .status
                    .remaining()
                    .map(|d| format!(" | {:.1}s left", d.as_secs_f64()))
                    .unwrap_or_default();
                (
                    format!("▶ Running {} on {}{} | {}", id, backend, remaining, self.status_message),
                    Style::default().fg(Color::Green),
                )
            }
            _ if self.backend == Backend::Pattern => (
                format!(
                    "⏹ Idle | backend: {} | {:.2} cps | {}",
                    self.backend, self.cps, self.status_message
                ),
                Style::default().fg(Color::Yellow),
            ),
            _ => (
                format!("⏹ Idle | backend: {} | {}", self.backend, self.status_message),
                Style::default().fg(Color::Yellow),
            ),
        }
    }

    fn title(&self) -> String {
        let name = self
            .file_path
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "untitled".to_string());
        format!(" {} [{}] ", name, self.backend)
    }

    /// Render the UI
    fn ui(&self, f: &mut Frame) {
        let banner_height = if self.error_banner.is_some() { 3 } else { 0 };
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(banner_height),
                Constraint::Min(5),
                Constraint::Length(1),
                Constraint::Length(1),
                Constraint::Length(8),
            ])
            .split(f.size());

        if let Some(error) = &self.error_banner {
            let banner = Paragraph::new(format!("❌ {}", error))
                .block(Block::default().borders(Borders::ALL).title("Error"))
                .style(Style::default().fg(Color::Red))
                .wrap(Wrap { trim: true });
            f.render_widget(banner, chunks[0]);
        }

        self.render_editor(f, chunks[1]);

        let (transport, style) = self.transport_line();
        f.render_widget(Paragraph::new(transport).style(style), chunks[2]);
        f.render_widget(
            Paragraph::new(HELP)
                .style(Style::default().fg(Color::Gray))
                .alignment(Alignment::Center),
            chunks[3],
        );

        let console_area = chunks[4];
        let console_height = console_area.height.saturating_sub(2) as usize;
        let start = self.console_messages.len().saturating_sub(console_height);
        let lines: Vec<Line> = self.console_messages[start..]
            .iter()
            .map(|msg| Line::from(msg.as_str()))
            .collect();
        let console = Paragraph::new(lines)
            .block(
                Block::default()
                    .title(format!("Console ({})", self.console_messages.len()))
                    .borders(Borders::ALL),
            )
            .style(Style::default().fg(Color::Cyan));
        f.render_widget(console, console_area);

        if self.browser.is_visible() {
            let area = f.size();
            let width = area.width * 4 / 5;
            let height = area.height * 3 / 5;
            let popup = Rect {
                x: (area.width - width) / 2,
                y: (area.height - height) / 2,
                width,
                height,
            };
            self.browser.render(f, popup);
        }
    }

    fn render_editor(&self, f: &mut Frame, area: Rect) {
        let visible = area.height.saturating_sub(2) as usize;
        let (line, col) = self.buffer.cursor_line_col();
        let scroll = (line + 1).saturating_sub(visible);

        let lines: Vec<Line> = self.buffer.text().split('\n').map(highlight_line).collect();
        let editor = Paragraph::new(lines)
            .block(
                Block::default()
                    .title(self.title())
                    .borders(Borders::ALL)
                    .style(Style::default().fg(Color::White)),
            )
            .scroll((scroll as u16, 0))
            .style(Style::default().fg(Color::White).bg(Color::Black));
        f.render_widget(editor, area);

        if !self.browser.is_visible() {
            let x = area.x + 1 + (col as u16).min(area.width.saturating_sub(3));
            let y = area.y + 1 + line.saturating_sub(scroll) as u16;
            f.set_cursor(x, y);
        }
    }
}

/// Colour comments and string literals
fn highlight_line(line: &str) -> Line<'static> {
    let mut spans = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                } else if c == q {
                    spans.push(Span::styled(
                        std::mem::take(&mut current),
                        Style::default().fg(Color::Green),
                    ));
                    quote = None;
                }
            }
            None if c == '/' && chars.peek() == Some(&'/') => {
                if !current.is_empty() {
                    spans.push(Span::raw(std::mem::take(&mut current)));
                }
                let rest: String = std::iter::once(c).chain(chars.by_ref()).collect();
                spans.push(Span::styled(rest, Style::default().fg(Color::DarkGray)));
            }
            None if c == '"' || c == '\'' || c == '`' => {
                if !current.is_empty() {
                    spans.push(Span::raw(std::mem::take(&mut current)));
                }
                current.push(c);
                quote = Some(c);
            }
            None => current.push(c),
        }
    }

    if !current.is_empty() {
        let style = match quote {
            Some(_) => Style::default().fg(Color::Green),
            None => Style::default(),
        };
        spans.push(Span::styled(current, style));
    }
    Line::from(spans)
}

/// Run the editor until Alt+Q
pub fn run(studio: StudioHandle, mut state: EditorState) -> io::Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_app(&mut terminal, &studio, &mut state);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    studio: &StudioHandle,
    state: &mut EditorState,
) -> io::Result<()> {
    loop {
        state.apply_status(studio.current());
        terminal.draw(|f| state.ui(f))?;

        if !event::poll(Duration::from_millis(100))? {
            continue;
        }
        let key = match event::read()? {
            Event::Key(key) if key.kind != KeyEventKind::Release => key,
            _ => continue,
        };

        match state.handle_key_event(key) {
            KeyResult::Continue => {}
            KeyResult::Quit => break,
            KeyResult::Evaluate => {
                let backend = state.backend();
                if studio.request_evaluate(backend, state.snippet()) {
                    state.status_message = format!("Evaluating on {}", backend);
                } else {
                    state.log("❌ Studio host is not running");
                }
            }
            KeyResult::Stop => {
                studio.request_stop();
                state.status_message = "Stop".to_string();
            }
            KeyResult::Tempo => {
                if !studio.request_cps(state.cps()) {
                    state.log("❌ Studio host is not running");
                }
            }
            KeyResult::Save => match state.save() {
                Ok(path) => info!("Saved {}", path.display()),
                Err(e) => {
                    warn!("Save failed: {}", e);
                    state.log(format!("❌ Save failed: {}", e));
                }
            },
        }
    }

    info!("Editor closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{PlaybackState, SessionId};

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn ctrl(c: char) -> KeyEvent {
        KeyEvent::new(KeyCode::Char(c), KeyModifiers::CONTROL)
    }

    fn type_text(state: &mut EditorState, text: &str) {
        for c in text.chars() {
            let code = if c == '\n' { KeyCode::Enter } else { KeyCode::Char(c) };
            assert_eq!(state.handle_key_event(key(code)), KeyResult::Continue);
        }
    }

    #[test]
    fn test_typing_builds_snippet() {
        let mut state = EditorState::new("", None, Backend::Tone);
        type_text(&mut state, "const s = new Tone.Synth()\ns.dispose()");
        assert_eq!(state.text(), "const s = new Tone.Synth()\ns.dispose()");
        assert!(!state.snippet().is_blank());
    }

    #[test]
    fn test_transport_keys() {
        let mut state = EditorState::new("Tone.now()", None, Backend::Tone);
        assert_eq!(state.handle_key_event(ctrl('e')), KeyResult::Evaluate);
        assert_eq!(
            state.handle_key_event(KeyEvent::new(KeyCode::Enter, KeyModifiers::CONTROL)),
            KeyResult::Evaluate
        );
        assert_eq!(state.handle_key_event(ctrl('h')), KeyResult::Stop);
        assert_eq!(state.handle_key_event(ctrl('.')), KeyResult::Stop);
        assert_eq!(state.handle_key_event(ctrl('s')), KeyResult::Save);
        assert_eq!(
            state.handle_key_event(KeyEvent::new(KeyCode::Char('q'), KeyModifiers::ALT)),
            KeyResult::Quit
        );
        assert_eq!(state.text(), "Tone.now()");
    }

    #[test]
    fn test_alt_arrows_nudge_tempo() {
        let alt = |code| KeyEvent::new(code, KeyModifiers::ALT);
        let mut state = EditorState::new("s \"bd\"", None, Backend::Pattern).with_cps(0.6);

        assert_eq!(state.handle_key_event(alt(KeyCode::Up)), KeyResult::Tempo);
        assert!((state.cps() - 0.65).abs() < 1e-9);
        assert!(state.transport_line().0.contains("0.65 cps"));

        for _ in 0..20 {
            state.handle_key_event(alt(KeyCode::Down));
        }
        assert!((state.cps() - TEMPO_STEP).abs() < 1e-9);
        // Already at the floor
        assert_eq!(state.handle_key_event(alt(KeyCode::Down)), KeyResult::Continue);

        // Plain arrows still move the cursor
        assert_eq!(state.handle_key_event(key(KeyCode::Up)), KeyResult::Continue);
        assert_eq!(state.text(), "s \"bd\"");
    }

    #[test]
    fn test_backend_toggle() {
        let mut state = EditorState::new("", None, Backend::Tone);
        state.handle_key_event(ctrl('b'));
        assert_eq!(state.backend(), Backend::Pattern);
        state.handle_key_event(ctrl('b'));
        assert_eq!(state.backend(), Backend::Tone);
    }

    #[test]
    fn test_browser_loads_example() {
        let mut state = EditorState::new("old code", None, Backend::Tone);
        state.handle_key_event(key(KeyCode::F(2)));
        assert!(state.browser().is_visible());

        let target = catalog::all()
            .iter()
            .position(|e| e.backend == Backend::Pattern)
            .unwrap();
        for _ in 0..target {
            state.handle_key_event(key(KeyCode::Down));
        }
        // Typing goes to the browser, not the buffer
        state.handle_key_event(key(KeyCode::Char('x')));
        state.handle_key_event(key(KeyCode::Enter));

        let example = &catalog::all()[target];
        assert!(!state.browser().is_visible());
        assert_eq!(state.text(), example.code());
        assert_eq!(state.backend(), Backend::Pattern);

        state.handle_key_event(ctrl('u'));
        assert_eq!(state.text(), "old code");
    }

    #[test]
    fn test_error_banner_follows_status_and_clears_on_edit() {
        let mut state = EditorState::new("badSyntax(", None, Backend::Tone);
        state.apply_status(PlaybackStatus {
            error: Some("SyntaxError: Unexpected end of input (line 1, column 11)".to_string()),
            ..PlaybackStatus::default()
        });
        assert!(state.error_banner().unwrap().starts_with("SyntaxError"));
        assert!(state.console_messages()[0].starts_with("❌"));

        type_text(&mut state, ")");
        assert_eq!(state.error_banner(), None);
    }

    #[test]
    fn test_session_transitions_are_logged() {
        let mut state = EditorState::new("", None, Backend::Tone);
        state.apply_status(PlaybackStatus {
            state: PlaybackState::Running,
            backend: Some(Backend::Tone),
            session: Some(SessionId(1)),
            ..PlaybackStatus::default()
        });
        state.apply_status(PlaybackStatus::default());
        assert_eq!(
            state.console_messages(),
            &["▶ Session #1 on tone".to_string(), "⏹ Stopped".to_string()]
        );
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groove.js");

        let mut state = EditorState::open(Some(path.clone()), Backend::Pattern).unwrap();
        assert!(!state.text().is_empty());
        type_text(&mut state, "\n// saved");
        state.save().unwrap();

        let reopened = EditorState::open(Some(path), Backend::Pattern).unwrap();
        assert!(reopened.text().ends_with("// saved"));
    }

    #[test]
    fn test_save_without_path_fails() {
        let mut state = EditorState::new("Tone.now()", None, Backend::Tone);
        assert!(state.save().is_err());
    }

    #[test]
    fn test_highlighting_splits_strings_and_comments() {
        let line = highlight_line("s.play('C4') // note");
        let texts: Vec<String> = line.spans.iter().map(|s| s.content.to_string()).collect();
        assert_eq!(texts, vec!["s.play(", "'C4'", ") ", "// note"]);
    }
}
