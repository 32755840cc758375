//! Example browser overlay
//!
//! Toggled with F2. Up/Down select, Tab cycles the category filter, Enter
//! loads the selected example into the editor, Esc closes.

use crate::catalog::{self, Example};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
    Frame,
};

#[derive(Debug, Default)]
pub struct ExampleBrowser {
    visible: bool,
    selected_index: usize,
    /// Index into `catalog::categories()`, `None` shows everything
    category: Option<usize>,
}

impl ExampleBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn toggle(&mut self) {
        self.visible = !self.visible;
        if self.visible {
            self.selected_index = 0;
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn hide(&mut self) {
        self.visible = false;
    }

    pub fn category(&self) -> Option<&'static str> {
        self.category
            .and_then(|i| catalog::categories().get(i).copied())
    }

    /// Examples shown under the current filter
    pub fn entries(&self) -> Vec<&'static Example> {
        match self.category() {
            Some(category) => catalog::by_category(category),
            None => catalog::all().iter().collect(),
        }
    }

    pub fn next_category(&mut self) {
        let count = catalog::categories().len();
        self.category = match self.category {
            None if count > 0 => Some(0),
            Some(i) if i + 1 < count => Some(i + 1),
            _ => None,
        };
        self.selected_index = 0;
    }

    pub fn select_prev(&mut self) {
        self.selected_index = self.selected_index.saturating_sub(1);
    }

    pub fn select_next(&mut self) {
        if self.selected_index + 1 < self.entries().len() {
            self.selected_index += 1;
        }
    }

    pub fn selected_index(&self) -> usize {
        self.selected_index
    }

    pub fn selected(&self) -> Option<&'static Example> {
        self.entries().get(self.selected_index).copied()
    }

    pub fn render(&self, f: &mut Frame, area: Rect) {
        let title = match self.category() {
            Some(category) => format!("Examples: {} [Tab: category, Enter: load, Esc: close]", category),
            None => "Examples [Tab: category, Enter: load, Esc: close]".to_string(),
        };
        let block = Block::default()
            .title(title)
            .borders(Borders::ALL)
            .style(Style::default().fg(Color::Cyan).bg(Color::Black));

        let inner = block.inner(area);
        f.render_widget(Clear, area);
        f.render_widget(block, area);

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(3), Constraint::Length(6)])
            .split(inner);

        let entries = self.entries();
        let items: Vec<ListItem> = entries
            .iter()
            .map(|example| {
                ListItem::new(Line::from(vec![
                    Span::styled(
                        format!("[{:7}] ", example.backend),
                        Style::default().fg(Color::DarkGray),
                    ),
                    Span::raw(example.title.clone()),
                ]))
            })
            .collect();

        let list = List::new(items)
            .highlight_style(
                Style::default()
                    .fg(Color::Black)
                    .bg(Color::Cyan)
                    .add_modifier(Modifier::BOLD),
            )
            .highlight_symbol("► ");
        let mut state = ListState::default();
        if !entries.is_empty() {
            state.select(Some(self.selected_index));
        }
        f.render_stateful_widget(list, chunks[0], &mut state);

        let preview = match self.selected() {
            Some(example) => {
                let mut lines = vec![Line::from(Span::styled(
                    example.description.clone(),
                    Style::default().fg(Color::Yellow),
                ))];
                lines.extend(
                    example
                        .code()
                        .lines()
                        .take(4)
                        .map(|l| Line::from(Span::styled(l.to_string(), Style::default().fg(Color::Gray)))),
                );
                lines
            }
            None => vec![Line::from("No examples")],
        };
        let preview = Paragraph::new(preview)
            .block(Block::default().borders(Borders::TOP))
            .wrap(Wrap { trim: false });
        f.render_widget(preview, chunks[1]);
    }
}
