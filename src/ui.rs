use anyhow::Result;
use chrono::Local;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::debug;
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph},
    Frame,
};
use std::{io, path::PathBuf, time::Duration};
use textwrap::wrap;
use tui_input::{backend::crossterm::EventHandler, Input};

use gigchat::chat::notifications::Level;
use gigchat::chat::separators::{group_by_day, TimelineEntry};
use gigchat::chat::{ConversationList, ConversationWindow, Notifications, ScrollIntent};
use gigchat::models::{AttachmentKind, DeliveryStatus, Message, PresenceStatus};

// Export types needed by main module
pub use ratatui::backend::CrosstermBackend;
pub use ratatui::Terminal;

/// What the user asked for; main turns these into synchronizer calls
#[derive(Debug, Clone, PartialEq)]
pub enum UiAction {
    Quit,
    Open(String),
    Send(String),
    Attach(PathBuf),
    Detach,
    SearchInput(String),
    LoadMoreChats,
    LoadOlder,
}

/// Compose-line commands
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Attach(PathBuf),
    Detach,
    Search(String),
    Help,
    Text(String),
}

pub fn parse_command(line: &str) -> Command {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix("/attach") {
        if rest.is_empty() || rest.starts_with(' ') {
            return Command::Attach(PathBuf::from(rest.trim()));
        }
    }
    if trimmed == "/detach" {
        return Command::Detach;
    }
    if let Some(rest) = trimmed.strip_prefix("/search") {
        if rest.is_empty() || rest.starts_with(' ') {
            return Command::Search(rest.trim().to_string());
        }
    }
    if trimmed == "/help" {
        return Command::Help;
    }
    Command::Text(line.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Focus {
    Sidebar,
    Search,
    Compose,
}

/// Everything the draw pass reads, borrowed from the state main owns
pub struct ViewModel<'a> {
    pub user: &'a str,
    pub connected: bool,
    pub list: &'a ConversationList,
    pub window: &'a ConversationWindow,
    pub notes: &'a Notifications,
}

pub struct ChatUI {
    input: Input,
    search: Input,
    focus: Focus,
    selected: usize,
    // items scrolled up from the newest line
    scroll_offset: usize,
    unseen_below: bool,
    show_help: bool,
}

impl ChatUI {
    pub fn new() -> Self {
        ChatUI {
            input: Input::default(),
            search: Input::default(),
            focus: Focus::Sidebar,
            selected: 0,
            scroll_offset: 0,
            unseen_below: false,
            show_help: false,
        }
    }

    /// Clear the compose line after a confirmed send, unless the user has
    /// typed something else since
    pub fn clear_sent_input(&mut self, sent: &str) -> bool {
        if self.input.value().trim() != sent {
            return false;
        }
        self.input.reset();
        true
    }

    /// Keep the selection inside the list after it was reloaded
    pub fn clamp_selection(&mut self, len: usize) {
        if len == 0 {
            self.selected = 0;
        } else if self.selected >= len {
            self.selected = len - 1;
        }
    }

    pub fn apply_scroll(&mut self, intent: ScrollIntent) {
        match intent {
            ScrollIntent::ToBottom => {
                self.scroll_offset = 0;
                self.unseen_below = false;
            }
            // the offset is counted from the bottom, so prepends leave the viewport alone
            ScrollIntent::PreserveViewport | ScrollIntent::Stay => {}
        }
    }

    /// Another party's message arrived; only hint at it if the user scrolled away
    pub fn note_incoming(&mut self) {
        if self.scroll_offset > 0 {
            self.unseen_below = true;
        }
    }

    pub fn reset_scroll(&mut self) {
        self.scroll_offset = 0;
        self.unseen_below = false;
    }

    pub fn handle_input(&mut self, list: &ConversationList) -> Result<Option<UiAction>> {
        if !event::poll(Duration::from_millis(50))? {
            return Ok(None);
        }
        let Event::Key(key) = event::read()? else {
            return Ok(None);
        };
        if key.kind != KeyEventKind::Press {
            return Ok(None);
        }

        if self.show_help {
            self.show_help = false;
            return Ok(None);
        }

        if key.modifiers.contains(KeyModifiers::CONTROL) {
            match key.code {
                KeyCode::Char('c') => return Ok(Some(UiAction::Quit)),
                KeyCode::Char('h') => {
                    self.show_help = true;
                    return Ok(None);
                }
                KeyCode::Char('f') => {
                    self.focus = Focus::Search;
                    return Ok(None);
                }
                _ => {}
            }
        }

        match key.code {
            KeyCode::Esc => {
                if self.focus == Focus::Search {
                    self.focus = Focus::Sidebar;
                    return Ok(None);
                }
                return Ok(Some(UiAction::Quit));
            }
            KeyCode::Tab => {
                self.focus = match self.focus {
                    Focus::Sidebar | Focus::Search => Focus::Compose,
                    Focus::Compose => Focus::Sidebar,
                };
                return Ok(None);
            }
            KeyCode::PageUp => {
                self.scroll_offset += 5;
                return Ok(Some(UiAction::LoadOlder));
            }
            KeyCode::PageDown => {
                self.scroll_offset = self.scroll_offset.saturating_sub(5);
                if self.scroll_offset == 0 {
                    self.unseen_below = false;
                }
                return Ok(None);
            }
            _ => {}
        }

        match self.focus {
            Focus::Sidebar => Ok(self.handle_sidebar_key(key, list)),
            Focus::Search => Ok(self.handle_search_key(key)),
            Focus::Compose => Ok(self.handle_compose_key(key)),
        }
    }

    fn handle_sidebar_key(&mut self, key: KeyEvent, list: &ConversationList) -> Option<UiAction> {
        let len = list.conversations().len();
        match key.code {
            KeyCode::Up => {
                self.selected = self.selected.saturating_sub(1);
                None
            }
            KeyCode::Down => {
                if self.selected + 1 < len {
                    self.selected += 1;
                    None
                } else {
                    Some(UiAction::LoadMoreChats)
                }
            }
            KeyCode::Enter => {
                let conversation = list.conversations().get(self.selected)?;
                self.focus = Focus::Compose;
                self.reset_scroll();
                Some(UiAction::Open(conversation.id.clone()))
            }
            KeyCode::Char('/') => {
                self.focus = Focus::Search;
                None
            }
            _ => None,
        }
    }

    fn handle_search_key(&mut self, key: KeyEvent) -> Option<UiAction> {
        if key.code == KeyCode::Enter {
            self.focus = Focus::Sidebar;
            return None;
        }
        let before = self.search.value().to_string();
        self.search.handle_event(&Event::Key(key));
        if self.search.value() != before {
            self.selected = 0;
            return Some(UiAction::SearchInput(self.search.value().to_string()));
        }
        None
    }

    fn handle_compose_key(&mut self, key: KeyEvent) -> Option<UiAction> {
        if key.code != KeyCode::Enter {
            self.input.handle_event(&Event::Key(key));
            return None;
        }

        let line = self.input.value().to_string();
        match parse_command(&line) {
            Command::Attach(path) => {
                self.input.reset();
                Some(UiAction::Attach(path))
            }
            Command::Detach => {
                self.input.reset();
                Some(UiAction::Detach)
            }
            Command::Search(term) => {
                self.input.reset();
                self.search = Input::new(term.clone());
                self.selected = 0;
                Some(UiAction::SearchInput(term))
            }
            Command::Help => {
                self.input.reset();
                self.show_help = true;
                None
            }
            // cleared by main once the send is confirmed
            Command::Text(text) => Some(UiAction::Send(text)),
        }
    }

    pub fn draw<B: Backend>(&self, frame: &mut Frame<B>, view: &ViewModel) {
        let size = frame.size();

        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(30), Constraint::Percentage(70)])
            .split(size);

        let sidebar_chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(3), Constraint::Min(3)])
            .split(chunks[0]);

        let chat_chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Min(5),    // Messages area
                Constraint::Length(3), // Input box
                Constraint::Length(1), // Notification / help line
            ])
            .split(chunks[1]);

        self.draw_search(frame, sidebar_chunks[0], view.list.is_search_pending());
        self.draw_sidebar(frame, sidebar_chunks[1], view);
        self.draw_messages(frame, chat_chunks[0], view);
        self.draw_compose(frame, chat_chunks[1], view);
        draw_status_line(frame, chat_chunks[2], view.notes);

        match self.focus {
            Focus::Compose => frame.set_cursor(
                chat_chunks[1].x + self.input.cursor() as u16 + 1,
                chat_chunks[1].y + 1,
            ),
            Focus::Search => frame.set_cursor(
                sidebar_chunks[0].x + self.search.cursor() as u16 + 1,
                sidebar_chunks[0].y + 1,
            ),
            Focus::Sidebar => {}
        }

        if self.show_help {
            draw_help_dialog(frame, size);
        }
    }

    fn draw_search<B: Backend>(&self, frame: &mut Frame<B>, area: Rect, pending: bool) {
        let title = if pending { "Search (Ctrl+F) …" } else { "Search (Ctrl+F)" };
        let block = Block::default()
            .title(title)
            .borders(Borders::ALL)
            .border_style(focus_style(self.focus == Focus::Search));
        frame.render_widget(Paragraph::new(self.search.value()).block(block), area);
    }

    fn draw_sidebar<B: Backend>(&self, frame: &mut Frame<B>, area: Rect, view: &ViewModel) {
        let width = area.width.saturating_sub(4) as usize;
        let open = view.window.chat_id();

        let mut items: Vec<ListItem> = view
            .list
            .conversations()
            .iter()
            .map(|c| {
                let badge = match c.status {
                    PresenceStatus::Online => Span::styled("● ", Style::default().fg(Color::Green)),
                    PresenceStatus::Offline => Span::styled("○ ", Style::default().fg(Color::DarkGray)),
                };
                let mut name_style = Style::default();
                if open == Some(c.id.as_str()) {
                    name_style = name_style.add_modifier(Modifier::BOLD);
                }
                let mut header = vec![badge, Span::styled(c.other_user.name.clone(), name_style)];
                if c.unread_count > 0 {
                    header.push(Span::styled(
                        format!(" ({})", c.unread_count),
                        Style::default().fg(Color::Yellow),
                    ));
                }

                let preview: String = c.preview().chars().take(width).collect();
                ListItem::new(vec![
                    Line::from(header),
                    Line::from(Span::styled(
                        format!("  {}", preview),
                        Style::default().fg(Color::Gray),
                    )),
                ])
            })
            .collect();

        if view.list.is_loading() {
            items.push(ListItem::new(Span::styled("  loading…", Style::default().fg(Color::DarkGray))));
        } else if items.is_empty() {
            items.push(ListItem::new(Span::styled(
                "  No conversations",
                Style::default().fg(Color::DarkGray),
            )));
        }

        let mut state = ListState::default();
        if !view.list.conversations().is_empty() {
            state.select(Some(self.selected));
        }

        let title = format!("Chats · {} online", view.list.online().online_count());
        let list = List::new(items)
            .block(
                Block::default()
                    .title(title)
                    .borders(Borders::ALL)
                    .border_style(focus_style(self.focus == Focus::Sidebar)),
            )
            .highlight_style(Style::default().bg(Color::DarkGray));
        frame.render_stateful_widget(list, area, &mut state);
    }

    fn draw_messages<B: Backend>(&self, frame: &mut Frame<B>, area: Rect, view: &ViewModel) {
        let wrap_width = area.width.saturating_sub(2).max(1) as usize;
        let connection_icon = if view.connected { "🔌 " } else { "❌ " };

        let Some(chat) = view.window.chat() else {
            let block = Block::default()
                .borders(Borders::ALL)
                .title(format!("{}{}", connection_icon, view.user));
            let hint = Paragraph::new("Select a conversation and press Enter")
                .style(Style::default().fg(Color::DarkGray))
                .block(block);
            frame.render_widget(hint, area);
            return;
        };

        let presence = match (chat.status, chat.last_seen) {
            (PresenceStatus::Online, _) => "online".to_string(),
            (PresenceStatus::Offline, Some(seen)) => {
                format!("last seen {}", seen.with_timezone(&Local).format("%b %-d %H:%M"))
            }
            (PresenceStatus::Offline, None) => "offline".to_string(),
        };
        let mut title = format!("{}{} · {}", connection_icon, chat.other_user.name, presence);
        if view.window.is_loading() {
            title.push_str(" · loading…");
        } else if view.window.has_more() {
            title.push_str(" · PgUp for older");
        }
        if self.unseen_below {
            title.push_str(" · new messages below");
        }

        let now = Local::now();
        let mut items: Vec<ListItem> = Vec::new();
        for entry in group_by_day(view.window.messages(), &now) {
            match entry {
                TimelineEntry::Separator(label) => {
                    let line = format!("── {} ──", label);
                    items.push(
                        ListItem::new(Line::from(line))
                            .style(Style::default().fg(Color::DarkGray)),
                    );
                }
                TimelineEntry::Message(message) => {
                    items.extend(message_lines(message, &chat.other_user.name, wrap_width));
                }
            }
        }

        let mut state = ListState::default();
        if !items.is_empty() {
            let last = items.len() - 1;
            state.select(Some(last.saturating_sub(self.scroll_offset)));
        }

        let list = List::new(items)
            .block(Block::default().borders(Borders::ALL).title(title))
            .highlight_style(Style::default());
        frame.render_stateful_widget(list, area, &mut state);
    }

    fn draw_compose<B: Backend>(&self, frame: &mut Frame<B>, area: Rect, view: &ViewModel) {
        let composer = view.window.composer();
        let mut title = String::from("Message");
        if !composer.attachments().is_empty() {
            let names: Vec<&str> = composer.attachments().iter().map(|a| a.filename.as_str()).collect();
            title.push_str(&format!(
                " [📎 {}/{}: {}]",
                names.len(),
                composer.cap(),
                names.join(", ")
            ));
        }
        if composer.is_sending() {
            title.push_str(" (sending…)");
        }

        let block = Block::default()
            .title(title)
            .borders(Borders::ALL)
            .border_style(focus_style(self.focus == Focus::Compose));
        frame.render_widget(Paragraph::new(self.input.value()).block(block), area);
    }
}

fn focus_style(focused: bool) -> Style {
    if focused {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default()
    }
}

fn message_lines(message: &Message, other_name: &str, wrap_width: usize) -> Vec<ListItem<'static>> {
    let who = if message.is_mine() { "You" } else { other_name };
    let status = match (message.is_mine(), message.delivery_status) {
        (true, DeliveryStatus::Pending) => " …",
        (true, DeliveryStatus::Sent) => " ✓",
        _ => "",
    };
    let full = format!(
        "[{}] {}: {}{}",
        message.time_label(&Local),
        who,
        message.text,
        status
    );

    let style = if message.is_mine() {
        match message.delivery_status {
            DeliveryStatus::Pending => Style::default().fg(Color::DarkGray),
            DeliveryStatus::Sent => Style::default().fg(Color::Blue),
        }
    } else {
        Style::default()
    };

    let mut lines: Vec<ListItem<'static>> = wrap(&full, wrap_width)
        .into_iter()
        .map(|l| ListItem::new(l.into_owned()).style(style))
        .collect();

    for attachment in &message.attachments {
        let icon = match attachment.kind {
            AttachmentKind::Image => "🖼",
            AttachmentKind::File => "📎",
        };
        lines.push(
            ListItem::new(format!("    {} {} ({})", icon, attachment.filename, human_size(attachment.size)))
                .style(Style::default().fg(Color::Cyan)),
        );
    }
    lines
}

fn human_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn draw_status_line<B: Backend>(frame: &mut Frame<B>, area: Rect, notes: &Notifications) {
    let line = match notes.latest() {
        Some(note) => {
            let color = match note.level {
                Level::Info => Color::Green,
                Level::Warning => Color::Yellow,
                Level::Error => Color::Red,
            };
            let text = match notes.len() {
                0 | 1 => note.text.clone(),
                n => format!("{} (+{} more)", note.text, n - 1),
            };
            Line::from(Span::styled(text, Style::default().fg(color)))
        }
        None => Line::from(Span::styled(
            "ESC quit | TAB switch | ↑/↓ select | Enter open/send | PgUp older | Ctrl+F search | Ctrl+H help",
            Style::default().fg(Color::Gray),
        )),
    };
    frame.render_widget(Paragraph::new(line), area);
}

fn draw_help_dialog<B: Backend>(f: &mut Frame<B>, area: Rect) {
    let popup_width = 70.min(area.width.saturating_sub(4));
    let popup_height = 20.min(area.height.saturating_sub(4));
    let popup_x = (area.width - popup_width) / 2;
    let popup_y = (area.height - popup_height) / 2;
    let popup_area = Rect::new(popup_x, popup_y, popup_width, popup_height);

    let popup_block = Block::default()
        .title("Keyboard Shortcuts")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    f.render_widget(Clear, popup_area);
    f.render_widget(popup_block, popup_area);

    let inner_area = popup_area.inner(&Margin {
        vertical: 1,
        horizontal: 2,
    });

    let shortcuts = vec![
        ("General", ""),
        ("ESC", "Quit application"),
        ("Tab", "Switch between chats and the message line"),
        ("", ""),
        ("Chats", ""),
        ("↑/↓", "Select a conversation, ↓ at the end loads more"),
        ("Enter", "Open the selected conversation"),
        ("Ctrl+F", "Search conversations"),
        ("", ""),
        ("Messages", ""),
        ("Enter", "Send"),
        ("PgUp/PgDn", "Scroll, PgUp loads older messages"),
        ("/attach", "Stage a file: /attach <path>"),
        ("/detach", "Drop the last staged file"),
        ("/search", "Search conversations: /search <term>"),
        ("", ""),
        ("Press any key to close this dialog", ""),
    ];

    let items: Vec<ListItem> = shortcuts
        .iter()
        .map(|(key, desc)| {
            if desc.is_empty() {
                if key.is_empty() {
                    ListItem::new("")
                } else {
                    ListItem::new(Text::styled(
                        key.to_string(),
                        Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
                    ))
                }
            } else {
                let line = Line::from(vec![
                    Span::styled(format!("{:<11}", key), Style::default().fg(Color::Green)),
                    Span::raw(desc.to_string()),
                ]);
                ListItem::new(line)
            }
        })
        .collect();

    f.render_widget(List::new(items), inner_area);
}

pub fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    debug!("Terminal ready");
    Ok(terminal)
}

pub fn restore_terminal(mut terminal: Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
