use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn, LevelFilter};
use std::{env, io, path::PathBuf, sync::Arc, time::Instant};
use tokio::sync::mpsc;

mod ui;
mod utils;

use crate::ui::{ChatUI, UiAction, ViewModel};
use gigchat::chat::channel::ChannelOptions;
use gigchat::chat::conversations::{ConversationList, ListTicket};
use gigchat::chat::presence::fetch_online_users;
use gigchat::chat::window::{confirm_read, ConversationWindow, HistoryTicket, NewMessageOutcome, OutgoingMessage, ScrollIntent};
use gigchat::chat::{
    ChannelEvent, ChannelHandle, ChatBackend, EventFilter, HttpBackend, Notifications, RealtimeChannel,
    StagedAttachment, Subscription,
};
use gigchat::config::{self, Config};
use gigchat::models::{Conversation, Message, Page, PresenceRecord};
use gigchat::{ChatError, Session};

/// Command line arguments for gigchat
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "gigchat: terminal chat client for the gig marketplace.",
    long_about = "gigchat signs in to the marketplace backend and keeps your conversations in sync.\n\n\
    Credentials come from GIGCHAT_EMAIL / GIGCHAT_PASSWORD, a cached session, or a prompt.\n\
    Use -h or --help to see all options."
)]
struct Args {
    /// REST API base URL
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,

    /// Real-time channel URL
    #[arg(long, value_name = "URL")]
    socket_url: Option<String>,

    /// Directory for config.json and the default log file
    #[arg(long, value_name = "PATH")]
    config_dir: Option<PathBuf>,

    /// Log file path (defaults to gigchat.log in the config directory)
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Log level: off, error, warn, info, debug, trace
    #[arg(long, value_name = "LEVEL", default_value = "debug")]
    log_level: LevelFilter,

    /// Forget the cached session and exit
    #[arg(long)]
    logout: bool,
}

/// Results reported back to the UI task by spawned network calls
enum AppEvent {
    ListLoaded(ListTicket, gigchat::Result<Page<Conversation>>),
    HistoryLoaded(HistoryTicket, gigchat::Result<Page<Message>>),
    Sent(OutgoingMessage, gigchat::Result<Message>),
    ReadConfirmed(String, gigchat::Result<()>),
    PresenceSnapshot(gigchat::Result<Vec<PresenceRecord>>),
}

/// Prompts for login credentials unless the environment provides them
fn prompt_credentials() -> (String, String) {
    let email = env::var("GIGCHAT_EMAIL").unwrap_or_else(|_| {
        eprintln!("Email:");
        utils::read_line().unwrap_or_default()
    });

    let password = env::var("GIGCHAT_PASSWORD").unwrap_or_else(|_| {
        eprintln!("Password:");
        utils::read_line().unwrap_or_default()
    });

    (email, password)
}

async fn establish_session(config: &mut Config) -> Result<Session> {
    if let Some(session) = config.cached_session() {
        info!("Using cached session for {}", session.display_name());
        return Ok(session);
    }

    let (email, password) = prompt_credentials();
    println!("Signing in to {}... please wait...", config.api_url);
    let session = HttpBackend::login(&config.api_url, &email, &password)
        .await
        .context("login failed")?;

    config.remember_session(&session);
    if let Err(e) = config::save_config(config) {
        warn!("Could not cache session: {}", e);
    }
    Ok(session)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(ref dir) = args.config_dir {
        config::set_config_dir_override(dir.clone());
    }

    let log_file_path = match args.log_file.clone() {
        Some(path) => path,
        None => config::config_dir()
            .map(|dir| dir.join("gigchat.log"))
            .unwrap_or_else(|_| PathBuf::from("gigchat.log")),
    };
    utils::setup_logging(Some(&log_file_path), args.log_level)?;

    info!("gigchat starting up");
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);
    info!("Logging to file: {}", log_file_path.display());

    let mut config = config::load_config()?;
    if let Some(url) = args.api_url {
        config.api_url = url;
    }
    if let Some(url) = args.socket_url {
        config.socket_url = url;
    }

    if args.logout {
        config.forget_session();
        config::save_config(&config)?;
        info!("Cached session removed");
        println!("Signed out.");
        return Ok(());
    }

    let session = establish_session(&mut config).await?;
    info!("Signed in as {} ({})", session.display_name(), session.user_id());

    let backend: Arc<dyn ChatBackend> = Arc::new(HttpBackend::new(&config.api_url, session.clone())?);
    let tuning = config.tuning.clone();
    let channel = RealtimeChannel::start(
        &config.socket_url,
        &session,
        ChannelOptions {
            request_timeout: tuning.request_timeout(),
            reconnect_min: tuning.reconnect_min(),
            reconnect_max: tuning.reconnect_max(),
        },
    )?;

    let mut terminal = ui::setup_terminal()?;
    let result = {
        let mut app = App::new(&session, &config, backend, channel.clone());
        app.run(&mut terminal).await
    };
    ui::restore_terminal(terminal)?;
    channel.close();

    if let Err(ref e) = result {
        error!("Application error: {}", e);
    }
    info!("gigchat shutting down");
    result
}

struct App {
    session: Session,
    tuning: config::Tuning,
    backend: Arc<dyn ChatBackend>,
    channel: RealtimeChannel,
    list: ConversationList,
    window: ConversationWindow,
    notes: Notifications,
    ui: ChatUI,
    sidebar: Subscription,
    tx: mpsc::UnboundedSender<AppEvent>,
    rx: mpsc::UnboundedReceiver<AppEvent>,
}

impl App {
    fn new(session: &Session, config: &Config, backend: Arc<dyn ChatBackend>, channel: RealtimeChannel) -> Self {
        let tuning = config.tuning.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let sidebar = channel.subscribe(EventFilter::Sidebar);
        App {
            session: session.clone(),
            list: ConversationList::new(session.user_id(), tuning.search_debounce()),
            window: ConversationWindow::new(session.user_id(), tuning.history_page_size, tuning.attachment_cap),
            notes: Notifications::new(tuning.notification_ttl()),
            ui: ChatUI::new(),
            tuning,
            backend,
            channel,
            sidebar,
            tx,
            rx,
        }
    }

    /// Run the main event loop
    async fn run(&mut self, terminal: &mut ui::Terminal<ui::CrosstermBackend<io::Stdout>>) -> Result<()> {
        let first = self.list.restart("");
        self.spawn_list(first);

        loop {
            let connected = self.channel.is_connected();
            terminal.draw(|f| {
                self.ui.draw(
                    f,
                    &ViewModel {
                        user: self.session.display_name(),
                        connected,
                        list: &self.list,
                        window: &self.window,
                        notes: &self.notes,
                    },
                )
            })?;

            if let Some(action) = self.ui.handle_input(&self.list)? {
                if action == UiAction::Quit {
                    info!("Quit requested");
                    break;
                }
                self.handle_action(action);
            }

            while let Some(event) = self.sidebar.try_recv() {
                self.on_channel_event(event);
            }

            for message in self.window.pending_events() {
                match self.window.on_new_message(message, &mut self.notes) {
                    NewMessageOutcome::AppendedScroll => self.ui.apply_scroll(ScrollIntent::ToBottom),
                    NewMessageOutcome::AppendedNotify => self.ui.note_incoming(),
                    NewMessageOutcome::Duplicate | NewMessageOutcome::Ignored => {}
                }
            }

            while let Ok(event) = self.rx.try_recv() {
                self.on_app_event(event);
            }

            let now = Instant::now();
            if let Some(ticket) = self.list.poll_search(now) {
                self.spawn_list(ticket);
            }
            self.notes.expire(now);

            // Yield so spawned fetches make progress between redraws
            tokio::task::yield_now().await;
        }

        Ok(())
    }

    fn handle_action(&mut self, action: UiAction) {
        match action {
            UiAction::Quit => {}
            UiAction::Open(chat_id) => self.open_conversation(&chat_id),
            UiAction::Send(text) => self.send(&text),
            UiAction::Attach(path) => {
                if path.as_os_str().is_empty() {
                    self.notes.warn("Usage: /attach <path>");
                    return;
                }
                match StagedAttachment::from_path(&path) {
                    Ok(attachment) => {
                        let name = attachment.filename.clone();
                        if self.window.stage_attachment(attachment, &mut self.notes) {
                            self.notes.info(format!("Attached {}", name));
                        }
                    }
                    Err(e) => {
                        error!("Cannot attach {}: {}", path.display(), e);
                        self.notes.error(format!("Cannot attach {}: {}", path.display(), e));
                    }
                }
            }
            UiAction::Detach => match self.window.composer_mut().unstage_last() {
                Some(attachment) => self.notes.info(format!("Removed {}", attachment.filename)),
                None => self.notes.info("Nothing attached"),
            },
            UiAction::SearchInput(term) => self.list.set_search_input(&term, Instant::now()),
            UiAction::LoadMoreChats => {
                if let Some(ticket) = self.list.next_page() {
                    self.spawn_list(ticket);
                }
            }
            UiAction::LoadOlder => {
                if let Some(ticket) = self.window.next_history_page() {
                    self.spawn_history(ticket);
                }
            }
        }
    }

    fn open_conversation(&mut self, chat_id: &str) {
        let Some(conversation) = self.list.get(chat_id).cloned() else {
            warn!("Conversation {} is not in the list", chat_id);
            return;
        };
        if self.window.chat_id() == Some(chat_id) {
            return;
        }

        self.list.open(Some(chat_id));
        let ticket = self.window.switch_to(&conversation, &self.channel);
        self.spawn_history(ticket);
        if self.channel.is_connected() {
            self.spawn_confirm_read(chat_id);
        }
    }

    fn send(&mut self, text: &str) {
        if self.window.chat_id().is_none() {
            self.notes.warn(ChatError::NoOpenConversation.to_string());
            return;
        }
        if !self.window.composer().is_sending() {
            self.window.composer_mut().set_text(text);
        }
        let Some(outgoing) = self.window.begin_send() else {
            debug!("Nothing sent");
            return;
        };
        self.ui.apply_scroll(ScrollIntent::ToBottom);

        let backend = self.backend.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = ConversationWindow::deliver(backend.as_ref(), &outgoing).await;
            let _ = tx.send(AppEvent::Sent(outgoing, result));
        });
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                info!("Real-time channel connected");
                self.notes.info("Connected");
                self.window.on_reconnected(&self.channel);
                if let Some(chat_id) = self.window.chat_id().map(str::to_string) {
                    self.spawn_confirm_read(&chat_id);
                }
                self.spawn_presence_snapshot();
            }
            ChannelEvent::Disconnected => {
                warn!("Real-time channel disconnected");
                self.list.on_disconnect();
                self.window.on_disconnect();
                self.notes.warn("Connection lost, reconnecting…");
            }
            ChannelEvent::UserPresence(event) => {
                if self.list.apply_presence(&event) {
                    debug!("Presence of the open conversation changed");
                }
                self.window
                    .apply_presence(&event.user_id, event.status(), event.timestamp);
            }
            ChannelEvent::LatestMessage(event) => self.list.apply_latest_message(&event),
            ChannelEvent::NewMessage(message) => {
                debug!("Sidebar ignoring message {}", message.id);
            }
        }
    }

    fn on_app_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::ListLoaded(ticket, result) => {
                if self.list.apply_page(&ticket, result, &mut self.notes) {
                    self.ui.clamp_selection(self.list.conversations().len());
                }
            }
            AppEvent::HistoryLoaded(ticket, result) => {
                if let Some(intent) = self.window.apply_history(&ticket, result, &mut self.notes) {
                    self.ui.apply_scroll(intent);
                }
            }
            AppEvent::Sent(outgoing, result) => {
                let delivered = result.is_ok();
                let intent = self.window.finish_send(&outgoing, result, &mut self.notes);
                if delivered {
                    self.ui.clear_sent_input(&outgoing.submission.text);
                }
                self.ui.apply_scroll(intent);
            }
            AppEvent::ReadConfirmed(chat_id, Ok(())) => self.list.mark_read(&chat_id),
            AppEvent::ReadConfirmed(chat_id, Err(e)) => {
                warn!("Conversation {} was not marked read: {}", chat_id, e);
            }
            AppEvent::PresenceSnapshot(Ok(records)) => {
                info!("Presence snapshot: {} online", records.len());
                self.list.apply_presence_snapshot(&records);
                self.window.apply_presence_snapshot(&records);
            }
            AppEvent::PresenceSnapshot(Err(e)) => {
                error!("Failed to fetch online users: {}", e);
                self.notes.error(format!("Could not fetch online users: {}", e));
            }
        }
    }

    fn spawn_list(&self, ticket: ListTicket) {
        let backend = self.backend.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = ConversationList::fetch(backend.as_ref(), &ticket).await;
            let _ = tx.send(AppEvent::ListLoaded(ticket, result));
        });
    }

    fn spawn_history(&self, ticket: HistoryTicket) {
        let backend = self.backend.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = ConversationWindow::fetch_history(backend.as_ref(), &ticket).await;
            let _ = tx.send(AppEvent::HistoryLoaded(ticket, result));
        });
    }

    fn spawn_confirm_read(&self, chat_id: &str) {
        let channel = self.channel.clone();
        let tx = self.tx.clone();
        let chat_id = chat_id.to_string();
        tokio::spawn(async move {
            let result = confirm_read(&channel, &chat_id).await;
            let _ = tx.send(AppEvent::ReadConfirmed(chat_id, result));
        });
    }

    fn spawn_presence_snapshot(&self) {
        let channel = self.channel.clone();
        let tx = self.tx.clone();
        let delay = self.tuning.presence_snapshot_delay();
        tokio::spawn(async move {
            let result = fetch_online_users(&channel, delay).await;
            let _ = tx.send(AppEvent::PresenceSnapshot(result));
        });
    }
}
