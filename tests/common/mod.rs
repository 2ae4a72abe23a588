// Common test utilities for integration tests
// A scripted in-memory backend, an in-memory channel and a local axum server.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use chrono::Utc;
use log::LevelFilter;
use serde_json::Value;
use tokio::task::JoinHandle;

use gigchat::chat::channel::ListenerRegistry;
use gigchat::chat::compose::StagedAttachment;
use gigchat::chat::{ChannelEvent, ChannelHandle, ChatBackend, EventFilter, Subscription};
use gigchat::models::wire::{ChatDto, MessageDto, PageEnvelope};
use gigchat::models::{Author, Conversation, DeliveryStatus, Message, Page, PageMeta};
use gigchat::{ChatError, Result};

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// Backend whose responses are scripted up front as raw JSON pages
pub struct ScriptedBackend {
    viewer_id: String,
    chat_pages: Mutex<HashMap<(u32, String), Value>>,
    message_pages: Mutex<HashMap<(String, u32), Value>>,
    failing: Mutex<HashSet<&'static str>>,
    next_id: AtomicU64,
    calls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(viewer_id: &str) -> Arc<Self> {
        Arc::new(ScriptedBackend {
            viewer_id: viewer_id.to_string(),
            chat_pages: Mutex::new(HashMap::new()),
            message_pages: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1000),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Script `GET /chats?page=&search=`; `body` is the full `{data, meta}` envelope
    pub fn with_chats(&self, page: u32, search: &str, body: Value) {
        self.chat_pages
            .lock()
            .unwrap()
            .insert((page, search.to_string()), body);
    }

    /// Script `GET /chats/{id}/messages?page=`
    pub fn with_messages(&self, chat_id: &str, page: u32, body: Value) {
        self.message_pages
            .lock()
            .unwrap()
            .insert((chat_id.to_string(), page), body);
    }

    /// Make every call of `operation` fail with a 500
    pub fn fail(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<()> {
        let operation = call.split(' ').next().unwrap_or_default().to_string();
        self.calls.lock().unwrap().push(call);
        if self.failing.lock().unwrap().contains(operation.as_str()) {
            return Err(ChatError::Status {
                status: 500,
                body: "scripted failure".to_string(),
            });
        }
        Ok(())
    }
}

fn empty_page<T>(page: u32) -> Page<T> {
    Page {
        items: Vec::new(),
        meta: PageMeta { page, total_pages: page },
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn list_chats(&self, page: u32, search: &str) -> Result<Page<Conversation>> {
        self.record(format!("list_chats {} {}", page, search))?;
        let body = self.chat_pages.lock().unwrap().get(&(page, search.to_string())).cloned();
        match body {
            Some(body) => {
                let envelope: PageEnvelope<ChatDto> = serde_json::from_value(body)?;
                Ok(envelope.into_page(ChatDto::into_conversation))
            }
            None => Ok(empty_page(page)),
        }
    }

    async fn list_messages(&self, chat_id: &str, page: u32, limit: u32) -> Result<Page<Message>> {
        self.record(format!("list_messages {} {} {}", chat_id, page, limit))?;
        let body = self
            .message_pages
            .lock()
            .unwrap()
            .get(&(chat_id.to_string(), page))
            .cloned();
        match body {
            Some(body) => {
                let envelope: PageEnvelope<MessageDto> = serde_json::from_value(body)?;
                Ok(envelope.into_page(|dto| dto.into_message(&self.viewer_id, chat_id)))
            }
            None => Ok(empty_page(page)),
        }
    }

    async fn send_message(&self, chat_id: &str, text: &str, files: &[StagedAttachment]) -> Result<Message> {
        self.record(format!("send_message {} {} {}", chat_id, text, files.len()))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Message {
            id: id.to_string(),
            chat_id: chat_id.to_string(),
            author: Author::Me,
            sender_id: self.viewer_id.clone(),
            text: text.to_string(),
            attachments: Vec::new(),
            created_at: Utc::now(),
            delivery_status: DeliveryStatus::Sent,
        })
    }
}

/// In-memory stand-in for the real-time channel
pub struct FakeChannel {
    connected: AtomicBool,
    registry: Arc<ListenerRegistry>,
    emitted: Mutex<Vec<(String, Value)>>,
    replies: Mutex<HashMap<String, Value>>,
}

impl FakeChannel {
    pub fn new(connected: bool) -> Self {
        FakeChannel {
            connected: AtomicBool::new(connected),
            registry: ListenerRegistry::new(),
            emitted: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        self.push(if connected {
            ChannelEvent::Connected
        } else {
            ChannelEvent::Disconnected
        });
    }

    /// Reply `value` to every request for `event`
    pub fn reply(&self, event: &str, value: Value) {
        self.replies.lock().unwrap().insert(event.to_string(), value);
    }

    /// Deliver a server event to the subscribers
    pub fn push(&self, event: ChannelEvent) {
        self.registry.dispatch(&event);
    }

    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.emitted.lock().unwrap().clone()
    }

    pub fn listeners(&self) -> usize {
        self.registry.len()
    }
}

#[async_trait]
impl ChannelHandle for FakeChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn emit(&self, event: &str, data: Value) -> Result<()> {
        if !self.is_connected() {
            return Err(ChatError::NotConnected);
        }
        self.emitted.lock().unwrap().push((event.to_string(), data));
        Ok(())
    }

    async fn request(&self, event: &str, data: Value) -> Result<Value> {
        self.emit(event, data)?;
        Ok(self
            .replies
            .lock()
            .unwrap()
            .get(event)
            .cloned()
            .unwrap_or(Value::Null))
    }

    fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.registry.register(filter)
    }
}

/// Serve `app` on an ephemeral local port
pub fn spawn_server(app: axum::Router) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server)
}
