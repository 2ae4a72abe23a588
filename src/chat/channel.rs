// Real-time channel client.
// One background task owns the websocket and reconnects with capped exponential
// backoff; everyone else talks to it through `RealtimeChannel` and receives events
// through `Subscription` handles whose lifetime is the listener's lifetime.
//
// Frames are JSON text:
//   {"event": "<name>", "data": <value>}                 plain emission / server event
//   {"event": "<name>", "data": <value>, "ack": <n>}     request expecting a reply
//   {"event": "ack", "ack": <n>, "data": <value>}        reply to request <n>

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::event_names;
use crate::error::{ChatError, Result};
use crate::models::wire::{LatestMessageEvent, MessageDto, PresenceEvent};
use crate::models::Message;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    UserPresence(PresenceEvent),
    LatestMessage(LatestMessageEvent),
    NewMessage(Message),
}

/// Which events a listener wants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    /// Lifecycle, presence and latest-message events for the conversation list
    Sidebar,
    /// `newMessage` events for one conversation only
    ChatMessages(String),
}

impl EventFilter {
    pub fn matches(&self, event: &ChannelEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Sidebar => matches!(
                event,
                ChannelEvent::Connected
                    | ChannelEvent::Disconnected
                    | ChannelEvent::UserPresence(_)
                    | ChannelEvent::LatestMessage(_)
            ),
            EventFilter::ChatMessages(chat_id) => {
                matches!(event, ChannelEvent::NewMessage(m) if &m.chat_id == chat_id)
            }
        }
    }
}

type Listener = (EventFilter, mpsc::UnboundedSender<ChannelEvent>);

/// Listeners keyed by id; a `Subscription` removes its own entry when dropped
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<u64, Listener>>,
}

impl ListenerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(ListenerRegistry::default())
    }

    pub fn register(self: &Arc<Self>, filter: EventFilter) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        match self.listeners.lock() {
            Ok(mut listeners) => {
                listeners.insert(id, (filter.clone(), tx));
            }
            Err(_) => error!("Listener registry lock poisoned; subscription {} will stay silent", id),
        }
        debug!("Registered listener {} for {:?}", id, filter);
        Subscription {
            id,
            filter,
            rx,
            registry: Arc::downgrade(self),
        }
    }

    /// Hand an event to every listener whose filter accepts it
    pub fn dispatch(&self, event: &ChannelEvent) {
        if let Ok(mut listeners) = self.listeners.lock() {
            // receivers that went away without dropping the handle cleanly
            listeners.retain(|_, (filter, tx)| !filter.matches(event) || tx.send(event.clone()).is_ok());
        } else {
            error!("Failed to lock listener registry");
        }
    }

    fn remove(&self, id: u64) {
        if let Ok(mut listeners) = self.listeners.lock() {
            if listeners.remove(&id).is_some() {
                debug!("Removed listener {}", id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cancellation handle for one listener. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    filter: EventFilter,
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    registry: Weak<ListenerRegistry>,
}

impl Subscription {
    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        self.rx.try_recv().ok()
    }

    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }

    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .finish()
    }
}

/// What the synchronizers need from a real-time channel
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Fire-and-forget emission; fails fast while disconnected
    fn emit(&self, event: &str, data: Value) -> Result<()>;

    /// Emission that waits for the server's acknowledgement
    async fn request(&self, event: &str, data: Value) -> Result<Value>;

    fn subscribe(&self, filter: EventFilter) -> Subscription;
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(ChannelEvent),
    Ack { id: u64, data: Value },
    Ignored(String),
}

/// Decode one text frame from the server
pub fn decode_frame(text: &str, viewer_id: &str) -> Result<Inbound> {
    let frame: Value = serde_json::from_str(text)?;
    let event = frame
        .get("event")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let data = frame.get("data").cloned().unwrap_or(Value::Null);

    if event == event_names::ACK {
        let id = frame
            .get("ack")
            .and_then(Value::as_u64)
            .ok_or_else(|| ChatError::Protocol("acknowledgement without id".to_string()))?;
        return Ok(Inbound::Ack { id, data });
    }

    let decoded = match event.as_str() {
        event_names::USER_PRESENCE => ChannelEvent::UserPresence(serde_json::from_value(data)?),
        event_names::LATEST_MESSAGE => ChannelEvent::LatestMessage(serde_json::from_value(data)?),
        event_names::NEW_MESSAGE => {
            let dto: MessageDto = serde_json::from_value(data)?;
            ChannelEvent::NewMessage(dto.into_message(viewer_id, ""))
        }
        _ => return Ok(Inbound::Ignored(event)),
    };
    Ok(Inbound::Event(decoded))
}

pub fn encode_frame(event: &str, data: &Value, ack: Option<u64>) -> String {
    match ack {
        Some(id) => json!({"event": event, "data": data, "ack": id}).to_string(),
        None => json!({"event": event, "data": data}).to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub request_timeout: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions {
            request_timeout: Duration::from_secs(5),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

enum Outbound {
    Frame(String),
    Close,
}

// State shared between the handle and the connection task
struct Core {
    registry: Arc<ListenerRegistry>,
    connected: AtomicBool,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_ack: AtomicU64,
}

impl Core {
    fn resolve(&self, id: u64, data: Value) {
        let waiter = self.pending.lock().ok().and_then(|mut p| p.remove(&id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(data);
            }
            None => debug!("Acknowledgement {} arrived with nobody waiting", id),
        }
    }

    fn resolve_abandoned(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }

    // Dropping the senders wakes every waiter with a closed-channel error
    fn fail_pending(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }

    fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if was != connected {
            self.registry.dispatch(if connected {
                &ChannelEvent::Connected
            } else {
                &ChannelEvent::Disconnected
            });
        }
    }
}

/// Handle to the websocket-backed real-time channel. Cheap to clone; the
/// connection task stops once every handle is gone or `close` is called.
#[derive(Clone)]
pub struct RealtimeChannel {
    core: Arc<Core>,
    outbound: mpsc::UnboundedSender<Outbound>,
    options: ChannelOptions,
}

impl RealtimeChannel {
    /// Start connecting in the background. Returns immediately; subscribe to
    /// see `Connected`/`Disconnected` as they happen.
    pub fn start(url: &str, session: &Session, options: ChannelOptions) -> Result<Self> {
        // fail early on an unusable URL or token instead of retrying forever
        let _ = build_request(url, session.token())?;

        let core = Arc::new(Core {
            registry: ListenerRegistry::new(),
            connected: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            next_ack: AtomicU64::new(1),
        });
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_connection(
            url.to_string(),
            session.clone(),
            options.clone(),
            core.clone(),
            outbound_rx,
        ));

        Ok(RealtimeChannel {
            core,
            outbound,
            options,
        })
    }

    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

#[async_trait]
impl ChannelHandle for RealtimeChannel {
    fn is_connected(&self) -> bool {
        self.core.connected.load(Ordering::SeqCst)
    }

    fn emit(&self, event: &str, data: Value) -> Result<()> {
        if !self.is_connected() {
            return Err(ChatError::NotConnected);
        }
        debug!("Emitting '{}'", event);
        self.outbound
            .send(Outbound::Frame(encode_frame(event, &data, None)))
            .map_err(|_| ChatError::ChannelClosed)
    }

    async fn request(&self, event: &str, data: Value) -> Result<Value> {
        if !self.is_connected() {
            return Err(ChatError::NotConnected);
        }
        let id = self.core.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.core.pending.lock() {
            pending.insert(id, tx);
        }

        debug!("Requesting '{}' (ack {})", event, id);
        if self
            .outbound
            .send(Outbound::Frame(encode_frame(event, &data, Some(id))))
            .is_err()
        {
            self.core.resolve_abandoned(id);
            return Err(ChatError::ChannelClosed);
        }

        match tokio::time::timeout(self.options.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ChatError::ChannelClosed),
            Err(_) => {
                self.core.resolve_abandoned(id);
                warn!("No acknowledgement for '{}' within {:?}", event, self.options.request_timeout);
                Err(ChatError::RequestTimeout(event.to_string()))
            }
        }
    }

    fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.core.registry.register(filter)
    }
}

fn build_request(
    url: &str,
    token: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = url.into_client_request()?;
    let bearer: HeaderValue = format!("Bearer {}", token)
        .parse()
        .map_err(|_| ChatError::Config("session token is not a valid header value".to_string()))?;
    request.headers_mut().insert("Authorization", bearer);
    Ok(request)
}

fn next_backoff(current: Duration, options: &ChannelOptions) -> Duration {
    (current * 2).min(options.reconnect_max)
}

// Connection task: connect, pump frames until the socket drops, back off, repeat.
async fn run_connection(
    url: String,
    session: Session,
    options: ChannelOptions,
    core: Arc<Core>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut backoff = options.reconnect_min;

    loop {
        info!("Connecting to real-time channel at {}", url);
        let request = match build_request(&url, session.token()) {
            Ok(request) => request,
            Err(e) => {
                error!("Cannot build channel request: {}", e);
                return;
            }
        };

        match tokio_tungstenite::connect_async(request).await {
            Ok((socket, _)) => {
                info!("Real-time channel connected");
                backoff = options.reconnect_min;
                core.set_connected(true);

                let (mut sink, mut stream) = socket.split();
                let stop = loop {
                    tokio::select! {
                        frame = stream.next() => match frame {
                            Some(Ok(WsMessage::Text(text))) => {
                                match decode_frame(&text, session.user_id()) {
                                    Ok(Inbound::Event(event)) => core.registry.dispatch(&event),
                                    Ok(Inbound::Ack { id, data }) => core.resolve(id, data),
                                    Ok(Inbound::Ignored(name)) => debug!("Ignoring channel event '{}'", name),
                                    Err(e) => warn!("Dropping malformed channel frame: {}", e),
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => {
                                warn!("Real-time channel closed by server");
                                break false;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!("Real-time channel error: {}", e);
                                break false;
                            }
                        },
                        outgoing = outbound_rx.recv() => match outgoing {
                            Some(Outbound::Frame(text)) => {
                                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                                    error!("Failed to write to real-time channel: {}", e);
                                    break false;
                                }
                            }
                            Some(Outbound::Close) | None => {
                                let _ = sink.send(WsMessage::Close(None)).await;
                                break true;
                            }
                        },
                    }
                };

                core.set_connected(false);
                core.fail_pending();
                if stop {
                    info!("Real-time channel shut down");
                    return;
                }
            }
            Err(e) => {
                warn!("Real-time channel connection failed: {}", e);
            }
        }

        // jitter keeps a fleet of clients from reconnecting in lockstep
        let jitter = Duration::from_millis(rand::random::<u64>() % 250);
        info!("Reconnecting to real-time channel in {:?}", backoff + jitter);
        let shutdown = tokio::select! {
            _ = tokio::time::sleep(backoff + jitter) => false,
            outgoing = drain_while_offline(&mut outbound_rx) => outgoing,
        };
        if shutdown {
            info!("Real-time channel shut down while offline");
            return;
        }
        backoff = next_backoff(backoff, &options);
    }
}

// Frames queued while offline are dropped; only a close or the last handle going away matters.
async fn drain_while_offline(outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>) -> bool {
    loop {
        match outbound_rx.recv().await {
            Some(Outbound::Frame(_)) => debug!("Dropping frame queued while offline"),
            Some(Outbound::Close) | None => return true,
        }
    }
}
