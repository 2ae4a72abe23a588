// Chat synchronization: REST client, real-time channel, and the state the UI renders.

pub mod api;
pub mod channel;
pub mod compose;
pub mod conversations;
pub mod debounce;
pub mod notifications;
pub mod presence;
pub mod separators;
pub mod window;

pub use api::{ChatBackend, HttpBackend};
pub use channel::{ChannelEvent, ChannelHandle, ChannelOptions, EventFilter, RealtimeChannel, Subscription};
pub use compose::{Composer, StagedAttachment};
pub use conversations::{ConversationList, ListTicket};
pub use notifications::{Level, Notification, Notifications};
pub use presence::PresenceTracker;
pub use window::{ConversationWindow, HistoryTicket, NewMessageOutcome, ScrollIntent};

/// Event names spoken on the real-time channel
pub mod event_names {
    // server -> client
    pub const USER_PRESENCE: &str = "userPresence";
    pub const LATEST_MESSAGE: &str = "latestMessage";
    pub const NEW_MESSAGE: &str = "newMessage";

    // client -> server
    pub const GET_ONLINE_USERS: &str = "getOnlineUsers";
    pub const JOIN_CHAT: &str = "joinChat";
    pub const MARK_AS_READ: &str = "markAsRead";

    /// Reply to a request carrying an `ack` id
    pub const ACK: &str = "ack";
}
