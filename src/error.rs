use thiserror::Error;

/// Errors surfaced by the chat synchronization core
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Websocket error: {0}")]
    Websocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Unexpected channel frame: {0}")]
    Protocol(String),

    #[error("Real-time channel is not connected")]
    NotConnected,

    #[error("Real-time channel closed")]
    ChannelClosed,

    #[error("Timed out waiting for '{0}' acknowledgement")]
    RequestTimeout(String),

    #[error("At most {0} attachments can be sent with one message")]
    AttachmentLimit(usize),

    #[error("Nothing to send")]
    EmptyMessage,

    #[error("A message is already being sent")]
    SendInProgress,

    #[error("No conversation is open")]
    NoOpenConversation,

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;
