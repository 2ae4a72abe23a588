// Data model for the chat synchronization core.
// Domain types live at the top of the file, the JSON shapes the backend and the
// real-time channel speak live in `wire` at the bottom.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fmt::Display;

use crate::session::is_viewer_id;

/// Placeholder shown when a conversation arrives without its other party
pub const UNKNOWN_USER: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceStatus {
    Online,
    #[default]
    Offline,
}

impl PresenceStatus {
    /// Anything other than "online" is treated as offline
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("online") {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OtherUser {
    pub id: String,
    pub name: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    File,
}

impl AttachmentKind {
    pub fn from_mime(mime: &str) -> Self {
        if mime.trim().to_ascii_lowercase().starts_with("image/") {
            AttachmentKind::Image
        } else {
            AttachmentKind::File
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub url: String,
    pub kind: AttachmentKind,
    pub size: u64,
    pub message_id: String,
}

/// Condensed view of a message's attachments for the conversation preview
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachmentSummary {
    pub count: usize,
    pub first_kind: Option<AttachmentKind>,
    pub first_filename: Option<String>,
}

impl AttachmentSummary {
    pub fn from_attachments(attachments: &[Attachment]) -> Self {
        AttachmentSummary {
            count: attachments.len(),
            first_kind: attachments.first().map(|a| a.kind),
            first_filename: attachments.first().map(|a| a.filename.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn describe(&self) -> Option<String> {
        if self.count == 0 {
            return None;
        }
        let noun = match self.first_kind {
            Some(AttachmentKind::Image) => "Photo",
            _ => "File",
        };
        Some(if self.count == 1 {
            match &self.first_filename {
                Some(name) if noun == "File" => format!("[{}] {}", noun, name),
                _ => format!("[{}]", noun),
            }
        } else {
            format!("[{} attachments]", self.count)
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LastMessage {
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub attachments: AttachmentSummary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub other_user: OtherUser,
    pub last_message: Option<LastMessage>,
    pub unread_count: u32,
    pub status: PresenceStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Conversation {
    /// One-line preview used in the sidebar
    pub fn preview(&self) -> String {
        match &self.last_message {
            None => String::new(),
            Some(last) if last.is_deleted => "This message was deleted".to_string(),
            Some(last) => {
                if !last.text.trim().is_empty() {
                    last.text.lines().next().unwrap_or_default().to_string()
                } else {
                    last.attachments.describe().unwrap_or_default()
                }
            }
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == PresenceStatus::Online
    }
}

/// Which side of the conversation wrote a message, relative to the viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Author {
    Me,
    Them,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum DeliveryStatus {
    Pending, // Optimistic local copy, not confirmed yet
    Sent,    // Confirmed by the server
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub author: Author,
    pub sender_id: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
}

impl Message {
    pub fn is_mine(&self) -> bool {
        self.author == Author::Me
    }

    /// Rendering time string in the viewer's zone
    pub fn time_label<Tz: TimeZone>(&self, tz: &Tz) -> String
    where
        Tz::Offset: Display,
    {
        self.created_at.with_timezone(tz).format("%H:%M").to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct PageMeta {
    #[serde(default)]
    pub page: u32,
    #[serde(default, rename = "totalPages", alias = "total_pages")]
    pub total_pages: u32,
}

impl PageMeta {
    pub fn has_more(&self) -> bool {
        self.page < self.total_pages
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub meta: PageMeta,
}

/// Identifiers arrive as JSON numbers or strings; keep them as strings
pub fn id_from_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Timestamps arrive as RFC 3339 strings or epoch milliseconds
pub fn time_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(id_from_value(&value))
}

fn de_opt_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(time_from_value))
}

pub mod wire {
    //! JSON payloads as they travel over REST and the real-time channel.

    use super::*;

    #[derive(Debug, Clone, Deserialize)]
    pub struct PageEnvelope<T> {
        #[serde(default = "Vec::new")]
        pub data: Vec<T>,
        #[serde(default)]
        pub meta: PageMeta,
    }

    impl<T> PageEnvelope<T> {
        pub fn into_page<U>(self, convert: impl FnMut(T) -> U) -> Page<U> {
            Page {
                items: self.data.into_iter().map(convert).collect(),
                meta: self.meta,
            }
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct UserDto {
        #[serde(deserialize_with = "de_id")]
        pub id: String,
        #[serde(default)]
        pub name: Option<String>,
        #[serde(default)]
        pub avatar: Option<String>,
    }

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    pub struct AttachmentDto {
        #[serde(default, deserialize_with = "de_id")]
        pub id: String,
        #[serde(default, alias = "filename")]
        pub file_name: String,
        #[serde(default, alias = "url")]
        pub file_url: String,
        #[serde(default, alias = "mime_type")]
        pub file_type: String,
        #[serde(default, alias = "size")]
        pub file_size: u64,
        #[serde(default, deserialize_with = "de_id")]
        pub message_id: String,
    }

    impl AttachmentDto {
        pub fn into_attachment(self, owner: &str) -> Attachment {
            Attachment {
                id: self.id,
                kind: AttachmentKind::from_mime(&self.file_type),
                filename: self.file_name,
                url: self.file_url,
                size: self.file_size,
                message_id: if self.message_id.is_empty() {
                    owner.to_string()
                } else {
                    self.message_id
                },
            }
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct LastMessageDto {
        #[serde(default, alias = "text")]
        pub message: Option<String>,
        #[serde(default, deserialize_with = "de_opt_time")]
        pub created_at: Option<DateTime<Utc>>,
        #[serde(default)]
        pub is_deleted: bool,
        #[serde(default)]
        pub attachments: Vec<AttachmentDto>,
    }

    impl LastMessageDto {
        pub fn into_last_message(self) -> LastMessage {
            let attachments: Vec<Attachment> = self
                .attachments
                .into_iter()
                .map(|a| a.into_attachment(""))
                .collect();
            LastMessage {
                text: self.message.unwrap_or_default(),
                created_at: self.created_at,
                is_deleted: self.is_deleted,
                attachments: AttachmentSummary::from_attachments(&attachments),
            }
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct ChatDto {
        #[serde(deserialize_with = "de_id")]
        pub id: String,
        #[serde(default)]
        pub other_user: Option<UserDto>,
        #[serde(default)]
        pub last_message: Option<LastMessageDto>,
        #[serde(default)]
        pub unread_count: u32,
        #[serde(default)]
        pub status: Option<String>,
        #[serde(default, deserialize_with = "de_opt_time")]
        pub last_seen: Option<DateTime<Utc>>,
    }

    impl ChatDto {
        pub fn into_conversation(self) -> Conversation {
            let other_user = match self.other_user {
                Some(user) => OtherUser {
                    id: user.id,
                    name: user
                        .name
                        .filter(|n| !n.trim().is_empty())
                        .unwrap_or_else(|| UNKNOWN_USER.to_string()),
                    avatar: user.avatar,
                },
                None => OtherUser {
                    id: String::new(),
                    name: UNKNOWN_USER.to_string(),
                    avatar: None,
                },
            };
            Conversation {
                id: self.id,
                other_user,
                last_message: self.last_message.map(LastMessageDto::into_last_message),
                unread_count: self.unread_count,
                status: self
                    .status
                    .as_deref()
                    .map(PresenceStatus::parse)
                    .unwrap_or_default(),
                last_seen: self.last_seen,
            }
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct MessageDto {
        #[serde(deserialize_with = "de_id")]
        pub id: String,
        #[serde(default, alias = "chatId", deserialize_with = "de_id")]
        pub chat_id: String,
        #[serde(default, alias = "senderId", deserialize_with = "de_id")]
        pub sender_id: String,
        #[serde(default, alias = "text")]
        pub message: Option<String>,
        #[serde(default)]
        pub attachments: Vec<AttachmentDto>,
        #[serde(default, alias = "createdAt", deserialize_with = "de_opt_time")]
        pub created_at: Option<DateTime<Utc>>,
    }

    impl MessageDto {
        /// `fallback_chat_id` covers history responses that omit the owning chat
        pub fn into_message(self, viewer_id: &str, fallback_chat_id: &str) -> Message {
            let author = if is_viewer_id(viewer_id, &self.sender_id) {
                Author::Me
            } else {
                Author::Them
            };
            let id = self.id;
            let attachments = self
                .attachments
                .into_iter()
                .map(|a| a.into_attachment(&id))
                .collect();
            Message {
                chat_id: if self.chat_id.is_empty() {
                    fallback_chat_id.to_string()
                } else {
                    self.chat_id
                },
                author,
                sender_id: self.sender_id,
                text: self.message.unwrap_or_default(),
                attachments,
                created_at: self.created_at.unwrap_or_else(Utc::now),
                delivery_status: DeliveryStatus::Sent,
                id,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    pub struct PresenceEvent {
        #[serde(rename = "userId", alias = "user_id", deserialize_with = "de_id")]
        pub user_id: String,
        #[serde(default)]
        pub status: String,
        #[serde(default, deserialize_with = "de_opt_time")]
        pub timestamp: Option<DateTime<Utc>>,
    }

    impl PresenceEvent {
        pub fn status(&self) -> PresenceStatus {
            PresenceStatus::parse(&self.status)
        }
    }

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    pub struct LatestMessageEvent {
        #[serde(alias = "chatId", deserialize_with = "de_id")]
        pub chat_id: String,
        #[serde(default, alias = "senderId", deserialize_with = "de_id")]
        pub sender_id: String,
        #[serde(default, alias = "text")]
        pub message: Option<String>,
        #[serde(default)]
        pub attachments: Vec<AttachmentDto>,
        #[serde(default, alias = "createdAt", deserialize_with = "de_opt_time")]
        pub created_at: Option<DateTime<Utc>>,
        #[serde(default, alias = "isDeleted")]
        pub is_deleted: bool,
    }

    impl LatestMessageEvent {
        pub fn to_last_message(&self) -> LastMessage {
            let attachments: Vec<Attachment> = self
                .attachments
                .iter()
                .cloned()
                .map(|a| a.into_attachment(""))
                .collect();
            LastMessage {
                text: self.message.clone().unwrap_or_default(),
                created_at: self.created_at,
                is_deleted: self.is_deleted,
                attachments: AttachmentSummary::from_attachments(&attachments),
            }
        }
    }

    /// One entry of the `getOnlineUsers` acknowledgement
    #[derive(Debug, Clone, Deserialize)]
    pub struct OnlineUserDto {
        #[serde(rename = "userId", alias = "user_id", deserialize_with = "de_id")]
        pub user_id: String,
        #[serde(default, rename = "lastSeen", alias = "last_seen", deserialize_with = "de_opt_time")]
        pub last_seen: Option<DateTime<Utc>>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct LoginResponse {
        pub token: String,
        pub user: UserDto,
    }
}
