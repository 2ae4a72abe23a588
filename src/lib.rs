// Re-export modules for the binary and integration tests
pub mod chat;
pub mod config;
pub mod error;
pub mod models;
pub mod session;

// Re-export main types for convenience
pub use error::{ChatError, Result};
pub use models::*;
pub use session::Session;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_conversation_preview_and_status() {
        let conversation = Conversation {
            id: "7".to_string(),
            other_user: OtherUser {
                id: "9".to_string(),
                name: "Dana".to_string(),
                avatar: None,
            },
            last_message: Some(LastMessage {
                text: "See you at the venue".to_string(),
                created_at: None,
                is_deleted: false,
                attachments: AttachmentSummary::default(),
            }),
            unread_count: 2,
            status: PresenceStatus::Online,
            last_seen: None,
        };

        assert!(conversation.is_online());
        assert_eq!(conversation.preview(), "See you at the venue");

        let offline = Conversation {
            status: PresenceStatus::Offline,
            ..conversation
        };
        assert!(!offline.is_online());
    }

    #[test]
    fn test_message_authorship_and_delivery_status() {
        let msg = Message {
            id: "msg123".to_string(),
            chat_id: "7".to_string(),
            author: Author::Me,
            sender_id: "100".to_string(),
            text: "Hello, world!".to_string(),
            attachments: Vec::new(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 5, 0).unwrap(),
            delivery_status: DeliveryStatus::Pending,
        };

        assert!(msg.is_mine());
        assert_eq!(msg.time_label(&Utc), "09:05");

        let sent = Message {
            delivery_status: DeliveryStatus::Sent,
            ..msg.clone()
        };
        assert_eq!(sent.delivery_status, DeliveryStatus::Sent);
        assert_ne!(sent, msg);
    }
}
