// Conversation window synchronizer.
// Shows paginated history for exactly one open conversation, appends live
// messages from a subscription scoped to that conversation, and drives sending.
//
// Messages are kept oldest-first and keyed by id, so a message delivered twice
// (server echo after the POST response, or the other way round) shows up once.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

use super::api::ChatBackend;
use super::channel::{ChannelHandle, EventFilter, Subscription};
use super::compose::{Composer, StagedAttachment, Submission};
use super::event_names;
use super::notifications::Notifications;
use crate::error::{ChatError, Result};
use crate::models::{
    Attachment, Author, Conversation, DeliveryStatus, Message, OtherUser, Page, PresenceRecord, PresenceStatus,
};

/// Identifies one history fetch; results for another chat or an older switch are dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTicket {
    pub generation: u64,
    pub chat_id: String,
    pub page: u32,
    pub limit: u32,
}

/// What the view should do with its scroll position after an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollIntent {
    ToBottom,
    PreserveViewport,
    Stay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewMessageOutcome {
    /// Belongs to some other conversation
    Ignored,
    /// Already shown; the stored copy was refreshed
    Duplicate,
    /// Appended and the view should follow it
    AppendedScroll,
    /// Appended; the viewer gets a passive hint instead of a jump
    AppendedNotify,
}

/// A send in flight: the optimistic entry id plus what goes over the wire
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub local_id: String,
    pub chat_id: String,
    pub generation: u64,
    pub submission: Submission,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenChat {
    pub chat_id: String,
    pub other_user: OtherUser,
    pub status: PresenceStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

pub struct ConversationWindow {
    viewer_id: String,
    chat: Option<OpenChat>,
    messages: Vec<Message>,
    ids: HashSet<String>,
    page: u32,
    has_more: bool,
    loading: bool,
    page_size: u32,
    generation: u64,
    subscription: Option<Subscription>,
    composer: Composer,
}

impl ConversationWindow {
    pub fn new(viewer_id: &str, page_size: u32, attachment_cap: usize) -> Self {
        ConversationWindow {
            viewer_id: viewer_id.to_string(),
            chat: None,
            messages: Vec::new(),
            ids: HashSet::new(),
            page: 0,
            has_more: false,
            loading: false,
            page_size,
            generation: 0,
            subscription: None,
            composer: Composer::new(attachment_cap),
        }
    }

    pub fn chat(&self) -> Option<&OpenChat> {
        self.chat.as_ref()
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.chat.as_ref().map(|c| c.chat_id.as_str())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn composer_mut(&mut self) -> &mut Composer {
        &mut self.composer
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Open another conversation. Local history, paging and the old subscription
    /// are dropped and the new chat is joined. Marking it read goes through
    /// `confirm_read` so the unread counter only resets once the server agrees.
    /// Returns the ticket for page 1.
    pub fn switch_to(&mut self, conversation: &Conversation, channel: &dyn ChannelHandle) -> HistoryTicket {
        info!("Switching to conversation {}", conversation.id);
        self.generation += 1;
        self.subscription = None;
        self.messages.clear();
        self.ids.clear();
        self.page = 0;
        self.has_more = true;
        self.loading = true;
        self.chat = Some(OpenChat {
            chat_id: conversation.id.clone(),
            other_user: conversation.other_user.clone(),
            status: conversation.status,
            last_seen: conversation.last_seen,
        });

        self.attach(channel);

        HistoryTicket {
            generation: self.generation,
            chat_id: conversation.id.clone(),
            page: 1,
            limit: self.page_size,
        }
    }

    /// Join the open chat and listen for its new messages. The listener lives
    /// exactly as long as this conversation stays open.
    pub fn attach(&mut self, channel: &dyn ChannelHandle) {
        let Some(chat_id) = self.chat_id().map(str::to_string) else {
            return;
        };
        if channel.is_connected() {
            if let Err(e) = channel.emit(event_names::JOIN_CHAT, json!({"chatId": chat_id})) {
                warn!("Failed to join chat {}: {}", chat_id, e);
            }
        }
        if self.subscription.is_none() {
            self.subscription = Some(channel.subscribe(EventFilter::ChatMessages(chat_id)));
        }
    }

    /// Re-join after the channel reconnects
    pub fn on_reconnected(&mut self, channel: &dyn ChannelHandle) {
        if let Some(chat_id) = self.chat_id() {
            debug!("Re-joining chat {} after reconnect", chat_id);
        }
        self.attach(channel);
    }

    /// Close the conversation and drop its listener
    pub fn close(&mut self) {
        self.generation += 1;
        self.subscription = None;
        self.chat = None;
        self.messages.clear();
        self.ids.clear();
        self.page = 0;
        self.has_more = false;
        self.loading = false;
    }

    /// Drain whatever the subscription has buffered
    pub fn pending_events(&mut self) -> Vec<Message> {
        let mut drained = Vec::new();
        if let Some(subscription) = self.subscription.as_mut() {
            while let Some(event) = subscription.try_recv() {
                if let super::channel::ChannelEvent::NewMessage(message) = event {
                    drained.push(message);
                }
            }
        }
        drained
    }

    /// Ticket for the next older page, if any and nothing is in flight
    pub fn next_history_page(&mut self) -> Option<HistoryTicket> {
        let chat_id = self.chat_id()?.to_string();
        if !self.has_more || self.loading {
            return None;
        }
        self.loading = true;
        Some(HistoryTicket {
            generation: self.generation,
            chat_id,
            page: self.page + 1,
            limit: self.page_size,
        })
    }

    pub async fn fetch_history(backend: &dyn ChatBackend, ticket: &HistoryTicket) -> Result<Page<Message>> {
        backend
            .list_messages(&ticket.chat_id, ticket.page, ticket.limit)
            .await
    }

    /// Land a history page. `None` means the response was stale and dropped.
    pub fn apply_history(
        &mut self,
        ticket: &HistoryTicket,
        result: Result<Page<Message>>,
        notes: &mut Notifications,
    ) -> Option<ScrollIntent> {
        if ticket.generation != self.generation || self.chat_id() != Some(ticket.chat_id.as_str()) {
            debug!(
                "Dropping stale history page {} for chat {}",
                ticket.page, ticket.chat_id
            );
            return None;
        }
        self.loading = false;

        match result {
            Ok(page) => {
                // server pages are newest-first
                let mut older: Vec<Message> = page.items;
                older.reverse();
                older.retain(|m| !self.ids.contains(&m.id));
                for message in &older {
                    self.ids.insert(message.id.clone());
                }

                self.page = ticket.page;
                self.has_more = page.meta.has_more();

                if ticket.page <= 1 {
                    // live messages that raced ahead of page 1 stay after it
                    let live = std::mem::take(&mut self.messages);
                    self.messages = older;
                    self.messages.extend(live);
                    Some(ScrollIntent::ToBottom)
                } else {
                    older.extend(std::mem::take(&mut self.messages));
                    self.messages = older;
                    Some(ScrollIntent::PreserveViewport)
                }
            }
            Err(e) => {
                error!("Failed to load history page {} for chat {}: {}", ticket.page, ticket.chat_id, e);
                notes.error(format!("Could not load messages: {}", e));
                self.has_more = false;
                Some(ScrollIntent::Stay)
            }
        }
    }

    /// A `newMessage` event arrived
    pub fn on_new_message(&mut self, message: Message, notes: &mut Notifications) -> NewMessageOutcome {
        if self.chat_id() != Some(message.chat_id.as_str()) {
            debug!("Ignoring message {} for chat {}", message.id, message.chat_id);
            return NewMessageOutcome::Ignored;
        }
        if self.ids.contains(&message.id) {
            if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
                *existing = message;
            }
            return NewMessageOutcome::Duplicate;
        }

        let mine = message.is_mine();
        self.ids.insert(message.id.clone());
        self.messages.push(message);
        if mine {
            NewMessageOutcome::AppendedScroll
        } else {
            let name = self
                .chat
                .as_ref()
                .map(|c| c.other_user.name.clone())
                .unwrap_or_default();
            notes.info(format!("New message from {}", name));
            NewMessageOutcome::AppendedNotify
        }
    }

    /// Refresh the header's presence if the event is about the other party
    pub fn apply_presence(&mut self, user_id: &str, status: PresenceStatus, timestamp: Option<DateTime<Utc>>) {
        if let Some(chat) = self.chat.as_mut() {
            if chat.other_user.id == user_id {
                chat.status = status;
                if timestamp.is_some() {
                    chat.last_seen = timestamp;
                }
            }
        }
    }

    /// The other party is online exactly when the snapshot lists them
    pub fn apply_presence_snapshot(&mut self, snapshot: &[PresenceRecord]) {
        let Some(other) = self.chat.as_ref().map(|c| c.other_user.id.clone()) else {
            return;
        };
        match snapshot.iter().find(|r| r.user_id == other) {
            Some(record) => self.apply_presence(&other, PresenceStatus::Online, record.last_seen),
            None => self.apply_presence(&other, PresenceStatus::Offline, None),
        }
    }

    pub fn on_disconnect(&mut self) {
        if let Some(chat) = self.chat.as_mut() {
            chat.status = PresenceStatus::Offline;
        }
    }

    /// Stage a file for the next message; over the cap it is refused with a warning
    pub fn stage_attachment(&mut self, attachment: StagedAttachment, notes: &mut Notifications) -> bool {
        match self.composer.stage(attachment) {
            Ok(()) => true,
            Err(e) => {
                notes.warn(e.to_string());
                false
            }
        }
    }

    /// Start sending the compose state. Empty input is a no-op; so is a second
    /// submit while the first is still in flight. On success an optimistic
    /// pending entry is appended.
    pub fn begin_send(&mut self) -> Option<OutgoingMessage> {
        let chat_id = self.chat_id()?.to_string();
        let submission = match self.composer.begin() {
            Ok(submission) => submission,
            Err(ChatError::EmptyMessage) => return None,
            Err(e) => {
                debug!("Send not started: {}", e);
                return None;
            }
        };

        let local_id = format!("local-{}", Uuid::new_v4());
        let pending = Message {
            id: local_id.clone(),
            chat_id: chat_id.clone(),
            author: Author::Me,
            sender_id: self.viewer_id.clone(),
            text: submission.text.clone(),
            attachments: submission
                .attachments
                .iter()
                .map(|a| Attachment {
                    id: a.local_id.clone(),
                    filename: a.filename.clone(),
                    url: a.preview_url.clone(),
                    kind: a.kind,
                    size: a.size,
                    message_id: local_id.clone(),
                })
                .collect(),
            created_at: Utc::now(),
            delivery_status: DeliveryStatus::Pending,
        };
        self.ids.insert(local_id.clone());
        self.messages.push(pending);

        Some(OutgoingMessage {
            local_id,
            chat_id,
            generation: self.generation,
            submission,
        })
    }

    pub async fn deliver(backend: &dyn ChatBackend, outgoing: &OutgoingMessage) -> Result<Message> {
        backend
            .send_message(
                &outgoing.chat_id,
                &outgoing.submission.text,
                &outgoing.submission.attachments,
            )
            .await
    }

    /// Land a send result. Success swaps the pending entry for the server copy
    /// and clears the compose state; failure removes the pending entry and
    /// leaves the input for a manual retry.
    pub fn finish_send(
        &mut self,
        outgoing: &OutgoingMessage,
        result: Result<Message>,
        notes: &mut Notifications,
    ) -> ScrollIntent {
        let still_open = outgoing.generation == self.generation;

        match result {
            Ok(confirmed) => {
                self.composer.finish(&outgoing.submission, true);
                if !still_open {
                    return ScrollIntent::Stay;
                }
                self.remove_local(&outgoing.local_id);
                if self.ids.insert(confirmed.id.clone()) {
                    self.messages.push(confirmed);
                } else if let Some(existing) = self.messages.iter_mut().find(|m| m.id == confirmed.id) {
                    *existing = confirmed;
                }
                ScrollIntent::ToBottom
            }
            Err(e) => {
                error!("Failed to send message to chat {}: {}", outgoing.chat_id, e);
                self.composer.finish(&outgoing.submission, false);
                if still_open {
                    self.remove_local(&outgoing.local_id);
                }
                notes.error(format!("Message not sent: {}", e));
                ScrollIntent::Stay
            }
        }
    }

    fn remove_local(&mut self, local_id: &str) {
        if self.ids.remove(local_id) {
            self.messages.retain(|m| m.id != local_id);
        }
    }
}

/// Ask the server to mark `chat_id` read and wait for the acknowledgement
pub async fn confirm_read(channel: &dyn ChannelHandle, chat_id: &str) -> Result<()> {
    channel
        .request(event_names::MARK_AS_READ, json!({"chatId": chat_id}))
        .await
        .map(|_| ())
}
