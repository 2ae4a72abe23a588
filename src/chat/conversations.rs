// Conversation list synchronizer.
// Owns the paginated, searchable list of conversations and keeps it live from
// presence and latest-message events. Network calls happen elsewhere; results come
// back with the ticket they were issued for so superseded ones can be dropped.

use log::{debug, error, info};
use std::time::{Duration, Instant};

use super::api::ChatBackend;
use super::debounce::Debouncer;
use super::notifications::Notifications;
use super::presence::PresenceTracker;
use crate::error::Result;
use crate::models::wire::{LatestMessageEvent, PresenceEvent};
use crate::models::{Conversation, Page, PresenceRecord, PresenceStatus};
use crate::session::is_viewer_id;

/// Identifies one list fetch; only the newest generation may land
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListTicket {
    pub generation: u64,
    pub page: u32,
    pub search: String,
}

#[derive(Debug)]
pub struct ConversationList {
    viewer_id: String,
    conversations: Vec<Conversation>,
    page: u32,
    has_more: bool,
    loading: bool,
    search: String,
    generation: u64,
    open_chat_id: Option<String>,
    online: PresenceTracker,
    search_input: Debouncer<String>,
}

impl ConversationList {
    pub fn new(viewer_id: &str, search_debounce: Duration) -> Self {
        ConversationList {
            viewer_id: viewer_id.to_string(),
            conversations: Vec::new(),
            page: 0,
            has_more: true,
            loading: false,
            search: String::new(),
            generation: 0,
            open_chat_id: None,
            online: PresenceTracker::new(),
            search_input: Debouncer::new(search_debounce),
        }
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, chat_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == chat_id)
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn search(&self) -> &str {
        &self.search
    }

    pub fn open_chat_id(&self) -> Option<&str> {
        self.open_chat_id.as_deref()
    }

    pub fn online(&self) -> &PresenceTracker {
        &self.online
    }

    /// True while a typed search term is waiting out the debounce delay
    pub fn is_search_pending(&self) -> bool {
        self.search_input.is_pending()
    }

    /// Start over from page 1 with `search`; earlier in-flight fetches become stale
    pub fn restart(&mut self, search: &str) -> ListTicket {
        self.search_input.cancel();
        self.generation += 1;
        self.search = search.trim().to_string();
        self.has_more = true;
        self.loading = true;
        ListTicket {
            generation: self.generation,
            page: 1,
            search: self.search.clone(),
        }
    }

    /// Ticket for the next page, if there is one and nothing is in flight
    pub fn next_page(&mut self) -> Option<ListTicket> {
        if !self.has_more || self.loading {
            return None;
        }
        self.loading = true;
        Some(ListTicket {
            generation: self.generation,
            page: self.page + 1,
            search: self.search.clone(),
        })
    }

    /// Feed a keystroke's worth of search text; the fetch waits for the input to settle
    pub fn set_search_input(&mut self, term: &str, now: Instant) {
        self.search_input.push(term.to_string(), now);
    }

    /// Returns a page-1 ticket once the debounced search term has settled
    pub fn poll_search(&mut self, now: Instant) -> Option<ListTicket> {
        let term = self.search_input.poll(now)?;
        if term.trim() == self.search && !self.conversations.is_empty() {
            debug!("Search term unchanged, skipping reload");
            return None;
        }
        info!("Searching conversations for '{}'", term.trim());
        Some(self.restart(&term))
    }

    pub async fn fetch(backend: &dyn ChatBackend, ticket: &ListTicket) -> Result<Page<Conversation>> {
        backend.list_chats(ticket.page, &ticket.search).await
    }

    /// Land a fetch result. Returns false when the ticket was superseded and the result dropped.
    pub fn apply_page(
        &mut self,
        ticket: &ListTicket,
        result: Result<Page<Conversation>>,
        notes: &mut Notifications,
    ) -> bool {
        if ticket.generation != self.generation {
            debug!(
                "Dropping stale conversation page {} (generation {} != {})",
                ticket.page, ticket.generation, self.generation
            );
            return false;
        }
        self.loading = false;

        match result {
            Ok(page) => {
                let mut incoming = page.items;
                for conversation in incoming.iter_mut() {
                    if let Some(record) = self.online.get(&conversation.other_user.id) {
                        conversation.status = record.status;
                        if record.last_seen.is_some() {
                            conversation.last_seen = record.last_seen;
                        }
                    }
                }

                if ticket.page <= 1 {
                    self.conversations = incoming;
                } else {
                    for conversation in incoming {
                        if !self.conversations.iter().any(|c| c.id == conversation.id) {
                            self.conversations.push(conversation);
                        }
                    }
                }
                self.page = ticket.page;
                self.has_more = page.meta.has_more();
                debug!(
                    "Conversation page {}/{} applied, {} conversations",
                    page.meta.page,
                    page.meta.total_pages,
                    self.conversations.len()
                );
            }
            Err(e) => {
                error!("Failed to load conversations (page {}): {}", ticket.page, e);
                notes.error(format!("Could not load conversations: {}", e));
                self.has_more = false;
            }
        }
        true
    }

    /// Load page `page` for `search` in one go
    pub async fn load_page(
        &mut self,
        backend: &dyn ChatBackend,
        page: u32,
        search: &str,
        notes: &mut Notifications,
    ) -> bool {
        let ticket = if page <= 1 || search.trim() != self.search {
            self.restart(search)
        } else {
            self.loading = true;
            ListTicket {
                generation: self.generation,
                page,
                search: self.search.clone(),
            }
        };
        let result = Self::fetch(backend, &ticket).await;
        self.apply_page(&ticket, result, notes)
    }

    pub fn open(&mut self, chat_id: Option<&str>) {
        self.open_chat_id = chat_id.map(str::to_string);
    }

    /// The server confirmed `chat_id` as read. An ack for a conversation the
    /// viewer already left is ignored; unread may have grown since.
    pub fn mark_read(&mut self, chat_id: &str) {
        if self.open_chat_id.as_deref() != Some(chat_id) {
            debug!("Read confirmation for chat {} which is no longer open", chat_id);
            return;
        }
        if let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == chat_id) {
            conversation.unread_count = 0;
        }
    }

    /// Apply a `userPresence` event. Returns true when the open conversation's
    /// other party was among those updated.
    pub fn apply_presence(&mut self, event: &PresenceEvent) -> bool {
        let status = event.status();
        self.online.apply(&event.user_id, status, event.timestamp);

        let mut touched_open = false;
        for conversation in self
            .conversations
            .iter_mut()
            .filter(|c| c.other_user.id == event.user_id)
        {
            conversation.status = status;
            if event.timestamp.is_some() {
                conversation.last_seen = event.timestamp;
            }
            if self.open_chat_id.as_deref() == Some(conversation.id.as_str()) {
                touched_open = true;
            }
        }
        touched_open
    }

    /// Replace the online set with the server's snapshot. Conversations whose
    /// other party is missing from it go offline.
    pub fn apply_presence_snapshot(&mut self, snapshot: &[PresenceRecord]) {
        self.online.replace_with_snapshot(snapshot);
        for conversation in self.conversations.iter_mut() {
            match snapshot.iter().find(|r| r.user_id == conversation.other_user.id) {
                Some(record) => {
                    conversation.status = PresenceStatus::Online;
                    if record.last_seen.is_some() {
                        conversation.last_seen = record.last_seen;
                    }
                }
                None => conversation.status = PresenceStatus::Offline,
            }
        }
    }

    /// Update the preview of the matching conversation and bump unread when it
    /// counts: not ours, not deleted, not the conversation on screen.
    pub fn apply_latest_message(&mut self, event: &LatestMessageEvent) {
        let open = self.open_chat_id.as_deref() == Some(event.chat_id.as_str());
        let from_viewer = is_viewer_id(&self.viewer_id, &event.sender_id);

        let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == event.chat_id) else {
            debug!("Latest message for chat {} which is not loaded", event.chat_id);
            return;
        };

        conversation.last_message = Some(event.to_last_message());
        if !from_viewer && !event.is_deleted && !open {
            conversation.unread_count += 1;
        }
    }

    /// Channel dropped: nobody is known to be online any more
    pub fn on_disconnect(&mut self) {
        self.online.clear();
        for conversation in self.conversations.iter_mut() {
            conversation.status = PresenceStatus::Offline;
        }
    }
}
