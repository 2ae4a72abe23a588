// Integration tests for the conversation window synchronizer
// History paging, live messages through the channel, and the send path.

mod common;

use std::time::Duration;

use chrono::{FixedOffset, TimeZone};
use serde_json::json;

use common::{setup_logging, FakeChannel, ScriptedBackend};
use gigchat::chat::compose::StagedAttachment;
use gigchat::chat::separators::{group_by_day, TimelineEntry};
use gigchat::chat::window::confirm_read;
use gigchat::chat::{
    ChannelEvent, ConversationList, ConversationWindow, NewMessageOutcome, Notifications, ScrollIntent,
};
use gigchat::models::wire::MessageDto;
use gigchat::models::{DeliveryStatus, Message};

fn conversations(backend: &ScriptedBackend) {
    backend.with_chats(
        1,
        "",
        json!({
            "data": [
                {"id": 1, "other_user": {"id": 9, "name": "Ann"}, "unread_count": 3},
                {"id": 2, "other_user": {"id": 8, "name": "Bo"}}
            ],
            "meta": {"page": 1, "totalPages": 1}
        }),
    );
}

fn history(ids: &[u64], chat_id: u64, page: u32, total_pages: u32) -> serde_json::Value {
    let data: Vec<_> = ids
        .iter()
        .map(|id| {
            let sender_id = if id % 2 == 0 { 100 } else { 9 };
            json!({
                "id": id,
                "chat_id": chat_id,
                "sender_id": sender_id,
                "message": format!("message {}", id),
                "created_at": format!("2024-05-{:02}T12:00:00Z", 1 + id)
            })
        })
        .collect();
    json!({"data": data, "meta": {"page": page, "totalPages": total_pages}})
}

fn incoming(id: u64, chat_id: u64, sender_id: u64) -> Message {
    let dto: MessageDto = serde_json::from_value(json!({
        "id": id,
        "chatId": chat_id,
        "senderId": sender_id,
        "text": "live"
    }))
    .unwrap();
    dto.into_message("100", "")
}

fn notes() -> Notifications {
    Notifications::new(Duration::from_secs(4))
}

async fn loaded_list(backend: &ScriptedBackend, notes: &mut Notifications) -> ConversationList {
    conversations(backend);
    let mut list = ConversationList::new("100", Duration::from_millis(400));
    list.load_page(backend, 1, "", notes).await;
    list
}

#[tokio::test]
async fn test_open_loads_history_and_confirms_read() {
    setup_logging();
    let backend = ScriptedBackend::new("100");
    backend.with_messages("1", 1, history(&[4, 3], 1, 1, 2));
    backend.with_messages("1", 2, history(&[2, 1], 1, 2, 2));
    let channel = FakeChannel::new(true);
    let mut notes = notes();
    let mut list = loaded_list(&backend, &mut notes).await;
    let mut window = ConversationWindow::new("100", 2, 5);

    let conversation = list.get("1").cloned().unwrap();
    list.open(Some("1"));
    let ticket = window.switch_to(&conversation, &channel);
    let page = ConversationWindow::fetch_history(backend.as_ref(), &ticket).await;
    assert_eq!(window.apply_history(&ticket, page, &mut notes), Some(ScrollIntent::ToBottom));

    confirm_read(&channel, "1").await.unwrap();
    list.mark_read("1");
    assert_eq!(list.get("1").unwrap().unread_count, 0);

    let older = window.next_history_page().unwrap();
    let page = ConversationWindow::fetch_history(backend.as_ref(), &older).await;
    assert_eq!(
        window.apply_history(&older, page, &mut notes),
        Some(ScrollIntent::PreserveViewport)
    );

    let ids: Vec<&str> = window.messages().iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3", "4"]);
    assert!(!window.has_more());
    assert!(backend.calls().contains(&"list_messages 1 2 2".to_string()));

    let names: Vec<String> = channel.emitted().into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["joinChat", "markAsRead"]);
}

#[tokio::test]
async fn test_switch_discards_in_flight_history() {
    setup_logging();
    let backend = ScriptedBackend::new("100");
    backend.with_messages("1", 1, history(&[3], 1, 1, 1));
    backend.with_messages("2", 1, history(&[7], 2, 1, 1));
    let channel = FakeChannel::new(true);
    let mut notes = notes();
    let list = loaded_list(&backend, &mut notes).await;
    let mut window = ConversationWindow::new("100", 20, 5);

    let first = window.switch_to(list.get("1").unwrap(), &channel);
    let second = window.switch_to(list.get("2").unwrap(), &channel);

    let late = ConversationWindow::fetch_history(backend.as_ref(), &first).await;
    let current = ConversationWindow::fetch_history(backend.as_ref(), &second).await;
    assert!(window.apply_history(&second, current, &mut notes).is_some());
    assert!(window.apply_history(&first, late, &mut notes).is_none());

    assert_eq!(window.messages().len(), 1);
    assert_eq!(window.messages()[0].id, "7");
    // only the second conversation is still listened to
    assert_eq!(channel.listeners(), 1);
}

#[tokio::test]
async fn test_live_messages_filtered_and_deduplicated() {
    setup_logging();
    let backend = ScriptedBackend::new("100");
    let channel = FakeChannel::new(true);
    let mut notes = notes();
    let list = loaded_list(&backend, &mut notes).await;
    let mut window = ConversationWindow::new("100", 20, 5);
    window.switch_to(list.get("1").unwrap(), &channel);

    channel.push(ChannelEvent::NewMessage(incoming(50, 1, 9)));
    channel.push(ChannelEvent::NewMessage(incoming(51, 2, 8)));
    channel.push(ChannelEvent::NewMessage(incoming(50, 1, 9)));

    let outcomes: Vec<NewMessageOutcome> = window
        .pending_events()
        .into_iter()
        .map(|m| window.on_new_message(m, &mut notes))
        .collect();
    assert_eq!(
        outcomes,
        vec![NewMessageOutcome::AppendedNotify, NewMessageOutcome::Duplicate]
    );
    assert_eq!(window.messages().len(), 1);

    window.close();
    assert_eq!(channel.listeners(), 0);
    channel.push(ChannelEvent::NewMessage(incoming(52, 1, 9)));
    assert!(window.pending_events().is_empty());
}

#[tokio::test]
async fn test_send_with_attachment_and_echo() {
    setup_logging();
    let backend = ScriptedBackend::new("100");
    let channel = FakeChannel::new(true);
    let mut notes = notes();
    let list = loaded_list(&backend, &mut notes).await;
    let mut window = ConversationWindow::new("100", 20, 5);
    window.switch_to(list.get("1").unwrap(), &channel);

    // nothing to send
    assert!(window.begin_send().is_none());
    assert!(backend.calls().iter().all(|c| !c.starts_with("send_message")));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rider.pdf");
    std::fs::write(&path, b"%PDF-1.4").unwrap();
    assert!(window.stage_attachment(StagedAttachment::from_path(&path).unwrap(), &mut notes));
    window.composer_mut().set_text("tech rider attached");

    let outgoing = window.begin_send().unwrap();
    assert_eq!(window.messages()[0].delivery_status, DeliveryStatus::Pending);
    assert_eq!(window.messages()[0].attachments.len(), 1);

    let result = ConversationWindow::deliver(backend.as_ref(), &outgoing).await;
    let confirmed = result.as_ref().unwrap().clone();
    assert_eq!(window.finish_send(&outgoing, result, &mut notes), ScrollIntent::ToBottom);

    // the server echo of our own message arrives afterwards
    assert_eq!(
        window.on_new_message(confirmed, &mut notes),
        NewMessageOutcome::Duplicate
    );
    assert_eq!(window.messages().len(), 1);
    assert_eq!(window.messages()[0].delivery_status, DeliveryStatus::Sent);
    assert!(window.composer().is_empty());
    assert_eq!(
        backend.calls().last().map(String::as_str),
        Some("send_message 1 tech rider attached 1")
    );
}

#[tokio::test]
async fn test_failed_send_preserves_compose() {
    setup_logging();
    let backend = ScriptedBackend::new("100");
    backend.fail("send_message");
    let channel = FakeChannel::new(true);
    let mut notes = notes();
    let list = loaded_list(&backend, &mut notes).await;
    let mut window = ConversationWindow::new("100", 20, 5);
    window.switch_to(list.get("1").unwrap(), &channel);

    window.composer_mut().set_text("are you free friday?");
    let outgoing = window.begin_send().unwrap();
    let result = ConversationWindow::deliver(backend.as_ref(), &outgoing).await;
    assert_eq!(window.finish_send(&outgoing, result, &mut notes), ScrollIntent::Stay);

    assert!(window.messages().is_empty());
    assert_eq!(window.composer().text(), "are you free friday?");
    assert!(!window.composer().is_sending());
    assert!(notes.latest().unwrap().text.starts_with("Message not sent"));
}

#[tokio::test]
async fn test_history_gets_day_separators() {
    setup_logging();
    let backend = ScriptedBackend::new("100");
    backend.with_messages("1", 1, history(&[3, 2, 1], 1, 1, 1));
    let channel = FakeChannel::new(false);
    let mut notes = notes();
    let list = loaded_list(&backend, &mut notes).await;
    let mut window = ConversationWindow::new("100", 20, 5);

    let ticket = window.switch_to(list.get("1").unwrap(), &channel);
    let page = ConversationWindow::fetch_history(backend.as_ref(), &ticket).await;
    window.apply_history(&ticket, page, &mut notes);

    // messages fall on May 2, 3 and 4 (ids 1, 2, 3)
    let tz = FixedOffset::east_opt(0).unwrap();
    let now = tz.with_ymd_and_hms(2024, 5, 4, 18, 0, 0).unwrap();
    let labels: Vec<String> = group_by_day(window.messages(), &now)
        .into_iter()
        .filter_map(|entry| match entry {
            TimelineEntry::Separator(label) => Some(label),
            TimelineEntry::Message(_) => None,
        })
        .collect();
    assert_eq!(labels, vec!["May 2, 2024", "Yesterday", "Today"]);
    // offline switch joins nothing
    assert!(channel.emitted().is_empty());
}

#[tokio::test]
async fn test_confirmed_send_keeps_draft_for_next_conversation() {
    setup_logging();
    let backend = ScriptedBackend::new("100");
    let channel = FakeChannel::new(true);
    let mut notes = notes();
    let list = loaded_list(&backend, &mut notes).await;
    let mut window = ConversationWindow::new("100", 20, 5);
    window.switch_to(list.get("1").unwrap(), &channel);

    window.composer_mut().set_text("see you at soundcheck");
    let outgoing = window.begin_send().unwrap();

    // the viewer moves on and starts a new draft while the send is in flight
    window.switch_to(list.get("2").unwrap(), &channel);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("map.png");
    std::fs::write(&path, b"png").unwrap();
    assert!(window.stage_attachment(StagedAttachment::from_path(&path).unwrap(), &mut notes));
    window.composer_mut().set_text("directions attached");

    let result = ConversationWindow::deliver(backend.as_ref(), &outgoing).await;
    assert_eq!(window.finish_send(&outgoing, result, &mut notes), ScrollIntent::Stay);

    assert!(window.messages().is_empty());
    assert_eq!(window.composer().text(), "directions attached");
    assert_eq!(window.composer().attachments().len(), 1);
    assert!(!window.composer().is_sending());
}
