// Day separators for the message pane.
// Pure grouping of an oldest-first message list into calendar-day buckets,
// labelled against the viewer's "now" in the viewer's own zone.

use chrono::{DateTime, NaiveDate, TimeZone};

use crate::models::Message;

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry<'a> {
    Separator(String),
    Message(&'a Message),
}

/// Label for a calendar day relative to `today`
pub fn day_label(day: NaiveDate, today: NaiveDate) -> String {
    if day == today {
        "Today".to_string()
    } else if today.pred_opt() == Some(day) {
        "Yesterday".to_string()
    } else if today.succ_opt() == Some(day) {
        "Tomorrow".to_string()
    } else {
        day.format("%B %-d, %Y").to_string()
    }
}

/// Interleave separators with messages: one separator before the first message
/// of each calendar day, in the zone of `now`.
pub fn group_by_day<'a, Tz: TimeZone>(messages: &'a [Message], now: &DateTime<Tz>) -> Vec<TimelineEntry<'a>> {
    let zone = now.timezone();
    let today = now.date_naive();
    let mut entries = Vec::with_capacity(messages.len() + 4);
    let mut current_day: Option<NaiveDate> = None;

    for message in messages {
        let day = message.created_at.with_timezone(&zone).date_naive();
        if current_day != Some(day) {
            entries.push(TimelineEntry::Separator(day_label(day, today)));
            current_day = Some(day);
        }
        entries.push(TimelineEntry::Message(message));
    }

    entries
}
