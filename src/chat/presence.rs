// Presence tracking for the conversation sidebar.
// Keeps the "online set" behind the avatar badges. Users move between online and
// offline only on explicit server events or a bulk snapshot; nothing times out locally.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use super::channel::ChannelHandle;
use super::event_names;
use crate::error::Result;
use crate::models::wire::OnlineUserDto;
use crate::models::{id_from_value, PresenceRecord, PresenceStatus};

#[derive(Debug, Default)]
pub struct PresenceTracker {
    records: HashMap<String, PresenceRecord>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        PresenceTracker::default()
    }

    /// Apply a single `userPresence` event
    ///
    /// # Arguments
    ///
    /// * `user_id` - The user whose status changed
    /// * `status` - The new status
    /// * `timestamp` - Server time of the change, kept as last-seen
    pub fn apply(&mut self, user_id: &str, status: PresenceStatus, timestamp: Option<DateTime<Utc>>) {
        debug!("Presence update: {} is now {}", user_id, status.as_str());
        let record = self
            .records
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceRecord {
                user_id: user_id.to_string(),
                status,
                last_seen: None,
            });
        record.status = status;
        if timestamp.is_some() {
            record.last_seen = timestamp;
        }
    }

    /// Replace the whole online set with a server snapshot
    pub fn replace_with_snapshot(&mut self, snapshot: &[PresenceRecord]) {
        self.records = snapshot
            .iter()
            .map(|record| (record.user_id.clone(), record.clone()))
            .collect();
        info!("Presence snapshot applied: {} users online", self.online_count());
    }

    /// Forget everyone; used when the channel drops so no badge stays stale-positive
    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.records
            .get(user_id)
            .map(|r| r.status == PresenceStatus::Online)
            .unwrap_or(false)
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.records.get(user_id)
    }

    pub fn online_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status == PresenceStatus::Online)
            .count()
    }
}

/// Decode the `getOnlineUsers` acknowledgement.
/// Accepts a list of `{userId, lastSeen}` objects, a bare list of ids, or either
/// of those wrapped in `{"users": [...]}`.
pub fn parse_online_users(value: &Value) -> Vec<PresenceRecord> {
    let list = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("users").or_else(|| map.get("data")) {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };

    list.iter()
        .filter_map(|item| match item {
            Value::Object(_) => match serde_json::from_value::<OnlineUserDto>(item.clone()) {
                Ok(dto) => Some(PresenceRecord {
                    user_id: dto.user_id,
                    status: PresenceStatus::Online,
                    last_seen: dto.last_seen,
                }),
                Err(e) => {
                    warn!("Skipping malformed online user entry: {}", e);
                    None
                }
            },
            Value::String(_) | Value::Number(_) => Some(PresenceRecord {
                user_id: id_from_value(item),
                status: PresenceStatus::Online,
                last_seen: None,
            }),
            _ => None,
        })
        .filter(|record| !record.user_id.is_empty())
        .collect()
}

/// Ask the channel for the current online set after letting the connection settle
pub async fn fetch_online_users(channel: &dyn ChannelHandle, delay: Duration) -> Result<Vec<PresenceRecord>> {
    tokio::time::sleep(delay).await;
    let reply = channel
        .request(event_names::GET_ONLINE_USERS, Value::Null)
        .await?;
    Ok(parse_online_users(&reply))
}
