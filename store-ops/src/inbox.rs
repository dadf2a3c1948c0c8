//! HQ broadcast messages addressed to a store, with per-store read and
//! acknowledgement state.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::{
    model::USERS,
    table::{decode_all, row, Direction, Query, TableStore},
    DataAccessError,
};

const MESSAGE_TARGETS: &str = "message_targets";
const MESSAGES: &str = "messages";
const MESSAGE_READS: &str = "message_reads";
const READ_CONFLICT: [&str; 2] = ["message_id", "store_id"];

/// A broadcast as seen by one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxMessage {
    /// Message identifier.
    pub id: String,
    /// Headline.
    pub title: String,
    /// Message text.
    pub body: String,
    /// When HQ sent it.
    pub created_at: DateTime<Utc>,
    /// Announcements are highlighted above ordinary messages.
    pub is_announcement: bool,
    /// Whether HQ asked stores to acknowledge it.
    pub requires_ack: bool,
    /// Profile of the sender, if recorded.
    pub sender_user_id: Option<String>,
    /// Sender's display name, when it could be looked up.
    pub sender_name: Option<String>,
    /// Set when the store opened the message.
    pub read_at: Option<DateTime<Utc>>,
    /// Set when the store acknowledged the message.
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl InboxMessage {
    /// Returns `true` when the message asks for an acknowledgement the store
    /// has not given yet.
    pub fn needs_ack(&self) -> bool {
        self.requires_ack && self.acknowledged_at.is_none()
    }

    /// Sender line shown with the message.
    pub fn sender_label(&self) -> &str {
        self.sender_name.as_deref().unwrap_or("HQ")
    }
}

#[derive(Debug, Deserialize)]
struct TargetRow {
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRow {
    id: String,
    title: String,
    body: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    is_announcement: Option<bool>,
    #[serde(default)]
    requires_ack: Option<bool>,
    #[serde(default)]
    sender_user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SenderRow {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ReadRow {
    message_id: String,
    #[serde(default)]
    read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    acknowledged_at: Option<DateTime<Utc>>,
}

/// Read counts for the dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboxSummary {
    /// Messages in the inbox.
    pub total: usize,
    /// Messages the store has opened.
    pub read: usize,
    /// Messages not yet opened.
    pub unread: usize,
}

impl InboxSummary {
    /// Counts `messages` by read state.
    pub fn new(messages: &[InboxMessage]) -> Self {
        let unread = messages
            .iter()
            .filter(|message| message.read_at.is_none())
            .count();
        Self {
            total: messages.len(),
            read: messages.len() - unread,
            unread,
        }
    }
}

/// Splits messages into those sent within the last 24 hours and the rest,
/// keeping their order.
pub fn split_recent(
    messages: &[InboxMessage],
    now: DateTime<Utc>,
) -> (Vec<InboxMessage>, Vec<InboxMessage>) {
    messages
        .iter()
        .cloned()
        .partition(|message| now - message.created_at < Duration::hours(24))
}

/// Reads a store's inbox and records reads and acknowledgements.
#[derive(Debug, Clone)]
pub struct InboxService<Tables: TableStore> {
    tables: Tables,
}

impl<Tables: TableStore> InboxService<Tables> {
    /// Creates a service over `tables`.
    pub fn new(tables: Tables) -> Self {
        Self { tables }
    }

    /// Unresolved messages addressed to the store, newest first.
    ///
    /// Sender names are best effort: when they cannot be read the messages
    /// are returned without them.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn inbox_for_store(
        &self,
        store_id: &str,
    ) -> Result<Vec<InboxMessage>, DataAccessError> {
        let query = Query::table(MESSAGE_TARGETS).eq("store_id", store_id);
        let targets: Vec<TargetRow> = decode_all(self.tables.query_rows(&query).await?)?;
        let message_ids: Vec<String> = targets
            .into_iter()
            .filter_map(|target| target.message_id)
            .filter(|id| !id.is_empty())
            .collect();
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = Query::table(MESSAGES)
            .is_in("id", message_ids)
            .is_null("resolved_at")
            .order_by("created_at", Direction::Descending);
        let messages: Vec<MessageRow> = decode_all(self.tables.query_rows(&query).await?)?;
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let names = self.sender_names(&messages).await;

        let query = Query::table(MESSAGE_READS)
            .eq("store_id", store_id)
            .is_in("message_id", messages.iter().map(|m| m.id.as_str()));
        let reads: HashMap<String, ReadRow> =
            decode_all::<ReadRow>(self.tables.query_rows(&query).await?)?
                .into_iter()
                .map(|read| (read.message_id.clone(), read))
                .collect();

        Ok(messages
            .into_iter()
            .map(|message| {
                let read = reads.get(&message.id);
                let sender_name = message
                    .sender_user_id
                    .as_ref()
                    .and_then(|id| names.get(id).cloned());
                InboxMessage {
                    read_at: read.and_then(|r| r.read_at),
                    acknowledged_at: read.and_then(|r| r.acknowledged_at),
                    sender_name,
                    id: message.id,
                    title: message.title,
                    body: message.body,
                    created_at: message.created_at,
                    is_announcement: message.is_announcement.unwrap_or(false),
                    requires_ack: message.requires_ack.unwrap_or(false),
                    sender_user_id: message.sender_user_id,
                }
            })
            .collect())
    }

    async fn sender_names(&self, messages: &[MessageRow]) -> HashMap<String, String> {
        let sender_ids: HashSet<&str> = messages
            .iter()
            .filter_map(|message| message.sender_user_id.as_deref())
            .collect();
        if sender_ids.is_empty() {
            return HashMap::new();
        }

        let query = Query::table(USERS).is_in("id", sender_ids);
        match self
            .tables
            .query_rows(&query)
            .await
            .and_then(decode_all::<SenderRow>)
        {
            Ok(senders) => senders
                .into_iter()
                .map(|sender| (sender.id, sender.name))
                .collect(),
            Err(err) => {
                tracing::warn!(error = %err, "sender names unavailable");
                HashMap::new()
            }
        }
    }

    /// Records that the store opened a message.
    #[tracing::instrument(level = "debug", skip(self, now), err)]
    pub async fn mark_read(
        &self,
        store_id: &str,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DataAccessError> {
        let read = row(json!({
            "message_id": message_id,
            "store_id": store_id,
            "read_at": now,
        }));
        self.tables
            .upsert(MESSAGE_READS, read, &READ_CONFLICT)
            .await?;
        Ok(())
    }

    /// Records that the store acknowledged a message.
    #[tracing::instrument(level = "debug", skip(self, now), err)]
    pub async fn acknowledge(
        &self,
        store_id: &str,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DataAccessError> {
        let ack = row(json!({
            "message_id": message_id,
            "store_id": store_id,
            "acknowledged_at": now,
        }));
        self.tables
            .upsert(MESSAGE_READS, ack, &READ_CONFLICT)
            .await?;
        Ok(())
    }
}
