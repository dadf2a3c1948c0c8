//! Conversations a store starts with HQ.
//!
//! A store opens a thread with a subject and a first message; HQ and the
//! store then reply in turn. Once HQ resolves a thread it disappears from the
//! store's list and can no longer be replied to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    model::AppUser,
    table::{decode, decode_all, row, Direction, Query, TableStore},
    DataAccessError,
};

const HQ_THREADS: &str = "hq_threads";
const HQ_MESSAGES: &str = "hq_messages";
const RESOLVED: &str = "resolved";

/// Which side of the conversation wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    /// The store's staff.
    Store,
    /// Head office.
    Hq,
}

/// A conversation between one store and HQ.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HqThread {
    /// Thread identifier.
    pub id: String,
    /// The store on the other side of the conversation.
    pub store_id: String,
    /// Subject line given when the thread was opened.
    pub subject: String,
    /// `open`, `resolved`, or unset.
    #[serde(default)]
    pub status: Option<String>,
    /// Profile that opened the thread.
    #[serde(default)]
    pub created_by_user_id: Option<String>,
    /// When the thread was opened.
    pub created_at: DateTime<Utc>,
    /// Time of the newest message, used for ordering.
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl HqThread {
    /// Returns `true` once HQ has closed the conversation.
    pub fn is_resolved(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|status| status.eq_ignore_ascii_case(RESOLVED))
    }
}

/// One message in a thread.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HqMessage {
    /// Message identifier.
    pub id: String,
    /// The thread it belongs to.
    pub thread_id: String,
    /// Which side wrote it.
    pub sender_role: SenderRole,
    /// Profile of the author, if recorded.
    #[serde(default)]
    pub sender_user_id: Option<String>,
    /// Message text.
    pub body: String,
    /// When it was sent.
    pub created_at: DateTime<Utc>,
    /// When HQ read it.
    #[serde(default)]
    pub hq_read_at: Option<DateTime<Utc>>,
    /// When the store read it.
    #[serde(default)]
    pub store_read_at: Option<DateTime<Utc>>,
}

impl HqMessage {
    /// Returns `true` for an HQ message the store has not seen.
    pub fn is_unread_from_hq(&self) -> bool {
        self.sender_role == SenderRole::Hq && self.store_read_at.is_none()
    }
}

/// A store's open threads with all their messages, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadList {
    /// Unresolved threads, most recently active first.
    pub threads: Vec<HqThread>,
    /// Messages of those threads, newest first.
    pub messages: Vec<HqMessage>,
}

impl ThreadList {
    /// The most recent message in a thread.
    pub fn latest_message(&self, thread_id: &str) -> Option<&HqMessage> {
        self.messages
            .iter()
            .find(|message| message.thread_id == thread_id)
    }

    /// Count of HQ messages in a thread the store has not seen.
    pub fn unread_from_hq(&self, thread_id: &str) -> usize {
        self.unread_ids(thread_id).len()
    }

    /// Count of unseen HQ messages across every thread.
    pub fn total_unread_from_hq(&self) -> usize {
        self.messages
            .iter()
            .filter(|message| message.is_unread_from_hq())
            .count()
    }

    fn unread_ids(&self, thread_id: &str) -> Vec<&str> {
        self.messages
            .iter()
            .filter(|message| message.thread_id == thread_id && message.is_unread_from_hq())
            .map(|message| message.id.as_str())
            .collect()
    }
}

/// A thread opened for reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadView {
    /// The thread row.
    pub thread: HqThread,
    /// Oldest first. Empty once the thread is resolved.
    pub messages: Vec<HqMessage>,
}

/// An error from a thread operation.
#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    /// The subject was blank.
    #[error("Please add a subject.")]
    EmptySubject,

    /// The message body was blank.
    #[error("Please write a message.")]
    EmptyBody,

    /// No thread has the given id.
    #[error("thread `{0}` was not found")]
    NotFound(String),

    /// HQ closed the thread; stores cannot reopen it.
    #[error("This thread has been resolved by HQ.")]
    Resolved,

    /// A lookup or write failed.
    #[error(transparent)]
    DataAccess(#[from] DataAccessError),
}

#[derive(Debug, Deserialize)]
struct Inserted {
    id: String,
}

/// Reads and writes a store's threads with HQ.
#[derive(Debug, Clone)]
pub struct ThreadService<Tables: TableStore> {
    tables: Tables,
}

impl<Tables: TableStore> ThreadService<Tables> {
    /// Creates a service over `tables`.
    pub fn new(tables: Tables) -> Self {
        Self { tables }
    }

    /// Threads HQ has not resolved, most recently active first, with their
    /// messages.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn threads_for_store(&self, store_id: &str) -> Result<ThreadList, DataAccessError> {
        let query = Query::table(HQ_THREADS)
            .eq("store_id", store_id)
            .null_or_neq("status", RESOLVED)
            .order_by("last_message_at", Direction::Descending);
        let threads: Vec<HqThread> = decode_all(self.tables.query_rows(&query).await?)?;
        if threads.is_empty() {
            return Ok(ThreadList::default());
        }

        let query = Query::table(HQ_MESSAGES)
            .is_in("thread_id", threads.iter().map(|thread| thread.id.as_str()))
            .order_by("created_at", Direction::Descending);
        let messages = decode_all(self.tables.query_rows(&query).await?)?;

        Ok(ThreadList { threads, messages })
    }

    /// Starts a thread with its first message and returns the thread id.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(store.id = %store_id, user.id = %author.id),
        err
    )]
    pub async fn create_thread(
        &self,
        store_id: &str,
        author: &AppUser,
        subject: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<String, ThreadError> {
        let subject = subject.trim();
        let body = body.trim();
        if subject.is_empty() {
            return Err(ThreadError::EmptySubject);
        }
        if body.is_empty() {
            return Err(ThreadError::EmptyBody);
        }

        let thread = row(json!({
            "store_id": store_id,
            "subject": subject,
            "status": "open",
            "created_by_user_id": author.id,
            "created_at": now,
            "last_message_at": now,
        }));
        let Inserted { id } = decode(self.tables.insert(HQ_THREADS, thread).await?)?;

        self.insert_store_message(&id, author, body, now).await?;
        tracing::debug!(thread.id = %id, "thread created");

        Ok(id)
    }

    /// Loads a thread for reading and marks HQ's messages in it as seen.
    ///
    /// Failing to record the reads is logged and otherwise ignored.
    #[tracing::instrument(level = "debug", skip(self, now), err)]
    pub async fn open_thread(
        &self,
        thread_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ThreadView>, DataAccessError> {
        let Some(thread) = self.thread(thread_id).await? else {
            return Ok(None);
        };

        if thread.is_resolved() {
            return Ok(Some(ThreadView {
                thread,
                messages: Vec::new(),
            }));
        }

        let query = Query::table(HQ_MESSAGES)
            .eq("thread_id", thread_id)
            .order_by("created_at", Direction::Ascending);
        let mut messages: Vec<HqMessage> = decode_all(self.tables.query_rows(&query).await?)?;

        let unread: Vec<String> = messages
            .iter()
            .filter(|message| message.is_unread_from_hq())
            .map(|message| message.id.clone())
            .collect();

        if !unread.is_empty() {
            match self.stamp_store_read(&unread, now).await {
                Ok(()) => {
                    for message in messages.iter_mut() {
                        if unread.contains(&message.id) {
                            message.store_read_at = Some(now);
                        }
                    }
                }
                Err(err) => tracing::warn!(error = %err, "failed to mark messages read"),
            }
        }

        Ok(Some(ThreadView { thread, messages }))
    }

    /// Marks HQ's unseen messages in one thread of `list` as seen. Returns how
    /// many were marked.
    #[tracing::instrument(level = "debug", skip(self, list, now), err)]
    pub async fn mark_hq_messages_read(
        &self,
        list: &ThreadList,
        thread_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, DataAccessError> {
        let unread = list.unread_ids(thread_id);
        if unread.is_empty() {
            return Ok(0);
        }

        self.stamp_store_read(&unread, now).await?;
        Ok(unread.len())
    }

    /// Adds a store message to a thread and moves the thread to the top of
    /// HQ's queue.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(thread.id = %thread_id, user.id = %author.id),
        err
    )]
    pub async fn reply(
        &self,
        thread_id: &str,
        author: &AppUser,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ThreadError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ThreadError::EmptyBody);
        }

        let thread = self
            .thread(thread_id)
            .await?
            .ok_or_else(|| ThreadError::NotFound(thread_id.to_string()))?;
        if thread.is_resolved() {
            return Err(ThreadError::Resolved);
        }

        self.insert_store_message(thread_id, author, body, now)
            .await?;

        let bump = row(json!({ "last_message_at": now, "status": "open" }));
        let query = Query::table(HQ_THREADS).eq("id", thread_id);
        if let Err(err) = self.tables.update(&query, bump).await {
            tracing::warn!(error = %err, "failed to update thread activity");
        }

        Ok(())
    }

    async fn thread(&self, thread_id: &str) -> Result<Option<HqThread>, DataAccessError> {
        let query = Query::table(HQ_THREADS).eq("id", thread_id);
        self.tables
            .query_row(&query)
            .await?
            .map(decode)
            .transpose()
    }

    async fn insert_store_message(
        &self,
        thread_id: &str,
        author: &AppUser,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DataAccessError> {
        let message = row(json!({
            "thread_id": thread_id,
            "sender_role": SenderRole::Store,
            "sender_user_id": author.id,
            "body": body,
            "created_at": now,
        }));
        self.tables.insert(HQ_MESSAGES, message).await?;
        Ok(())
    }

    async fn stamp_store_read<Id: AsRef<str>>(
        &self,
        message_ids: &[Id],
        now: DateTime<Utc>,
    ) -> Result<(), DataAccessError> {
        let query = Query::table(HQ_MESSAGES)
            .is_in("id", message_ids.iter().map(|id| id.as_ref()));
        self.tables
            .update(&query, row(json!({ "store_read_at": now })))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::{model::Role, MemoryStore};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap()
    }

    fn manager() -> AppUser {
        AppUser {
            id: "u-1".to_string(),
            auth_user_id: "auth-1".to_string(),
            name: "Meera".to_string(),
            role: Role::StoreManager,
        }
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .seed(
                HQ_THREADS,
                [
                    row(json!({ "id": "th-1", "store_id": "s-1", "subject": "Broken freezer", "status": "open", "created_at": "2024-05-01T09:00:00Z", "last_message_at": "2024-05-02T09:00:00Z" })),
                    row(json!({ "id": "th-2", "store_id": "s-1", "subject": "Uniforms", "status": null, "created_at": "2024-05-03T09:00:00Z", "last_message_at": "2024-05-04T09:00:00Z" })),
                    row(json!({ "id": "th-3", "store_id": "s-1", "subject": "Closed", "status": "resolved", "created_at": "2024-05-01T09:00:00Z", "last_message_at": "2024-05-05T09:00:00Z" })),
                ],
            )
            .await;
        store
            .seed(
                HQ_MESSAGES,
                [
                    row(json!({ "id": "hm-1", "thread_id": "th-1", "sender_role": "store", "body": "It is warm", "created_at": "2024-05-01T09:00:00Z" })),
                    row(json!({ "id": "hm-2", "thread_id": "th-1", "sender_role": "hq", "body": "Technician booked", "created_at": "2024-05-02T09:00:00Z", "store_read_at": null })),
                    row(json!({ "id": "hm-3", "thread_id": "th-2", "sender_role": "hq", "body": "Sizes?", "created_at": "2024-05-04T09:00:00Z" })),
                    row(json!({ "id": "hm-4", "thread_id": "th-2", "sender_role": "hq", "body": "Seen", "created_at": "2024-05-03T10:00:00Z", "store_read_at": "2024-05-03T11:00:00Z" })),
                    row(json!({ "id": "hm-5", "thread_id": "th-3", "sender_role": "hq", "body": "Done", "created_at": "2024-05-05T09:00:00Z" })),
                ],
            )
            .await;
        store
    }

    #[tokio::test]
    async fn test_threads_for_store() {
        let service = ThreadService::new(seeded().await);

        let list = service.threads_for_store("s-1").await.unwrap();
        let ids: Vec<&str> = list.threads.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["th-2", "th-1"]);

        assert_eq!(list.latest_message("th-1").unwrap().id, "hm-2");
        assert_eq!(list.latest_message("th-2").unwrap().id, "hm-3");
        assert_eq!(list.unread_from_hq("th-1"), 1);
        assert_eq!(list.unread_from_hq("th-2"), 1);
        assert_eq!(list.total_unread_from_hq(), 2);

        let empty = service.threads_for_store("s-9").await.unwrap();
        assert_eq!(empty, ThreadList::default());
    }

    #[tokio::test]
    async fn test_create_thread_validates_and_inserts() {
        let tables = MemoryStore::new();
        let service = ThreadService::new(tables.clone());

        let err = service
            .create_thread("s-1", &manager(), "   ", "hello", now())
            .await
            .unwrap_err();
        assert!(matches!(err, ThreadError::EmptySubject));

        let err = service
            .create_thread("s-1", &manager(), "Help", "\n", now())
            .await
            .unwrap_err();
        assert!(matches!(err, ThreadError::EmptyBody));
        assert!(tables.rows(HQ_THREADS).await.is_empty());

        let id = service
            .create_thread("s-1", &manager(), "  Leaking roof ", " Water in aisle 3 ", now())
            .await
            .unwrap();

        let list = service.threads_for_store("s-1").await.unwrap();
        assert_eq!(list.threads[0].id, id);
        assert_eq!(list.threads[0].subject, "Leaking roof");
        assert_eq!(list.threads[0].status.as_deref(), Some("open"));
        let first = list.latest_message(&id).unwrap();
        assert_eq!(first.body, "Water in aisle 3");
        assert_eq!(first.sender_role, SenderRole::Store);
        assert_eq!(first.sender_user_id.as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn test_open_thread_marks_hq_messages_read() {
        let service = ThreadService::new(seeded().await);

        let view = service.open_thread("th-1", now()).await.unwrap().unwrap();
        let ids: Vec<&str> = view.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["hm-1", "hm-2"]);
        assert_eq!(view.messages[1].store_read_at, Some(now()));

        let list = service.threads_for_store("s-1").await.unwrap();
        assert_eq!(list.unread_from_hq("th-1"), 0);

        let resolved = service.open_thread("th-3", now()).await.unwrap().unwrap();
        assert!(resolved.thread.is_resolved());
        assert!(resolved.messages.is_empty());

        assert!(service.open_thread("missing", now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_hq_messages_read() {
        let service = ThreadService::new(seeded().await);
        let list = service.threads_for_store("s-1").await.unwrap();

        let marked = service
            .mark_hq_messages_read(&list, "th-2", now())
            .await
            .unwrap();
        assert_eq!(marked, 1);

        let list = service.threads_for_store("s-1").await.unwrap();
        assert_eq!(list.total_unread_from_hq(), 1);
        assert_eq!(
            service
                .mark_hq_messages_read(&list, "th-2", now())
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_reply_bumps_thread() {
        let service = ThreadService::new(seeded().await);

        service
            .reply("th-1", &manager(), " Thanks! ", now())
            .await
            .unwrap();

        let list = service.threads_for_store("s-1").await.unwrap();
        assert_eq!(list.threads[0].id, "th-1");
        assert_eq!(list.threads[0].last_message_at, Some(now()));
        assert_eq!(list.latest_message("th-1").unwrap().body, "Thanks!");

        let err = service
            .reply("th-3", &manager(), "Reopen?", now())
            .await
            .unwrap_err();
        assert!(matches!(err, ThreadError::Resolved));

        let err = service
            .reply("missing", &manager(), "Hello", now())
            .await
            .unwrap_err();
        assert!(matches!(err, ThreadError::NotFound(_)));

        let err = service.reply("th-1", &manager(), "  ", now()).await.unwrap_err();
        assert!(matches!(err, ThreadError::EmptyBody));
    }
}
