//! Message store adapter.
//!
//! The delivery core never talks to a database directly. It consumes three
//! traits: [`ConversationStore`] for participant and conversation lookups,
//! [`MessageStore`] for history and appends, and [`RealtimeFeed`] for a
//! filtered stream of insert events. [`memory::MemoryChatStore`] and
//! [`postgres::PgChatStore`] implement all three.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::models::{
    Conversation, Message, NewMessage, ParticipantPair, ParticipantProfile, ParticipantRole,
};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Table holding chat messages.
pub const MESSAGES_TABLE: &str = "messages";

/// Errors reported by store adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique constraint rejected the write.
    #[error("record already exists: {0}")]
    UniqueViolation(String),
    /// The requested record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),
    /// The backend refused the operation for the current user.
    #[error("access denied: {0}")]
    Unauthorized(String),
    /// The realtime feed could not register the subscription.
    #[error("subscription failed: {0}")]
    Subscription(String),
    /// Any other backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            match db_err.code().as_deref() {
                Some("23505") => return StoreError::UniqueViolation(db_err.message().to_string()),
                Some("42501") => return StoreError::Unauthorized(db_err.message().to_string()),
                Some("23503") => return StoreError::NotFound(db_err.message().to_string()),
                _ => {}
            }
        }
        if matches!(err, sqlx::Error::RowNotFound) {
            return StoreError::NotFound(err.to_string());
        }

        StoreError::Backend(err.to_string())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Kind of row change carried by a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

/// An untyped change-data-capture event as emitted by the backend.
///
/// `record` is whatever the backend serialized; it is only trusted after
/// the live channel validates it into a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Table the change happened on.
    pub table: String,
    /// Change kind.
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    /// Row payload.
    pub record: Value,
}

impl ChangeEvent {
    /// Insert event for an already persisted message.
    ///
    /// # Errors
    /// Returns an error if the message cannot be serialized.
    pub fn message_insert(message: &Message) -> serde_json::Result<Self> {
        Ok(Self {
            table: MESSAGES_TABLE.to_string(),
            kind: ChangeKind::Insert,
            record: serde_json::to_value(message)?,
        })
    }
}

/// Server-side filter of a realtime subscription: inserts on `table` whose
/// `column` equals `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertFilter {
    /// Table to watch.
    pub table: String,
    /// Column compared against `value`.
    pub column: String,
    /// Expected column value, in its JSON string form.
    pub value: String,
}

impl InsertFilter {
    /// Inserts into `messages` for one conversation.
    #[must_use]
    pub fn messages_for(conversation_id: Uuid) -> Self {
        Self {
            table: MESSAGES_TABLE.to_string(),
            column: "conversation_id".to_string(),
            value: conversation_id.to_string(),
        }
    }

    /// Whether `event` passes the filter.
    #[must_use]
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.kind == ChangeKind::Insert
            && event.table == self.table
            && event.record.get(&self.column).and_then(Value::as_str) == Some(self.value.as_str())
    }
}

/// A confirmed realtime subscription.
///
/// Dropping the subscription unregisters it: feeds stop forwarding once the
/// receiving side is gone.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<ChangeEvent>,
}

impl Subscription {
    /// Wraps the receiving half handed out by a feed.
    #[must_use]
    pub fn new(receiver: mpsc::Receiver<ChangeEvent>) -> Self {
        Self { receiver }
    }

    /// Next event, or `None` once the feed dropped the subscription.
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }
}

/// Participant and conversation lookups.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Profile of `id` in `role`, if such a profile exists.
    async fn participant_profile(
        &self,
        id: Uuid,
        role: ParticipantRole,
    ) -> StoreResult<Option<ParticipantProfile>>;

    /// Conversation for the exact (doctor, patient) pair.
    async fn find_conversation(&self, pair: ParticipantPair) -> StoreResult<Option<Conversation>>;

    /// Creates the conversation for `pair`.
    ///
    /// Fails with [`StoreError::UniqueViolation`] when one already exists.
    async fn create_conversation(&self, pair: ParticipantPair) -> StoreResult<Conversation>;
}

/// Durable message persistence and history.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Every message of the conversation, oldest first, ties ordered by id.
    async fn fetch_history(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>>;

    /// Persists `message` and returns the stored record.
    async fn append(&self, message: NewMessage) -> StoreResult<Message>;
}

/// Filtered stream of row inserts.
#[async_trait]
pub trait RealtimeFeed: Send + Sync {
    /// Registers a subscription and returns once the backend confirmed it.
    async fn subscribe(&self, filter: InsertFilter) -> StoreResult<Subscription>;
}

/// Everything a conversation view needs from its backend.
pub trait ChatStore: ConversationStore + MessageStore + RealtimeFeed {}

impl<T> ChatStore for T where T: ConversationStore + MessageStore + RealtimeFeed + ?Sized {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_only_its_conversation() {
        let conversation_id = Uuid::new_v4();
        let filter = InsertFilter::messages_for(conversation_id);

        let matching = ChangeEvent {
            table: "messages".into(),
            kind: ChangeKind::Insert,
            record: json!({ "conversation_id": conversation_id.to_string() }),
        };
        let other_conversation = ChangeEvent {
            record: json!({ "conversation_id": Uuid::new_v4().to_string() }),
            ..matching.clone()
        };
        let update = ChangeEvent {
            kind: ChangeKind::Update,
            ..matching.clone()
        };
        let other_table = ChangeEvent {
            table: "health_submissions".into(),
            ..matching.clone()
        };

        assert!(filter.matches(&matching));
        assert!(!filter.matches(&other_conversation));
        assert!(!filter.matches(&update));
        assert!(!filter.matches(&other_table));
    }

    #[test]
    fn test_change_event_wire_format() {
        let raw = json!({
            "table": "messages",
            "type": "INSERT",
            "record": { "id": "m1" }
        });

        let event: ChangeEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.record["id"], "m1");
    }

    #[tokio::test]
    async fn test_subscription_ends_when_sender_dropped() {
        let (tx, rx) = mpsc::channel(1);
        let mut subscription = Subscription::new(rx);
        drop(tx);

        assert!(subscription.next_event().await.is_none());
    }
}
