//! `PostgreSQL` store.
//!
//! History and appends are plain queries. Live inserts come from an
//! `AFTER INSERT` trigger that publishes the id and conversation of every new
//! message with `pg_notify`; each subscription holds its own `LISTEN`
//! connection, loads the rows whose notifications pass its filter, and
//! forwards them as full insert events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::config::chat::{ChatConfig, RealtimeConfig};
use shared::models::{
    Conversation, Message, NewMessage, ParticipantPair, ParticipantProfile, ParticipantRole,
    SenderRole, Timestamp,
};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::{
    ChangeEvent, ConversationStore, InsertFilter, MessageStore, RealtimeFeed, StoreError,
    StoreResult, Subscription,
};

const SCHEMA: &str = include_str!("../../sql/schema.sql");
const NOTIFY_CHANNEL_PLACEHOLDER: &str = "{{notify_channel}}";
const MAX_CONNECTIONS: u32 = 5;

/// Schema script with the notify channel filled in.
#[must_use]
pub fn render_schema(notify_channel: &str) -> String {
    SCHEMA.replace(NOTIFY_CHANNEL_PLACEHOLDER, notify_channel)
}

#[derive(sqlx::FromRow)]
struct ProfileRow {
    id: Uuid,
    role: String,
    display_name: String,
}

impl TryFrom<ProfileRow> for ParticipantProfile {
    type Error = StoreError;

    fn try_from(row: ProfileRow) -> Result<Self, Self::Error> {
        let role = ParticipantRole::try_from(row.role.as_str())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self {
            id: row.id,
            role,
            display_name: row.display_name,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: Uuid,
    doctor_id: Uuid,
    patient_id: Uuid,
    created_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Self {
            id: row.id,
            doctor_id: row.doctor_id,
            patient_id: row.patient_id,
            created_at: Timestamp(row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    sender_role: String,
    body: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let sender_role = SenderRole::try_from(row.sender_role.as_str())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            sender_role,
            body: row.body,
            created_at: Timestamp(row.created_at),
        })
    }
}

/// Store backed by a `PostgreSQL` pool.
#[derive(Clone, Debug)]
pub struct PgChatStore {
    pool: PgPool,
    notify_channel: String,
    capacity: usize,
}

impl PgChatStore {
    /// Store over an existing pool.
    #[must_use]
    pub fn new(pool: PgPool, realtime: &RealtimeConfig) -> Self {
        Self {
            pool,
            notify_channel: realtime.notify_channel.clone(),
            capacity: realtime.channel_capacity.max(1),
        }
    }

    /// Connects a pool to `config.database_url`.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] if the database is unreachable.
    pub async fn connect(config: &ChatConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(&config.database_url)
            .await?;
        info!("connected chat store to PostgreSQL");
        Ok(Self::new(pool, &config.realtime))
    }

    /// Underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates tables, indexes, and the insert trigger if missing.
    ///
    /// # Errors
    /// Returns the first failing statement's error.
    pub async fn bootstrap(&self) -> StoreResult<()> {
        info!(notify_channel = %self.notify_channel, "applying chat schema");
        sqlx::raw_sql(&render_schema(&self.notify_channel))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Inserts or renames a participant profile.
    ///
    /// # Errors
    /// Returns a store error if the write fails.
    pub async fn upsert_profile(&self, profile: &ParticipantProfile) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO profiles (id, role, display_name) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET display_name = EXCLUDED.display_name",
        )
        .bind(profile.id)
        .bind(profile.role.as_str())
        .bind(&profile.display_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for PgChatStore {
    async fn participant_profile(
        &self,
        id: Uuid,
        role: ParticipantRole,
    ) -> StoreResult<Option<ParticipantProfile>> {
        let row = sqlx::query_as::<_, ProfileRow>(
            "SELECT id, role, display_name FROM profiles WHERE id = $1 AND role = $2",
        )
        .bind(id)
        .bind(role.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ParticipantProfile::try_from).transpose()
    }

    async fn find_conversation(&self, pair: ParticipantPair) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, doctor_id, patient_id, created_at FROM conversations \
             WHERE doctor_id = $1 AND patient_id = $2",
        )
        .bind(pair.doctor_id)
        .bind(pair.patient_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Conversation::from))
    }

    async fn create_conversation(&self, pair: ParticipantPair) -> StoreResult<Conversation> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "INSERT INTO conversations (doctor_id, patient_id) VALUES ($1, $2) \
             RETURNING id, doctor_id, patient_id, created_at",
        )
        .bind(pair.doctor_id)
        .bind(pair.patient_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }
}

#[async_trait]
impl MessageStore for PgChatStore {
    #[instrument(skip(self), err)]
    async fn fetch_history(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, conversation_id, sender_id, sender_role, body, created_at \
             FROM messages WHERE conversation_id = $1 ORDER BY created_at, id",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Message::try_from).collect()
    }

    #[instrument(skip(self, message), fields(conversation_id = %message.conversation_id), err)]
    async fn append(&self, message: NewMessage) -> StoreResult<Message> {
        let row = sqlx::query_as::<_, MessageRow>(
            "INSERT INTO messages (conversation_id, sender_id, sender_role, body) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, conversation_id, sender_id, sender_role, body, created_at",
        )
        .bind(message.conversation_id)
        .bind(message.sender_id)
        .bind(message.sender_role.as_str())
        .bind(&message.body)
        .fetch_one(&self.pool)
        .await?;

        let stored = Message::try_from(row)?;
        trace!(message_id = %stored.id, "message persisted");
        Ok(stored)
    }
}

#[async_trait]
impl RealtimeFeed for PgChatStore {
    async fn subscribe(&self, filter: InsertFilter) -> StoreResult<Subscription> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| StoreError::Subscription(e.to_string()))?;
        listener
            .listen(&self.notify_channel)
            .await
            .map_err(|e| StoreError::Subscription(e.to_string()))?;
        debug!(channel = %self.notify_channel, value = %filter.value, "listening for inserts");

        let (sender, receiver) = mpsc::channel(self.capacity);
        tokio::spawn(forward_notifications(
            self.pool.clone(),
            listener,
            filter,
            sender,
        ));
        Ok(Subscription::new(receiver))
    }
}

/// Forwards matching notifications until the subscriber goes away or the
/// connection is lost. Ending drops `sender`, which the subscriber observes
/// as a dropped subscription.
async fn forward_notifications(
    pool: PgPool,
    mut listener: PgListener,
    filter: InsertFilter,
    sender: mpsc::Sender<ChangeEvent>,
) {
    loop {
        let received = tokio::select! {
            () = sender.closed() => break,
            received = listener.try_recv() => received,
        };

        let notification = match received {
            Ok(Some(notification)) => notification,
            Ok(None) => {
                warn!(value = %filter.value, "notification connection lost");
                break;
            }
            Err(err) => {
                warn!(value = %filter.value, error = %err, "notification listener failed");
                break;
            }
        };

        let event = match serde_json::from_str::<ChangeEvent>(notification.payload()) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "skipping undecodable notification");
                continue;
            }
        };
        if !filter.matches(&event) {
            continue;
        }
        let Some(message_id) = notified_message_id(&event) else {
            warn!("skipping notification without a message id");
            continue;
        };

        let message = match load_message(&pool, message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(%message_id, "notified message no longer exists");
                continue;
            }
            Err(err) => {
                warn!(%message_id, error = %err, "failed to load notified message");
                continue;
            }
        };
        let event = match ChangeEvent::message_insert(&message) {
            Ok(event) => event,
            Err(err) => {
                warn!(%message_id, error = %err, "failed to encode notified message");
                continue;
            }
        };
        if sender.send(event).await.is_err() {
            break;
        }
    }

    debug!(value = %filter.value, "notification forwarder stopped");
}

/// Id carried in the `record` of a trigger notification.
fn notified_message_id(event: &ChangeEvent) -> Option<Uuid> {
    event
        .record
        .get("id")
        .and_then(Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok())
}

async fn load_message(pool: &PgPool, id: Uuid) -> StoreResult<Option<Message>> {
    let row = sqlx::query_as::<_, MessageRow>(
        "SELECT id, conversation_id, sender_id, sender_role, body, created_at \
         FROM messages WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(Message::try_from).transpose()
}
