//! In-process store used by tests, demos, and embedders without a database.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use shared::config::chat::RealtimeConfig;
use shared::models::{
    Conversation, Message, NewMessage, ParticipantPair, ParticipantProfile, ParticipantRole,
    Timestamp,
};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{
    ChangeEvent, ConversationStore, InsertFilter, MessageStore, RealtimeFeed, StoreError,
    StoreResult, Subscription,
};

struct Subscriber {
    filter: InsertFilter,
    sender: mpsc::Sender<ChangeEvent>,
}

#[derive(Default)]
struct MemoryState {
    profiles: HashMap<Uuid, ParticipantProfile>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    subscribers: Vec<Subscriber>,
    last_timestamp: Option<Timestamp>,
}

impl MemoryState {
    /// Store clock: wall time, never going backwards.
    fn next_timestamp(&mut self) -> Timestamp {
        let now = Timestamp(Utc::now());
        let assigned = self.last_timestamp.map_or(now, |last| last.max(now));
        self.last_timestamp = Some(assigned);
        assigned
    }

    fn matching_senders(&mut self, event: &ChangeEvent) -> Vec<mpsc::Sender<ChangeEvent>> {
        self.subscribers.retain(|subscriber| !subscriber.sender.is_closed());
        self.subscribers
            .iter()
            .filter(|subscriber| subscriber.filter.matches(event))
            .map(|subscriber| subscriber.sender.clone())
            .collect()
    }
}

/// Number of calls each store operation received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `participant_profile` calls.
    pub profile_lookups: usize,
    /// `find_conversation` calls.
    pub conversation_lookups: usize,
    /// `create_conversation` calls.
    pub conversation_creates: usize,
    /// `fetch_history` calls.
    pub history_fetches: usize,
    /// `append` calls.
    pub appends: usize,
    /// `subscribe` calls.
    pub subscribes: usize,
}

#[derive(Default)]
struct Counters {
    profile_lookups: AtomicUsize,
    conversation_lookups: AtomicUsize,
    conversation_creates: AtomicUsize,
    history_fetches: AtomicUsize,
    appends: AtomicUsize,
    subscribes: AtomicUsize,
}

#[derive(Default)]
struct Faults {
    unavailable: AtomicBool,
    deny_writes: AtomicBool,
    failing_subscriptions: AtomicUsize,
    stale_lookups: AtomicUsize,
    subscribe_delay_ms: AtomicU64,
}

struct Inner {
    state: Mutex<MemoryState>,
    counters: Counters,
    faults: Faults,
    capacity: usize,
}

/// A complete in-memory implementation of the store traits.
///
/// Enforces one conversation per pair, assigns non-decreasing timestamps, and
/// fans inserts out to matching subscriptions. Fault switches let tests drive
/// the error paths of the delivery core.
#[derive(Clone)]
pub struct MemoryChatStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryChatStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChatStore")
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

impl Default for MemoryChatStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChatStore {
    /// Empty store with the default per-subscription buffer of
    /// [`RealtimeConfig`].
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(&RealtimeConfig::default())
    }

    /// Empty store buffering `realtime.channel_capacity` events per
    /// subscription, as [`super::postgres::PgChatStore`] does.
    #[must_use]
    pub fn from_config(realtime: &RealtimeConfig) -> Self {
        Self::with_capacity(realtime.channel_capacity)
    }

    /// Per-subscription buffer size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Empty store buffering up to `capacity` events per subscription.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MemoryState::default()),
                counters: Counters::default(),
                faults: Faults::default(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Registers a participant profile and returns it.
    pub async fn add_participant(
        &self,
        role: ParticipantRole,
        display_name: impl Into<String>,
    ) -> ParticipantProfile {
        let profile = ParticipantProfile {
            id: Uuid::new_v4(),
            role,
            display_name: display_name.into(),
        };
        self.insert_profile(profile.clone()).await;
        profile
    }

    /// Registers an existing profile.
    pub async fn insert_profile(&self, profile: ParticipantProfile) {
        let mut state = self.inner.state.lock().await;
        state.profiles.insert(profile.id, profile);
    }

    /// Stores a fully formed message as if another client wrote it, and
    /// publishes its insert event.
    ///
    /// # Errors
    /// Returns [`StoreError::UniqueViolation`] if the id is already taken.
    pub async fn insert_message(&self, message: Message) -> StoreResult<()> {
        let event = ChangeEvent::message_insert(&message)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let senders = {
            let mut state = self.inner.state.lock().await;
            if state.messages.iter().any(|existing| existing.id == message.id) {
                return Err(StoreError::UniqueViolation(format!("message {}", message.id)));
            }
            state.messages.push(message);
            state.matching_senders(&event)
        };
        deliver(senders, event).await;
        Ok(())
    }

    /// Publishes a raw change event without storing anything.
    pub async fn publish_raw(&self, event: ChangeEvent) {
        let senders = {
            let mut state = self.inner.state.lock().await;
            state.matching_senders(&event)
        };
        deliver(senders, event).await;
    }

    /// Drops every live subscription, as a backend restart would.
    pub async fn disconnect_subscribers(&self) {
        let mut state = self.inner.state.lock().await;
        let dropped = state.subscribers.len();
        state.subscribers.clear();
        debug!(dropped, "memory store disconnected all subscribers");
    }

    /// Number of subscriptions whose receiver is still alive.
    pub async fn active_subscriptions(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        state.subscribers.retain(|subscriber| !subscriber.sender.is_closed());
        state.subscribers.len()
    }

    /// Number of conversations stored.
    pub async fn conversation_count(&self) -> usize {
        self.inner.state.lock().await.conversations.len()
    }

    /// Snapshot of per-operation call counts.
    #[must_use]
    pub fn calls(&self) -> CallCounts {
        let counters = &self.inner.counters;
        CallCounts {
            profile_lookups: counters.profile_lookups.load(Ordering::SeqCst),
            conversation_lookups: counters.conversation_lookups.load(Ordering::SeqCst),
            conversation_creates: counters.conversation_creates.load(Ordering::SeqCst),
            history_fetches: counters.history_fetches.load(Ordering::SeqCst),
            appends: counters.appends.load(Ordering::SeqCst),
            subscribes: counters.subscribes.load(Ordering::SeqCst),
        }
    }

    /// Makes every operation fail with a backend error while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner
            .faults
            .unavailable
            .store(unavailable, Ordering::SeqCst);
    }

    /// Makes writes fail with [`StoreError::Unauthorized`] while set.
    pub fn set_deny_writes(&self, deny: bool) {
        self.inner.faults.deny_writes.store(deny, Ordering::SeqCst);
    }

    /// Fails the next `count` subscription attempts.
    pub fn fail_next_subscriptions(&self, count: usize) {
        self.inner
            .faults
            .failing_subscriptions
            .store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` conversation lookups miss, as if a concurrent
    /// client created the conversation right after the lookup.
    pub fn stale_next_lookups(&self, count: usize) {
        self.inner.faults.stale_lookups.store(count, Ordering::SeqCst);
    }

    /// Delays subscription confirmation by `delay`.
    pub fn set_subscribe_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.inner
            .faults
            .subscribe_delay_ms
            .store(millis, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.inner.faults.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("store unavailable".to_string()));
        }
        Ok(())
    }

    fn check_writable(&self) -> StoreResult<()> {
        self.check_available()?;
        if self.inner.faults.deny_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unauthorized(
                "write rejected by access policy".to_string(),
            ));
        }
        Ok(())
    }
}

/// Decrements `counter` if it is positive; returns whether it was.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

async fn deliver(senders: Vec<mpsc::Sender<ChangeEvent>>, event: ChangeEvent) {
    for sender in senders {
        if sender.send(event.clone()).await.is_err() {
            trace!("subscriber went away during delivery");
        }
    }
}

#[async_trait]
impl ConversationStore for MemoryChatStore {
    async fn participant_profile(
        &self,
        id: Uuid,
        role: ParticipantRole,
    ) -> StoreResult<Option<ParticipantProfile>> {
        self.inner
            .counters
            .profile_lookups
            .fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let state = self.inner.state.lock().await;
        Ok(state
            .profiles
            .get(&id)
            .filter(|profile| profile.role == role)
            .cloned())
    }

    async fn find_conversation(&self, pair: ParticipantPair) -> StoreResult<Option<Conversation>> {
        self.inner
            .counters
            .conversation_lookups
            .fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        if take_one(&self.inner.faults.stale_lookups) {
            return Ok(None);
        }

        let state = self.inner.state.lock().await;
        Ok(state
            .conversations
            .iter()
            .find(|conversation| conversation.pair() == pair)
            .cloned())
    }

    async fn create_conversation(&self, pair: ParticipantPair) -> StoreResult<Conversation> {
        self.inner
            .counters
            .conversation_creates
            .fetch_add(1, Ordering::SeqCst);
        self.check_writable()?;

        let mut state = self.inner.state.lock().await;
        if state
            .conversations
            .iter()
            .any(|conversation| conversation.pair() == pair)
        {
            return Err(StoreError::UniqueViolation(format!(
                "conversation for {pair} already exists"
            )));
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            doctor_id: pair.doctor_id,
            patient_id: pair.patient_id,
            created_at: state.next_timestamp(),
        };
        state.conversations.push(conversation.clone());
        Ok(conversation)
    }
}

#[async_trait]
impl MessageStore for MemoryChatStore {
    async fn fetch_history(&self, conversation_id: Uuid) -> StoreResult<Vec<Message>> {
        self.inner
            .counters
            .history_fetches
            .fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let state = self.inner.state.lock().await;
        let mut history: Vec<Message> = state
            .messages
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect();
        history.sort_by_key(Message::ordering_key);
        Ok(history)
    }

    async fn append(&self, message: NewMessage) -> StoreResult<Message> {
        self.inner.counters.appends.fetch_add(1, Ordering::SeqCst);
        self.check_writable()?;

        let (stored, senders, event) = {
            let mut state = self.inner.state.lock().await;
            if !state
                .conversations
                .iter()
                .any(|conversation| conversation.id == message.conversation_id)
            {
                return Err(StoreError::NotFound(format!(
                    "conversation {}",
                    message.conversation_id
                )));
            }

            let stored = Message {
                id: Uuid::new_v4(),
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                sender_role: message.sender_role,
                body: message.body,
                created_at: state.next_timestamp(),
            };
            let event = ChangeEvent::message_insert(&stored)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            state.messages.push(stored.clone());
            let senders = state.matching_senders(&event);
            (stored, senders, event)
        };

        deliver(senders, event).await;
        Ok(stored)
    }
}

#[async_trait]
impl RealtimeFeed for MemoryChatStore {
    async fn subscribe(&self, filter: InsertFilter) -> StoreResult<Subscription> {
        self.inner.counters.subscribes.fetch_add(1, Ordering::SeqCst);

        let delay_ms = self.inner.faults.subscribe_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        self.check_available()?;
        if take_one(&self.inner.faults.failing_subscriptions) {
            warn!(table = %filter.table, value = %filter.value, "memory store rejected subscription");
            return Err(StoreError::Subscription(
                "realtime service rejected the subscription".to_string(),
            ));
        }

        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        let mut state = self.inner.state.lock().await;
        state.subscribers.push(Subscriber { filter, sender });
        Ok(Subscription::new(receiver))
    }
}
