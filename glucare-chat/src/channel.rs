//! Live delivery channel.
//!
//! A [`LiveChannel`] owns one filtered subscription to message inserts for a
//! single conversation and walks the lifecycle
//! `Subscribing -> Active -> Closed`, with `Active -> Error -> Subscribing`
//! when the feed drops the subscription. Every channel carries a distinct
//! [`ChannelId`]; once a channel is closed its handler is never invoked again.

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    future::Future,
    sync::Arc,
    time::Duration,
};

use futures::future::{BoxFuture, FutureExt};
use metrics::counter;
use shared::config::chat::RealtimeConfig;
use shared::models::Message;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::store::{
    ChangeEvent, ChangeKind, InsertFilter, MESSAGES_TABLE, RealtimeFeed, Subscription,
};

/// Lifecycle state of a [`LiveChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Torn down; no further deliveries.
    Closed,
    /// Waiting for the feed to confirm the subscription.
    Subscribing,
    /// Delivering inserts.
    Active,
    /// The feed dropped the subscription and it could not be restored.
    Error,
}

/// Identity of one `open` call. Ids handed out by a [`ChannelIds`] strictly
/// increase, so a stale channel can always be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Raw id value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "channel-{}", self.0)
    }
}

/// Allocator of [`ChannelId`]s, owned by a single conversation view.
#[derive(Debug, Default)]
pub struct ChannelIds {
    last: u64,
}

impl ChannelIds {
    /// Next, never before returned, id.
    pub fn next_id(&mut self) -> ChannelId {
        self.last += 1;
        ChannelId(self.last)
    }
}

/// Callback invoked for each validated insert.
pub type MessageHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure into a [`MessageHandler`].
pub fn message_handler<F, Fut>(handler: F) -> MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| handler(message).boxed())
}

/// Tunables of a live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Upper bound on waiting for subscription confirmation.
    pub subscribe_timeout: Duration,
    /// Whether one automatic resubscription is attempted.
    pub auto_resubscribe: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::from(&RealtimeConfig::default())
    }
}

impl From<&RealtimeConfig> for ChannelOptions {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            subscribe_timeout: config.subscribe_timeout(),
            auto_resubscribe: config.auto_resubscribe,
        }
    }
}

/// Why a live event was rejected at the channel boundary.
#[derive(Debug, Error)]
pub enum MalformedEvent {
    /// Event for a table other than `messages`.
    #[error("unexpected table '{0}'")]
    Table(String),
    /// Update or delete where only inserts are expected.
    #[error("unexpected change kind {0:?}")]
    Kind(ChangeKind),
    /// Record does not have the message shape.
    #[error("record is not a message: {0}")]
    Shape(#[from] serde_json::Error),
    /// Record belongs to a different conversation.
    #[error("record belongs to conversation {0}")]
    Conversation(Uuid),
    /// Record has an empty body.
    #[error("record has an empty body")]
    EmptyBody,
}

/// Validates an untyped change event into a message of `conversation_id`.
///
/// # Errors
/// Returns the first reason the event does not qualify.
pub fn decode_message(conversation_id: Uuid, event: ChangeEvent) -> Result<Message, MalformedEvent> {
    if event.table != MESSAGES_TABLE {
        return Err(MalformedEvent::Table(event.table));
    }
    if event.kind != ChangeKind::Insert {
        return Err(MalformedEvent::Kind(event.kind));
    }

    let message: Message = serde_json::from_value(event.record)?;
    if message.conversation_id != conversation_id {
        return Err(MalformedEvent::Conversation(message.conversation_id));
    }
    if message.body.trim().is_empty() {
        return Err(MalformedEvent::EmptyBody);
    }
    Ok(message)
}

struct ChannelShared {
    id: ChannelId,
    conversation_id: Uuid,
    state: watch::Sender<ChannelState>,
    token: CancellationToken,
    handler: Mutex<Option<MessageHandler>>,
}

impl ChannelShared {
    fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn transition(&self, from: ChannelState, to: ChannelState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Marks the channel closed and stops the pump. Returns whether this call
    /// did the closing.
    fn shut_down(&self) -> bool {
        let previous = self.state.send_replace(ChannelState::Closed);
        self.token.cancel();
        previous != ChannelState::Closed
    }

    async fn deliver(&self, event: ChangeEvent) {
        let message = match decode_message(self.conversation_id, event) {
            Ok(message) => message,
            Err(reason) => {
                counter!("glucare_chat_malformed_events_total").increment(1);
                warn!(channel = %self.id, %reason, "dropping malformed live event");
                return;
            }
        };

        // Held for the whole delivery so `close` waits for it to finish.
        let handler = self.handler.lock().await;
        if self.state() != ChannelState::Active {
            debug!(channel = %self.id, message_id = %message.id, "dropping delivery for inactive channel");
            return;
        }
        if let Some(handler) = handler.as_ref() {
            handler(message).await;
        }
    }
}

/// A filtered subscription to message inserts of one conversation.
pub struct LiveChannel {
    shared: Arc<ChannelShared>,
    pump: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for LiveChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveChannel")
            .field("id", &self.shared.id)
            .field("conversation_id", &self.shared.conversation_id)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl LiveChannel {
    /// Subscribes to inserts of `conversation_id` and returns once the feed
    /// confirmed the subscription.
    ///
    /// # Errors
    /// [`ChatError::Channel`] if the feed rejects the subscription or does not
    /// confirm it within `options.subscribe_timeout`.
    pub async fn open<F>(
        id: ChannelId,
        feed: Arc<F>,
        conversation_id: Uuid,
        handler: MessageHandler,
        options: ChannelOptions,
    ) -> ChatResult<Self>
    where
        F: RealtimeFeed + ?Sized + 'static,
    {
        let (state, _) = watch::channel(ChannelState::Closed);
        let shared = Arc::new(ChannelShared {
            id,
            conversation_id,
            state,
            token: CancellationToken::new(),
            handler: Mutex::new(Some(handler)),
        });
        shared.transition(ChannelState::Closed, ChannelState::Subscribing);

        let filter = InsertFilter::messages_for(conversation_id);
        debug!(channel = %id, %conversation_id, "opening live channel");

        let subscription =
            match confirm_subscription(feed.as_ref(), filter.clone(), options.subscribe_timeout)
                .await
            {
                Ok(subscription) => subscription,
                Err(err) => {
                    shared.shut_down();
                    warn!(channel = %id, %conversation_id, error = %err, "live channel failed to open");
                    return Err(err);
                }
            };

        shared.transition(ChannelState::Subscribing, ChannelState::Active);
        info!(channel = %id, %conversation_id, "live channel active");

        let pump = tokio::spawn(pump(
            Arc::clone(&shared),
            feed,
            subscription,
            filter,
            options,
        ));

        Ok(Self {
            shared,
            pump: Some(pump),
        })
    }

    /// Identity of this channel.
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    /// Conversation the channel is scoped to.
    #[must_use]
    pub fn conversation_id(&self) -> Uuid {
        self.shared.conversation_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Whether inserts are currently delivered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == ChannelState::Active
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Replaces the delivery callback. Waits for an in-flight delivery to
    /// finish first.
    pub async fn on_message(&self, handler: MessageHandler) {
        *self.shared.handler.lock().await = Some(handler);
    }

    /// Tears the channel down.
    ///
    /// Once this returns the handler is never invoked again and the
    /// subscription has been released. Calling it twice is harmless.
    pub async fn close(&mut self) {
        if self.shared.shut_down() {
            info!(channel = %self.shared.id, conversation_id = %self.shared.conversation_id, "live channel closed");
        }

        self.shared.handler.lock().await.take();

        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.shared.shut_down();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

async fn confirm_subscription<F>(
    feed: &F,
    filter: InsertFilter,
    timeout: Duration,
) -> ChatResult<Subscription>
where
    F: RealtimeFeed + ?Sized,
{
    match tokio::time::timeout(timeout, feed.subscribe(filter)).await {
        Ok(Ok(subscription)) => Ok(subscription),
        Ok(Err(err)) => Err(ChatError::Channel(err.to_string())),
        Err(_) => Err(ChatError::Channel(format!(
            "subscription not confirmed within {} ms",
            timeout.as_millis()
        ))),
    }
}

async fn pump<F>(
    shared: Arc<ChannelShared>,
    feed: Arc<F>,
    mut subscription: Subscription,
    filter: InsertFilter,
    options: ChannelOptions,
) where
    F: RealtimeFeed + ?Sized,
{
    let mut resubscribed = false;

    loop {
        let next = tokio::select! {
            () = shared.token.cancelled() => break,
            event = subscription.next_event() => event,
        };

        if let Some(event) = next {
            shared.deliver(event).await;
            continue;
        }

        if !shared.transition(ChannelState::Active, ChannelState::Error) {
            break;
        }
        warn!(channel = %shared.id, conversation_id = %shared.conversation_id, "live feed dropped the subscription");

        if !options.auto_resubscribe || resubscribed {
            error!(channel = %shared.id, "live channel needs an explicit reconnect");
            break;
        }
        resubscribed = true;

        match resubscribe(&shared, feed.as_ref(), &filter, options.subscribe_timeout).await {
            Some(restored) => subscription = restored,
            None => break,
        }
    }

    debug!(channel = %shared.id, "live channel pump stopped");
}

async fn resubscribe<F>(
    shared: &ChannelShared,
    feed: &F,
    filter: &InsertFilter,
    timeout: Duration,
) -> Option<Subscription>
where
    F: RealtimeFeed + ?Sized,
{
    if !shared.transition(ChannelState::Error, ChannelState::Subscribing) {
        return None;
    }
    counter!("glucare_chat_resubscribe_total").increment(1);

    let attempt = tokio::select! {
        () = shared.token.cancelled() => return None,
        result = confirm_subscription(feed, filter.clone(), timeout) => result,
    };

    match attempt {
        Ok(subscription) => {
            if shared.transition(ChannelState::Subscribing, ChannelState::Active) {
                info!(channel = %shared.id, "live channel resubscribed");
                Some(subscription)
            } else {
                None
            }
        }
        Err(err) => {
            shared.transition(ChannelState::Subscribing, ChannelState::Error);
            error!(channel = %shared.id, error = %err, "live channel resubscription failed");
            None
        }
    }
}
