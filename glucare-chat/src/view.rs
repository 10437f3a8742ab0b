//! Conversation view: the single owner of one conversation's in-memory
//! message sequence and its live channel.

use std::sync::Arc;

use metrics::counter;
use serde_json::json;
use shared::models::{
    Identity, Message, NewMessage, ParticipantPair, ParticipantRole, SenderRole,
};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::assistant::{Assistant, AssistantRequest};
use crate::channel::{
    ChannelId, ChannelIds, ChannelOptions, ChannelState, LiveChannel, MessageHandler,
    message_handler,
};
use crate::error::{ChatError, ChatResult};
use crate::resolver::{ConversationResolver, ResolvedConversation};
use crate::sequence::{MergeOutcome, MessageSequence};
use crate::store::ChatStore;

/// Sender id stamped on assistant replies.
pub const ASSISTANT_SENDER_ID: Uuid = Uuid::from_u128(0x0000_0000_0000_4000_8000_0000_0000_a551);

/// Label used for assistant replies.
pub const ASSISTANT_DISPLAY_NAME: &str = "Assistant";

/// Number of trailing messages forwarded to the assistant as context.
const ASSISTANT_CONTEXT_MESSAGES: usize = 10;

struct ViewState {
    sequence: MessageSequence,
    active_channel: Option<ChannelId>,
}

/// An open conversation.
///
/// Opening resolves the conversation, seeds the sequence from history, and
/// only then subscribes to live inserts. Once a subscription is confirmed,
/// whether at open or after an automatic resubscribe, history is read again
/// so inserts made while no subscription existed are not lost. Sends are
/// merged after the store confirms them; the echo of an own send arrives as
/// a duplicate and is dropped. Dropping the view tears the live channel down; [`Self::close`]
/// does the same and also waits for in-flight deliveries.
pub struct ConversationView<S: ChatStore + ?Sized + 'static> {
    store: Arc<S>,
    identity: Identity,
    resolved: ResolvedConversation,
    state: Arc<Mutex<ViewState>>,
    channel: Option<LiveChannel>,
    catch_up: Option<JoinHandle<()>>,
    channel_ids: ChannelIds,
    options: ChannelOptions,
    revision: Arc<watch::Sender<u64>>,
}

impl<S: ChatStore + ?Sized + 'static> std::fmt::Debug for ConversationView<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationView")
            .field("conversation_id", &self.resolved.conversation_id)
            .field("identity", &self.identity)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl<S: ChatStore + ?Sized + 'static> ConversationView<S> {
    /// Opens the conversation of `pair` on behalf of `identity`.
    ///
    /// # Errors
    /// - [`ChatError::NotFound`] if `identity` is not the participant of its
    ///   role in `pair`, or a participant profile is missing.
    /// - [`ChatError::Persistence`] if resolution or the history fetch fails.
    /// - [`ChatError::Channel`] if the live channel cannot be established.
    #[instrument(
        name = "chat.open_view",
        skip(store, options),
        fields(user_id = %identity.user_id, role = %identity.role),
        err
    )]
    pub async fn open(
        store: Arc<S>,
        identity: Identity,
        pair: ParticipantPair,
        options: ChannelOptions,
    ) -> ChatResult<Self> {
        let own_slot = match identity.role {
            ParticipantRole::Doctor => pair.doctor_id,
            ParticipantRole::Patient => pair.patient_id,
        };
        if own_slot != identity.user_id {
            return Err(ChatError::NotFound(format!(
                "{} {} is not a participant of {pair}",
                identity.role, identity.user_id
            )));
        }

        let resolved = ConversationResolver::new(Arc::clone(&store))
            .resolve(pair)
            .await?;
        let history = store
            .fetch_history(resolved.conversation_id)
            .await
            .map_err(ChatError::Persistence)?;
        debug!(
            conversation_id = %resolved.conversation_id,
            messages = history.len(),
            "seeded conversation from history"
        );

        let (revision, _) = watch::channel(0);
        let mut view = Self {
            store,
            identity,
            resolved,
            state: Arc::new(Mutex::new(ViewState {
                sequence: MessageSequence::from_history(history),
                active_channel: None,
            })),
            channel: None,
            catch_up: None,
            channel_ids: ChannelIds::default(),
            options,
            revision: Arc::new(revision),
        };
        view.connect().await?;
        let missed = view.refresh().await?;
        if missed > 0 {
            debug!(missed, "caught up on inserts made while subscribing");
        }

        info!(conversation_id = %view.resolved.conversation_id, "conversation view open");
        Ok(view)
    }

    /// Conversation id.
    #[must_use]
    pub fn conversation_id(&self) -> Uuid {
        self.resolved.conversation_id
    }

    /// Identity the view acts for.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Both participant profiles.
    #[must_use]
    pub fn participants(&self) -> &ResolvedConversation {
        &self.resolved
    }

    /// State of the current live channel; `Closed` when there is none.
    #[must_use]
    pub fn channel_state(&self) -> ChannelState {
        self.channel
            .as_ref()
            .map_or(ChannelState::Closed, LiveChannel::state)
    }

    /// Identity of the current live channel.
    #[must_use]
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.channel.as_ref().map(LiveChannel::id)
    }

    /// Receiver bumped every time the sequence gains a message.
    #[must_use]
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Snapshot of the ordered sequence.
    pub async fn messages(&self) -> Vec<Message> {
        self.state.lock().await.sequence.messages().to_vec()
    }

    /// Number of messages in the sequence.
    pub async fn len(&self) -> usize {
        self.state.lock().await.sequence.len()
    }

    /// Whether the sequence is empty.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.sequence.is_empty()
    }

    /// Display label of a message's sender.
    #[must_use]
    pub fn display_name(&self, message: &Message) -> &str {
        match message.sender_role {
            SenderRole::Assistant => ASSISTANT_DISPLAY_NAME,
            SenderRole::Doctor if message.sender_id == self.resolved.doctor.id => {
                &self.resolved.doctor.display_name
            }
            SenderRole::Patient if message.sender_id == self.resolved.patient.id => {
                &self.resolved.patient.display_name
            }
            SenderRole::Doctor | SenderRole::Patient => "Unknown",
        }
    }

    /// Persists `body` as a message from the view's identity and merges the
    /// stored record.
    ///
    /// Leading and trailing whitespace is stripped. Nothing is merged unless
    /// the store confirmed the write, and a failed send is never retried.
    ///
    /// # Errors
    /// - [`ChatError::Validation`] for an empty or whitespace-only body; the
    ///   store is not contacted.
    /// - [`ChatError::Persistence`] if the store rejects the write.
    #[instrument(
        name = "chat.send",
        skip(self, body),
        fields(conversation_id = %self.resolved.conversation_id),
        err
    )]
    pub async fn send(&self, body: &str) -> ChatResult<Message> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ChatError::Validation(
                "message body must not be empty".to_string(),
            ));
        }

        let stored = self
            .store
            .append(NewMessage::new(
                self.resolved.conversation_id,
                self.identity.user_id,
                self.identity.role.into(),
                body,
            ))
            .await
            .map_err(ChatError::Persistence)?;

        counter!("glucare_chat_messages_sent_total", "role" => self.identity.role.as_str())
            .increment(1);
        self.merge(stored.clone()).await;
        Ok(stored)
    }

    /// Sends `body`, relays it to `assistant`, and persists the reply as an
    /// assistant message. Returns the stored reply.
    ///
    /// # Errors
    /// Anything [`Self::send`] returns, [`ChatError::Assistant`] if the
    /// assistant fails, or [`ChatError::Persistence`] if the reply cannot be
    /// stored.
    #[instrument(
        name = "chat.ask_assistant",
        skip(self, assistant, body),
        fields(conversation_id = %self.resolved.conversation_id),
        err
    )]
    pub async fn ask_assistant<A>(&self, assistant: &A, body: &str) -> ChatResult<Message>
    where
        A: Assistant + ?Sized,
    {
        let question = self.send(body).await?;

        let recent: Vec<_> = {
            let state = self.state.lock().await;
            let messages = state.sequence.messages();
            messages[messages.len().saturating_sub(ASSISTANT_CONTEXT_MESSAGES)..]
                .iter()
                .map(|m| json!({ "role": m.sender_role, "body": m.body }))
                .collect()
        };
        let request = AssistantRequest::new(question.body)
            .with_user(self.identity.user_id)
            .with_context(json!({
                "conversation_id": self.resolved.conversation_id,
                "role": self.identity.role,
                "recent_messages": recent,
            }));

        let reply = assistant.reply(&request).await?;

        let stored = self
            .store
            .append(NewMessage::new(
                self.resolved.conversation_id,
                ASSISTANT_SENDER_ID,
                SenderRole::Assistant,
                reply.response,
            ))
            .await
            .map_err(ChatError::Persistence)?;
        self.merge(stored.clone()).await;
        Ok(stored)
    }

    /// Re-reads history and merges anything the sequence is missing, e.g.
    /// inserts made while the channel was down. Returns how many were new.
    ///
    /// # Errors
    /// [`ChatError::Persistence`] if the history fetch fails.
    pub async fn refresh(&self) -> ChatResult<usize> {
        let history = self
            .store
            .fetch_history(self.resolved.conversation_id)
            .await
            .map_err(ChatError::Persistence)?;

        let added = self.state.lock().await.sequence.extend(history);
        if added > 0 {
            self.revision.send_modify(|revision| *revision += 1);
            debug!(added, "refresh merged missing messages");
        }
        Ok(added)
    }

    /// Replaces the live channel with a fresh one and catches up on anything
    /// missed in between. Returns how many messages the catch-up added.
    ///
    /// # Errors
    /// [`ChatError::Channel`] if no channel could be established, or
    /// [`ChatError::Persistence`] if the catch-up fetch fails.
    pub async fn reconnect(&mut self) -> ChatResult<usize> {
        self.connect().await?;
        self.refresh().await
    }

    /// Tears the view down: the live channel is closed first, then the
    /// sequence is discarded. No delivery mutates the sequence once this
    /// returns.
    pub async fn close(mut self) {
        self.disconnect().await;
        self.state.lock().await.sequence.clear();
        info!(conversation_id = %self.resolved.conversation_id, "conversation view closed");
    }

    async fn merge(&self, message: Message) {
        let mut state = self.state.lock().await;
        if let MergeOutcome::Inserted(_) = state.sequence.merge(message) {
            self.revision.send_modify(|revision| *revision += 1);
        }
    }

    async fn disconnect(&mut self) {
        // Deliveries still waiting on the lock see no active channel.
        self.state.lock().await.active_channel = None;
        if let Some(catch_up) = self.catch_up.take() {
            catch_up.abort();
        }
        if let Some(mut previous) = self.channel.take() {
            previous.close().await;
        }
    }

    async fn connect(&mut self) -> ChatResult<()> {
        self.disconnect().await;

        let attempts = if self.options.auto_resubscribe { 2 } else { 1 };
        let mut last_error = None;

        for attempt in 1..=attempts {
            let id = self.channel_ids.next_id();
            self.state.lock().await.active_channel = Some(id);

            match LiveChannel::open(
                id,
                Arc::clone(&self.store),
                self.resolved.conversation_id,
                self.delivery_handler(id),
                self.options,
            )
            .await
            {
                Ok(channel) => {
                    self.catch_up = Some(self.spawn_catch_up(id, channel.watch_state()));
                    self.channel = Some(channel);
                    return Ok(());
                }
                Err(err) => {
                    warn!(channel = %id, attempt, error = %err, "live channel open failed");
                    last_error = Some(err);
                }
            }
        }

        self.state.lock().await.active_channel = None;
        Err(last_error.unwrap_or_else(|| {
            ChatError::Channel("live channel could not be opened".to_string())
        }))
    }

    /// Re-reads history each time channel `id` comes back to `Active` after
    /// an automatic resubscribe. Stops when the channel closes.
    fn spawn_catch_up(
        &self,
        id: ChannelId,
        mut states: watch::Receiver<ChannelState>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let state = Arc::clone(&self.state);
        let revision = Arc::clone(&self.revision);
        let conversation_id = self.resolved.conversation_id;

        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let current = *states.borrow_and_update();
                match current {
                    ChannelState::Active => {}
                    ChannelState::Closed => break,
                    ChannelState::Subscribing | ChannelState::Error => continue,
                }

                let history = match store.fetch_history(conversation_id).await {
                    Ok(history) => history,
                    Err(err) => {
                        warn!(channel = %id, error = %err, "catch-up after resubscribe failed");
                        continue;
                    }
                };

                let mut view = state.lock().await;
                if view.active_channel != Some(id) {
                    break;
                }
                let added = view.sequence.extend(history);
                if added > 0 {
                    revision.send_modify(|revision| *revision += 1);
                    debug!(channel = %id, added, "caught up after resubscribe");
                }
            }
        })
    }

    fn delivery_handler(&self, id: ChannelId) -> MessageHandler {
        let state = Arc::clone(&self.state);
        let revision = Arc::clone(&self.revision);

        message_handler(move |message| {
            let state = Arc::clone(&state);
            let revision = Arc::clone(&revision);
            async move {
                let message_id = message.id;
                let mut view = state.lock().await;
                if view.active_channel != Some(id) {
                    debug!(channel = %id, %message_id, "ignoring delivery from stale channel");
                    return;
                }
                match view.sequence.merge(message) {
                    MergeOutcome::Inserted(_) => {
                        counter!("glucare_chat_live_messages_total").increment(1);
                        revision.send_modify(|revision| *revision += 1);
                    }
                    MergeOutcome::Duplicate => {
                        counter!("glucare_chat_duplicate_messages_total").increment(1);
                        debug!(channel = %id, %message_id, "dropped duplicate live message");
                    }
                }
            }
        })
    }
}
