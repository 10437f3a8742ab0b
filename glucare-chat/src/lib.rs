#![cfg_attr(not(test), forbid(unsafe_code))]
#![warn(clippy::pedantic)]

//! Real-time conversation delivery core of the `GluCare` doctor/patient chat.
//!
//! A [`ConversationView`] resolves (or lazily creates) the conversation for a
//! doctor/patient pair, seeds an ordered message sequence from history, and
//! keeps it current through a [`LiveChannel`] subscribed to message inserts.
//! Storage sits behind the traits in [`store`].

pub mod assistant;
pub mod channel;
pub mod error;
pub mod resolver;
pub mod sequence;
pub mod store;
pub mod tracer;
pub mod view;

pub use assistant::{Assistant, AssistantError, AssistantReply, AssistantRequest, HttpAssistant};
pub use channel::{
    ChannelId, ChannelIds, ChannelOptions, ChannelState, LiveChannel, MessageHandler,
    message_handler,
};
pub use error::{ChatError, ChatResult};
pub use resolver::{ConversationResolver, ResolvedConversation};
pub use sequence::{MergeOutcome, MessageSequence};
pub use store::memory::MemoryChatStore;
pub use store::postgres::PgChatStore;
pub use store::{ChatStore, ConversationStore, MessageStore, RealtimeFeed, StoreError};
pub use tracer::initialize_tracing;
pub use view::{ASSISTANT_SENDER_ID, ConversationView};
