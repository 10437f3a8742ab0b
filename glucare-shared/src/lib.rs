#![cfg_attr(not(test), forbid(unsafe_code))]
#![warn(clippy::pedantic)]

//! Shared models and configuration for the `GluCare` chat core.
//!
//! The models mirror the persisted shapes of the `conversations` and `messages`
//! tables so that store adapters, the delivery core, and UI screens agree on a
//! single wire representation.

pub mod config;
pub mod models;

pub use config::chat::{AssistantConfig, ChatConfig, ConfigError, RealtimeConfig};
pub use models::{
    Conversation, ErrorResponse, Identity, Message, NewMessage, ParticipantPair,
    ParticipantProfile, ParticipantRole, SenderRole, Timestamp, UnknownRole,
};
