pub mod conversation;
pub mod errors;
pub mod message;
pub mod participant;
pub mod timestamp;

pub use conversation::{Conversation, ParticipantPair};
pub use errors::ErrorResponse;
pub use message::{Message, NewMessage, SenderRole};
pub use participant::{Identity, ParticipantProfile, ParticipantRole, UnknownRole};
pub use timestamp::Timestamp;
