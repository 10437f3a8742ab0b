use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ParticipantRole, Timestamp, UnknownRole};

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    /// Message from the doctor participant.
    Doctor,
    /// Message from the patient participant.
    Patient,
    /// Message produced by the AI assistant on behalf of the platform.
    Assistant,
}

impl SenderRole {
    /// Stored representation of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SenderRole::Doctor => "doctor",
            SenderRole::Patient => "patient",
            SenderRole::Assistant => "assistant",
        }
    }
}

impl Display for SenderRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl From<ParticipantRole> for SenderRole {
    fn from(role: ParticipantRole) -> Self {
        match role {
            ParticipantRole::Doctor => SenderRole::Doctor,
            ParticipantRole::Patient => SenderRole::Patient,
        }
    }
}

impl TryFrom<&str> for SenderRole {
    type Error = UnknownRole;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "doctor" => Ok(SenderRole::Doctor),
            "patient" => Ok(SenderRole::Patient),
            "assistant" => Ok(SenderRole::Assistant),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// A persisted, immutable chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Store-assigned identifier.
    pub id: Uuid,

    /// Conversation the message belongs to.
    pub conversation_id: Uuid,

    /// Author of the message.
    pub sender_id: Uuid,

    /// Role of the author.
    pub sender_role: SenderRole,

    /// Message text.
    pub body: String,

    /// Store-assigned creation time.
    pub created_at: Timestamp,
}

impl Message {
    /// Key messages are ordered by: creation time, then id.
    #[must_use]
    pub fn ordering_key(&self) -> (Timestamp, Uuid) {
        (self.created_at, self.id)
    }
}

/// A message that has not been persisted yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    /// Conversation to append to.
    pub conversation_id: Uuid,

    /// Author of the message.
    pub sender_id: Uuid,

    /// Role of the author.
    pub sender_role: SenderRole,

    /// Message text.
    pub body: String,
}

impl NewMessage {
    /// Builds an unsent message.
    pub fn new(
        conversation_id: Uuid,
        sender_id: Uuid,
        sender_role: SenderRole,
        body: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            sender_id,
            sender_role,
            body: body.into(),
        }
    }

    /// Whether the body holds anything besides whitespace.
    #[must_use]
    pub fn has_content(&self) -> bool {
        !self.body.trim().is_empty()
    }
}
