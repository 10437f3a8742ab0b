use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Role a human participant plays in a one-to-one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    /// Care provider side of the conversation.
    Doctor,
    /// Patient side of the conversation.
    Patient,
}

impl ParticipantRole {
    /// Stored representation of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ParticipantRole::Doctor => "doctor",
            ParticipantRole::Patient => "patient",
        }
    }
}

impl Display for ParticipantRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// Raised when a stored role string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown role '{0}'")]
pub struct UnknownRole(pub String);

impl TryFrom<&str> for ParticipantRole {
    type Error = UnknownRole;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "doctor" => Ok(ParticipantRole::Doctor),
            "patient" => Ok(ParticipantRole::Patient),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Profile row used to label messages by display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantProfile {
    /// Profile identifier, shared with the authentication layer.
    pub id: Uuid,
    /// Role of the profile.
    pub role: ParticipantRole,
    /// Human readable name shown next to messages.
    pub display_name: String,
}

/// Already-authenticated user on whose behalf a view sends messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Authenticated user id.
    pub user_id: Uuid,
    /// Role of the authenticated user.
    pub role: ParticipantRole,
}

impl Identity {
    /// Identity of a doctor.
    #[must_use]
    pub const fn doctor(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: ParticipantRole::Doctor,
        }
    }

    /// Identity of a patient.
    #[must_use]
    pub const fn patient(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: ParticipantRole::Patient,
        }
    }
}
