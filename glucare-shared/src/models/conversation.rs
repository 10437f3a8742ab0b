use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Timestamp;

/// The (doctor, patient) pair a conversation is keyed by.
///
/// The pair is order-sensitive: the two slots are never interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantPair {
    /// Doctor participant.
    pub doctor_id: Uuid,
    /// Patient participant.
    pub patient_id: Uuid,
}

impl ParticipantPair {
    /// Builds a pair from its two participants.
    #[must_use]
    pub const fn new(doctor_id: Uuid, patient_id: Uuid) -> Self {
        Self {
            doctor_id,
            patient_id,
        }
    }

    /// Whether `user_id` is one of the two participants.
    #[must_use]
    pub fn contains(&self, user_id: Uuid) -> bool {
        self.doctor_id == user_id || self.patient_id == user_id
    }
}

impl Display for ParticipantPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "doctor={} patient={}", self.doctor_id, self.patient_id)
    }
}

/// A durable record grouping all messages between one doctor and one patient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    /// Unique identifier for the conversation.
    pub id: Uuid,

    /// Doctor participant.
    pub doctor_id: Uuid,

    /// Patient participant.
    pub patient_id: Uuid,

    /// Store-assigned creation time.
    pub created_at: Timestamp,
}

impl Conversation {
    /// Participant pair this conversation belongs to.
    #[must_use]
    pub const fn pair(&self) -> ParticipantPair {
        ParticipantPair::new(self.doctor_id, self.patient_id)
    }
}
