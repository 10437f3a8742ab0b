//! Find-or-create resolution of the conversation for a participant pair.

use std::sync::Arc;

use metrics::counter;
use shared::models::{ParticipantPair, ParticipantProfile, ParticipantRole};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::store::{ConversationStore, StoreError};

/// Result of resolving a pair: the conversation plus both participant
/// profiles, used to label messages by display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConversation {
    /// Conversation id.
    pub conversation_id: Uuid,
    /// Doctor profile.
    pub doctor: ParticipantProfile,
    /// Patient profile.
    pub patient: ParticipantProfile,
}

impl ResolvedConversation {
    /// Participant pair of the conversation.
    #[must_use]
    pub fn pair(&self) -> ParticipantPair {
        ParticipantPair::new(self.doctor.id, self.patient.id)
    }
}

/// Finds or lazily creates the conversation grouping a doctor and a patient.
pub struct ConversationResolver<S: ConversationStore + ?Sized> {
    store: Arc<S>,
}

impl<S: ConversationStore + ?Sized> Clone for ConversationResolver<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: ConversationStore + ?Sized> std::fmt::Debug for ConversationResolver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationResolver").finish()
    }
}

impl<S: ConversationStore + ?Sized> ConversationResolver<S> {
    /// Creates a resolver over `store`.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Returns the id of the conversation for `pair`, creating it on first
    /// contact.
    ///
    /// # Errors
    /// [`ChatError::NotFound`] if either participant has no profile,
    /// [`ChatError::Persistence`] if the store fails.
    pub async fn resolve_conversation(&self, pair: ParticipantPair) -> ChatResult<Uuid> {
        self.resolve(pair)
            .await
            .map(|resolved| resolved.conversation_id)
    }

    /// Like [`Self::resolve_conversation`], also returning both profiles.
    ///
    /// # Errors
    /// See [`Self::resolve_conversation`].
    #[instrument(
        name = "chat.resolve_conversation",
        skip(self),
        fields(doctor_id = %pair.doctor_id, patient_id = %pair.patient_id),
        err
    )]
    pub async fn resolve(&self, pair: ParticipantPair) -> ChatResult<ResolvedConversation> {
        let doctor = self
            .require_profile(pair.doctor_id, ParticipantRole::Doctor)
            .await?;
        let patient = self
            .require_profile(pair.patient_id, ParticipantRole::Patient)
            .await?;

        let conversation_id = self.find_or_create(pair).await?;

        Ok(ResolvedConversation {
            conversation_id,
            doctor,
            patient,
        })
    }

    async fn require_profile(
        &self,
        id: Uuid,
        role: ParticipantRole,
    ) -> ChatResult<ParticipantProfile> {
        self.store
            .participant_profile(id, role)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("{role} profile {id} could not be loaded")))
    }

    async fn find_or_create(&self, pair: ParticipantPair) -> ChatResult<Uuid> {
        if let Some(existing) = self.store.find_conversation(pair).await? {
            debug!(conversation_id = %existing.id, "conversation already exists");
            return Ok(existing.id);
        }

        match self.store.create_conversation(pair).await {
            Ok(created) => {
                counter!("glucare_chat_conversations_created_total").increment(1);
                info!(conversation_id = %created.id, "created conversation on first contact");
                Ok(created.id)
            }
            Err(StoreError::UniqueViolation(detail)) => {
                debug!(%detail, "lost find-or-create race; re-reading conversation");
                self.store
                    .find_conversation(pair)
                    .await?
                    .map(|conversation| conversation.id)
                    .ok_or_else(|| {
                        ChatError::Persistence(StoreError::Backend(format!(
                            "conversation for {pair} reported as existing but could not be read"
                        )))
                    })
            }
            Err(err) => Err(err.into()),
        }
    }
}
